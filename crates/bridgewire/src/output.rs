use std::io::{IsTerminal, Write};
use std::time::Duration;

use bytes::Bytes;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// What a `send` or `probe` observed for one exchange.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Response frames received, including start and end markers.
    pub frames: usize,
    pub streamed: bool,
    pub elapsed: Duration,
}

#[derive(Serialize)]
struct ResponseOutput<'a> {
    endpoint: &'a str,
    status: u16,
    headers: Vec<HeaderOutput<'a>>,
    body_size: usize,
    body: String,
    frames: usize,
    streamed: bool,
    elapsed_ms: f64,
}

#[derive(Serialize)]
struct HeaderOutput<'a> {
    name: &'a str,
    value: &'a str,
}

pub fn print_response(summary: &ResponseSummary, endpoint: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ResponseOutput {
                endpoint,
                status: summary.status,
                headers: summary
                    .headers
                    .iter()
                    .map(|(name, value)| HeaderOutput { name, value })
                    .collect(),
                body_size: summary.body.len(),
                body: body_preview(&summary.body),
                frames: summary.frames,
                streamed: summary.streamed,
                elapsed_ms: millis(summary.elapsed),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["STATUS", "FRAMES", "SIZE", "ELAPSED", "BODY"])
                .add_row(vec![
                    summary.status.to_string(),
                    summary.frames.to_string(),
                    summary.body.len().to_string(),
                    format!("{:.2}ms", millis(summary.elapsed)),
                    body_preview(&summary.body),
                ]);
            println!("{table}");
            if !summary.headers.is_empty() {
                let mut headers = Table::new();
                headers
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["HEADER", "VALUE"]);
                for (name, value) in &summary.headers {
                    headers.add_row(vec![name.as_str(), value.as_str()]);
                }
                println!("{headers}");
            }
        }
        OutputFormat::Pretty => {
            println!(
                "status={} frames={} size={} elapsed={:.2}ms",
                summary.status,
                summary.frames,
                summary.body.len(),
                millis(summary.elapsed)
            );
            for (name, value) in &summary.headers {
                println!("{name}: {value}");
            }
            println!();
            println!("{}", body_preview(&summary.body));
        }
        OutputFormat::Raw => print_raw(&summary.body),
    }
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    event: &'static str,
    endpoints: &'a [String],
}

pub fn print_listening(endpoints: &[String], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            event: "listening",
            endpoints,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec!["LISTENING ON"]);
            for endpoint in endpoints {
                table.add_row(vec![endpoint.as_str()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for endpoint in endpoints {
                println!("listening on {endpoint}");
            }
        }
        OutputFormat::Raw => {
            for endpoint in endpoints {
                println!("{endpoint}");
            }
        }
    }
    let _ = std::io::stdout().flush();
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_bodies_are_summarized() {
        assert_eq!(body_preview(b"hello"), "hello");
        assert_eq!(body_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }

    #[test]
    fn json_output_carries_status_and_headers() {
        let summary = ResponseSummary {
            status: 201,
            headers: vec![("x-echo-path".to_string(), "/a".to_string())],
            body: Bytes::from_static(b"ok"),
            frames: 3,
            streamed: true,
            elapsed: Duration::from_millis(2),
        };
        let out = ResponseOutput {
            endpoint: "tcp://127.0.0.1:9",
            status: summary.status,
            headers: summary
                .headers
                .iter()
                .map(|(name, value)| HeaderOutput { name, value })
                .collect(),
            body_size: summary.body.len(),
            body: body_preview(&summary.body),
            frames: summary.frames,
            streamed: summary.streamed,
            elapsed_ms: millis(summary.elapsed),
        };
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["status"], 201);
        assert_eq!(value["headers"][0]["name"], "x-echo-path");
        assert_eq!(value["body"], "ok");
        assert_eq!(value["streamed"], true);
    }
}
