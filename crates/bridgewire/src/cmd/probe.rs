use bytes::Bytes;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use bridgewire_frame::RequestHead;
use bridgewire_transport::BridgeEndpoint;

use crate::cmd::client::{exchange, BodyMode};
use crate::cmd::{parse_duration, ProbeArgs};
use crate::exit::{transport_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct ProbeOutput {
    endpoint: String,
    status: u16,
    healthy: bool,
    latency_ms: f64,
    frames: usize,
}

pub async fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = BridgeEndpoint::parse(&args.endpoint)
        .map_err(|err| transport_error("invalid endpoint", err))?;
    let timeout = parse_duration(&args.timeout)?;

    let head = RequestHead::new("GET", args.path.as_str()).with_header("user-agent", "bridgewire-probe");
    let summary = exchange(&endpoint, head, Bytes::new(), BodyMode::Single, timeout).await?;

    let out = ProbeOutput {
        endpoint: endpoint.to_string(),
        status: summary.status,
        healthy: summary.status < 500,
        latency_ms: summary.elapsed.as_secs_f64() * 1000.0,
        frames: summary.frames,
    };
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["ENDPOINT", "STATUS", "LATENCY", "HEALTHY"])
                .add_row(vec![
                    out.endpoint.clone(),
                    out.status.to_string(),
                    format!("{:.2}ms", out.latency_ms),
                    out.healthy.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "{} status={} latency={:.2}ms",
                out.endpoint, out.status, out.latency_ms
            );
        }
    }

    Ok(if out.healthy { SUCCESS } else { FAILURE })
}
