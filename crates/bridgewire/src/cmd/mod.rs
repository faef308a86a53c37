use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod client;
pub mod probe;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a bridge endpoint with the built-in echo handler.
    Serve(ServeArgs),
    /// Act as the native side: send one request and print the response.
    Send(SendArgs),
    /// Check that a bridge endpoint answers, and how fast.
    Probe(ProbeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Probe(args) => probe::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind: tcp://host:port, localhost:0, or unix:///path.
    #[arg(env = "BRIDGEWIRE_ENDPOINT")]
    pub endpoint: String,
    /// Largest request or response body accepted, in bytes.
    #[arg(long, default_value_t = bridgewire_frame::DEFAULT_MAX_BODY_BYTES)]
    pub max_body: usize,
    /// Close connections idle this long between frames (e.g. 30s). Default: never.
    #[arg(long)]
    pub idle_timeout: Option<String>,
    /// Grace period after a second shutdown signal (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub shutdown_grace: String,
    /// Listen backlog. 0 uses the default of 1024.
    #[arg(long, default_value_t = 0)]
    pub backlog: u32,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Endpoint to connect to.
    #[arg(env = "BRIDGEWIRE_ENDPOINT")]
    pub endpoint: String,
    /// Request method.
    #[arg(long, short = 'X', default_value = "GET")]
    pub method: String,
    /// Request path.
    #[arg(long, default_value = "/")]
    pub path: String,
    /// Query string, without the leading `?`.
    #[arg(long, default_value = "")]
    pub query: String,
    /// Request header as `name: value`. Repeatable.
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE")]
    pub headers: Vec<String>,
    /// Raw string body.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the body from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Send the body as request-start, chunks, and request-end.
    #[arg(long)]
    pub stream: bool,
    /// Chunk size used with --stream, in bytes.
    #[arg(long, default_value_t = bridgewire_frame::BODY_CHUNK_BYTES)]
    pub chunk_size: usize,
    /// Give up waiting for the response after this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Endpoint to probe.
    #[arg(env = "BRIDGEWIRE_ENDPOINT")]
    pub endpoint: String,
    /// Path requested by the probe.
    #[arg(long, default_value = "/")]
    pub path: String,
    /// Connection and response timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }
}
