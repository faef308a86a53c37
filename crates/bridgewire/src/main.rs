mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::exit::io_error;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "bridgewire", version, about = "Bridge transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "text",
        env = "BRIDGEWIRE_LOG_FORMAT",
        global = true
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "BRIDGEWIRE_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))
        .and_then(|runtime| runtime.block_on(cmd::run(cli.command, format)));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "bridgewire",
            "send",
            "tcp://127.0.0.1:7000",
            "--method",
            "POST",
            "--path",
            "/upload",
            "--header",
            "content-type: text/plain",
            "--data",
            "hello",
            "--stream",
        ])
        .expect("send args should parse");

        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.method, "POST");
        assert_eq!(args.headers, vec!["content-type: text/plain".to_string()]);
        assert!(args.stream);
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "bridgewire",
            "send",
            "tcp://127.0.0.1:7000",
            "--file",
            "/tmp/body.bin",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_serve_and_probe() {
        let cli = Cli::try_parse_from(["bridgewire", "serve", "localhost:0"])
            .expect("serve args should parse");
        assert!(matches!(cli.command, Command::Serve(_)));

        let cli = Cli::try_parse_from([
            "bridgewire",
            "probe",
            "unix:///tmp/bridge.sock",
            "--timeout",
            "500ms",
        ])
        .expect("probe args should parse");
        assert!(matches!(cli.command, Command::Probe(_)));
    }

    #[test]
    fn global_log_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "bridgewire",
            "version",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .expect("global flags should parse");
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
