use std::fs;

use bytes::Bytes;

use bridgewire_frame::RequestHead;
use bridgewire_transport::BridgeEndpoint;

use crate::cmd::client::{exchange, parse_header, BodyMode};
use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{print_response, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = BridgeEndpoint::parse(&args.endpoint)
        .map_err(|err| transport_error("invalid endpoint", err))?;
    let timeout = parse_duration(&args.timeout)?;
    let head = build_head(&args)?;
    let body = resolve_body(&args)?;
    let mode = if args.stream {
        if args.chunk_size == 0 {
            return Err(CliError::new(USAGE, "--chunk-size must be greater than zero"));
        }
        BodyMode::Streamed {
            chunk_size: args.chunk_size,
        }
    } else {
        BodyMode::Single
    };

    let summary = exchange(&endpoint, head, body, mode, timeout).await?;
    print_response(&summary, &endpoint.to_string(), format);

    // Server errors still printed the response; the exit code tells scripts.
    if summary.status >= 500 {
        return Ok(FAILURE);
    }
    Ok(SUCCESS)
}

fn build_head(args: &SendArgs) -> CliResult<RequestHead> {
    let mut head = RequestHead::new(args.method.to_ascii_uppercase(), &args.path);
    head.query = args.query.clone();
    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        head = head.with_header(name, value);
    }
    Ok(head)
}

fn resolve_body(args: &SendArgs) -> CliResult<Bytes> {
    if let Some(data) = &args.data {
        return Ok(Bytes::from(data.clone()));
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map(Bytes::from)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SendArgs {
        SendArgs {
            endpoint: "tcp://127.0.0.1:7000".to_string(),
            method: "post".to_string(),
            path: "/items".to_string(),
            query: "page=2".to_string(),
            headers: vec!["Content-Type: application/json".to_string()],
            data: Some("{}".to_string()),
            file: None,
            stream: false,
            chunk_size: 4,
            timeout: "1s".to_string(),
        }
    }

    #[test]
    fn head_carries_method_path_query_and_headers() {
        let head = build_head(&args()).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/items");
        assert_eq!(head.query, "page=2");
        assert_eq!(
            head.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn body_comes_from_data_or_file() {
        assert_eq!(resolve_body(&args()).unwrap(), Bytes::from_static(b"{}"));

        let path = std::env::temp_dir().join(format!("bridgewire-send-{}.bin", std::process::id()));
        std::fs::write(&path, b"file body").unwrap();
        let from_file = SendArgs {
            data: None,
            file: Some(path.clone()),
            ..args()
        };
        assert_eq!(
            resolve_body(&from_file).unwrap(),
            Bytes::from_static(b"file body")
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_reported() {
        let missing = SendArgs {
            data: None,
            file: Some("/nonexistent/bridgewire/body".into()),
            ..args()
        };
        assert!(resolve_body(&missing).is_err());
    }
}
