use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use bridgewire_server::{
    watch_signals, BridgeRequest, BridgeServer, HandlerError, OsSignals, ResponseSink,
    ServerConfig,
};
use bridgewire_transport::BridgeEndpoint;

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{io_error, server_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_listening, OutputFormat};

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = BridgeEndpoint::parse(&args.endpoint)
        .map_err(|err| transport_error("invalid endpoint", err))?;
    let config = server_config(&args)?;
    let grace = config.shutdown_grace;

    let server = BridgeServer::bind(&endpoint, echo, config)
        .await
        .map_err(|err| server_error("bind failed", err))?;
    // Signal handlers must be live before the endpoint is announced.
    let signals = OsSignals::install()
        .map_err(|err| io_error("failed to install signal handlers", err))?;
    let mut watcher = tokio::spawn(watch_signals(signals, server.shutdown_token(), grace));

    let endpoints: Vec<String> = server.endpoints().iter().map(ToString::to_string).collect();
    print_listening(&endpoints, format);

    let run = server.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => {
            watcher.abort();
            result.map_err(|err| server_error("server failed", err))?;
        }
        forced = &mut watcher => {
            match forced {
                Ok(Some(code)) => return Ok(code),
                // Signal stream ended; keep serving until something else stops us.
                _ => run.await.map_err(|err| server_error("server failed", err))?,
            }
        }
    }

    info!("bridge server stopped");
    Ok(SUCCESS)
}

fn server_config(args: &ServeArgs) -> CliResult<ServerConfig> {
    let mut config = ServerConfig::default();
    config.frame.max_body_bytes = args.max_body;
    config.frame.idle_timeout = args
        .idle_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    config.shutdown_grace = parse_duration(&args.shutdown_grace)?;
    config.bind.backlog = args.backlog;
    Ok(config)
}

/// Streams each request body back with the request line in headers.
/// Websocket upgrades become a raw echo tunnel.
async fn echo(request: BridgeRequest, response: ResponseSink) -> Result<(), HandlerError> {
    debug!(method = request.method(), path = request.path(), "echo");
    if request.is_websocket_upgrade() {
        let socket = response
            .detach(101, vec![("upgrade".to_string(), "websocket".to_string())])
            .await?;
        let (mut read_half, mut write_half) = tokio::io::split(socket);
        tokio::io::copy(&mut read_half, &mut write_half).await?;
        write_half.shutdown().await?;
        return Ok(());
    }

    let mut headers = vec![
        ("x-echo-method".to_string(), request.method().to_string()),
        ("x-echo-path".to_string(), request.path().to_string()),
    ];
    if let Some(content_type) = request.header("content-type") {
        headers.push(("content-type".to_string(), content_type.to_string()));
    }

    let (_, mut body) = request.into_parts();
    response.start(200, headers).await?;
    while let Some(chunk) = body.chunk().await {
        response.write(chunk?).await?;
    }
    response.finish().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn args() -> ServeArgs {
        ServeArgs {
            endpoint: "localhost:0".to_string(),
            max_body: 1024,
            idle_timeout: Some("30s".to_string()),
            shutdown_grace: "250ms".to_string(),
            backlog: 16,
        }
    }

    #[test]
    fn config_follows_flags() {
        let config = server_config(&args()).unwrap();
        assert_eq!(config.frame.max_body_bytes, 1024);
        assert_eq!(config.frame.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.bind.backlog, 16);
    }

    #[test]
    fn idle_timeout_defaults_to_none() {
        let config = server_config(&ServeArgs {
            idle_timeout: None,
            ..args()
        })
        .unwrap();
        assert_eq!(config.frame.idle_timeout, None);
    }

    #[test]
    fn bad_grace_is_a_usage_error() {
        let err = server_config(&ServeArgs {
            shutdown_grace: "soon".to_string(),
            ..args()
        })
        .unwrap_err();
        assert_eq!(err.code, crate::exit::USAGE);
    }
}
