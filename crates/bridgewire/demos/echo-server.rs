//! Echo server on a bridge endpoint.
//!
//! Run with:
//!   cargo run --example echo-server -- tcp://127.0.0.1:7070
//!
//! In another terminal:
//!   cargo run --features cli -- send tcp://127.0.0.1:7070 -X POST --data hello

use bridgewire::server::{BridgeRequest, BridgeServer, HandlerError, ResponseSink, ServerConfig};
use bridgewire::transport::BridgeEndpoint;

async fn echo(request: BridgeRequest, response: ResponseSink) -> Result<(), HandlerError> {
    eprintln!("{} {}", request.method(), request.path());
    let (_, body) = request.into_parts();
    let body = body.collect().await?;
    response
        .respond(200, vec![("content-type".into(), "application/octet-stream".into())], body)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let arg = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:7070".to_string());
    let endpoint = BridgeEndpoint::parse(&arg)?;

    let server = BridgeServer::bind(&endpoint, echo, ServerConfig::default()).await?;
    for endpoint in server.endpoints() {
        eprintln!("Listening on {endpoint}");
    }

    let token = server.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("Draining");
        token.cancel();
    });

    server.run().await?;
    Ok(())
}
