//! Direct dispatch through an in-process native transport.
//!
//! Pushes one request through the call/poll interface and prints the
//! response frames the dispatcher hands back.
//!
//! Run with:
//!   cargo run --example direct-dispatch

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use bridgewire::frame::{Frame, RequestFrame, RequestHead};
use bridgewire::server::{
    BridgeRequest, ConnectionCounters, DirectConfig, HandlerError, NativeListener, ResponseSink,
};
use bridgewire::transport::{
    BackendDescriptor, InProcessNative, ListenerBinding, NativeListenerConfig, NativeTransport,
};

async fn greet(request: BridgeRequest, response: ResponseSink) -> Result<(), HandlerError> {
    let name = request.query().strip_prefix("name=").unwrap_or("world").to_string();
    response.start(200, vec![("content-type".into(), "text/plain".into())]).await?;
    response.write(format!("hello, {name}\n")).await?;
    response.finish().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (native, mut responses) = InProcessNative::new();
    let native = Arc::new(native);

    let config = NativeListenerConfig::new(ListenerBinding {
        host: "127.0.0.1".into(),
        port: 8443,
        tls: None,
        backend: BackendDescriptor::Direct,
    });
    let shutdown = CancellationToken::new();
    let listener = NativeListener::start(
        Arc::clone(&native) as Arc<dyn NativeTransport>,
        &config,
        Arc::new(greet),
        DirectConfig::default(),
        ConnectionCounters::new(),
        &shutdown,
    )?;

    let mut head = RequestHead::new("GET", "/greet");
    head.query = "name=bridge".into();
    let request = Frame::Request(RequestFrame {
        head,
        body: Bytes::new(),
    });
    native.submit(1, request.to_bytes()?);

    while let Some(payload) = responses.recv().await {
        let frame = Frame::decode(&payload.payload)?;
        println!("request {}: {frame:?}", payload.request_id);
        if frame == Frame::ResponseEnd {
            break;
        }
    }

    listener.stop().await?;
    Ok(())
}
