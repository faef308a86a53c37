//! Listener lifecycle: bind, accept, and coordinated shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bridgewire_frame::{FrameConfig, BODY_CHUNK_BYTES};
use bridgewire_transport::{
    start_native_listener, BackendDescriptor, BindOptions, BridgeEndpoint, BridgeListener,
    NativeListenerConfig, NativeListenerHandle, NativeTransport, TransportError,
};

use crate::connection::serve_connection;
use crate::counters::ConnectionCounters;
use crate::direct::{DirectConfig, DirectDispatcher};
use crate::error::{Result, ServerError};
use crate::handler::Handler;

/// Pause after an accept error that is not about a single connection.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Bridge server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Frame and body limits for every connection.
    pub frame: FrameConfig,
    /// Listener socket options. A zero backlog means 1024.
    pub bind: BindOptions,
    /// How long a second shutdown signal waits before forcing exit. Default: 5 s.
    pub shutdown_grace: Duration,
    /// Response frames queued per connection before handlers wait for the
    /// writer. Default: 64.
    pub outbound_queue_frames: usize,
    /// Read size for detached tunnel sockets. Default: 64 KiB.
    pub tunnel_read_chunk: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            bind: BindOptions::default(),
            shutdown_grace: Duration::from_secs(5),
            outbound_queue_frames: 64,
            tunnel_read_chunk: BODY_CHUNK_BYTES,
        }
    }
}

/// One handler served on one or more bridge listeners.
///
/// All listeners share one set of connection counters and one shutdown
/// token. If any listener stops, the others are stopped too.
pub struct BridgeServer<H> {
    listeners: Vec<BridgeListener>,
    handler: Arc<H>,
    config: Arc<ServerConfig>,
    counters: Arc<ConnectionCounters>,
    shutdown: CancellationToken,
}

impl<H: Handler> BridgeServer<H> {
    /// Bind every listener `endpoint` needs.
    pub async fn bind(endpoint: &BridgeEndpoint, handler: H, config: ServerConfig) -> Result<Self> {
        let listeners = endpoint.bind(&config.bind).await?;
        for listener in &listeners {
            info!(listener = %listener_label(listener), "bridge listener bound");
        }
        Ok(Self::from_listeners(listeners, handler, config))
    }

    pub fn from_listeners(listeners: Vec<BridgeListener>, handler: H, config: ServerConfig) -> Self {
        Self {
            listeners,
            handler: Arc::new(handler),
            config: Arc::new(config),
            counters: ConnectionCounters::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an existing token instead of a fresh one.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Endpoints a client would use to reach the bound listeners.
    pub fn endpoints(&self) -> Vec<BridgeEndpoint> {
        self.listeners
            .iter()
            .filter_map(BridgeListener::endpoint)
            .collect()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(BridgeListener::local_addr)
            .collect()
    }

    pub fn counters(&self) -> Arc<ConnectionCounters> {
        Arc::clone(&self.counters)
    }

    /// Cancelling this token stops accepting and lets in-flight exchanges finish.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept and serve until shutdown, then wait for open connections.
    ///
    /// Returns the first listener failure, if any.
    pub async fn run(self) -> Result<()> {
        let Self {
            listeners,
            handler,
            config,
            counters,
            shutdown,
        } = self;
        let mut loops = JoinSet::new();
        for listener in listeners {
            loops.spawn(accept_loop(
                listener,
                Arc::clone(&handler),
                Arc::clone(&config),
                Arc::clone(&counters),
                shutdown.clone(),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            if !shutdown.is_cancelled() {
                warn!("bridge listener stopped, shutting down the others");
                shutdown.cancel();
            }
            let outcome = joined.unwrap_or_else(|err| Err(join_failure(err)));
            if let Err(err) = outcome {
                error!(error = %err, "bridge listener failed");
                first_error.get_or_insert(err);
            }
        }
        info!(open_channels = counters.open_channels(), "bridge server stopped");
        first_error.map_or(Ok(()), Err)
    }
}

async fn accept_loop<H: Handler>(
    listener: BridgeListener,
    handler: Arc<H>,
    config: Arc<ServerConfig>,
    counters: Arc<ConnectionCounters>,
    shutdown: CancellationToken,
) -> Result<()> {
    let label = listener_label(&listener);
    info!(listener = %label, "accepting bridge connections");
    let mut connections = JoinSet::new();

    let result = loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    error!(listener = %label, error = %err, "bridge connection task failed");
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok(stream) => stream,
            Err(TransportError::Accept(err)) if is_connection_error(&err) => {
                debug!(listener = %label, error = %err, "connection failed during accept");
                continue;
            }
            Err(TransportError::Accept(err)) => {
                warn!(listener = %label, error = %err, "accept failed, backing off");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
            Err(err) => break Err(ServerError::from(err)),
        };

        let peer = stream.peer_label();
        match stream.peer_credentials() {
            Some((pid, uid, gid)) => debug!(%peer, pid, uid, gid, "bridge connection accepted"),
            None => debug!(%peer, "bridge connection accepted"),
        }
        let handler = Arc::clone(&handler);
        let config = Arc::clone(&config);
        let counters = Arc::clone(&counters);
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            match serve_connection(stream, handler, &config, &counters, shutdown).await {
                Ok(()) => debug!(%peer, "bridge connection closed"),
                Err(err) => error!(%peer, error = %err, "bridge connection failed"),
            }
        });
    };

    drop(listener);
    if !connections.is_empty() {
        info!(listener = %label, open = connections.len(), "waiting for open bridge connections");
    }
    while let Some(joined) = connections.join_next().await {
        if let Err(err) = joined {
            error!(listener = %label, error = %err, "bridge connection task failed");
        }
    }
    info!(listener = %label, "bridge listener closed");
    result
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn listener_label(listener: &BridgeListener) -> String {
    listener
        .endpoint()
        .map_or_else(|| format!("{listener:?}"), |endpoint| endpoint.to_string())
}

fn join_failure(err: JoinError) -> ServerError {
    ServerError::Io(io::Error::other(err))
}

/// A listener started on the native side.
///
/// With a [`BackendDescriptor::Direct`] backend this also runs the direct
/// dispatch loop; with a bridge backend the caller serves the endpoint
/// through a [`BridgeServer`].
pub struct NativeListener {
    native: Arc<dyn NativeTransport>,
    handle: NativeListenerHandle,
    shutdown: CancellationToken,
    dispatcher: Option<JoinHandle<Result<()>>>,
}

impl NativeListener {
    /// Probe the native ABI and start the listener. Must be called from
    /// within a tokio runtime.
    ///
    /// `shutdown` cancels the direct dispatcher too; [`stop`](Self::stop)
    /// stops this listener alone.
    pub fn start<H: Handler>(
        native: Arc<dyn NativeTransport>,
        config: &NativeListenerConfig,
        handler: Arc<H>,
        direct: DirectConfig,
        counters: Arc<ConnectionCounters>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let handle = start_native_listener(native.as_ref(), config)?;
        let shutdown = shutdown.child_token();
        let dispatcher = match config.binding.backend {
            BackendDescriptor::Direct => {
                let dispatcher =
                    DirectDispatcher::new(Arc::clone(&native), handler, direct, counters);
                Some(tokio::spawn(dispatcher.run(shutdown.clone())))
            }
            BackendDescriptor::Bridge(_) => None,
        };
        Ok(Self {
            native,
            handle,
            shutdown,
            dispatcher,
        })
    }

    pub fn handle(&self) -> NativeListenerHandle {
        self.handle
    }

    /// Stop the native listener, then drain the direct dispatcher if any.
    pub async fn stop(self) -> Result<()> {
        let stopped = self.native.stop_listener(self.handle);
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.await.unwrap_or_else(|err| Err(join_failure(err)))?;
        }
        info!(listener = self.handle.0, "native listener stopped");
        stopped.map_err(ServerError::from)
    }
}

impl std::fmt::Debug for NativeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeListener")
            .field("handle", &self.handle)
            .field("direct", &self.dispatcher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::split;

    use bridgewire_frame::{
        Frame, FrameReader, FrameWriter, RequestFrame, RequestHead, ResponseFrame, ResponseHead,
    };
    use bridgewire_transport::{InProcessNative, ListenerBinding};

    use super::*;
    use crate::handler::{BridgeRequest, HandlerError};
    use crate::sink::ResponseSink;

    type HandlerResult = std::result::Result<(), HandlerError>;

    async fn echo(request: BridgeRequest, response: ResponseSink) -> HandlerResult {
        let path = request.path().to_string();
        let body = request.body.collect().await?;
        response
            .respond(200, vec![("x-path".to_string(), path)], body)
            .await?;
        Ok(())
    }

    fn get(path: &str, body: &'static [u8]) -> Frame {
        Frame::Request(RequestFrame {
            head: RequestHead::new("GET", path),
            body: Bytes::from_static(body),
        })
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.outbound_queue_frames, 64);
        assert_eq!(config.tunnel_read_chunk, 64 * 1024);
        assert_eq!(config.bind.backlog, 0);
    }

    #[tokio::test]
    async fn serves_requests_over_tcp_and_stops_on_shutdown() {
        let endpoint = BridgeEndpoint::parse("tcp://127.0.0.1:0").unwrap();
        let server = BridgeServer::bind(&endpoint, echo, ServerConfig::default())
            .await
            .unwrap();
        let bound = server.endpoints();
        assert_eq!(bound.len(), 1);
        let counters = server.counters();
        let shutdown = server.shutdown_token();
        let running = tokio::spawn(server.run());

        let stream = bound[0].connect().await.unwrap();
        let (read_half, write_half) = split(stream);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        writer.write_frame(&get("/x", b"")).await.unwrap();
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Response(ResponseFrame {
                status: 200,
                headers: vec![("x-path".to_string(), "/x".to_string())],
                body: Bytes::new(),
            }))
        );
        assert_eq!(counters.open_channels(), 1);

        writer.write_frame(&get("/y", b"hi")).await.unwrap();
        let Some(Frame::Response(second)) = reader.read_frame().await.unwrap() else {
            panic!("expected a single response frame");
        };
        assert_eq!(second.body, Bytes::from_static(b"hi"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), None);
        assert_eq!(counters.open_channels(), 0);
    }

    #[tokio::test]
    async fn counters_follow_connections() {
        let endpoint = BridgeEndpoint::parse("127.0.0.1:0").unwrap();
        let server = BridgeServer::bind(&endpoint, echo, ServerConfig::default())
            .await
            .unwrap();
        let bound = server.endpoints();
        let counters = server.counters();
        let shutdown = server.shutdown_token();
        let running = tokio::spawn(server.run());

        let first = bound[0].connect().await.unwrap();
        let second = bound[0].connect().await.unwrap();
        wait_for(|| counters.open_channels() == 2).await;

        drop(first);
        wait_for(|| counters.open_channels() == 1).await;
        drop(second);
        wait_for(|| counters.open_channels() == 0).await;

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serves_requests_over_unix_socket() {
        let dir = std::env::temp_dir().join(format!(
            "bridgewire-server-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = BridgeEndpoint::Unix(dir.join("bridge.sock"));

        let server = BridgeServer::bind(&endpoint, echo, ServerConfig::default())
            .await
            .unwrap();
        assert_eq!(server.endpoints(), vec![endpoint.clone()]);
        let shutdown = server.shutdown_token();
        let running = tokio::spawn(server.run());

        let (read_half, write_half) = split(endpoint.connect().await.unwrap());
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        writer.write_frame(&get("/uds", b"")).await.unwrap();
        assert!(matches!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Response(ResponseFrame { status: 200, .. }))
        ));

        shutdown.cancel();
        running.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn direct_binding() -> NativeListenerConfig {
        NativeListenerConfig::new(ListenerBinding {
            host: "127.0.0.1".to_string(),
            port: 8443,
            tls: None,
            backend: BackendDescriptor::Direct,
        })
    }

    #[tokio::test]
    async fn native_listener_runs_direct_dispatch() {
        let (native, mut responses) = InProcessNative::new();
        let native = Arc::new(native);
        let shutdown = CancellationToken::new();
        let listener = NativeListener::start(
            Arc::clone(&native) as Arc<dyn NativeTransport>,
            &direct_binding(),
            Arc::new(echo),
            DirectConfig::default(),
            ConnectionCounters::new(),
            &shutdown,
        )
        .unwrap();
        assert_eq!(native.listeners().len(), 1);

        native.submit(42, get("/direct", b"").to_bytes().unwrap());
        let start = responses.recv().await.unwrap();
        assert_eq!(start.request_id, 42);
        assert!(matches!(
            Frame::decode(&start.payload).unwrap(),
            Frame::ResponseStart(ResponseHead { status: 200, .. })
        ));
        let end = responses.recv().await.unwrap();
        assert_eq!(Frame::decode(&end.payload).unwrap(), Frame::ResponseEnd);

        listener.stop().await.unwrap();
        assert!(native.listeners().is_empty());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn native_listener_refuses_unknown_abi() {
        let (native, _responses) = InProcessNative::with_abi_version(9);
        let err = NativeListener::start(
            Arc::new(native) as Arc<dyn NativeTransport>,
            &direct_binding(),
            Arc::new(echo),
            DirectConfig::default(),
            ConnectionCounters::new(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Transport(TransportError::UnsupportedAbi { found: 9, .. })
        ));
    }
}
