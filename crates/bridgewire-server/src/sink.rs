use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use bridgewire_frame::{
    split_chunks, Frame, Headers, ResponseFrame, ResponseHead, BODY_CHUNK_BYTES,
};
use bridgewire_transport::{loopback_pair, NativeTransport};

use crate::body::BodyQueue;
use crate::error::{Result, ServerError};
use crate::exchange::Outcome;
use crate::handler::HandlerError;
use crate::tunnel::{self, Handoff};

/// How an exchange travels over the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// One request frame in, one response frame out.
    SingleFrame,
    /// Start/chunk/end frames in both directions.
    Streamed,
    /// Frames pushed through the native call interface, keyed by request id.
    /// Responses are always streamed.
    Direct,
}

impl ExchangeMode {
    pub fn streams_response(self) -> bool {
        !matches!(self, Self::SingleFrame)
    }
}

/// Where an exchange stands. Reported for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingRequest,
    AwaitingBody,
    Dispatched,
    AwaitingResponseStart,
    StreamingResponse,
    Complete,
    Detached,
    Aborted,
}

/// Destination of the frames one exchange produces.
#[derive(Clone)]
pub(crate) enum Outlet {
    /// Queue feeding the connection's single writer task.
    Channel(mpsc::Sender<Frame>),
    Direct {
        native: Arc<dyn NativeTransport>,
        request_id: u64,
    },
}

impl Outlet {
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        match self {
            Self::Channel(tx) => tx.send(frame).await.map_err(|_| ServerError::ChannelClosed),
            Self::Direct { native, request_id } => {
                let payload = frame.to_bytes()?;
                if native.push_response(*request_id, &payload) {
                    Ok(())
                } else {
                    Err(ServerError::ChannelClosed)
                }
            }
        }
    }
}

impl fmt::Debug for Outlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Outlet::Channel"),
            Self::Direct { request_id, .. } => write!(f, "Outlet::Direct({request_id})"),
        }
    }
}

/// Frames announcing a tunnel handoff.
pub(crate) fn handoff_frames(mode: ExchangeMode, status: u16, headers: Headers) -> Vec<Frame> {
    complete_frames(mode, status, headers, Bytes::new())
}

/// Frames carrying a whole response in the given mode.
pub(crate) fn complete_frames(
    mode: ExchangeMode,
    status: u16,
    headers: Headers,
    body: Bytes,
) -> Vec<Frame> {
    if !mode.streams_response() {
        return vec![Frame::Response(ResponseFrame {
            status,
            headers,
            body,
        })];
    }
    let mut frames = vec![Frame::ResponseStart(ResponseHead { status, headers })];
    frames.extend(split_chunks(body, BODY_CHUNK_BYTES).map(Frame::ResponseChunk));
    frames.push(Frame::ResponseEnd);
    frames
}

#[derive(Debug, Default)]
struct PendingHeaders {
    headers: Headers,
    frozen: bool,
}

/// Headers other components add to a response before it starts.
///
/// Merged behind the handler's own headers when the response starts; after
/// that the set is frozen and appends are refused.
#[derive(Debug, Clone, Default)]
pub struct SharedHeaders(Arc<StdMutex<PendingHeaders>>);

impl SharedHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingHeaders> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a header. Returns `false` once the response has started.
    pub fn append(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let mut pending = self.lock();
        if pending.frozen {
            return false;
        }
        pending.headers.push((name.into(), value.into()));
        true
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    pub fn snapshot(&self) -> Headers {
        self.lock().headers.clone()
    }

    /// Whether both handles point at the same response.
    pub fn same_response(&self, other: &SharedHeaders) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn freeze(&self) -> Headers {
        let mut pending = self.lock();
        pending.frozen = true;
        std::mem::take(&mut pending.headers)
    }
}

enum Phase {
    Pending,
    /// Single-frame mode holds the response until it is finished.
    Buffering {
        status: u16,
        headers: Headers,
        body: BytesMut,
    },
    Streaming,
    Complete,
    Detached,
    Aborted,
}

pub(crate) struct SinkCore {
    mode: ExchangeMode,
    outlet: Outlet,
    body: Arc<BodyQueue>,
    max_body: usize,
    tunnel_read_chunk: usize,
    phase: Phase,
    sent: usize,
    pending: SharedHeaders,
    outcome: Option<oneshot::Sender<Outcome>>,
}

impl SinkCore {
    pub(crate) fn new(
        mode: ExchangeMode,
        outlet: Outlet,
        body: Arc<BodyQueue>,
        max_body: usize,
        tunnel_read_chunk: usize,
        pending: SharedHeaders,
        outcome: oneshot::Sender<Outcome>,
    ) -> Self {
        Self {
            mode,
            outlet,
            body,
            max_body,
            tunnel_read_chunk,
            phase: Phase::Pending,
            sent: 0,
            pending,
            outcome: Some(outcome),
        }
    }

    pub(crate) fn state(&self) -> ExchangeState {
        match self.phase {
            Phase::Complete => ExchangeState::Complete,
            Phase::Detached => ExchangeState::Detached,
            Phase::Aborted => ExchangeState::Aborted,
            Phase::Streaming => ExchangeState::StreamingResponse,
            Phase::Pending | Phase::Buffering { .. } => {
                if !self.body.is_ended() {
                    ExchangeState::AwaitingBody
                } else if self.mode.streams_response() {
                    ExchangeState::AwaitingResponseStart
                } else {
                    ExchangeState::Dispatched
                }
            }
        }
    }

    /// Whether a response frame has gone out for this exchange.
    pub(crate) fn is_committed(&self) -> bool {
        matches!(
            self.phase,
            Phase::Streaming | Phase::Complete | Phase::Detached
        )
    }

    fn conclude_with(&mut self, phase: Phase, outcome: Outcome) {
        self.phase = phase;
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }

    async fn emit(&mut self, frame: Frame) -> Result<()> {
        if let Err(err) = self.outlet.send(frame).await {
            debug!(error = %err, "bridge gone while writing response");
            self.conclude_with(Phase::Aborted, Outcome::Aborted(ServerError::ChannelClosed));
            return Err(err);
        }
        Ok(())
    }

    async fn start(&mut self, status: u16, mut headers: Headers) -> Result<()> {
        match self.phase {
            Phase::Pending => {}
            Phase::Detached => {
                return Err(ServerError::ProtocolSequence(
                    "response start after tunnel handoff".into(),
                ))
            }
            _ => {
                return Err(ServerError::ProtocolSequence(
                    "response already started".into(),
                ))
            }
        }
        headers.extend(self.pending.freeze());
        if self.mode.streams_response() {
            self.emit(Frame::ResponseStart(ResponseHead { status, headers }))
                .await?;
            self.phase = Phase::Streaming;
        } else {
            self.phase = Phase::Buffering {
                status,
                headers,
                body: BytesMut::new(),
            };
        }
        debug!(status, "response started");
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        match self.phase {
            Phase::Buffering { .. } | Phase::Streaming => {}
            Phase::Pending => {
                return Err(ServerError::ProtocolSequence(
                    "response chunk before response start".into(),
                ))
            }
            Phase::Detached => {
                return Err(ServerError::ProtocolSequence(
                    "response body after tunnel handoff".into(),
                ))
            }
            Phase::Complete => {
                return Err(ServerError::ProtocolSequence(
                    "response already finished".into(),
                ))
            }
            Phase::Aborted => return Err(ServerError::ChannelClosed),
        }

        let size = self.sent + chunk.len();
        if size > self.max_body {
            return Err(ServerError::ResourceLimit {
                size,
                max: self.max_body,
            });
        }
        if let Phase::Buffering { body, .. } = &mut self.phase {
            body.extend_from_slice(&chunk);
        } else {
            for piece in split_chunks(chunk, BODY_CHUNK_BYTES) {
                self.emit(Frame::ResponseChunk(piece)).await?;
            }
        }
        self.sent = size;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.phase, Phase::Pending) {
            Phase::Pending => self.respond_now(200, Vec::new(), Bytes::new()).await,
            Phase::Buffering {
                status,
                headers,
                body,
            } => self.respond_now(status, headers, body.freeze()).await,
            Phase::Streaming => {
                self.phase = Phase::Streaming;
                self.emit(Frame::ResponseEnd).await?;
                self.conclude_with(Phase::Complete, Outcome::Completed);
                Ok(())
            }
            Phase::Complete => {
                self.phase = Phase::Complete;
                Ok(())
            }
            Phase::Detached => {
                self.phase = Phase::Detached;
                Err(ServerError::ProtocolSequence(
                    "response end after tunnel handoff".into(),
                ))
            }
            Phase::Aborted => {
                self.phase = Phase::Aborted;
                Err(ServerError::ChannelClosed)
            }
        }
    }

    /// Emit a whole response. Caller has checked nothing is committed.
    async fn respond_now(&mut self, status: u16, headers: Headers, body: Bytes) -> Result<()> {
        if body.len() > self.max_body {
            return Err(ServerError::ResourceLimit {
                size: body.len(),
                max: self.max_body,
            });
        }
        self.emit_whole(status, headers, body).await
    }

    /// Emit a whole response without the body cap.
    async fn emit_whole(&mut self, status: u16, mut headers: Headers, body: Bytes) -> Result<()> {
        headers.extend(self.pending.freeze());
        for frame in complete_frames(self.mode, status, headers, body) {
            self.emit(frame).await?;
        }
        debug!(status, "response complete");
        self.conclude_with(Phase::Complete, Outcome::Completed);
        Ok(())
    }

    async fn respond(&mut self, status: u16, headers: Headers, body: Bytes) -> Result<()> {
        match self.phase {
            Phase::Pending => self.respond_now(status, headers, body).await,
            _ => Err(ServerError::ProtocolSequence(
                "response already started".into(),
            )),
        }
    }

    async fn detach(&mut self, handoff: Option<(u16, Headers)>) -> Result<TcpStream> {
        if !matches!(self.phase, Phase::Pending) {
            return Err(ServerError::ProtocolSequence(
                "tunnel handoff after response start".into(),
            ));
        }
        let (app, retained) = loopback_pair().await?;
        let extra_headers = self.pending.freeze();
        // Tunnel bytes may arrive as soon as the handoff frames go out.
        self.body.detach();

        let handoff = match handoff {
            Some((status, mut headers)) => {
                headers.extend(extra_headers);
                for frame in handoff_frames(self.mode, status, headers) {
                    self.emit(frame).await?;
                }
                Handoff::Emitted
            }
            None => Handoff::Preface {
                mode: self.mode,
                extra_headers,
            },
        };

        let handle = tunnel::spawn(
            retained,
            self.outlet.clone(),
            handoff,
            self.tunnel_read_chunk,
        );
        debug!(tunnel = handle.id(), "exchange detached");
        self.conclude_with(Phase::Detached, Outcome::Detached(handle));
        Ok(app)
    }

    /// Report a failure of this exchange.
    ///
    /// Before anything is committed a recoverable failure becomes an error
    /// response and the exchange completes; otherwise it is aborted.
    pub(crate) async fn fail(&mut self, err: ServerError) {
        self.body.abort(err.to_string());
        match self.phase {
            Phase::Complete | Phase::Detached | Phase::Aborted => {
                debug!(error = %err, "failure after exchange concluded");
            }
            Phase::Pending | Phase::Buffering { .. } if err.is_recoverable_before_commit() => {
                let status = err.error_status();
                warn!(status, error = %err, "sending error response");
                self.phase = Phase::Pending;
                let headers = vec![("content-type".to_string(), "text/plain".to_string())];
                // No body cap on synthesized error responses.
                if let Err(send_err) = self
                    .emit_whole(status, headers, Bytes::from(err.to_string()))
                    .await
                {
                    debug!(error = %send_err, "could not deliver error response");
                    self.conclude_with(Phase::Aborted, Outcome::Aborted(err));
                }
            }
            _ => {
                warn!(error = %err, "exchange aborted");
                self.conclude_with(Phase::Aborted, Outcome::Aborted(err));
            }
        }
    }

    /// Settle the exchange once the handler task has ended.
    pub(crate) async fn conclude(
        &mut self,
        joined: std::result::Result<std::result::Result<(), HandlerError>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(())) => {
                if matches!(
                    self.phase,
                    Phase::Pending | Phase::Buffering { .. } | Phase::Streaming
                ) {
                    debug!("handler returned without finishing, finishing response");
                    if let Err(err) = self.finish().await {
                        debug!(error = %err, "implicit finish failed");
                        self.fail(err).await;
                    }
                }
            }
            Ok(Err(err)) => self.fail(ServerError::Handler(err)).await,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "handler panicked"
                } else {
                    "handler cancelled"
                };
                self.fail(ServerError::Handler(HandlerError::message(message)))
                    .await
            }
        }
    }
}

/// The handler's side of a response.
///
/// Calls are serialized, so frames for one exchange never interleave or
/// reorder on the wire.
pub struct ResponseSink {
    core: Arc<Mutex<SinkCore>>,
    pending: SharedHeaders,
}

impl ResponseSink {
    pub(crate) fn new(core: Arc<Mutex<SinkCore>>, pending: SharedHeaders) -> Self {
        Self { core, pending }
    }

    /// Send status and headers. They are frozen from here on.
    pub async fn start(&self, status: u16, headers: Headers) -> Result<()> {
        self.core.lock().await.start(status, headers).await
    }

    /// Send one body chunk. Chunks above 64 KiB are split.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.core.lock().await.write(chunk.into()).await
    }

    /// End the response. Without a prior `start` this sends an empty 200.
    pub async fn finish(&self) -> Result<()> {
        self.core.lock().await.finish().await
    }

    /// Send a complete response in one go.
    pub async fn respond(
        self,
        status: u16,
        headers: Headers,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.core
            .lock()
            .await
            .respond(status, headers, body.into())
            .await
    }

    /// Answer with an upgrade response and take over the connection as a raw
    /// byte stream.
    ///
    /// Request bytes the handler has not read are delivered to the returned
    /// socket first.
    pub async fn detach(self, status: u16, headers: Headers) -> Result<TcpStream> {
        self.core
            .lock()
            .await
            .detach(Some((status, headers)))
            .await
    }

    /// Take over the connection without answering. The application writes
    /// the `HTTP/1.1 101 ...` head into the returned socket itself.
    pub async fn detach_raw(self) -> Result<TcpStream> {
        self.core.lock().await.detach(None).await
    }

    /// Headers other components may still add before the response starts.
    pub fn pending_headers(&self) -> SharedHeaders {
        self.pending.clone()
    }

    pub async fn state(&self) -> ExchangeState {
        self.core.lock().await.state()
    }

    pub async fn is_committed(&self) -> bool {
        self.core.lock().await.is_committed()
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink").finish_non_exhaustive()
    }
}
