use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bridgewire_frame::{
    peek_frame_type, Frame, FrameType, RequestFrame, RequestHead, BODY_CHUNK_BYTES,
    DEFAULT_MAX_BODY_BYTES,
};
use bridgewire_transport::{probe_abi, DirectPayload, NativeTransport};

use crate::body::BodyQueue;
use crate::counters::{ChannelGuard, ConnectionCounters};
use crate::error::{Result, ServerError};
use crate::exchange::{Exchange, ExchangeSettings, Outcome};
use crate::handler::Handler;
use crate::sink::{complete_frames, ExchangeMode, ExchangeState, Outlet};
use crate::tunnel::{Offer, TunnelHandle};

/// Payloads taken from the native side before settling outcomes again.
const MAX_POLLS_PER_TICK: usize = 256;

/// Settings for the direct dispatch loop.
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Sleep between polls while the native side has nothing pending. Default: 1 ms.
    pub poll_idle_sleep: Duration,
    /// Maximum request or response body per exchange. Default: 32 MiB.
    pub max_body_bytes: usize,
    /// An exchange whose response has not started this long after the last
    /// request frame is answered with 504 and dropped. Default: 30 s.
    pub request_timeout: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            poll_idle_sleep: Duration::from_millis(1),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct DirectExchange {
    exchange: Exchange,
    request_ended: bool,
    response_done: bool,
    tunnel: Option<TunnelHandle>,
    /// Tunnel bytes the application has not taken yet.
    backlog: VecDeque<Bytes>,
    backlog_bytes: usize,
    /// The native side closed the tunnel; close it once the backlog drains.
    close_requested: bool,
    last_activity: Instant,
    _channel: ChannelGuard,
}

impl DirectExchange {
    fn is_finished(&self) -> bool {
        match &self.tunnel {
            Some(tunnel) => tunnel.is_closed(),
            None => self.request_ended && self.response_done,
        }
    }

    /// Queue bytes for the tunnel. Never waits on the application.
    fn forward(&mut self, chunk: Bytes, max_backlog: usize) {
        self.backlog_bytes += chunk.len();
        self.backlog.push_back(chunk);
        self.flush();
        if self.backlog_bytes > max_backlog {
            if let Some(tunnel) = &self.tunnel {
                warn!(
                    tunnel = tunnel.id(),
                    backlog = self.backlog_bytes,
                    "tunnel application not reading, closing"
                );
                tunnel.close();
            }
            self.backlog.clear();
            self.backlog_bytes = 0;
        }
    }

    /// Move backlog into the tunnel until its queue is full.
    fn flush(&mut self) {
        let Some(tunnel) = &self.tunnel else {
            return;
        };
        while let Some(chunk) = self.backlog.pop_front() {
            let len = chunk.len();
            match tunnel.offer(chunk) {
                Offer::Accepted => self.backlog_bytes -= len,
                Offer::Full(chunk) => {
                    self.backlog.push_front(chunk);
                    break;
                }
                Offer::Closed => {
                    debug!(tunnel = tunnel.id(), "dropping bytes for closed tunnel");
                    self.backlog.clear();
                    self.backlog_bytes = 0;
                }
            }
        }
        if self.close_requested && self.backlog.is_empty() {
            tunnel.close();
        }
    }
}

/// Serves exchanges that arrive through the native call interface instead of
/// a socket.
///
/// Frames are matched to exchanges by request id. An entry stays in the table
/// until its request has ended and its response has completed, or until its
/// tunnel has closed. Frames for ids not in the table are dropped with a
/// warning: trailing frames racing a completed exchange are expected here.
pub struct DirectDispatcher<H> {
    native: Arc<dyn NativeTransport>,
    handler: Arc<H>,
    config: DirectConfig,
    counters: Arc<ConnectionCounters>,
    exchanges: HashMap<u64, DirectExchange>,
    outcomes_tx: mpsc::UnboundedSender<(u64, Outcome)>,
    outcomes_rx: mpsc::UnboundedReceiver<(u64, Outcome)>,
    draining: bool,
}

impl<H: Handler> DirectDispatcher<H> {
    pub fn new(
        native: Arc<dyn NativeTransport>,
        handler: Arc<H>,
        config: DirectConfig,
        counters: Arc<ConnectionCounters>,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            native,
            handler,
            config,
            counters,
            exchanges: HashMap::new(),
            outcomes_tx,
            outcomes_rx,
            draining: false,
        }
    }

    /// Exchanges currently in the table.
    pub fn in_flight(&self) -> usize {
        self.exchanges.len()
    }

    /// Poll and dispatch until `shutdown` fires and every in-flight exchange
    /// has settled. New requests arriving after shutdown get a 503.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        probe_abi(self.native.as_ref())?;
        info!("direct dispatch started");

        loop {
            if shutdown.is_cancelled() && !self.draining {
                info!(in_flight = self.exchanges.len(), "direct dispatch draining");
                self.draining = true;
            }
            if self.draining && self.exchanges.is_empty() {
                break;
            }

            let mut polled = 0;
            while polled < MAX_POLLS_PER_TICK {
                let Some(payload) = self.native.poll_request() else {
                    break;
                };
                polled += 1;
                self.dispatch(payload).await;
            }
            while let Ok((request_id, outcome)) = self.outcomes_rx.try_recv() {
                self.settle(request_id, outcome);
            }
            for entry in self.exchanges.values_mut() {
                entry.flush();
            }
            self.expire_stale().await;
            self.exchanges.retain(|_, entry| !entry.is_finished());

            if polled == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_idle_sleep) => {}
                    Some((request_id, outcome)) = self.outcomes_rx.recv() => {
                        self.settle(request_id, outcome);
                    }
                    _ = shutdown.cancelled(), if !self.draining => {}
                }
            }
        }

        info!("direct dispatch stopped");
        Ok(())
    }

    /// Handle one payload taken from the native side.
    pub(crate) async fn dispatch(&mut self, payload: DirectPayload) {
        let DirectPayload {
            request_id,
            payload,
        } = payload;
        let frame = match Frame::decode(&payload) {
            Ok(frame) => frame,
            Err(err) => {
                let opens_exchange = matches!(
                    peek_frame_type(&payload),
                    Ok(FrameType::Request
                        | FrameType::LegacyRequest
                        | FrameType::RequestStart
                        | FrameType::LegacyRequestStart)
                );
                if opens_exchange && !self.exchanges.contains_key(&request_id) {
                    warn!(request_id, error = %err, "rejecting undecodable direct request");
                    let err = ServerError::Frame(err);
                    self.reject(request_id, err.error_status(), err.to_string());
                } else {
                    warn!(request_id, error = %err, "dropping undecodable direct frame");
                }
                return;
            }
        };

        let max_backlog = self.config.max_body_bytes;
        match frame {
            Frame::Request(RequestFrame { head, body }) => self.open(request_id, head, Some(body)),
            Frame::RequestStart(head) => self.open(request_id, head, None),
            Frame::RequestChunk(chunk) => {
                let Some(entry) = self.exchanges.get_mut(&request_id) else {
                    warn!(request_id, "dropping request chunk for unknown request");
                    return;
                };
                entry.last_activity = Instant::now();
                if entry.tunnel.is_some() {
                    entry.forward(chunk, max_backlog);
                } else {
                    entry.exchange.push_chunk(chunk).await;
                }
            }
            Frame::RequestEnd => {
                let Some(entry) = self.exchanges.get_mut(&request_id) else {
                    warn!(request_id, "dropping request end for unknown request");
                    return;
                };
                entry.last_activity = Instant::now();
                entry.request_ended = true;
                entry.exchange.end_request();
            }
            Frame::TunnelChunk(chunk) => {
                let Some(entry) = self.exchanges.get_mut(&request_id) else {
                    warn!(request_id, "dropping tunnel chunk for unknown tunnel");
                    return;
                };
                if entry.tunnel.is_some() {
                    entry.forward(chunk, max_backlog);
                } else if !entry.exchange.queue_tunnel_bytes(chunk) {
                    warn!(request_id, "dropping tunnel chunk for an exchange without a tunnel");
                }
            }
            Frame::TunnelClose => match self.exchanges.get_mut(&request_id) {
                Some(entry) if entry.tunnel.is_some() || entry.exchange.is_detached() => {
                    debug!(request_id, "direct tunnel closed by native side");
                    entry.close_requested = true;
                    entry.flush();
                }
                Some(_) => warn!(
                    request_id,
                    "dropping tunnel close for an exchange without a tunnel"
                ),
                None => warn!(request_id, "dropping tunnel close for unknown tunnel"),
            },
            other => warn!(
                request_id,
                frame_type = other.frame_type().name(),
                "dropping response frame sent to the dispatcher"
            ),
        }
    }

    fn open(&mut self, request_id: u64, head: RequestHead, body: Option<Bytes>) {
        if self.exchanges.contains_key(&request_id) {
            warn!(request_id, "dropping request for an id already in flight");
            return;
        }
        if self.draining {
            debug!(request_id, "refusing request while draining");
            self.reject(request_id, 503, "server is shutting down".to_string());
            return;
        }
        if let Some(body) = &body {
            if body.len() > self.config.max_body_bytes {
                let err = ServerError::ResourceLimit {
                    size: body.len(),
                    max: self.config.max_body_bytes,
                };
                warn!(request_id, error = %err, "request body over limit, handler not invoked");
                self.reject(request_id, err.error_status(), err.to_string());
                return;
            }
        }

        debug!(request_id, method = %head.method, path = %head.path, "direct request");
        let request_ended = body.is_some();
        let queue = match body {
            Some(body) => BodyQueue::complete(body),
            None => BodyQueue::new(self.config.max_body_bytes),
        };
        let channel = self.counters.channel_opened();
        let mut exchange = Exchange::dispatch(
            &self.handler,
            head,
            queue,
            Outlet::Direct {
                native: Arc::clone(&self.native),
                request_id,
            },
            ExchangeSettings {
                mode: ExchangeMode::Direct,
                max_body: self.config.max_body_bytes,
                tunnel_read_chunk: BODY_CHUNK_BYTES,
            },
            self.counters.exchange_started(),
        );

        if let Some(outcome_rx) = exchange.take_outcome() {
            let outcomes = self.outcomes_tx.clone();
            tokio::spawn(async move {
                let outcome = outcome_rx
                    .await
                    .unwrap_or_else(|_| Outcome::Aborted(ServerError::ChannelClosed));
                let _ = outcomes.send((request_id, outcome));
            });
        }

        self.exchanges.insert(
            request_id,
            DirectExchange {
                exchange,
                request_ended,
                response_done: false,
                tunnel: None,
                backlog: VecDeque::new(),
                backlog_bytes: 0,
                close_requested: false,
                last_activity: Instant::now(),
                _channel: channel,
            },
        );
    }

    fn settle(&mut self, request_id: u64, outcome: Outcome) {
        let Some(entry) = self.exchanges.get_mut(&request_id) else {
            debug!(request_id, "outcome for an exchange no longer tracked");
            if let Outcome::Detached(tunnel) = outcome {
                tunnel.close();
            }
            return;
        };
        match outcome {
            Outcome::Completed => entry.response_done = true,
            Outcome::Detached(tunnel) => {
                entry.response_done = true;
                entry.tunnel = Some(tunnel);
                let max_backlog = self.config.max_body_bytes;
                for chunk in entry.exchange.take_detached_body() {
                    entry.forward(chunk, max_backlog);
                }
                entry.flush();
            }
            Outcome::Aborted(err) => {
                warn!(request_id, error = %err, "direct exchange aborted");
                self.exchanges.remove(&request_id);
            }
        }
    }

    /// Answer exchanges that waited too long for a response to start.
    async fn expire_stale(&mut self) {
        let timeout = self.config.request_timeout;
        let candidates: Vec<u64> = self
            .exchanges
            .iter()
            .filter(|(_, entry)| {
                !entry.response_done
                    && entry.tunnel.is_none()
                    && entry.last_activity.elapsed() >= timeout
            })
            .map(|(request_id, _)| *request_id)
            .collect();

        for request_id in candidates {
            let Some(mut entry) = self.exchanges.remove(&request_id) else {
                continue;
            };
            if entry.exchange.state().await == ExchangeState::StreamingResponse {
                self.exchanges.insert(request_id, entry);
                continue;
            }
            warn!(request_id, ?timeout, "direct request timed out");
            entry.exchange.abort(ServerError::Timeout(timeout)).await;
        }
    }

    /// Answer a request without dispatching it.
    fn reject(&self, request_id: u64, status: u16, message: String) {
        let headers = vec![("content-type".to_string(), "text/plain".to_string())];
        let body = Bytes::from(message);
        for frame in complete_frames(ExchangeMode::Direct, status, headers, body) {
            let payload = match frame.to_bytes() {
                Ok(payload) => payload,
                Err(encode_err) => {
                    warn!(request_id, error = %encode_err, "could not encode error response");
                    return;
                }
            };
            if !self.native.push_response(request_id, &payload) {
                debug!(request_id, "native side no longer knows the request");
                return;
            }
        }
    }
}
