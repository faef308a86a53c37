use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use bridgewire_frame::{
    peek_frame_type, Frame, FrameError, FrameReader, FrameType, FrameWriter, RequestFrame,
    RequestHead,
};

use crate::body::BodyQueue;
use crate::counters::ConnectionCounters;
use crate::error::{Result, ServerError};
use crate::exchange::{Exchange, ExchangeSettings, Outcome};
use crate::handler::Handler;
use crate::server::ServerConfig;
use crate::sink::{complete_frames, ExchangeMode, ExchangeState, Outlet};
use crate::tunnel::TunnelHandle;

/// Serve bridge exchanges on one connection until the native side closes it,
/// a fatal error occurs, or `shutdown` fires between exchanges.
///
/// Exchanges are served one at a time in arrival order. Response frames go
/// through a single writer task, so frames of one exchange never interleave
/// with anything else on the wire.
pub async fn serve_connection<S, H>(
    stream: S,
    handler: Arc<H>,
    config: &ServerConfig,
    counters: &Arc<ConnectionCounters>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler,
{
    let _channel = counters.channel_opened();
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_frames.max(1));
    let writer = tokio::spawn(drain_outbound(
        FrameWriter::with_config(write_half, config.frame.clone()),
        outbound_rx,
    ));

    let mut connection = Connection {
        reader: FrameReader::with_config(read_half, config.frame.clone()),
        outbound,
        handler,
        counters: Arc::clone(counters),
        settings: ExchangeSettings {
            mode: ExchangeMode::SingleFrame,
            max_body: config.frame.max_body_bytes,
            tunnel_read_chunk: config.tunnel_read_chunk,
        },
    };
    let served = connection.run(&shutdown).await;
    drop(connection);

    let flushed = match writer.await {
        Ok(result) => result,
        Err(err) => Err(ServerError::Io(std::io::Error::other(err))),
    };
    match (served, flushed) {
        (Err(ServerError::ChannelClosed), Err(write_err)) => Err(write_err),
        (Err(err), _) => Err(err),
        (Ok(()), flushed) => flushed,
    }
}

async fn drain_outbound<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<Frame>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        trace!(frame_type = frame.frame_type().name(), "writing frame");
        writer.write_frame(&frame).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

struct Connection<S, H> {
    reader: FrameReader<ReadHalf<S>>,
    outbound: mpsc::Sender<Frame>,
    handler: Arc<H>,
    counters: Arc<ConnectionCounters>,
    settings: ExchangeSettings,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler,
{
    async fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            trace!(state = ?ExchangeState::AwaitingRequest, "waiting for next exchange");
            let payload = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested, serving no further exchanges");
                    return Ok(());
                }
                payload = self.reader.read_payload() => payload?,
            };
            let Some(payload) = payload else {
                debug!("bridge connection closed by peer");
                return Ok(());
            };

            match Frame::decode(&payload) {
                Ok(Frame::Request(request)) => self.single(request).await?,
                Ok(Frame::RequestStart(head)) => self.streamed(head).await?,
                Ok(Frame::TunnelChunk(_) | Frame::TunnelClose) => {
                    debug!("dropping tunnel frame with no open tunnel");
                }
                Ok(other) => {
                    return Err(ServerError::ProtocolSequence(format!(
                        "{} frame outside an exchange",
                        other.frame_type().name()
                    )))
                }
                Err(err) => self.reject_undecodable(&payload, err).await?,
            }
        }
    }

    fn outlet(&self) -> Outlet {
        Outlet::Channel(self.outbound.clone())
    }

    fn settings(&self, mode: ExchangeMode) -> ExchangeSettings {
        ExchangeSettings {
            mode,
            ..self.settings
        }
    }

    async fn send_frames(&self, frames: Vec<Frame>) -> Result<()> {
        for frame in frames {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| ServerError::ChannelClosed)?;
        }
        Ok(())
    }

    async fn send_error(&self, mode: ExchangeMode, err: &ServerError) -> Result<()> {
        let headers = vec![("content-type".to_string(), "text/plain".to_string())];
        let body = Bytes::from(err.to_string());
        self.send_frames(complete_frames(mode, err.error_status(), headers, body))
            .await
    }

    /// A request frame that does not decode still gets an answer. Anything
    /// else undecodable ends the connection.
    async fn reject_undecodable(&mut self, payload: &Bytes, err: FrameError) -> Result<()> {
        match peek_frame_type(payload) {
            Ok(FrameType::Request | FrameType::LegacyRequest) => {
                warn!(error = %err, "rejecting undecodable request");
                self.send_error(ExchangeMode::SingleFrame, &ServerError::Frame(err))
                    .await
            }
            Ok(FrameType::RequestStart | FrameType::LegacyRequestStart) => {
                warn!(error = %err, "rejecting undecodable request start");
                self.send_error(ExchangeMode::Streamed, &ServerError::Frame(err))
                    .await?;
                self.skip_request_body().await
            }
            _ => Err(err.into()),
        }
    }

    async fn skip_request_body(&mut self) -> Result<()> {
        loop {
            match self.reader.read_frame().await? {
                Some(Frame::RequestChunk(_)) => {}
                Some(Frame::RequestEnd) | None => return Ok(()),
                Some(other) => {
                    return Err(ServerError::ProtocolSequence(format!(
                        "{} frame inside a request body",
                        other.frame_type().name()
                    )))
                }
            }
        }
    }

    async fn single(&mut self, request: RequestFrame) -> Result<()> {
        let RequestFrame { head, body } = request;
        debug!(
            method = %head.method,
            path = %head.path,
            bytes = body.len(),
            "single-frame request"
        );
        let guard = self.counters.exchange_started();
        if body.len() > self.settings.max_body {
            let err = ServerError::ResourceLimit {
                size: body.len(),
                max: self.settings.max_body,
            };
            warn!(error = %err, "request body over limit, handler not invoked");
            drop(guard);
            return self.send_error(ExchangeMode::SingleFrame, &err).await;
        }

        let mut exchange = Exchange::dispatch(
            &self.handler,
            head,
            BodyQueue::complete(body),
            self.outlet(),
            self.settings(ExchangeMode::SingleFrame),
            guard,
        );
        match exchange.outcome().await {
            Outcome::Completed => Ok(()),
            Outcome::Detached(tunnel) => self.relay_tunnel(&exchange, tunnel, true).await,
            Outcome::Aborted(err) => Err(err),
        }
    }

    async fn streamed(&mut self, head: RequestHead) -> Result<()> {
        debug!(method = %head.method, path = %head.path, "streamed request");
        let guard = self.counters.exchange_started();
        let mut exchange = Exchange::dispatch(
            &self.handler,
            head,
            BodyQueue::new(self.settings.max_body),
            self.outlet(),
            self.settings(ExchangeMode::Streamed),
            guard,
        );

        let mut request_ended = false;
        let mut tunnel_closed = false;
        let outcome = loop {
            tokio::select! {
                biased;
                outcome = exchange.outcome() => break outcome,
                frame = self.reader.read_frame(), if !request_ended => {
                    match apply_request_frame(&mut exchange, frame).await? {
                        BodyProgress::More => {}
                        BodyProgress::Ended => request_ended = true,
                        BodyProgress::TunnelClosed => {
                            request_ended = true;
                            tunnel_closed = true;
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Completed => {
                while !request_ended {
                    let frame = self.reader.read_frame().await;
                    request_ended = !matches!(
                        apply_request_frame(&mut exchange, frame).await?,
                        BodyProgress::More
                    );
                }
                Ok(())
            }
            Outcome::Detached(tunnel) if tunnel_closed => {
                flush_detached_body(&exchange, &tunnel).await;
                debug!(tunnel = tunnel.id(), "tunnel closed by native side");
                tunnel.close();
                Ok(())
            }
            Outcome::Detached(tunnel) => {
                self.relay_tunnel(&exchange, tunnel, request_ended).await
            }
            Outcome::Aborted(err) => Err(err),
        }
    }

    /// Relay frames into a detached tunnel until either side closes it.
    async fn relay_tunnel(
        &mut self,
        exchange: &Exchange,
        tunnel: TunnelHandle,
        mut request_ended: bool,
    ) -> Result<()> {
        flush_detached_body(exchange, &tunnel).await;

        loop {
            let frame = tokio::select! {
                biased;
                _ = tunnel.closed() => {
                    debug!(tunnel = tunnel.id(), "tunnel closed by application");
                    return Ok(());
                }
                frame = self.reader.read_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tunnel.close();
                    return Err(err.into());
                }
            };
            match frame {
                Some(Frame::TunnelChunk(chunk)) => {
                    if tunnel.send(chunk).await.is_err() {
                        debug!(tunnel = tunnel.id(), "dropping bytes for closed tunnel");
                    }
                }
                Some(Frame::RequestChunk(chunk)) if !request_ended => {
                    if tunnel.send(chunk).await.is_err() {
                        debug!(tunnel = tunnel.id(), "dropping bytes for closed tunnel");
                    }
                }
                Some(Frame::RequestEnd) if !request_ended => request_ended = true,
                Some(Frame::TunnelClose) => {
                    debug!(tunnel = tunnel.id(), "tunnel closed by native side");
                    tunnel.close();
                    return Ok(());
                }
                None => {
                    tunnel.close();
                    return Ok(());
                }
                Some(other) => {
                    tunnel.close();
                    return Err(ServerError::ProtocolSequence(format!(
                        "{} frame after tunnel handoff",
                        other.frame_type().name()
                    )));
                }
            }
        }
    }
}

/// Hand the tunnel what arrived before it existed: unread request body,
/// then tunnel bytes that raced the handoff.
async fn flush_detached_body(exchange: &Exchange, tunnel: &TunnelHandle) {
    for chunk in exchange.take_detached_body() {
        if tunnel.send(chunk).await.is_err() {
            debug!(tunnel = tunnel.id(), "dropping bytes for closed tunnel");
            break;
        }
    }
}

/// Apply one frame read while a request body is open.
///
/// Once the handler has detached, tunnel frames may arrive before the
/// outcome is observed; they are held for the tunnel.
async fn apply_request_frame(
    exchange: &mut Exchange,
    frame: std::result::Result<Option<Frame>, FrameError>,
) -> Result<BodyProgress> {
    let failure = match frame {
        Ok(Some(Frame::RequestChunk(chunk))) => {
            trace!(bytes = chunk.len(), "request chunk");
            exchange.push_chunk(chunk).await;
            return Ok(BodyProgress::More);
        }
        Ok(Some(Frame::RequestEnd)) => {
            exchange.end_request();
            return Ok(BodyProgress::Ended);
        }
        Ok(Some(Frame::TunnelChunk(chunk))) => {
            if exchange.queue_tunnel_bytes(chunk) {
                return Ok(BodyProgress::More);
            }
            ServerError::ProtocolSequence(format!(
                "{} frame inside a request body",
                FrameType::TunnelChunk.name()
            ))
        }
        Ok(Some(Frame::TunnelClose)) if exchange.is_detached() => {
            return Ok(BodyProgress::TunnelClosed);
        }
        Ok(Some(other)) => ServerError::ProtocolSequence(format!(
            "{} frame inside a request body",
            other.frame_type().name()
        )),
        Ok(None) => ServerError::Frame(FrameError::ConnectionClosed),
        Err(err) => err.into(),
    };
    let state = exchange.state().await;
    debug!(error = %failure, ?state, "request stream broken");
    exchange
        .abort(ServerError::ProtocolSequence(failure.to_string()))
        .await;
    Err(failure)
}

enum BodyProgress {
    More,
    Ended,
    /// The native side closed a tunnel whose outcome is not yet observed.
    TunnelClosed,
}
