use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use bridgewire_frame::{split_chunks, Frame, Headers, BODY_CHUNK_BYTES};

use crate::error::{Result, ServerError};
use crate::sink::{handoff_frames, ExchangeMode, Outlet};

/// Largest upgrade head an application may write by hand.
pub const MAX_PREFACE_BYTES: usize = 64 * 1024;

const INBOUND_QUEUE_CHUNKS: usize = 64;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// How the upgrade response reaches the native side.
#[derive(Debug)]
pub(crate) enum Handoff {
    /// The response sink already emitted it.
    Emitted,
    /// The application writes the `HTTP/1.1 101` head into the socket itself.
    Preface { mode: ExchangeMode, extra_headers: Headers },
}

/// Result of handing bytes to a tunnel without waiting.
#[derive(Debug)]
pub(crate) enum Offer {
    Accepted,
    /// The inbound queue is full; the bytes come back to the caller.
    Full(Bytes),
    Closed,
}

/// Bridge-side control of one detached tunnel.
///
/// Cloning shares the tunnel. [`close`](Self::close) may be called any number
/// of times from either direction.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    id: u64,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl TunnelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver bytes from the native side to the application socket.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::ChannelClosed);
        }
        self.inbound
            .send(bytes)
            .await
            .map_err(|_| ServerError::ChannelClosed)
    }

    /// Like [`send`](Self::send), but never waits for the application to
    /// read.
    pub(crate) fn offer(&self, bytes: Bytes) -> Offer {
        if self.cancel.is_cancelled() {
            return Offer::Closed;
        }
        match self.inbound.try_send(bytes) {
            Ok(()) => Offer::Accepted,
            Err(mpsc::error::TrySendError::Full(bytes)) => Offer::Full(bytes),
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Tear the tunnel down. Queued inbound bytes are still written first.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(tunnel = self.id, "closing tunnel");
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the tunnel has closed from either side.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Start relaying between `retained` and the bridge.
pub(crate) fn spawn(
    retained: TcpStream,
    outlet: Outlet,
    handoff: Handoff,
    read_chunk: usize,
) -> TunnelHandle {
    let id = NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = retained.into_split();
    let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CHUNKS);
    let cancel = CancellationToken::new();

    tokio::spawn(write_inbound(id, write_half, inbound_rx, cancel.clone()));
    tokio::spawn(pump_outbound(
        id,
        read_half,
        outlet,
        handoff,
        cancel.clone(),
        read_chunk.max(1),
    ));
    debug!(tunnel = id, "tunnel started");

    TunnelHandle {
        id,
        inbound,
        cancel,
    }
}

/// Bridge → application.
async fn write_inbound(
    id: u64,
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(err) = socket.write_all(&chunk).await {
                        debug!(tunnel = id, error = %err, "tunnel socket write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(chunk) = rx.try_recv() {
                    if socket.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = socket.shutdown().await;
    cancel.cancel();
    debug!(tunnel = id, "tunnel inbound finished");
}

/// Application → bridge.
async fn pump_outbound(
    id: u64,
    mut socket: OwnedReadHalf,
    outlet: Outlet,
    handoff: Handoff,
    cancel: CancellationToken,
    read_chunk: usize,
) {
    if let Handoff::Preface {
        mode,
        extra_headers,
    } = handoff
    {
        let preface = tokio::select! {
            _ = cancel.cancelled() => return,
            preface = read_preface(&mut socket) => preface,
        };
        match preface {
            Ok(mut preface) => {
                preface.headers.extend(extra_headers);
                for frame in handoff_frames(mode, preface.status, preface.headers) {
                    if outlet.send(frame).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
                if !send_tunnel_bytes(&outlet, preface.leftover).await {
                    cancel.cancel();
                    return;
                }
            }
            Err(err) => {
                warn!(tunnel = id, error = %err, "invalid upgrade preface");
                let body = Bytes::from(err.to_string());
                let headers = vec![("content-type".to_string(), "text/plain".to_string())];
                for frame in crate::sink::complete_frames(mode, 400, headers, body) {
                    if outlet.send(frame).await.is_err() {
                        break;
                    }
                }
                cancel.cancel();
                return;
            }
        }
    }

    let mut buf = BytesMut::with_capacity(read_chunk);
    loop {
        buf.reserve(read_chunk);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = socket.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(tunnel = id, "application closed tunnel socket");
                let _ = outlet.send(Frame::TunnelClose).await;
                break;
            }
            Ok(_) => {
                if !send_tunnel_bytes(&outlet, buf.split().freeze()).await {
                    break;
                }
            }
            Err(err) => {
                debug!(tunnel = id, error = %err, "tunnel socket read failed");
                let _ = outlet.send(Frame::TunnelClose).await;
                break;
            }
        }
    }
    cancel.cancel();
    debug!(tunnel = id, "tunnel outbound finished");
}

async fn send_tunnel_bytes(outlet: &Outlet, bytes: Bytes) -> bool {
    for piece in split_chunks(bytes, BODY_CHUNK_BYTES) {
        if let Err(err) = outlet.send(Frame::TunnelChunk(piece)).await {
            debug!(error = %err, "bridge gone while relaying tunnel bytes");
            return false;
        }
    }
    true
}

/// Upgrade head written by the application, plus whatever followed it.
#[derive(Debug)]
pub(crate) struct Preface {
    pub status: u16,
    pub headers: Headers,
    pub leftover: Bytes,
}

async fn read_preface(socket: &mut OwnedReadHalf) -> Result<Preface> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf.split_to(end);
            return parse_preface(&head, buf.freeze());
        }
        if buf.len() >= MAX_PREFACE_BYTES {
            return Err(ServerError::Tunnel(format!(
                "upgrade head exceeds {MAX_PREFACE_BYTES} bytes"
            )));
        }
        buf.reserve(4096);
        if socket.read_buf(&mut buf).await? == 0 {
            return Err(ServerError::Tunnel(
                "socket closed before upgrade head completed".into(),
            ));
        }
    }
}

/// Offset just past the blank line ending the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

pub(crate) fn parse_preface(head: &[u8], leftover: Bytes) -> Result<Preface> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ServerError::Tunnel("upgrade head is not utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| ServerError::Tunnel(format!("invalid status line: {status_line}")))?,
        _ => {
            return Err(ServerError::Tunnel(format!(
                "invalid status line: {status_line}"
            )))
        }
    };

    let mut headers = Vec::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ServerError::Tunnel(format!("invalid header line: {line}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Preface {
        status,
        headers,
        leftover,
    })
}
