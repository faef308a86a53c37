use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::codec::{Frame, FrameConfig, LENGTH_PREFIX_SIZE};
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads length-prefixed frames from any `AsyncRead` stream.
///
/// Received bytes are kept as a queue of chunks. A frame payload that lies
/// entirely inside one chunk is returned as a slice of it; only payloads that
/// straddle chunk boundaries are copied.
pub struct FrameReader<R> {
    inner: R,
    chunks: VecDeque<Bytes>,
    buffered: usize,
    read_buf: BytesMut,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: R, config: FrameConfig) -> Self {
        Self {
            inner,
            chunks: VecDeque::new(),
            buffered: 0,
            read_buf: BytesMut::new(),
            config,
        }
    }

    /// Read the next frame payload.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary.
    /// End of stream inside a frame is [`FrameError::ConnectionClosed`]. The
    /// idle timeout only applies while no byte of the next frame has arrived.
    ///
    /// Cancel safe: nothing is consumed until the whole frame is buffered, so
    /// dropping the future inside `select!` loses no data.
    pub async fn read_payload(&mut self) -> Result<Option<Bytes>> {
        if self.buffered == 0 {
            let filled = match self.config.idle_timeout {
                Some(idle) => tokio::time::timeout(idle, self.fill())
                    .await
                    .map_err(|_| FrameError::IdleTimeout(idle))??,
                None => self.fill().await?,
            };
            if !filled {
                return Ok(None);
            }
        }

        while self.buffered < LENGTH_PREFIX_SIZE {
            if !self.fill().await? {
                return Err(FrameError::ConnectionClosed);
            }
        }
        let len = self.peek_len();
        self.config.check_frame_len(len)?;

        while self.buffered < LENGTH_PREFIX_SIZE + len {
            if !self.fill().await? {
                return Err(FrameError::ConnectionClosed);
            }
        }
        self.take(LENGTH_PREFIX_SIZE);
        trace!(bytes = len, "read bridge frame");
        Ok(Some(self.take(len)))
    }

    /// Read and decode the next frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self.read_payload().await? {
            Some(payload) => Frame::decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Read one more chunk from the stream. `false` on end of stream.
    async fn fill(&mut self) -> Result<bool> {
        self.read_buf.reserve(READ_CHUNK_SIZE);
        let read = self.inner.read_buf(&mut self.read_buf).await?;
        if read == 0 {
            return Ok(false);
        }
        self.buffered += read;
        self.chunks.push_back(self.read_buf.split().freeze());
        Ok(true)
    }

    /// Length prefix of the next frame. Caller guarantees four bytes are buffered.
    fn peek_len(&self) -> usize {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        for chunk in &self.chunks {
            let want = (LENGTH_PREFIX_SIZE - filled).min(chunk.len());
            prefix[filled..filled + want].copy_from_slice(&chunk[..want]);
            filled += want;
            if filled == LENGTH_PREFIX_SIZE {
                break;
            }
        }
        u32::from_be_bytes(prefix) as usize
    }

    /// Remove exactly `len` buffered bytes. Caller guarantees they are present.
    fn take(&mut self, len: usize) -> Bytes {
        self.buffered -= len;
        if len == 0 {
            return Bytes::new();
        }

        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= len {
                let out = front.split_to(len);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                return out;
            }
        }

        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let want = (len - out.len()).min(front.len());
            out.extend_from_slice(&front[..want]);
            front.advance(want);
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        out.freeze()
    }

    /// Bytes received but not yet returned as frames.
    pub fn buffered_len(&self) -> usize {
        self.buffered
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
