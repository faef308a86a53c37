use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;

use crate::error::{Result, ServerError};

/// Request-body chunks received for one exchange, held until a consumer
/// reads them.
///
/// Chunks pushed before the handler starts reading stay queued in order.
/// The byte total is checked on every push, so a chunk that would cross the
/// limit is refused and never becomes visible to the consumer.
pub(crate) struct BodyQueue {
    state: Mutex<BodyState>,
}

struct BodyState {
    chunks: VecDeque<Bytes>,
    received: usize,
    max: usize,
    ended: bool,
    detached: bool,
    failure: Option<BodyFailure>,
    waker: Option<Waker>,
}

#[derive(Debug, Clone)]
enum BodyFailure {
    Limit { size: usize, max: usize },
    Aborted(String),
}

impl BodyQueue {
    pub(crate) fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BodyState {
                chunks: VecDeque::new(),
                received: 0,
                max,
                ended: false,
                detached: false,
                failure: None,
                waker: None,
            }),
        })
    }

    /// A queue holding an already complete body.
    pub(crate) fn complete(body: Bytes) -> Arc<Self> {
        let queue = Self::new(usize::MAX);
        {
            let mut state = queue.lock();
            state.received = body.len();
            if !body.is_empty() {
                state.chunks.push_back(body);
            }
            state.ended = true;
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, BodyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one chunk for the consumer.
    pub(crate) fn push(&self, chunk: Bytes) -> Result<()> {
        let mut state = self.lock();
        if state.detached {
            // Relayed to the tunnel with the unread chunks.
            state.chunks.push_back(chunk);
            return Ok(());
        }
        if state.ended {
            return Err(ServerError::ProtocolSequence(
                "request chunk after request end".into(),
            ));
        }
        let size = state.received + chunk.len();
        if size > state.max {
            let max = state.max;
            state.failure = Some(BodyFailure::Limit { size, max });
            wake(&mut state);
            return Err(ServerError::ResourceLimit { size, max });
        }
        state.received = size;
        if !chunk.is_empty() {
            state.chunks.push_back(chunk);
        }
        wake(&mut state);
        Ok(())
    }

    /// Mark the body complete. Already queued chunks stay readable.
    pub(crate) fn finish(&self) {
        let mut state = self.lock();
        state.ended = true;
        wake(&mut state);
    }

    /// Make the consumer's next read fail.
    pub(crate) fn abort(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(BodyFailure::Aborted(reason.into()));
        }
        wake(&mut state);
    }

    /// Stop delivering to the handler. Unread chunks, and any pushed later,
    /// stay queued for [`take_detached`](Self::take_detached).
    pub(crate) fn detach(&self) {
        let mut state = self.lock();
        state.detached = true;
        state.ended = true;
        wake(&mut state);
    }

    /// Queue tunnel bytes behind the unread body. Refused until detached.
    pub(crate) fn push_detached(&self, chunk: Bytes) -> bool {
        let mut state = self.lock();
        if !state.detached {
            return false;
        }
        state.chunks.push_back(chunk);
        true
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.lock().detached
    }

    /// Chunks the handler never read, in arrival order.
    pub(crate) fn take_detached(&self) -> Vec<Bytes> {
        let mut state = self.lock();
        state.chunks.drain(..).collect()
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.lock().ended
    }

    pub(crate) fn received(&self) -> usize {
        self.lock().received
    }

    fn poll_chunk(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        let mut state = self.lock();
        if let Some(failure) = state.failure.clone() {
            return Poll::Ready(Some(Err(match failure {
                BodyFailure::Limit { size, max } => ServerError::ResourceLimit { size, max },
                BodyFailure::Aborted(reason) => ServerError::ProtocolSequence(reason),
            })));
        }
        if state.detached {
            return Poll::Ready(None);
        }
        if let Some(chunk) = state.chunks.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if state.ended {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

fn wake(state: &mut BodyState) {
    if let Some(waker) = state.waker.take() {
        waker.wake();
    }
}

/// The body of a bridge request, as an async stream of chunks.
///
/// Chunks arrive in the order the native side sent them, each exactly once.
pub struct RequestBody {
    queue: Arc<BodyQueue>,
}

impl RequestBody {
    pub(crate) fn new(queue: Arc<BodyQueue>) -> Self {
        Self { queue }
    }

    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(body: impl Into<Bytes>) -> Self {
        Self::new(BodyQueue::complete(body.into()))
    }

    /// Next chunk, or `None` once the body is complete.
    pub async fn chunk(&mut self) -> Option<Result<Bytes>> {
        std::future::poll_fn(|cx| self.queue.poll_chunk(cx)).await
    }

    /// Read the whole body into one buffer.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.chunk().await {
            chunks.push(chunk?);
        }
        if chunks.len() <= 1 {
            return Ok(chunks.pop().unwrap_or_default());
        }
        let mut joined = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in &chunks {
            joined.extend_from_slice(chunk);
        }
        Ok(joined.freeze())
    }

    /// Bytes received so far, read or not.
    pub fn received(&self) -> usize {
        self.queue.received()
    }

    /// Whether the native side has sent the whole body.
    pub fn is_complete(&self) -> bool {
        self.queue.is_ended()
    }
}

impl Stream for RequestBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.queue.poll_chunk(cx)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("received", &self.received())
            .field("complete", &self.is_complete())
            .finish()
    }
}
