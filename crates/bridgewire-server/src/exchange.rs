use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;

use bridgewire_frame::RequestHead;

use crate::body::{BodyQueue, RequestBody};
use crate::counters::ExchangeGuard;
use crate::error::ServerError;
use crate::handler::{BridgeRequest, Handler};
use crate::sink::{ExchangeMode, ExchangeState, Outlet, ResponseSink, SharedHeaders, SinkCore};
use crate::tunnel::TunnelHandle;

/// How an exchange's response side ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The last response frame went out.
    Completed,
    /// The exchange became a tunnel.
    Detached(TunnelHandle),
    /// Failed after the response was committed, or the bridge went away.
    Aborted(ServerError),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ExchangeSettings {
    pub mode: ExchangeMode,
    pub max_body: usize,
    pub tunnel_read_chunk: usize,
}

/// One dispatched exchange, seen from whoever feeds it request frames.
///
/// The handler runs on its own task. A supervisor task settles the response
/// when the handler returns, so the outcome always arrives even if the
/// handler never finished the response itself.
pub(crate) struct Exchange {
    core: Arc<Mutex<SinkCore>>,
    body: Arc<BodyQueue>,
    outcome: Option<oneshot::Receiver<Outcome>>,
    handler_task: AbortHandle,
    overflowed: bool,
    _guard: ExchangeGuard,
}

impl Exchange {
    pub(crate) fn dispatch<H: Handler>(
        handler: &Arc<H>,
        head: RequestHead,
        body: Arc<BodyQueue>,
        outlet: Outlet,
        settings: ExchangeSettings,
        guard: ExchangeGuard,
    ) -> Self {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let pending = SharedHeaders::new();
        let core = Arc::new(Mutex::new(SinkCore::new(
            settings.mode,
            outlet,
            Arc::clone(&body),
            settings.max_body,
            settings.tunnel_read_chunk,
            pending.clone(),
            outcome_tx,
        )));

        let request = BridgeRequest::new(head, RequestBody::new(Arc::clone(&body)));
        let sink = ResponseSink::new(Arc::clone(&core), pending);
        let handler = Arc::clone(handler);
        let task = tokio::spawn(async move { handler.handle(request, sink).await });
        let handler_task = task.abort_handle();

        let supervised = Arc::clone(&core);
        tokio::spawn(async move {
            let joined = task.await;
            supervised.lock().await.conclude(joined).await;
        });

        Self {
            core,
            body,
            outcome: Some(outcome_rx),
            handler_task,
            overflowed: false,
            _guard: guard,
        }
    }

    /// Queue a request-body chunk for the handler.
    ///
    /// A chunk crossing the body limit fails the exchange and stops the
    /// handler; later chunks are dropped.
    pub(crate) async fn push_chunk(&mut self, chunk: Bytes) {
        if self.overflowed {
            return;
        }
        if let Err(err) = self.body.push(chunk) {
            self.overflowed = true;
            self.core.lock().await.fail(err).await;
            self.handler_task.abort();
        }
    }

    pub(crate) fn end_request(&self) {
        self.body.finish();
    }

    /// Wait for the response side to settle. Cancel safe.
    pub(crate) async fn outcome(&mut self) -> Outcome {
        let Some(rx) = self.outcome.as_mut() else {
            return Outcome::Aborted(ServerError::ChannelClosed);
        };
        let outcome = rx
            .await
            .unwrap_or_else(|_| Outcome::Aborted(ServerError::ChannelClosed));
        self.outcome = None;
        outcome
    }

    /// Hand the outcome receiver to another task.
    pub(crate) fn take_outcome(&mut self) -> Option<oneshot::Receiver<Outcome>> {
        self.outcome.take()
    }

    /// Request chunks the handler never read, for a tunnel to deliver first.
    pub(crate) fn take_detached_body(&self) -> Vec<Bytes> {
        self.body.take_detached()
    }

    /// Hold tunnel bytes that arrive after the handoff started but before
    /// the outcome was taken. Returns `false` if the exchange is not detaching.
    pub(crate) fn queue_tunnel_bytes(&self, chunk: Bytes) -> bool {
        self.body.push_detached(chunk)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.body.is_detached()
    }

    /// Fail the exchange from the bridge side and stop the handler.
    pub(crate) async fn abort(&mut self, err: ServerError) {
        self.core.lock().await.fail(err).await;
        self.handler_task.abort();
    }

    pub(crate) async fn state(&self) -> ExchangeState {
        self.core.lock().await.state()
    }
}
