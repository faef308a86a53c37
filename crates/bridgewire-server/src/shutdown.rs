//! Signal-driven shutdown with second-signal escalation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A process signal that asks the server to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Conventional exit code for a process killed by this signal.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

/// Where shutdown signals come from.
pub trait SignalSource: Send {
    /// Next signal, or `None` once the source can deliver no more.
    fn next(&mut self) -> impl Future<Output = Option<ShutdownSignal>> + Send;
}

/// SIGINT and SIGTERM from the operating system.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Install the handlers. Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }
}

impl SignalSource for OsSignals {
    async fn next(&mut self) -> Option<ShutdownSignal> {
        #[cfg(unix)]
        {
            tokio::select! {
                got = self.interrupt.recv() => got.map(|()| ShutdownSignal::Interrupt),
                got = self.terminate.recv() => got.map(|()| ShutdownSignal::Terminate),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .ok()
                .map(|()| ShutdownSignal::Interrupt)
        }
    }
}

impl SignalSource for mpsc::Receiver<ShutdownSignal> {
    async fn next(&mut self) -> Option<ShutdownSignal> {
        self.recv().await
    }
}

/// Cancel `token` on the first signal. A second signal starts a `grace`
/// countdown, after which the caller should exit immediately with the
/// returned code.
///
/// Returns `None` if the source runs dry before a second signal arrives.
pub async fn watch_signals<S: SignalSource>(
    mut source: S,
    token: CancellationToken,
    grace: Duration,
) -> Option<i32> {
    let first = tokio::select! {
        signal = source.next() => signal?,
        _ = token.cancelled() => {
            // Shut down for another reason; a signal now still escalates.
            source.next().await?
        }
    };
    if token.is_cancelled() {
        warn!(signal = first.name(), "signal during shutdown");
        return escalate(first, grace).await;
    }
    info!(signal = first.name(), "shutdown requested, draining");
    token.cancel();

    let second = source.next().await?;
    escalate(second, grace).await
}

async fn escalate(signal: ShutdownSignal, grace: Duration) -> Option<i32> {
    warn!(
        signal = signal.name(),
        grace_ms = grace.as_millis() as u64,
        "second shutdown signal, forcing exit after grace period"
    );
    tokio::time::sleep(grace).await;
    Some(signal.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_signal_numbers() {
        assert_eq!(ShutdownSignal::Interrupt.exit_code(), 130);
        assert_eq!(ShutdownSignal::Terminate.exit_code(), 143);
    }

    #[tokio::test(start_paused = true)]
    async fn first_signal_cancels_second_escalates() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch_signals(rx, token.clone(), Duration::from_secs(5)));

        tx.send(ShutdownSignal::Interrupt).await.unwrap();
        token.cancelled().await;
        assert!(!watcher.is_finished());

        tx.send(ShutdownSignal::Terminate).await.unwrap();
        assert_eq!(watcher.await.unwrap(), Some(143));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_delays_forced_exit() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();
        tx.send(ShutdownSignal::Interrupt).await.unwrap();
        tx.send(ShutdownSignal::Interrupt).await.unwrap();

        let code = watch_signals(rx, token.clone(), Duration::from_secs(5)).await;
        assert_eq!(code, Some(130));
        assert!(token.is_cancelled());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn closed_source_after_first_signal_returns_none() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        tx.send(ShutdownSignal::Terminate).await.unwrap();
        drop(tx);

        assert_eq!(watch_signals(rx, token.clone(), Duration::ZERO).await, None);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn signal_after_external_cancel_escalates() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        token.cancel();
        tx.send(ShutdownSignal::Interrupt).await.unwrap();

        assert_eq!(
            watch_signals(rx, token, Duration::ZERO).await,
            Some(130)
        );
    }
}
