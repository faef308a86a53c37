use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Open-channel and active-exchange counts shared by every listener of one
/// server.
///
/// Owned explicitly and handed to each connection, so independent servers
/// (and tests) never share counts.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    open: AtomicUsize,
    active: AtomicUsize,
}

/// Point-in-time view of [`ConnectionCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub open_channels: usize,
    pub active_exchanges: usize,
}

impl ConnectionCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a newly accepted channel until the guard drops.
    pub fn channel_opened(self: &Arc<Self>) -> ChannelGuard {
        self.open.fetch_add(1, Ordering::AcqRel);
        ChannelGuard {
            counters: Arc::clone(self),
        }
    }

    /// Count a dispatched exchange until the guard drops.
    pub fn exchange_started(self: &Arc<Self>) -> ExchangeGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ExchangeGuard {
            counters: Arc::clone(self),
        }
    }

    pub fn open_channels(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Active exchanges, never more than open channels.
    pub fn active_exchanges(&self) -> usize {
        let open = self.open_channels();
        self.active.load(Ordering::Acquire).min(open)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let open_channels = self.open_channels();
        CounterSnapshot {
            open_channels,
            active_exchanges: self.active.load(Ordering::Acquire).min(open_channels),
        }
    }
}

fn saturating_decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// Decrements the open-channel count on drop.
#[derive(Debug)]
pub struct ChannelGuard {
    counters: Arc<ConnectionCounters>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        saturating_decrement(&self.counters.open);
    }
}

/// Decrements the active-exchange count on drop.
#[derive(Debug)]
pub struct ExchangeGuard {
    counters: Arc<ConnectionCounters>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        saturating_decrement(&self.counters.active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_open_and_active() {
        let counters = ConnectionCounters::new();
        let channel = counters.channel_opened();
        let exchange = counters.exchange_started();
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                open_channels: 1,
                active_exchanges: 1
            }
        );

        drop(exchange);
        assert_eq!(counters.active_exchanges(), 0);
        drop(channel);
        assert_eq!(counters.open_channels(), 0);
    }

    #[test]
    fn active_is_clamped_to_open() {
        let counters = ConnectionCounters::new();
        let channel = counters.channel_opened();
        let first = counters.exchange_started();
        let second = counters.exchange_started();
        assert_eq!(counters.active_exchanges(), 1);

        drop(channel);
        assert_eq!(counters.active_exchanges(), 0);
        drop(first);
        drop(second);
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn independent_instances_do_not_share_counts() {
        let a = ConnectionCounters::new();
        let b = ConnectionCounters::new();
        let _guard = a.channel_opened();
        assert_eq!(a.open_channels(), 1);
        assert_eq!(b.open_channels(), 0);
    }

    #[test]
    fn concurrent_open_close_stays_consistent() {
        let counters = ConnectionCounters::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let channel = counters.channel_opened();
                        let exchange = counters.exchange_started();
                        let snapshot = counters.snapshot();
                        assert!(snapshot.active_exchanges <= snapshot.open_channels);
                        drop(exchange);
                        drop(channel);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
