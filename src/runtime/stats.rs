//! Resource accounting shared by the driver, context pools and engine.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters for sockets, contexts and traffic events.
#[derive(Debug, Default)]
pub struct ResourceStats {
    open_sockets: AtomicUsize,
    live_contexts: AtomicUsize,
    partial_sends: AtomicUsize,
    accepted: AtomicUsize,
}

/// Point-in-time copy of [`ResourceStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Sockets currently registered with the completion driver, listener included.
    pub open_sockets: usize,
    /// I/O contexts registered across all socket context pools.
    pub live_contexts: usize,
    /// Sends that completed with fewer bytes than requested.
    pub partial_sends: usize,
    /// Connections accepted since the server was created.
    pub accepted: usize,
}

impl ResourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn socket_opened(&self) {
        self.open_sockets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sockets_closed(&self, count: usize) {
        self.open_sockets.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn context_allocated(&self) {
        self.live_contexts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn contexts_freed(&self, count: usize) {
        self.live_contexts.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn partial_send(&self) {
        self.partial_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            open_sockets: self.open_sockets.load(Ordering::Relaxed),
            live_contexts: self.live_contexts.load(Ordering::Relaxed),
            partial_sends: self.partial_sends.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ResourceStats::new();
        stats.socket_opened();
        stats.socket_opened();
        stats.sockets_closed(1);
        stats.context_allocated();
        stats.partial_send();
        stats.connection_accepted();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                open_sockets: 1,
                live_contexts: 1,
                partial_sends: 1,
                accepted: 1,
            }
        );
    }
}
