//! Router forwarding statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the router's hot paths
///
/// All fields use relaxed atomics; readers get a point-in-time snapshot via
/// [`RouterStats::snapshot`].
#[derive(Debug, Default)]
pub struct RouterStats {
    /// RTP packets enqueued toward subscribers
    pub packets_forwarded: AtomicU64,
    /// RTP packets dropped because a subscriber's egress queue was full
    pub packets_dropped: AtomicU64,
    /// NACKed packets retransmitted from the local jitter buffer
    pub nacks_served: AtomicU64,
    /// NACKed packets escalated to the publisher
    pub nacks_upstream: AtomicU64,
    /// Aggregated REMB packets written to the publisher
    pub rembs_emitted: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub nacks_served: u64,
    pub nacks_upstream: u64,
    pub rembs_emitted: u64,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_forwarded(&self) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_nack_served(&self) {
        self.nacks_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_nack_upstream(&self) {
        self.nacks_upstream.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_remb_emitted(&self) {
        self.rembs_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            nacks_served: self.nacks_served.load(Ordering::Relaxed),
            nacks_upstream: self.nacks_upstream.load(Ordering::Relaxed),
            rembs_emitted: self.rembs_emitted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_at_zero() {
        let stats = RouterStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_stats_snapshot_reflects_counters() {
        let stats = RouterStats::new();

        stats.add_forwarded();
        stats.add_forwarded();
        stats.add_dropped();
        stats.add_nack_served();
        stats.add_nack_upstream();
        stats.add_remb_emitted();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_forwarded, 2);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.nacks_served, 1);
        assert_eq!(snap.nacks_upstream, 1);
        assert_eq!(snap.rembs_emitted, 1);
    }
}
