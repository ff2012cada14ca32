//! Network counters: what went over the wire and how searches ended.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct NetStats {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub handshakes: AtomicU64,
    pub store_in: AtomicU64,
    pub store_out: AtomicU64,
    pub retrieve_in: AtomicU64,
    pub retrieve_out: AtomicU64,
    pub peers_out: AtomicU64,
    pub found: AtomicU64,
    pub timeouts: AtomicU64,
    pub rejected: AtomicU64,
}

/// Point-in-time copy of [`NetStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub handshakes: u64,
    pub store_in: u64,
    pub store_out: u64,
    pub retrieve_in: u64,
    pub retrieve_out: u64,
    pub peers_out: u64,
    pub found: u64,
    pub timeouts: u64,
    pub rejected: u64,
}

impl NetStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_in: load(&self.messages_in),
            messages_out: load(&self.messages_out),
            handshakes: load(&self.handshakes),
            store_in: load(&self.store_in),
            store_out: load(&self.store_out),
            retrieve_in: load(&self.retrieve_in),
            retrieve_out: load(&self.retrieve_out),
            peers_out: load(&self.peers_out),
            found: load(&self.found),
            timeouts: load(&self.timeouts),
            rejected: load(&self.rejected),
        }
    }

    /// Log a snapshot, skipping idle nodes.
    pub fn log(&self) {
        let s = self.snapshot();
        if s == StatsSnapshot::default() {
            return;
        }
        tracing::info!(
            msgs_in = s.messages_in,
            msgs_out = s.messages_out,
            handshakes = s.handshakes,
            store_in = s.store_in,
            store_out = s.store_out,
            retrieve_in = s.retrieve_in,
            retrieve_out = s.retrieve_out,
            peers_out = s.peers_out,
            found = s.found,
            timeouts = s.timeouts,
            rejected = s.rejected,
            "network stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = NetStats::new();
        NetStats::bump(&stats.store_out);
        NetStats::bump(&stats.store_out);
        NetStats::bump(&stats.timeouts);
        let s = stats.snapshot();
        assert_eq!(s.store_out, 2);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.retrieve_in, 0);
    }
}
