//! Peer routing: which peers are "near" a key.
//!
//! `NetworkStore` only sees the `PeerRouter` trait. `PeerTable` is the
//! reference implementation: connected sessions plus peer records learned
//! from PEERS messages, ranked by XOR distance between key and node id.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use cairn_core::{ContentKey, PeerAddress};
use dashmap::DashMap;

use crate::session::{PeerSession, SessionId};

pub trait PeerRouter: Send + Sync {
    /// Up to `limit` connected sessions, nearest first.
    fn nearest_peers(&self, key: &ContentKey, limit: usize) -> Vec<Arc<PeerSession>>;

    /// Called once a session completes its handshake.
    fn register(&self, session: Arc<PeerSession>);

    fn unregister(&self, id: SessionId);

    /// Up to `limit` known peer addresses, connected or not, nearest first.
    fn nearest_addresses(&self, key: &ContentKey, limit: usize) -> Vec<PeerAddress>;

    /// Remember peers advertised by someone else.
    fn add_peer_records(&self, peers: &[PeerAddress]);
}

/// Compare `a ^ target` against `b ^ target`, treating missing bytes as zero.
pub fn cmp_distance(target: &[u8], a: &[u8], b: &[u8]) -> Ordering {
    let len = target.len().max(a.len()).max(b.len());
    let at = |s: &[u8], i: usize| s.get(i).copied().unwrap_or(0);
    for i in 0..len {
        let t = at(target, i);
        let ord = (at(a, i) ^ t).cmp(&(at(b, i) ^ t));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Default cap on learned peer addresses.
pub const MAX_RECORDS: usize = 1024;

pub struct PeerTable {
    local_id: Bytes,
    sessions: DashMap<SessionId, Arc<PeerSession>>,
    records: DashMap<Bytes, PeerAddress>,
    max_records: usize,
}

impl PeerTable {
    pub fn new(local_id: impl Into<Bytes>) -> Self {
        Self::with_capacity(local_id, MAX_RECORDS)
    }

    /// A table that learns at most `max_records` addresses from peer lists.
    /// Connected peers are always recorded.
    pub fn with_capacity(local_id: impl Into<Bytes>, max_records: usize) -> Self {
        Self {
            local_id: local_id.into(),
            sessions: DashMap::new(),
            records: DashMap::new(),
            max_records,
        }
    }

    pub fn connected(&self) -> usize {
        self.sessions.len()
    }

    pub fn known(&self) -> usize {
        self.records.len()
    }

    /// Known addresses with no live session, for dialing.
    pub fn unconnected_records(&self) -> Vec<PeerAddress> {
        self.records
            .iter()
            .filter(|r| {
                !self
                    .sessions
                    .iter()
                    .any(|s| s.peer().is_some_and(|p| p.node_id == r.node_id))
            })
            .map(|r| r.value().clone())
            .collect()
    }
}

impl PeerRouter for PeerTable {
    fn nearest_peers(&self, key: &ContentKey, limit: usize) -> Vec<Arc<PeerSession>> {
        let mut ranked: Vec<(Bytes, Arc<PeerSession>)> = self
            .sessions
            .iter()
            .filter_map(|s| s.peer().map(|p| (p.node_id.clone(), s.value().clone())))
            .collect();
        ranked.sort_by(|(a, _), (b, _)| cmp_distance(key.as_bytes(), a, b));
        ranked.into_iter().take(limit).map(|(_, s)| s).collect()
    }

    fn register(&self, session: Arc<PeerSession>) {
        if let Some(peer) = session.peer() {
            self.records.insert(peer.node_id.clone(), peer.clone());
        }
        tracing::debug!(session = %session.id(), "peer registered");
        self.sessions.insert(session.id(), session);
    }

    fn unregister(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            tracing::debug!(session = %id, "peer unregistered");
        }
    }

    fn nearest_addresses(&self, key: &ContentKey, limit: usize) -> Vec<PeerAddress> {
        let mut ranked: Vec<PeerAddress> = self.records.iter().map(|r| r.value().clone()).collect();
        ranked.sort_by(|a, b| cmp_distance(key.as_bytes(), &a.node_id, &b.node_id));
        ranked.truncate(limit);
        ranked
    }

    fn add_peer_records(&self, peers: &[PeerAddress]) {
        let mut skipped = 0;
        for peer in peers {
            if peer.node_id.is_empty() || peer.node_id == self.local_id {
                continue;
            }
            if self.records.len() >= self.max_records && !self.records.contains_key(&peer.node_id) {
                skipped += 1;
                continue;
            }
            self.records.insert(peer.node_id.clone(), peer.clone());
        }
        if skipped > 0 {
            tracing::trace!(skipped, known = self.records.len(), "peer record limit reached");
        }
    }
}
