//! The distribution engine.
//!
//! Each key being resolved has at most one `PendingRequest`. Local callers
//! wait on oneshot channels; remote requesters are remembered per request id.
//! When the chunk shows up (from any peer, or a local `store`) the request is
//! removed and every waiter is served exactly once.
//!
//! Locking: every read-modify-write of a pending entry runs under its
//! `DashMap` shard lock. Messages to peers are collected inside the critical
//! section and sent after it is released.

use std::collections::HashSet;
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::config::DistributionConfig;
use cairn_core::crypto;
use cairn_core::wire::{PeersMessage, RetrieveRequest, StatusMessage, StoreRequest};
use cairn_core::{Chunk, ChunkerError, ContentKey, Message, PeerAddress, TreeChunker};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::local::LocalStore;
use crate::router::PeerRouter;
use crate::session::{PeerSession, SessionId};
use crate::stats::NetStats;

/// Who we are on the overlay.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub address: PeerAddress,
    pub network_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Searching,
    Found,
}

struct PendingRequest {
    status: Status,
    local_waiters: Vec<oneshot::Sender<Chunk>>,
    /// Request id → requesting sessions, in arrival order.
    remote_waiters: Vec<(u64, Vec<Arc<PeerSession>>)>,
    /// Sessions already sent a RETRIEVE for this key.
    asked: HashSet<SessionId>,
    deadline: Instant,
}

impl PendingRequest {
    fn new(deadline: Instant) -> Self {
        Self {
            status: Status::Searching,
            local_waiters: Vec::new(),
            remote_waiters: Vec::new(),
            asked: HashSet::new(),
            deadline,
        }
    }

    fn is_remote_waiter(&self, id: SessionId) -> bool {
        self.remote_waiters
            .iter()
            .any(|(_, peers)| peers.iter().any(|s| s.id() == id))
    }

    /// Record `(request_id, peer)`. Returns false if it was already there.
    fn add_remote(&mut self, request_id: u64, peer: &Arc<PeerSession>) -> bool {
        let slot = match self.remote_waiters.iter_mut().position(|(id, _)| *id == request_id) {
            Some(i) => &mut self.remote_waiters[i].1,
            None => {
                self.remote_waiters.push((request_id, Vec::new()));
                let last = self.remote_waiters.len() - 1;
                &mut self.remote_waiters[last].1
            }
        };
        if slot.iter().any(|s| s.id() == peer.id()) {
            return false;
        }
        slot.push(Arc::clone(peer));
        true
    }

    /// Restart an entry whose deadline has passed as a fresh search ending
    /// at `deadline`. Remote waiters and asked peers from the old search are
    /// dropped. Returns whether the entry was restarted.
    fn renew_if_stale(&mut self, now: Instant, deadline: Instant) -> bool {
        if self.deadline > now {
            return false;
        }
        self.prune_local();
        self.remote_waiters.clear();
        self.asked.clear();
        self.deadline = deadline;
        true
    }

    fn prune_local(&mut self) {
        self.local_waiters.retain(|tx| !tx.is_closed());
    }
}

/// Open store broadcasts kept at once. Each holds its chunk, so the oldest
/// are dropped past this.
const MAX_OPEN_BROADCASTS: usize = 256;

/// A store push that keeps picking up newly connected peers until its
/// window closes or it has reached `max_store_peers`.
struct Broadcast {
    chunk: Chunk,
    exclude: Option<SessionId>,
    contacted: HashSet<SessionId>,
    deadline: Instant,
}

enum Waiter {
    Ready(Chunk),
    Pending(oneshot::Receiver<Chunk>),
}

pub struct NetworkStore {
    local: LocalStore,
    chunker: TreeChunker,
    router: Arc<dyn PeerRouter>,
    identity: NodeIdentity,
    config: DistributionConfig,
    pending: DashMap<ContentKey, PendingRequest>,
    broadcasts: Mutex<Vec<Broadcast>>,
    stats: NetStats,
}

impl NetworkStore {
    pub fn new(
        local: LocalStore,
        router: Arc<dyn PeerRouter>,
        identity: NodeIdentity,
        chunker: TreeChunker,
        config: DistributionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            chunker,
            router,
            identity,
            config,
            pending: DashMap::new(),
            broadcasts: Mutex::new(Vec::new()),
            stats: NetStats::new(),
        })
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn router(&self) -> &Arc<dyn PeerRouter> {
        &self.router
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    pub fn chunker(&self) -> &TreeChunker {
        &self.chunker
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    pub fn status_message(&self) -> StatusMessage {
        StatusMessage::local(self.identity.address.clone(), self.identity.network_id)
    }

    /// Keys currently being searched for.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ── Store ─────────────────────────────────────────────────────────────────

    /// Store a chunk locally, then either answer everyone waiting for it or
    /// push it to nearby peers. A failed durable write is returned after
    /// propagation has happened.
    pub fn store(&self, chunk: Chunk) -> Result<(), StoreError> {
        self.store_from(chunk, None)
    }

    fn store_from(&self, chunk: Chunk, source: Option<SessionId>) -> Result<(), StoreError> {
        let persisted = self.local.put(&chunk);

        let found = self.pending.remove(&chunk.key).map(|(_, mut request)| {
            request.status = Status::Found;
            request
        });
        match found {
            Some(request) => self.deliver(&chunk, request),
            None => self.broadcast(chunk, source),
        }
        persisted
    }

    /// Serve every waiter of a found request. Runs with no locks held.
    fn deliver(&self, chunk: &Chunk, request: PendingRequest) {
        debug_assert_eq!(request.status, Status::Found);
        NetStats::bump(&self.stats.found);

        let mut local = 0;
        for tx in request.local_waiters {
            if tx.send(chunk.clone()).is_ok() {
                local += 1;
            }
        }

        let mut remote = 0;
        for (request_id, peers) in &request.remote_waiters {
            for peer in peers.iter().take(self.config.requester_count) {
                self.send_store(peer, chunk);
                remote += 1;
            }
            if peers.len() > self.config.requester_count {
                tracing::trace!(
                    key = %chunk.key.short(),
                    request_id,
                    dropped = peers.len() - self.config.requester_count,
                    "requester limit reached"
                );
            }
        }

        tracing::debug!(key = %chunk.key.short(), local, remote, "chunk delivered to waiters");
    }

    fn broadcast(&self, chunk: Chunk, exclude: Option<SessionId>) {
        if self.config.max_store_peers == 0 {
            return;
        }
        let mut task = Broadcast {
            chunk,
            exclude,
            contacted: HashSet::new(),
            deadline: Instant::now() + self.config.broadcast_window(),
        };
        let targets = self.broadcast_targets(&mut task);
        for peer in &targets {
            self.send_store(peer, &task.chunk);
        }
        tracing::trace!(key = %task.chunk.key.short(), peers = targets.len(), "store broadcast");

        if task.contacted.len() < self.config.max_store_peers && !self.config.broadcast_window().is_zero() {
            let now = Instant::now();
            let mut tasks = self.broadcasts.lock();
            tasks.retain(|t| t.deadline > now);
            if tasks.len() >= MAX_OPEN_BROADCASTS {
                let dropped = tasks.len() + 1 - MAX_OPEN_BROADCASTS;
                tasks.drain(..dropped);
                tracing::trace!(dropped, "open broadcast limit reached");
            }
            tasks.push(task);
        }
    }

    /// Store broadcasts still waiting for more peers.
    pub fn open_broadcasts(&self) -> usize {
        self.broadcasts.lock().len()
    }

    fn broadcast_targets(&self, task: &mut Broadcast) -> Vec<Arc<PeerSession>> {
        let budget = self.config.max_store_peers.saturating_sub(task.contacted.len());
        if budget == 0 {
            return Vec::new();
        }
        let limit = self.config.max_store_peers + usize::from(task.exclude.is_some());
        let mut targets = Vec::new();
        for peer in self.router.nearest_peers(&task.chunk.key, limit) {
            if targets.len() == budget {
                break;
            }
            let id = peer.id();
            if Some(id) == task.exclude || task.contacted.contains(&id) || peer.is_closed() {
                continue;
            }
            task.contacted.insert(id);
            targets.push(peer);
        }
        targets
    }

    /// Split a byte stream and store every chunk. Returns the root key.
    pub fn store_blob<R: Read>(&self, reader: R) -> Result<ContentKey, StoreError> {
        let mut sink = |chunk: Chunk| {
            let key = chunk.key.clone();
            self.store(chunk).map_err(|e| ChunkerError::Sink {
                key,
                source: Box::new(e),
            })
        };
        Ok(self.chunker.split(reader, &mut sink)?)
    }

    // ── Retrieve ──────────────────────────────────────────────────────────────

    /// Resolve a chunk, locally or from the network.
    ///
    /// Registration and the first search round happen before this returns;
    /// the future only waits. It fails with `RetrievalTimeout` once the
    /// search timeout elapses.
    pub fn retrieve(
        self: &Arc<Self>,
        key: ContentKey,
    ) -> impl Future<Output = Result<Chunk, StoreError>> + Send + 'static {
        let deadline = Instant::now() + self.config.search_timeout();
        let registration = self.register_waiter(&key, deadline);
        let store = Arc::clone(self);

        async move {
            let rx = match registration? {
                Waiter::Ready(chunk) => return Ok(chunk),
                Waiter::Pending(rx) => rx,
            };
            let outcome = tokio::time::timeout_at(deadline, rx).await;
            match outcome {
                Ok(Ok(chunk)) => Ok(chunk),
                Ok(Err(_)) | Err(_) => {
                    store.expire_waiters(&key);
                    NetStats::bump(&store.stats.timeouts);
                    tracing::debug!(key = %key.short(), "retrieve timed out");
                    Err(StoreError::RetrievalTimeout { key })
                }
            }
        }
    }

    fn register_waiter(&self, key: &ContentKey, deadline: Instant) -> Result<Waiter, StoreError> {
        if let Some(chunk) = self.local.get(key)? {
            return Ok(Waiter::Ready(chunk));
        }

        let (tx, rx) = oneshot::channel();
        let targets = {
            let mut slot = match self.pending.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    if e.get_mut().renew_if_stale(Instant::now(), deadline) {
                        tracing::trace!(key = %key.short(), "stale search restarted");
                    }
                    e.into_ref()
                }
                Entry::Vacant(e) => {
                    // A store may have landed since the first check.
                    if let Some(chunk) = self.local.get(key)? {
                        return Ok(Waiter::Ready(chunk));
                    }
                    e.insert(PendingRequest::new(deadline))
                }
            };
            let request = slot.value_mut();
            request.local_waiters.push(tx);
            if deadline > request.deadline {
                request.deadline = deadline;
            }
            self.search_targets(key, request)
        };

        self.send_retrieves(key, &targets, deadline);
        Ok(Waiter::Pending(rx))
    }

    /// Pick peers for the next search round and mark them asked. Called with
    /// the entry lock held; only consults the router.
    fn search_targets(&self, key: &ContentKey, request: &mut PendingRequest) -> Vec<Arc<PeerSession>> {
        let budget = self.config.max_search_peers.saturating_sub(request.asked.len());
        if budget == 0 {
            return Vec::new();
        }
        let skip = request.asked.len()
            + request
                .remote_waiters
                .iter()
                .map(|(_, peers)| peers.len())
                .sum::<usize>();

        let mut targets = Vec::new();
        for peer in self.router.nearest_peers(key, budget + skip) {
            if targets.len() == budget {
                break;
            }
            let id = peer.id();
            if request.asked.contains(&id) || request.is_remote_waiter(id) || peer.is_closed() {
                continue;
            }
            request.asked.insert(id);
            targets.push(peer);
        }
        targets
    }

    /// Run another search round for a live request.
    fn search_round(&self, key: &ContentKey) {
        let now = Instant::now();
        let (targets, deadline) = {
            let Some(mut request) = self.pending.get_mut(key) else {
                return;
            };
            if request.status != Status::Searching || request.deadline <= now {
                return;
            }
            let deadline = request.deadline;
            (self.search_targets(key, &mut request), deadline)
        };
        self.send_retrieves(key, &targets, deadline);
    }

    /// Drop timed-out local waiters; remove the request if nobody is left.
    fn expire_waiters(&self, key: &ContentKey) {
        if let Entry::Occupied(mut e) = self.pending.entry(key.clone()) {
            let request = e.get_mut();
            request.prune_local();
            if request.local_waiters.is_empty()
                && (request.remote_waiters.is_empty() || request.deadline <= Instant::now())
            {
                e.remove();
                tracing::trace!(key = %key.short(), "pending request expired");
            }
        }
    }

    /// Remove requests whose deadline passed and that no local caller is
    /// still waiting on, and store broadcasts whose window closed.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.pending.retain(|_, request| {
            request.prune_local();
            request.deadline > now || !request.local_waiters.is_empty()
        });
        self.broadcasts.lock().retain(|t| t.deadline > now);
    }

    // ── Peer events ───────────────────────────────────────────────────────────

    /// A peer sent us a chunk.
    pub fn on_remote_store(&self, peer: &Arc<PeerSession>, msg: StoreRequest) -> Result<(), StoreError> {
        NetStats::bump(&self.stats.store_in);
        if self.local.contains(&msg.key) {
            tracing::trace!(key = %msg.key.short(), session = %peer.id(), "already have chunk");
            return Ok(());
        }
        if crypto::hash(&msg.data)[..] != *msg.key.as_bytes() {
            NetStats::bump(&self.stats.rejected);
            tracing::warn!(key = %msg.key.short(), session = %peer.id(), "chunk does not match its key, dropped");
            return Ok(());
        }
        self.store_from(Chunk::new(msg.key, msg.data), Some(peer.id()))
    }

    /// A peer asked us for a chunk, or for our neighbours (zero key).
    pub fn on_remote_retrieve(&self, peer: &Arc<PeerSession>, msg: RetrieveRequest) {
        NetStats::bump(&self.stats.retrieve_in);

        if msg.key.is_zero() {
            if let Some(addr) = peer.peer() {
                let near = ContentKey::new(addr.node_id.clone());
                self.send_peers(peer, &near);
            }
            return;
        }

        match self.local.get(&msg.key) {
            Ok(Some(chunk)) => {
                self.send_store(peer, &chunk);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %msg.key.short(), error = %e, "local lookup failed, treating as miss");
            }
        }

        self.send_peers(peer, &msg.key);

        let mut timeout = self.config.search_timeout();
        if let Some(ms) = msg.timeout {
            timeout = timeout.min(Duration::from_millis(ms));
        }
        let deadline = Instant::now() + timeout;
        let request_id = msg.request_id.unwrap_or(0);

        let targets = match self.pending.entry(msg.key.clone()) {
            Entry::Occupied(e) => {
                let mut slot = e.into_ref();
                let request = slot.value_mut();
                let restarted = request.renew_if_stale(Instant::now(), deadline);
                if !request.add_remote(request_id, peer) {
                    tracing::trace!(key = %msg.key.short(), request_id, "duplicate remote waiter");
                }
                if deadline > request.deadline {
                    request.deadline = deadline;
                }
                if restarted {
                    self.search_targets(&msg.key, request)
                } else {
                    // A search is already in flight.
                    Vec::new()
                }
            }
            Entry::Vacant(e) => {
                if let Ok(Some(chunk)) = self.local.get(&msg.key) {
                    drop(e);
                    self.send_store(peer, &chunk);
                    return;
                }
                let mut slot = e.insert(PendingRequest::new(deadline));
                let request = slot.value_mut();
                request.add_remote(request_id, peer);
                self.search_targets(&msg.key, request)
            }
        };

        self.send_retrieves(&msg.key, &targets, deadline);
    }

    /// Give every live search and broadcast a chance at a newly connected
    /// peer.
    pub(crate) fn on_peer_registered(&self) {
        self.sweep_expired();
        let now = Instant::now();

        let keys: Vec<ContentKey> = self
            .pending
            .iter()
            .filter(|r| r.status == Status::Searching && r.deadline > now)
            .map(|r| r.key().clone())
            .collect();
        for key in keys {
            self.search_round(&key);
        }

        let mut sends = Vec::new();
        {
            let mut tasks = self.broadcasts.lock();
            tasks.retain(|t| t.deadline > now);
            for task in tasks.iter_mut() {
                for peer in self.broadcast_targets(task) {
                    sends.push((peer, task.chunk.clone()));
                }
            }
            let max = self.config.max_store_peers;
            tasks.retain(|t| t.contacted.len() < max);
        }
        for (peer, chunk) in sends {
            self.send_store(&peer, &chunk);
        }
    }

    /// Purge a closed session from every pending request.
    pub(crate) fn forget_peer(&self, id: SessionId) {
        self.pending.retain(|_, request| {
            for (_, peers) in request.remote_waiters.iter_mut() {
                peers.retain(|s| s.id() != id);
            }
            request.remote_waiters.retain(|(_, peers)| !peers.is_empty());
            request.prune_local();
            !request.local_waiters.is_empty() || !request.remote_waiters.is_empty()
        });
    }

    // ── Sends ─────────────────────────────────────────────────────────────────

    fn send_store(&self, peer: &Arc<PeerSession>, chunk: &Chunk) {
        let msg = Message::Store(StoreRequest {
            key: chunk.key.clone(),
            data: chunk.data.clone(),
            request_id: None,
            metadata: None,
        });
        match peer.send(msg) {
            Ok(()) => NetStats::bump(&self.stats.store_out),
            Err(e) => tracing::debug!(error = %e, "store not sent"),
        }
    }

    fn send_retrieves(&self, key: &ContentKey, targets: &[Arc<PeerSession>], deadline: Instant) {
        if targets.is_empty() {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        for peer in targets {
            let mut req = RetrieveRequest::new(key.clone());
            req.timeout = Some(remaining.as_millis() as u64);
            match peer.send(Message::Retrieve(req)) {
                Ok(()) => NetStats::bump(&self.stats.retrieve_out),
                Err(e) => tracing::debug!(error = %e, "retrieve not sent"),
            }
        }
        tracing::debug!(key = %key.short(), peers = targets.len(), "search round");
    }

    fn send_peers(&self, peer: &Arc<PeerSession>, key: &ContentKey) {
        let own = peer.peer().map(|p| p.node_id.clone());
        let limit = self.config.max_search_peers;
        let peers: Vec<PeerAddress> = self
            .router
            .nearest_addresses(key, limit + 1)
            .into_iter()
            .filter(|p| Some(&p.node_id) != own.as_ref())
            .take(limit)
            .collect();
        let msg = Message::Peers(PeersMessage {
            peers,
            key: Some(key.clone()),
            request_id: None,
        });
        match peer.send(msg) {
            Ok(()) => NetStats::bump(&self.stats.peers_out),
            Err(e) => tracing::debug!(error = %e, "peers not sent"),
        }
    }
}
