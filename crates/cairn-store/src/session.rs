//! Per-peer protocol state machine.
//!
//! ```text
//!   Init ──start──▶ OutSent ──STATUS in──▶ Done
//!     └──────────STATUS in (reply)─────────▲
//!   any ──close / bad frame──▶ Closed
//! ```
//!
//! Until the handshake is done, outbound messages and non-STATUS inbound
//! messages are queued. Completing the handshake flushes outbound in order,
//! sends one wildcard RETRIEVE to discover the peer's neighbours, then
//! dispatches the queued inbound messages.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use cairn_core::wire::{RetrieveRequest, StatusMessage, PROTOCOL_VERSION};
use cairn_core::{ContentKey, Message, PeerAddress};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::network::NetworkStore;
use crate::stats::NetStats;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic request id, stamped on every outbound message.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Init,
    OutSent,
    Done,
    Closed,
}

struct SessionState {
    handshake: Handshake,
    transport: Option<mpsc::UnboundedSender<Message>>,
    pending_out: VecDeque<Message>,
    pending_in: VecDeque<Message>,
}

pub struct PeerSession {
    id: SessionId,
    store: Arc<NetworkStore>,
    remote: Option<SocketAddr>,
    peer: OnceLock<PeerAddress>,
    state: Mutex<SessionState>,
}

impl PeerSession {
    /// A fresh session whose outbound messages go to `transport`.
    /// `remote` is the socket address the connection came from, if known.
    pub fn new(
        store: Arc<NetworkStore>,
        transport: mpsc::UnboundedSender<Message>,
        remote: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            store,
            remote,
            peer: OnceLock::new(),
            state: Mutex::new(SessionState {
                handshake: Handshake::Init,
                transport: Some(transport),
                pending_out: VecDeque::new(),
                pending_in: VecDeque::new(),
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer's announced address, once the handshake is done.
    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.get()
    }

    pub fn handshake(&self) -> Handshake {
        self.state.lock().handshake
    }

    pub fn is_closed(&self) -> bool {
        self.handshake() == Handshake::Closed
    }

    /// Announce ourselves. Does nothing unless the session is still `Init`.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.handshake != Handshake::Init {
            return;
        }
        self.transmit(&state, Message::Status(self.store.status_message()));
        state.handshake = Handshake::OutSent;
        tracing::debug!(session = %self.id, "status sent");
    }

    /// Send a message, or queue it until the handshake completes.
    pub fn send(&self, msg: Message) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        match state.handshake {
            Handshake::Closed => {
                tracing::debug!(session = %self.id, "dropping message for closed session");
                Err(SessionError::UnknownPeer(self.id))
            }
            Handshake::Done => {
                self.transmit(&state, msg);
                Ok(())
            }
            Handshake::Init | Handshake::OutSent => {
                state.pending_out.push_back(msg);
                Ok(())
            }
        }
    }

    /// Stamp a fresh request id and hand the message to the transport.
    /// Only called with the state lock held so queue flushes stay ordered.
    fn transmit(&self, state: &SessionState, mut msg: Message) {
        msg.set_request_id(next_request_id());
        let Some(tx) = &state.transport else {
            return;
        };
        if tx.send(msg).is_ok() {
            NetStats::bump(&self.store.stats().messages_out);
        }
    }

    /// Decode and handle one frame. A frame that fails to decode closes
    /// the session.
    pub fn handle_frame(self: &Arc<Self>, frame: &[u8]) -> Result<(), SessionError> {
        match Message::decode(frame) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "malformed frame, closing session");
                NetStats::bump(&self.store.stats().rejected);
                self.close();
                Err(SessionError::Malformed(e))
            }
        }
    }

    pub fn handle_message(self: &Arc<Self>, msg: Message) -> Result<(), SessionError> {
        NetStats::bump(&self.store.stats().messages_in);
        let msg = match msg {
            Message::Status(status) => return self.on_status(status),
            other => other,
        };

        let mut state = self.state.lock();
        match state.handshake {
            Handshake::Closed => Err(SessionError::UnknownPeer(self.id)),
            Handshake::Done => {
                drop(state);
                self.dispatch(msg);
                Ok(())
            }
            Handshake::Init | Handshake::OutSent => {
                tracing::trace!(session = %self.id, "queueing inbound message until handshake");
                state.pending_in.push_back(msg);
                Ok(())
            }
        }
    }

    fn on_status(self: &Arc<Self>, status: StatusMessage) -> Result<(), SessionError> {
        let inbound = {
            let mut state = self.state.lock();
            match state.handshake {
                Handshake::Closed => return Err(SessionError::UnknownPeer(self.id)),
                Handshake::Done => {
                    tracing::debug!(session = %self.id, "duplicate status ignored");
                    return Ok(());
                }
                Handshake::Init | Handshake::OutSent => {}
            }

            if let Err(e) = self.validate(&status) {
                drop(state);
                tracing::warn!(session = %self.id, error = %e, "handshake rejected");
                self.close();
                return Err(e);
            }

            let _ = self.peer.set(self.observed_address(status.self_address));

            if state.handshake == Handshake::Init {
                self.transmit(&state, Message::Status(self.store.status_message()));
            }
            while let Some(msg) = state.pending_out.pop_front() {
                self.transmit(&state, msg);
            }
            self.transmit(&state, Message::Retrieve(RetrieveRequest::new(ContentKey::zero())));
            NetStats::bump(&self.store.stats().retrieve_out);

            state.handshake = Handshake::Done;
            std::mem::take(&mut state.pending_in)
        };

        NetStats::bump(&self.store.stats().handshakes);
        tracing::info!(
            session = %self.id,
            peer = %self.peer().map(ToString::to_string).unwrap_or_default(),
            "handshake complete"
        );

        self.store.router().register(Arc::clone(self));
        self.store.on_peer_registered();

        for msg in inbound {
            self.dispatch(msg);
        }
        Ok(())
    }

    fn validate(&self, status: &StatusMessage) -> Result<(), SessionError> {
        let ours = self.store.identity().network_id;
        if status.network_id != ours {
            return Err(SessionError::NetworkMismatch {
                ours,
                theirs: status.network_id,
            });
        }
        if status.protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: status.protocol_version,
            });
        }
        Ok(())
    }

    /// Peers listening on a wildcard address announce `0.0.0.0`; substitute
    /// the address the connection actually came from.
    fn observed_address(&self, mut announced: PeerAddress) -> PeerAddress {
        if announced.ip.is_unspecified() {
            if let Some(SocketAddr::V4(remote)) = self.remote {
                announced.ip = *remote.ip();
            } else if let Some(SocketAddr::V6(remote)) = self.remote {
                if let Some(v4) = remote.ip().to_ipv4_mapped() {
                    announced.ip = v4;
                }
            }
        }
        announced
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Store(req) => {
                if let Err(e) = self.store.on_remote_store(self, req) {
                    tracing::warn!(session = %self.id, error = %e, "inbound store failed");
                }
            }
            Message::Retrieve(req) => self.store.on_remote_retrieve(self, req),
            Message::Peers(peers) => {
                tracing::debug!(session = %self.id, count = peers.peers.len(), "peer records received");
                self.store.router().add_peer_records(&peers.peers);
            }
            Message::Status(_) => {}
        }
    }

    /// Tear down: drop both queues and the transport, leave the router and
    /// every pending request. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.handshake == Handshake::Closed {
                return;
            }
            state.handshake = Handshake::Closed;
            state.transport = None;
            state.pending_out.clear();
            state.pending_in.clear();
        }
        tracing::debug!(session = %self.id, "session closed");
        self.store.router().unregister(self.id);
        self.store.forget_peer(self.id);
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("peer", &self.peer())
            .finish()
    }
}
