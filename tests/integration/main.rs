//! Cairn integration test harness.
//!
//! Every test builds a small overlay of real `NetworkStore`s inside one
//! process. Nodes are joined either by an in-memory link, which runs every
//! message through the wire codec, or by loopback TCP via the transport.
//!
//!   cargo test --test integration

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use cairn_core::config::DistributionConfig;
use cairn_core::{PeerAddress, TreeChunker};
use cairn_store::{Handshake, LocalStore, MemDatabase, NetworkStore, NodeIdentity, PeerSession, PeerTable};
use tokio::sync::mpsc;

mod blob;
mod handshake;
mod retrieval;
mod store;
mod tcp;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const NETWORK_ID: u64 = 7;

/// Chunk size small enough that a few hundred bytes make a real tree.
pub const CHUNK_SIZE: usize = 64;

pub struct TestNode {
    pub store: Arc<NetworkStore>,
    pub table: Arc<PeerTable>,
}

impl TestNode {
    pub fn new(id: u8) -> Self {
        Self::with(id, NETWORK_ID, DistributionConfig::default())
    }

    pub fn with(id: u8, network_id: u64, config: DistributionConfig) -> Self {
        let node_id = vec![id; 32];
        let table = Arc::new(PeerTable::new(node_id.clone()));
        let identity = NodeIdentity {
            address: PeerAddress::new(Ipv4Addr::LOCALHOST, 40000 + id as u16, node_id),
            network_id,
        };
        let store = NetworkStore::new(
            LocalStore::new(1 << 20, Arc::new(MemDatabase::new())),
            table.clone(),
            identity,
            TreeChunker::new(CHUNK_SIZE).expect("valid chunk size"),
            config,
        );
        Self { store, table }
    }
}

/// Config with a short search timeout so misses fail fast.
pub fn quick_config() -> DistributionConfig {
    DistributionConfig {
        search_timeout_ms: 300,
        ..Default::default()
    }
}

/// Join two nodes with an in-memory link and start both handshakes.
/// Returns (a's session for b, b's session for a).
pub fn link(a: &TestNode, b: &TestNode) -> (Arc<PeerSession>, Arc<PeerSession>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let at_a = PeerSession::new(a.store.clone(), tx_a, Some(fake_remote(&b.store)));
    let at_b = PeerSession::new(b.store.clone(), tx_b, Some(fake_remote(&a.store)));

    tokio::spawn(pump(rx_a, at_b.clone()));
    tokio::spawn(pump(rx_b, at_a.clone()));

    at_a.start();
    at_b.start();
    (at_a, at_b)
}

/// Link two nodes and wait for both handshakes.
pub async fn connect(a: &TestNode, b: &TestNode) -> (Arc<PeerSession>, Arc<PeerSession>) {
    let (x, y) = link(a, b);
    wait_for("handshake", || {
        x.handshake() == Handshake::Done && y.handshake() == Handshake::Done
    })
    .await
    .expect("handshake should complete");
    (x, y)
}

fn fake_remote(store: &NetworkStore) -> SocketAddr {
    store.identity().address.socket_addr().into()
}

/// Deliver one side's outbound messages to the other as encoded frames.
/// The far side is closed when the near side's transport goes away.
async fn pump(mut rx: mpsc::UnboundedReceiver<cairn_core::Message>, far: Arc<PeerSession>) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(_) => break,
        };
        let _ = far.handle_frame(&frame);
    }
    far.close();
}

/// Poll `cond` until it holds, for up to two seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..200 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Deterministic test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
