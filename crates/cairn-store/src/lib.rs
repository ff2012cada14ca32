//! cairn-store: tiered chunk storage and the network distribution layer.
//!
//! `LocalStore` layers the in-memory LRU cache over a persistent
//! `Database`. `NetworkStore` sits on top: it deduplicates concurrent
//! lookups, fans requests out to peers picked by a `PeerRouter`, and pushes
//! found chunks back to every waiter. Each connected peer is a `PeerSession`
//! that gates traffic behind the STATUS handshake.

pub mod database;
pub mod error;
pub mod fetch;
pub mod local;
pub mod memory;
pub mod network;
pub mod router;
pub mod session;
pub mod stats;
pub mod transport;

pub use database::{Database, FsDatabase, MemDatabase};
pub use error::{DbError, SessionError, StoreError};
pub use fetch::NetworkFetch;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use network::{NetworkStore, NodeIdentity};
pub use router::{PeerRouter, PeerTable};
pub use session::{Handshake, PeerSession, SessionId};
pub use stats::{NetStats, StatsSnapshot};
