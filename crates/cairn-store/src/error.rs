use cairn_core::{ChunkerError, ContentKey, WireError};

use crate::session::SessionId;

/// Persistent database failures.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("empty key cannot be stored")]
    EmptyKey,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No peer answered before the search deadline. Retrying may succeed.
    #[error("retrieval of {key:?} timed out")]
    RetrievalTimeout { key: ContentKey },

    /// The durable write failed. The memory tier still holds the chunk.
    #[error("persistent store failed: {0}")]
    StoreBackendFailure(#[from] DbError),

    #[error(transparent)]
    Chunker(#[from] ChunkerError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A message addressed to a session that has already closed.
    #[error("session {0} is closed")]
    UnknownPeer(SessionId),

    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    #[error("peer is on network {theirs}, we are on {ours}")]
    NetworkMismatch { ours: u64, theirs: u64 },

    #[error("peer speaks protocol version {theirs}, we speak {ours}")]
    VersionMismatch { ours: u64, theirs: u64 },
}
