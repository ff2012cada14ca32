//! cairn-core: shared types, wire format, chunker, and configuration.
//! All other Cairn crates depend on this one.

pub mod chunk;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod wire;

pub use chunk::{Chunk, ContentKey};
pub use chunker::{ChunkFetch, ChunkReader, ChunkSink, ChunkerError, TreeChunker};
pub use wire::{Message, PeerAddress, WireError};
