//! Two-tier local store: memory cache in front of the persistent database.
//!
//! Writes go to both tiers, memory first. Reads check memory, then the
//! database, promoting database hits into memory. The tiers are not written
//! atomically; the database is authoritative and memory starts cold.

use std::sync::Arc;

use cairn_core::{Chunk, ChunkFetch, ChunkerError, ContentKey};

use crate::database::Database;
use crate::error::StoreError;
use crate::memory::MemoryStore;

pub struct LocalStore {
    memory: MemoryStore,
    db: Arc<dyn Database>,
}

impl LocalStore {
    pub fn new(memory_budget: u64, db: Arc<dyn Database>) -> Self {
        Self {
            memory: MemoryStore::new(memory_budget),
            db,
        }
    }

    /// Store a chunk. A failed durable write is returned, but the memory
    /// copy stays.
    pub fn put(&self, chunk: &Chunk) -> Result<(), StoreError> {
        self.memory.put(chunk.clone());
        self.db.put(&chunk.key, &chunk.data).map_err(|e| {
            tracing::warn!(key = %chunk.key.short(), error = %e, "durable write failed");
            StoreError::StoreBackendFailure(e)
        })
    }

    pub fn get(&self, key: &ContentKey) -> Result<Option<Chunk>, StoreError> {
        if let Some(chunk) = self.memory.get(key) {
            return Ok(Some(chunk));
        }
        match self.db.get(key)? {
            Some(data) => {
                let chunk = Chunk::new(key.clone(), data);
                self.memory.put(chunk.clone());
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Presence check without promoting. Database errors count as absent.
    pub fn contains(&self, key: &ContentKey) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        match self.db.contains(key) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key = %key.short(), error = %e, "database lookup failed");
                false
            }
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }
}

impl ChunkFetch for LocalStore {
    fn fetch(&self, key: &ContentKey) -> Result<Chunk, ChunkerError> {
        match self.get(key) {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => Err(ChunkerError::Fetch(key.clone(), "not in local store".into())),
            Err(e) => Err(ChunkerError::Fetch(key.clone(), Box::new(e))),
        }
    }
}
