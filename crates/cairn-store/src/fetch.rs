//! Bridges the chunker's synchronous fetch seam to `NetworkStore::retrieve`.
//!
//! The chunk reader is blocking, so it runs on a blocking thread and each
//! fetch parks that thread on the runtime until the chunk arrives or the
//! search times out.

use std::io;
use std::sync::Arc;

use cairn_core::{Chunk, ChunkFetch, ChunkerError, ContentKey};
use tokio::runtime::Handle;

use crate::error::StoreError;
use crate::network::NetworkStore;

pub struct NetworkFetch {
    store: Arc<NetworkStore>,
    runtime: Handle,
}

impl NetworkFetch {
    pub fn new(store: Arc<NetworkStore>, runtime: Handle) -> Self {
        Self { store, runtime }
    }
}

impl ChunkFetch for NetworkFetch {
    /// Must not be called from an async context; `Handle::block_on` panics
    /// there.
    fn fetch(&self, key: &ContentKey) -> Result<Chunk, ChunkerError> {
        self.runtime
            .block_on(self.store.retrieve(key.clone()))
            .map_err(|e| ChunkerError::Fetch(key.clone(), Box::new(e)))
    }
}

/// Read a whole blob, fetching missing chunks from the network.
pub async fn fetch_blob(store: Arc<NetworkStore>, root: ContentKey) -> Result<Vec<u8>, StoreError> {
    let chunker = *store.chunker();
    let fetch = NetworkFetch::new(store, Handle::current());
    let joined = tokio::task::spawn_blocking(move || chunker.join(root, fetch)?.read_all()).await;
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(StoreError::Chunker(ChunkerError::Io(io::Error::new(
            io::ErrorKind::Other,
            e,
        )))),
    }
}
