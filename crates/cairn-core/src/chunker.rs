//! Tree chunker. Splits byte streams into a Merkle tree of chunks and
//! joins them back into a seekable reader.
//!
//! Leaves hold at most `chunk_size` payload bytes. Interior nodes hold up to
//! `branches = chunk_size / key_size` child keys, so every chunk fits the
//! same payload budget. Levels are built bottom-up by grouping consecutive
//! keys until a single key remains:
//!
//! ```text
//!              root (size = n)
//!          /        |        \
//!      node_0    node_1 ... node_k        (level 1, up to `branches` each)
//!     /  |  \
//!  leaf leaf leaf ...                      (level 0, up to `chunk_size` bytes)
//! ```
//!
//! Every subtree except the last one at its level is full, so a node at
//! level `l` covers exactly `chunk_size * branches^l` bytes unless it is the
//! rightmost. That is what lets the reader compute child offsets from the
//! parent's size alone.

use std::io::{self, Read, Seek, SeekFrom};

use thiserror::Error;

use crate::chunk::{Chunk, ContentKey};
use crate::crypto::KEY_SIZE;

/// Default leaf payload size: 128 keys of 32 bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("chunk size {chunk_size} holds fewer than two {key_size}-byte keys")]
    FanoutTooSmall { chunk_size: usize, key_size: usize },

    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    #[error("chunk sink rejected {key:?}: {source}")]
    Sink {
        key: ContentKey,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("chunk {0:?} could not be fetched: {1}")]
    Fetch(ContentKey, #[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("chunk {0:?} is malformed: {1}")]
    Malformed(ContentKey, &'static str),

    #[error("offset {offset} is beyond the end of a {size}-byte blob")]
    OffsetOutOfRange { offset: u64, size: u64 },
}

impl From<ChunkerError> for io::Error {
    fn from(e: ChunkerError) -> Self {
        match e {
            ChunkerError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

// ── Sink / fetch seams ────────────────────────────────────────────────────────

/// Receives chunks as `split` produces them, children before parents.
pub trait ChunkSink {
    fn accept(&mut self, chunk: Chunk) -> Result<(), ChunkerError>;
}

impl ChunkSink for Vec<Chunk> {
    fn accept(&mut self, chunk: Chunk) -> Result<(), ChunkerError> {
        self.push(chunk);
        Ok(())
    }
}

impl<F> ChunkSink for F
where
    F: FnMut(Chunk) -> Result<(), ChunkerError>,
{
    fn accept(&mut self, chunk: Chunk) -> Result<(), ChunkerError> {
        self(chunk)
    }
}

/// Resolves a key to its chunk. May hit a cache or go to the network, and
/// may be called any number of times for the same key.
pub trait ChunkFetch {
    fn fetch(&self, key: &ContentKey) -> Result<Chunk, ChunkerError>;
}

impl<T: ChunkFetch + ?Sized> ChunkFetch for &T {
    fn fetch(&self, key: &ContentKey) -> Result<Chunk, ChunkerError> {
        (**self).fetch(key)
    }
}

impl<T: ChunkFetch + ?Sized> ChunkFetch for std::sync::Arc<T> {
    fn fetch(&self, key: &ContentKey) -> Result<Chunk, ChunkerError> {
        (**self).fetch(key)
    }
}

// ── Chunker ───────────────────────────────────────────────────────────────────

/// Stateless tree chunker.
#[derive(Debug, Clone, Copy)]
pub struct TreeChunker {
    chunk_size: usize,
    key_size: usize,
    branches: usize,
}

impl Default for TreeChunker {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            key_size: KEY_SIZE,
            branches: DEFAULT_CHUNK_SIZE / KEY_SIZE,
        }
    }
}

impl TreeChunker {
    /// A chunker with the given leaf payload size, keyed by the crate hash.
    pub fn new(chunk_size: usize) -> Result<Self, ChunkerError> {
        Self::with_key_size(chunk_size, KEY_SIZE)
    }

    pub fn with_key_size(chunk_size: usize, key_size: usize) -> Result<Self, ChunkerError> {
        let branches = if key_size == 0 { 0 } else { chunk_size / key_size };
        if branches < 2 {
            return Err(ChunkerError::FanoutTooSmall {
                chunk_size,
                key_size,
            });
        }
        Ok(Self {
            chunk_size,
            key_size,
            branches,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn branches(&self) -> usize {
        self.branches
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Split `source` into chunks, handing each to `sink` as soon as it is
    /// complete. Returns the root key.
    pub fn split<R: Read, S: ChunkSink + ?Sized>(
        &self,
        mut source: R,
        sink: &mut S,
    ) -> Result<ContentKey, ChunkerError> {
        let mut levels = LevelStack::new(self.branches);
        let mut buf = vec![0u8; self.chunk_size];
        let mut leaves = 0u64;

        loop {
            let n = read_full(&mut source, &mut buf)?;
            if n == 0 && leaves > 0 {
                break;
            }
            let leaf = Chunk::leaf(&buf[..n]);
            let entry = (leaf.key.clone(), n as u64);
            emit(sink, leaf)?;
            leaves += 1;
            levels.push(0, entry, sink)?;
            if n < self.chunk_size {
                break;
            }
        }

        levels.finish(sink)
    }

    /// Convenience: split an in-memory buffer.
    pub fn split_bytes<S: ChunkSink + ?Sized>(
        &self,
        data: &[u8],
        sink: &mut S,
    ) -> Result<ContentKey, ChunkerError> {
        self.split(data, sink)
    }

    /// Open a lazy reader over the blob rooted at `root`.
    pub fn join<F: ChunkFetch>(&self, root: ContentKey, fetch: F) -> Result<ChunkReader<F>, ChunkerError> {
        ChunkReader::open(*self, root, fetch)
    }

    /// Width in bytes of a full subtree at `level` (leaves are level 0).
    fn level_width(&self, level: u32) -> u64 {
        (self.chunk_size as u64).saturating_mul((self.branches as u64).saturating_pow(level))
    }

    /// Depth of the tree that covers `size` bytes.
    fn depth_for(&self, size: u64) -> u32 {
        let mut depth = 0;
        let mut width = self.chunk_size as u64;
        while width < size {
            width = width.saturating_mul(self.branches as u64);
            depth += 1;
        }
        depth
    }
}

fn emit<S: ChunkSink + ?Sized>(sink: &mut S, chunk: Chunk) -> Result<(), ChunkerError> {
    sink.accept(chunk)
}

/// Fill `buf` from `source`, stopping early only at end of stream.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Per-level buffers of `(key, subtree size)` awaiting a parent.
struct LevelStack {
    branches: usize,
    pending: Vec<Vec<(ContentKey, u64)>>,
    /// Whether a level has already produced at least one parent.
    flushed: Vec<bool>,
}

impl LevelStack {
    fn new(branches: usize) -> Self {
        Self {
            branches,
            pending: Vec::new(),
            flushed: Vec::new(),
        }
    }

    fn ensure(&mut self, level: usize) {
        while self.pending.len() <= level {
            self.pending.push(Vec::with_capacity(self.branches));
            self.flushed.push(false);
        }
    }

    fn push<S: ChunkSink + ?Sized>(
        &mut self,
        level: usize,
        entry: (ContentKey, u64),
        sink: &mut S,
    ) -> Result<(), ChunkerError> {
        self.ensure(level);
        self.pending[level].push(entry);
        if self.pending[level].len() == self.branches {
            self.flush(level, sink)?;
        }
        Ok(())
    }

    /// Seal everything pending at `level` into one parent one level up.
    fn flush<S: ChunkSink + ?Sized>(&mut self, level: usize, sink: &mut S) -> Result<(), ChunkerError> {
        let children = std::mem::take(&mut self.pending[level]);
        self.flushed[level] = true;

        let size: u64 = children.iter().map(|(_, s)| *s).sum();
        let mut body = Vec::with_capacity(children.iter().map(|(k, _)| k.len()).sum());
        for (key, _) in &children {
            body.extend_from_slice(key.as_bytes());
        }
        let parent = Chunk::seal(size, &body);
        let entry = (parent.key.clone(), size);
        emit(sink, parent)?;
        self.push(level + 1, entry, sink)
    }

    /// Close out partial levels bottom-up until one key is left.
    fn finish<S: ChunkSink + ?Sized>(mut self, sink: &mut S) -> Result<ContentKey, ChunkerError> {
        let mut level = 0;
        loop {
            self.ensure(level);
            let pending = self.pending[level].len();
            if !self.flushed[level] && pending == 1 {
                let (root, _) = self.pending[level].remove(0);
                return Ok(root);
            }
            if pending > 0 {
                self.flush(level, sink)?;
            }
            level += 1;
        }
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Lazy random-access view over a chunked blob.
///
/// Each read walks from the root down to the covering leaf, fetching every
/// chunk on the way. Nothing is cached here.
pub struct ChunkReader<F> {
    chunker: TreeChunker,
    root: ContentKey,
    fetch: F,
    size: u64,
    depth: u32,
    pos: u64,
}

impl<F: ChunkFetch> ChunkReader<F> {
    fn open(chunker: TreeChunker, root: ContentKey, fetch: F) -> Result<Self, ChunkerError> {
        let chunk = fetch.fetch(&root)?;
        let size = chunk
            .subtree_size()
            .ok_or_else(|| ChunkerError::Malformed(root.clone(), "missing size prefix"))?;
        Ok(Self {
            depth: chunker.depth_for(size),
            chunker,
            root,
            fetch,
            size,
            pos: 0,
        })
    }

    /// Total blob size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn root(&self) -> &ContentKey {
        &self.root
    }

    /// Read into `buf` starting at `offset`. Returns the number of bytes
    /// copied, which is short only at the end of the blob.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ChunkerError> {
        if offset > self.size {
            return Err(ChunkerError::OffsetOutOfRange {
                offset,
                size: self.size,
            });
        }
        let mut copied = 0;
        while copied < buf.len() {
            let at = offset + copied as u64;
            if at >= self.size {
                break;
            }
            let n = self.read_leaf_at(&mut buf[copied..], at)?;
            if n == 0 {
                break;
            }
            copied += n;
        }
        Ok(copied)
    }

    /// Read the whole blob into memory. The buffer grows with the data
    /// actually read, not with the size the root claims.
    pub fn read_all(&self) -> Result<Vec<u8>, ChunkerError> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.chunker.chunk_size];
        loop {
            let n = self.read_at(&mut buf, out.len() as u64)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Descend to the leaf covering `offset` and copy from it.
    fn read_leaf_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ChunkerError> {
        let mut key = self.root.clone();
        let mut start = 0u64;
        let mut expected = self.size;

        for level in (0..=self.depth).rev() {
            let chunk = self.fetch.fetch(&key)?;
            let size = chunk
                .subtree_size()
                .ok_or_else(|| ChunkerError::Malformed(key.clone(), "missing size prefix"))?;
            if size != expected {
                return Err(ChunkerError::Malformed(key, "subtree size disagrees with parent"));
            }

            if level == 0 {
                let payload = chunk.body();
                if payload.len() as u64 != size {
                    return Err(ChunkerError::Malformed(key, "leaf payload length"));
                }
                let from = (offset - start) as usize;
                let n = buf.len().min(payload.len() - from);
                buf[..n].copy_from_slice(&payload[from..from + n]);
                return Ok(n);
            }

            let children = self.children(&chunk, size, level)?;
            let rel = offset - start;
            let idx = children.partition_point(|(_, end)| *end <= rel);
            let (child, end) = children
                .get(idx)
                .cloned()
                .ok_or(ChunkerError::OffsetOutOfRange { offset, size: self.size })?;
            let child_start = if idx == 0 { 0 } else { children[idx - 1].1 };

            key = child;
            start += child_start;
            expected = end - child_start;
        }

        Err(ChunkerError::Malformed(self.root.clone(), "tree deeper than its size allows"))
    }

    /// `(child key, cumulative end offset)` for an interior chunk.
    fn children(
        &self,
        chunk: &Chunk,
        size: u64,
        level: u32,
    ) -> Result<Vec<(ContentKey, u64)>, ChunkerError> {
        let key_size = self.chunker.key_size;
        let body = chunk.body();
        if body.len() % key_size != 0 {
            return Err(ChunkerError::Malformed(chunk.key.clone(), "reference block length"));
        }

        let width = self.chunker.level_width(level - 1);
        let count = body.len() / key_size;
        let expected = size.div_ceil(width).max(1);
        if count as u64 != expected || count > self.chunker.branches {
            return Err(ChunkerError::Malformed(chunk.key.clone(), "child count"));
        }

        body.chunks(key_size)
            .enumerate()
            .map(|(i, k)| {
                let end = (i as u64 + 1)
                    .checked_mul(width)
                    .ok_or_else(|| ChunkerError::Malformed(chunk.key.clone(), "subtree size overflows"))?;
                Ok((ContentKey::from_slice(k), end.min(size)))
            })
            .collect()
    }
}

impl<F: ChunkFetch> Read for ChunkReader<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<F: ChunkFetch> Seek for ChunkReader<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.size.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative offset",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Map-backed fetch that counts lookups.
    #[derive(Default)]
    struct MapFetch {
        chunks: HashMap<ContentKey, Chunk>,
        calls: Cell<usize>,
    }

    impl MapFetch {
        fn from_chunks(chunks: Vec<Chunk>) -> Self {
            Self {
                chunks: chunks.into_iter().map(|c| (c.key.clone(), c)).collect(),
                calls: Cell::new(0),
            }
        }
    }

    impl ChunkFetch for MapFetch {
        fn fetch(&self, key: &ContentKey) -> Result<Chunk, ChunkerError> {
            self.calls.set(self.calls.get() + 1);
            self.chunks.get(key).cloned().ok_or_else(|| {
                ChunkerError::Fetch(key.clone(), "not in map".into())
            })
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn small() -> TreeChunker {
        // 64-byte leaves, 2 keys per interior node: deep trees from small inputs.
        TreeChunker::new(64).unwrap()
    }

    fn round_trip(chunker: TreeChunker, data: &[u8]) -> Vec<u8> {
        let mut chunks = Vec::new();
        let root = chunker.split_bytes(data, &mut chunks).unwrap();
        let reader = chunker.join(root, MapFetch::from_chunks(chunks)).unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        reader.read_all().unwrap()
    }

    #[test]
    fn rejects_fanout_below_two() {
        assert!(matches!(
            TreeChunker::new(32),
            Err(ChunkerError::FanoutTooSmall { .. })
        ));
        assert!(TreeChunker::new(64).is_ok());
        assert_eq!(TreeChunker::default().branches(), 128);
    }

    #[test]
    fn round_trip_various_sizes() {
        let chunker = small();
        for len in [0, 1, 63, 64, 65, 128, 129, 255, 256, 257, 1000, 4097] {
            let data = pattern(len);
            assert_eq!(round_trip(chunker, &data), data, "len {len}");
        }
        let data = pattern(3 * DEFAULT_CHUNK_SIZE + 17);
        assert_eq!(round_trip(TreeChunker::default(), &data), data);
    }

    #[test]
    fn oversized_root_claim_is_malformed() {
        let leaf = Chunk::leaf(&pattern(64));
        let mut refs = Vec::new();
        refs.extend_from_slice(leaf.key.as_bytes());
        refs.extend_from_slice(leaf.key.as_bytes());
        let root = Chunk::seal(u64::MAX, &refs);

        let fetch = MapFetch::from_chunks(vec![leaf, root.clone()]);
        let reader = small().join(root.key.clone(), fetch).unwrap();
        assert_eq!(reader.size(), u64::MAX);

        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.read_at(&mut buf, 1 << 63),
            Err(ChunkerError::Malformed(_, _))
        ));
        assert!(matches!(reader.read_all(), Err(ChunkerError::Malformed(_, _))));
    }

    #[test]
    fn empty_source_is_single_empty_leaf() {
        let mut chunks = Vec::new();
        let root = small().split_bytes(&[], &mut chunks).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(root, Chunk::leaf(&[]).key);
    }

    #[test]
    fn small_source_root_is_leaf() {
        let mut chunks = Vec::new();
        let root = small().split_bytes(b"tiny", &mut chunks).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].key, root);
        assert_eq!(chunks[0].body(), b"tiny");
    }

    #[test]
    fn children_emitted_before_parents() {
        let mut chunks = Vec::new();
        let root = small().split_bytes(&pattern(1000), &mut chunks).unwrap();
        assert_eq!(chunks.last().unwrap().key, root);

        let mut seen = std::collections::HashSet::new();
        for chunk in &chunks {
            if chunk.subtree_size().unwrap() as usize != chunk.body().len() || chunk.body().len() > 64 {
                for child in chunk.body().chunks(KEY_SIZE) {
                    assert!(seen.contains(child), "parent emitted before child");
                }
            }
            seen.insert(chunk.key.as_bytes().to_vec());
        }
    }

    #[test]
    fn interior_size_is_sum_of_children() {
        let chunker = small();
        let mut chunks = Vec::new();
        chunker.split_bytes(&pattern(300), &mut chunks).unwrap();
        let by_key: HashMap<_, _> = chunks.iter().map(|c| (c.key.clone(), c.clone())).collect();

        // Leaves are the chunks whose payload is exactly their size.
        let leaf_total: u64 = chunks
            .iter()
            .filter(|c| c.body().len() as u64 == c.subtree_size().unwrap() && c.body().len() <= 64)
            .map(|c| c.subtree_size().unwrap())
            .sum();
        assert_eq!(leaf_total, 300);

        let root = chunks.last().unwrap();
        let child_sum: u64 = root
            .body()
            .chunks(KEY_SIZE)
            .map(|k| by_key[&ContentKey::from_slice(k)].subtree_size().unwrap())
            .sum();
        assert_eq!(child_sum, root.subtree_size().unwrap());
    }

    #[test]
    fn content_addressing() {
        let chunker = small();
        let data = pattern(777);
        let a = chunker.split_bytes(&data, &mut Vec::new()).unwrap();
        let b = chunker.split_bytes(&data, &mut Vec::new()).unwrap();
        assert_eq!(a, b);

        let mut mutated = data.clone();
        mutated[500] ^= 1;
        let c = chunker.split_bytes(&mutated, &mut Vec::new()).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn exact_multiple_does_not_add_empty_leaf() {
        let mut chunks = Vec::new();
        small().split_bytes(&pattern(128), &mut chunks).unwrap();
        // two leaves and one parent
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn random_access_and_seek() {
        let chunker = small();
        let data = pattern(1000);
        let mut chunks = Vec::new();
        let root = chunker.split_bytes(&data, &mut chunks).unwrap();
        let mut reader = chunker.join(root, MapFetch::from_chunks(chunks)).unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(reader.read_at(&mut buf, 950).unwrap(), 50);
        assert_eq!(&buf[..50], &data[950..]);

        assert_eq!(reader.read_at(&mut buf, 60).unwrap(), 100);
        assert_eq!(&buf[..], &data[60..160]);

        reader.seek(SeekFrom::Start(500)).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, &data[500..]);

        reader.seek(SeekFrom::End(-10)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[990..]);

        assert_eq!(reader.read_at(&mut buf, 1000).unwrap(), 0);
        assert!(reader.read_at(&mut buf, 1001).is_err());
    }

    #[test]
    fn refetches_on_every_read() {
        let chunker = small();
        let data = pattern(200);
        let mut chunks = Vec::new();
        let root = chunker.split_bytes(&data, &mut chunks).unwrap();
        let fetch = MapFetch::from_chunks(chunks);
        let reader = chunker.join(root, &fetch).unwrap();

        let mut buf = [0u8; 1];
        reader.read_at(&mut buf, 0).unwrap();
        let after_first = fetch.calls.get();
        reader.read_at(&mut buf, 0).unwrap();
        assert_eq!(fetch.calls.get(), 2 * after_first - 1);
    }

    #[test]
    fn missing_chunk_surfaces_fetch_error() {
        let chunker = small();
        let mut chunks = Vec::new();
        let root = chunker.split_bytes(&pattern(500), &mut chunks).unwrap();
        chunks.remove(0);
        let reader = chunker.join(root, MapFetch::from_chunks(chunks)).unwrap();
        assert!(matches!(reader.read_all(), Err(ChunkerError::Fetch(..))));
    }

    #[test]
    fn sink_errors_abort_split() {
        let mut count = 0;
        let mut sink = |chunk: Chunk| {
            count += 1;
            if count == 2 {
                return Err(ChunkerError::Sink {
                    key: chunk.key,
                    source: "full".into(),
                });
            }
            Ok(())
        };
        assert!(small().split_bytes(&pattern(500), &mut sink).is_err());
    }
}
