//! Content keys and chunks, the unit of storage.
//!
//! Every chunk's data starts with an 8-byte little-endian subtree size:
//!   leaf:     size || payload
//!   interior: size || key_0 || key_1 || ... || key_{n-1}
//!
//! A leaf's size is its own payload length. An interior node's size is the
//! sum of its children's sizes, i.e. the length of the byte range it covers.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto;

/// Length of the subtree size prefix carried by every chunk.
pub const SIZE_PREFIX: usize = 8;

// ── ContentKey ────────────────────────────────────────────────────────────────

/// Opaque content hash identifying a chunk.
///
/// Equality and hashing are byte-for-byte. The all-zero key is reserved as a
/// wildcard meaning "nearby peers" rather than a real chunk.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(Bytes);

impl ContentKey {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// The wildcard key used to ask a peer for its neighbours.
    pub fn zero() -> Self {
        Self(Bytes::from_static(&[0u8; crypto::KEY_SIZE]))
    }

    /// True for the wildcard key. An empty key is not a wildcard.
    pub fn is_zero(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First eight hex characters, for log fields.
    pub fn short(&self) -> String {
        let n = self.0.len().min(4);
        hex::encode(&self.0[..n])
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(|v| Self(Bytes::from(v)))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", self.short())
    }
}

impl From<[u8; 32]> for ContentKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for ContentKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// An immutable `(key, data)` pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    pub key: ContentKey,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(key: ContentKey, data: Bytes) -> Self {
        Self { key, data }
    }

    /// Encode `size || body` and key it by the hash of the encoded bytes.
    pub fn seal(subtree_size: u64, body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(SIZE_PREFIX + body.len());
        buf.put_u64_le(subtree_size);
        buf.put_slice(body);
        let data = buf.freeze();
        Self {
            key: crypto::content_key(&data),
            data,
        }
    }

    /// A leaf chunk holding raw payload bytes.
    pub fn leaf(payload: &[u8]) -> Self {
        Self::seal(payload.len() as u64, payload)
    }

    /// Subtree size from the prefix, or `None` if the data is too short.
    pub fn subtree_size(&self) -> Option<u64> {
        let prefix: [u8; SIZE_PREFIX] = self.data.get(..SIZE_PREFIX)?.try_into().ok()?;
        Some(u64::from_le_bytes(prefix))
    }

    /// Everything after the size prefix.
    pub fn body(&self) -> &[u8] {
        self.data.get(SIZE_PREFIX..).unwrap_or(&[])
    }

    /// Does the key match the hash of the data?
    pub fn verify(&self) -> bool {
        crypto::hash(&self.data)[..] == *self.key.as_bytes()
    }

    /// Bytes this chunk is charged in the memory budget.
    pub fn cost(&self) -> u64 {
        self.subtree_size().unwrap_or(self.data.len() as u64)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("key", &self.key)
            .field("subtree_size", &self.subtree_size())
            .field("len", &self.data.len())
            .finish()
    }
}
