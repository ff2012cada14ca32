//! Hashing and identity primitives for Cairn.
//!
//! BLAKE3 is the content hash for every chunk: a chunk's key is the digest
//! of its full encoded bytes (size prefix included). Any collision-resistant
//! digest with a fixed output size could stand in; everything downstream
//! only relies on `KEY_SIZE`.

use rand::RngCore;

use crate::chunk::ContentKey;

/// Digest length in bytes. Interior chunks spend this many bytes per child.
pub const KEY_SIZE: usize = 32;

/// Length of a generated node id.
pub const NODE_ID_SIZE: usize = 32;

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash a byte slice into a `ContentKey`.
pub fn content_key(data: &[u8]) -> ContentKey {
    ContentKey::from_slice(&hash(data))
}

/// Generate a random overlay node id.
pub fn generate_node_id() -> [u8; NODE_ID_SIZE] {
    let mut id = [0u8; NODE_ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    id
}
