//! Hashing and identities for Shoal.
//!
//! BLAKE3 names chunks. Peer identities are 32 random bytes generated once
//! per node and persisted.

use rand::RngCore;

use crate::wire::{ChunkHash, PeerId};

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> ChunkHash {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for data that arrives in pieces.
///
/// # Example
/// ```
/// use shoal_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, shoal_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh random identity for a new node.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    id
}
