//! RFC 6962 leaf/node hashing primitives.
//!
//! Pure functions only: no I/O, never fails. `Hash` is the 32-byte SHA-256
//! digest type threaded through the bundle writer, integrator and
//! checkpoint modules.

use sha2::{Digest, Sha256};
use std::fmt;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// `SHA-256(0x00 || entry)`.
#[must_use]
pub fn leaf_hash(entry: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(entry);
    Hash(hasher.finalize().into())
}

/// `SHA-256(0x01 || left || right)`.
#[must_use]
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

/// Naive, in-memory RFC 6962 root over a full set of leaf hashes. Used by
/// tests to independently check the tile-based integrator (property 5:
/// root correctness) and, trivially, at size 0/1.
#[must_use]
pub fn naive_root(leaf_hashes: &[Hash]) -> Hash {
    subtree_root(leaf_hashes)
}

fn subtree_root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Hash::default(),
        1 => leaves[0],
        n => {
            let split = largest_power_of_two_less_than(n);
            let left = subtree_root(&leaves[..split]);
            let right = subtree_root(&leaves[split..]);
            node_hash(&left, &right)
        }
    }
}

/// RFC 6962 defines the split point as the largest power of two strictly
/// less than `n` (so a tree of `n` leaves splits into a left subtree of
/// that size and a right subtree of the remainder).
fn largest_power_of_two_less_than(n: usize) -> usize {
    let mut p = 1usize;
    while p * 2 < n {
        p *= 2;
    }
    p
}
