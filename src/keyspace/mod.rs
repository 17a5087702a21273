// Key space module for the ring node
//
// Identifiers live on the ring of integers [0, 2^128); all arithmetic is
// modulo 2^128. This module provides the key type, distance helpers and
// hashing; interval algebra lives in the `interval` submodule.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod interval;

pub use interval::Interval;

/// A position in the 128-bit circular key space
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RingKey(u128);

impl RingKey {
    /// The zero key
    pub const ZERO: RingKey = RingKey(0);

    /// The largest key, 2^128 - 1
    pub const MAX: RingKey = RingKey(u128::MAX);

    /// One quarter of the ring, 2^126
    pub const QUARTER: RingKey = RingKey(1u128 << 126);

    /// Create a key from a raw value
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(&self) -> u128 {
        self.0
    }

    /// Addition modulo 2^128
    pub const fn add(&self, other: RingKey) -> RingKey {
        RingKey(self.0.wrapping_add(other.0))
    }

    /// Subtraction modulo 2^128
    pub const fn sub(&self, other: RingKey) -> RingKey {
        RingKey(self.0.wrapping_sub(other.0))
    }

    /// Clockwise distance from `self` to `other`
    pub const fn distance_cw(&self, other: RingKey) -> u128 {
        other.0.wrapping_sub(self.0)
    }

    /// Counterclockwise distance from `self` to `other`
    pub const fn distance_ccw(&self, other: RingKey) -> u128 {
        self.0.wrapping_sub(other.0)
    }
}

impl fmt::Debug for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingKey({:#034x})", self.0)
    }
}

impl fmt::Display for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash arbitrary bytes onto the ring.
///
/// Uses the first 16 bytes of a blake3 digest, which distributes keys
/// uniformly over the identifier space.
pub fn hash_key(data: &[u8]) -> RingKey {
    let digest = blake3::hash(data);
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest.as_bytes()[..16]);
    RingKey(u128::from_be_bytes(raw))
}
