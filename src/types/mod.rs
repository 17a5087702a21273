// Types module for the ring node
//
// This module defines common types used throughout the node: process
// addresses, node descriptors and trace identifiers.

use crate::keyspace::RingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a logical process.
///
/// Two descriptors denote the same process iff their addresses coincide.
/// Addresses order lexicographically, which is also the tie-breaker used
/// when sorting neighborhood entries at equal ring distance.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessAddr(String);

impl ProcessAddr {
    /// Create a new process address
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ProcessAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessAddr({})", self.0)
    }
}

impl From<&str> for ProcessAddr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Descriptor of a node participating in the overlay.
///
/// The version field supersedes: of two descriptors for the same process,
/// the one with the greater version is the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Process address of the node
    pub addr: ProcessAddr,

    /// Position of the node in the 128-bit key space
    pub id: RingKey,

    /// Descriptor version, bumped by the node itself
    pub version: u32,
}

impl NodeDescriptor {
    /// Create a new descriptor
    pub fn new(addr: ProcessAddr, id: RingKey, version: u32) -> Self {
        Self { addr, id, version }
    }

    /// Whether both descriptors denote the same process
    pub fn same_process(&self, other: &NodeDescriptor) -> bool {
        self.addr == other.addr
    }

    /// Whether this descriptor supersedes `other` (same process, newer version)
    pub fn supersedes(&self, other: &NodeDescriptor) -> bool {
        self.addr == other.addr && self.version > other.version
    }
}

/// Identifier of a scheduler trace.
///
/// Steering operations that omit the trace use [`TraceId::default`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

impl TraceId {
    /// Create a new trace identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
