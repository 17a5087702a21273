// Error handling module for the ring node
//
// This module defines error types and the crate-wide Result alias

use std::io;
use std::result;
use thiserror::Error;

/// Result type for ring node operations
pub type Result<T> = result::Result<T, NodeError>;

/// Error type for ring node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A process address is already registered
    #[error("Address already registered: {0}")]
    AddressInUse(String),

    /// Message delivery failure
    #[error("Send failure: {0}")]
    SendFailure(String),

    /// Receive failure
    #[error("Receive failure: {0}")]
    ReceiveFailure(String),

    /// Serialization-related errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// thread_num was called twice for the same trace
    #[error("thread_num already set for trace {0}")]
    ThreadNumAlreadySet(String),

    /// thread_num was called after a thread had already begun
    #[error("threads already begun for trace {0}")]
    ThreadsAlreadyBegun(String),

    /// thread_begin was called on a trace that already started delivering
    #[error("trace {0} is already running")]
    TraceAlreadyRunning(String),

    /// A steering operation was attempted from an infected thread
    #[error("operation not allowed from an infected thread: {0}")]
    InfectedThread(String),
}

// Implement conversion from io::Error to NodeError
impl From<io::Error> for NodeError {
    fn from(err: io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

// Implement conversion from toml deserialization error to NodeError
impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

// Implement conversion from toml serialization error to NodeError
impl From<toml::ser::Error> for NodeError {
    fn from(err: toml::ser::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

// Implement conversion from serde_json::Error to NodeError
impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}
