//! Network error types.

use super::message::PeerId;
use thiserror::Error;

/// Errors on one connection or on the node's lifecycle. None of them is
/// fatal to the node itself.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Duplicate peer: {0}")]
    DuplicatePeer(PeerId),

    #[error("Refusing to connect to ourselves")]
    SelfConnection,

    #[error("Node is already running")]
    AlreadyRunning,

    #[error("Node is not running")]
    NotRunning,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
