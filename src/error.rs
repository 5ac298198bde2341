//! Error types for the mesh engine.
//!
//! Cryptographic and protocol violations are handled locally (the offending
//! frame is dropped); only resource-exhaustion and startup errors surface to
//! the caller.

use thiserror::Error;

/// Main error type for mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Authentication tag or handshake confirmation did not verify
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Received counter was not strictly greater than the last accepted one
    #[error("replay detected: counter {received} not above {last_accepted}")]
    ReplayDetected { received: u64, last_accepted: u64 },

    /// Peer speaks an incompatible protocol version
    #[error("protocol mismatch: local version {local}, remote version {remote}")]
    ProtocolMismatch { local: u8, remote: u8 },

    /// Store-and-forward buffer cannot hold the message
    #[error("forward queue full for destination {destination}")]
    QueueFull { destination: String },

    /// Message passed its retention deadline before delivery
    #[error("message expired: {0}")]
    MessageExpired(String),

    /// Frame or payload bytes could not be parsed
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Entropy source failure during key generation (fatal at startup)
    #[error("entropy source failure: {0}")]
    Entropy(String),

    /// No session material available for a peer
    #[error("no session for peer {0}")]
    NoSession(String),

    /// Link layer failure (send to unknown or disconnected address)
    #[error("link error: {0}")]
    Link(String),

    /// Persisted state I/O failure
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Persisted state (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine task has shut down and no longer accepts commands
    #[error("engine stopped")]
    EngineStopped,
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, MeshError>;
