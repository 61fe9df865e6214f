//! Domain-specific error types for the Remora transport core.
//!
//! All fallible operations return `Result<T, TransportError>`.
//! No panics on invalid input — every error is typed and recoverable,
//! and nothing in the core ever aborts the process.

use thiserror::Error;

/// The canonical error type for the Remora transport.
#[derive(Debug, Error)]
pub enum TransportError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// A datagram was not exactly one chunk long.
    #[error("invalid chunk length: expected {expected}, got {actual}")]
    InvalidChunkLength { expected: usize, actual: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    // ── Assembly Errors ──────────────────────────────────────────
    /// A message would need more chunks than the 7-bit index allows.
    #[error("message requires {chunks} chunks (max {max})")]
    MessageTooLarge { chunks: usize, max: usize },

    /// The erasure coder rejected the shard geometry or could not
    /// recover the missing shards.
    #[error("erasure coding failed: {0}")]
    Erasure(String),

    // ── Connection Errors ────────────────────────────────────────
    /// An address string could not be parsed into `host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The rendezvous handshake did not complete in time.
    #[error("connection to '{address}' could not be established (timeout)")]
    HandshakeTimeout { address: String },

    /// An operation that requires an established link was attempted
    /// while the endpoint was not connected.
    #[error("endpoint is not connected")]
    NotConnected,

    /// The UDP/TCP layer reported an error.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reed_solomon_erasure::Error> for TransportError {
    fn from(e: reed_solomon_erasure::Error) -> Self {
        TransportError::Erasure(e.to_string())
    }
}
