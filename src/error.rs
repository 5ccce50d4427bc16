//! Error types for fcgiwire.

use thiserror::Error;

/// Main error type for all client, server and codec operations.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record header carried an unsupported protocol version.
    #[error("malformed frame: protocol version {0}, expected 1")]
    MalformedFrame(u8),

    /// A record or name-value pair ended before its declared length.
    #[error("truncated frame")]
    TruncatedFrame,

    /// A name or value length does not fit the 31-bit wire encoding.
    #[error("name-value length {0} exceeds the 31-bit wire limit")]
    OversizedName(usize),

    /// The peer violated the record protocol (wrong state, duplicate id, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The transport closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer did not answer the capability probe in time.
    #[error("capability negotiation timed out")]
    NegotiationTimeout,

    /// Outbound record queue stayed full past the configured timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using FcgiError.
pub type Result<T> = std::result::Result<T, FcgiError>;
