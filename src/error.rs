//! Error types for sqlite-share.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{CastError, EnvelopeError, FrameError, MessageKind};

/// Main error type for all sqlite-share operations.
#[derive(Debug, Error)]
pub enum ShareError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed or truncated frame bytes.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed correlated envelope or invalid correlation id.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Frame payload could not be read as the requested type.
    #[error("cast error: {0}")]
    Cast(#[from] CastError),

    /// Unexpected message for the current exchange.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response arrived within the wait window.
    #[error("timed out after {waited:?} waiting for a response to {kind}")]
    Timeout {
        /// Kind of the request that was waiting.
        kind: MessageKind,
        /// Time since the request (or the last busy signal).
        waited: Duration,
    },

    /// The peer reported a failure while executing the request.
    #[error("remote error: {0}")]
    Remote(String),

    /// Local database engine error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Neither binding nor connecting to the endpoint succeeded.
    #[error("cannot bind or connect to {address}: bind failed ({bind}), connect failed ({connect})")]
    ConnectFailed {
        /// Endpoint that was tried.
        address: String,
        /// Why listening failed.
        bind: std::io::Error,
        /// Why connecting failed.
        connect: std::io::Error,
    },

    /// The coordinator holds no role yet.
    #[error("not connected")]
    NotConnected,

    /// The link went away while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation on a connection that was already closed.
    #[error("connection is closed")]
    Closed,

    /// Operation not valid for the current role or lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Backpressure timeout - write buffer full.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ShareError {
    /// Whether this error is a send-and-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShareError::Timeout { .. })
    }
}

/// Result type alias using ShareError.
pub type Result<T> = std::result::Result<T, ShareError>;
