//! Error types for Foreman
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Foreman
#[derive(Debug, Error)]
pub enum ForemanError {
    /// Transport failure: connect/write/read failed, or the connection was
    /// lost while awaiting a correlated response
    #[error("worker unavailable: {0}")]
    Unavailable(String),

    /// A bounded RPC wait elapsed without a response
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Malformed frame or unexpected response type; scoped to one call
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error envelope returned by the worker, surfaced verbatim
    #[error("worker error: {0}")]
    Remote(String),

    /// Handshake rejected: protocol version or identity token
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Session record is missing required fields or unparseable
    #[error("invalid session record: {0}")]
    Record(String),

    /// Starting a loop with an empty ticket queue
    #[error("no tickets to run")]
    NoTickets,

    /// Invalid state transition or operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Snapshot/persistence error
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Foreman operations
pub type Result<T> = std::result::Result<T, ForemanError>;
