//! Error types for the gateway core.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use comlink_connection::ConnectionError;
use comlink_dispatch::DispatchError;
use comlink_persistence::PersistenceError;
use comlink_queue::QueueError;

/// Errors from a language model call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// No model (primary or fallback) answered.
    #[error("no language model available: {0}")]
    Unavailable(String),

    /// The call did not finish in time.
    #[error("language model timed out after {0:?}")]
    Timeout(Duration),

    /// The HTTP request failed.
    #[error("model request failed: {0}")]
    Request(String),

    /// The response could not be understood.
    #[error("unexpected model response: {0}")]
    Response(String),

    /// Missing API key or endpoint.
    #[error("model configuration error: {0}")]
    Configuration(String),
}

/// Errors that can occur in the gateway core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Queue error, including an unavailable durable store.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Dispatch error.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Persistence error.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Language model error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A queued message lacks what its stage requires.
    #[error("malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    /// Logical channel not configured.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Gateway already started.
    #[error("gateway already started")]
    AlreadyStarted,

    /// Gateway not started.
    #[error("gateway not started")]
    NotStarted,

    /// Shutdown error.
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl CoreError {
    /// Whether the durable queue store is gone. The gateway cannot keep its
    /// single transit point without it, so this stops the process.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, CoreError::Queue(QueueError::StorageUnavailable(_)))
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
