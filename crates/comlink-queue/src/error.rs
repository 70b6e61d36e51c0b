//! Error types for queue operations.

use comlink_persistence::PersistenceError;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The durable store rejected a write or read.
    #[error("queue storage unavailable: {0}")]
    StorageUnavailable(#[from] PersistenceError),

    /// The message is not currently handed out to a consumer.
    #[error("message not in flight: {0}")]
    NotInFlight(String),

    /// Lock poisoned (thread panicked while holding lock).
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
