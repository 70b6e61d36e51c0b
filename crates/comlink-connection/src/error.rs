//! Error types for connection operations.

use std::time::Duration;
use thiserror::Error;

use crate::types::ConnectionState;

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// A connection with this id is already registered.
    #[error("connection already registered: {0}")]
    DuplicateId(String),

    /// No connection with this id is registered.
    #[error("connection not found: {0}")]
    NotFound(String),

    /// Send or receive attempted outside the Connected state.
    #[error("connection {id} is not connected (state: {state})")]
    NotConnected { id: String, state: ConnectionState },

    /// Receive did not produce data in time.
    #[error("connection {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    /// The transport failed.
    #[error("{kind} transport error: {message}")]
    Transport { kind: &'static str, message: String },

    /// The transport configuration is unusable.
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    pub(crate) fn transport(kind: &'static str, message: impl ToString) -> Self {
        Self::Transport {
            kind,
            message: message.to_string(),
        }
    }
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;
