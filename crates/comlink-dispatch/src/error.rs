//! Error types for command dispatch.

use thiserror::Error;

use comlink_persistence::PersistenceError;

/// Errors that can occur while dispatching input.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The pending confirmation cap is reached.
    #[error("too many pending confirmations (limit {limit})")]
    TooManyPending { limit: usize },

    /// The id does not name a Pending confirmation (unknown, resolved or expired).
    #[error("confirmation not pending: {0}")]
    ConfirmationNotPending(String),

    /// The shell command is on the prohibited list.
    #[error("command prohibited: {command}")]
    Prohibited { command: String },

    /// A prefixed command is missing its arguments.
    #[error("invalid `{prefix}` command: {reason}")]
    InvalidCommand { prefix: &'static str, reason: String },

    /// Confirmation history could not be written.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Lock poisoned.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl DispatchError {
    /// Text sent back to the user who triggered the error.
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::TooManyPending { limit } => format!(
                "There are already {} commands waiting for confirmation. \
                 Confirm, reject or `cancel` some of them, or wait a minute for them to expire.",
                limit
            ),
            DispatchError::ConfirmationNotPending(id) => format!(
                "Nothing is waiting for confirmation under `{}`. It may have expired (60s) or already been handled.",
                id
            ),
            DispatchError::Prohibited { command } => {
                format!("`{}` is prohibited and will not be executed.", command)
            }
            DispatchError::InvalidCommand { prefix, reason } => {
                format!("Could not read `{}` command: {}.", prefix, reason)
            }
            DispatchError::Persistence(_) | DispatchError::LockPoisoned(_) => {
                "Internal error while handling the command; please retry.".to_string()
            }
        }
    }
}

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
