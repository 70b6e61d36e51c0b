//! Error types for screen parsing.

use thiserror::Error;

/// Raised only by [`crate::ParsedScreen::check`]; parsing itself never fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScreenError {
    /// The input could not be read as terminal output.
    #[error("parse degraded: {0}")]
    ParseDegraded(String),
}
