//! Application-specific extractors.
//!
//! Each extractor reads the full grid snapshot (never a diff) so that
//! applications which repaint in place are handled the same as ones that
//! append.

use serde_json::Value;
use std::collections::HashMap;

use crate::element::{Application, ElementType, Position, ScreenElement, ScreenEvent};

pub mod com;
pub mod generic;
pub mod top;
pub mod vim;

/// What an extractor contributes to a [`crate::ParsedScreen`].
#[derive(Debug, Default)]
pub struct Extraction {
    pub metadata: HashMap<String, Value>,
    pub events: Vec<ScreenEvent>,
    /// Rows whose elements should be reclassified.
    pub retype: Vec<(usize, ElementType)>,
    /// Elements spanning more than one region, such as a table.
    pub extra: Vec<ScreenElement>,
}

/// Runs the extractor for `application`.
pub fn run(application: Application, lines: &[String], cursor: Position) -> Extraction {
    match application {
        Application::Generic => generic::extract(lines),
        Application::ProcessMonitor => top::extract(lines),
        Application::LineEditor => vim::extract(lines, cursor),
        Application::ComChat => com::extract(lines),
    }
}
