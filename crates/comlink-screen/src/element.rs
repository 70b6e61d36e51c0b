//! Screen model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ScreenError;

/// Metadata key set when the input could not be parsed.
pub const PARSE_ERROR: &str = "parse_error";

/// Classification of a screen region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Text,
    /// First row of the screen.
    Header,
    /// Column header of a detected table.
    TableHeader,
    /// A table spanning several rows.
    Table,
    Row,
    Menu,
    Status,
    Error,
    Cursor,
}

/// Zero-indexed, screen-relative position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

/// Extent in rows and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub rows: usize,
    pub cols: usize,
}

/// A contiguous region of screen content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenElement {
    pub element_type: ElementType,
    pub content: String,
    pub position: Position,
    pub size: Size,
}

/// Which extractor runs over the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Application {
    /// Raw lines only.
    #[default]
    Generic,
    /// `top`-style process monitor.
    ProcessMonitor,
    /// `vim`-style modal editor.
    LineEditor,
    /// The SDF COM chat client.
    ComChat,
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Application::Generic => "generic",
            Application::ProcessMonitor => "top",
            Application::LineEditor => "vim",
            Application::ComChat => "com",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Application {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "shell" => Ok(Application::Generic),
            "top" | "htop" | "process_monitor" => Ok(Application::ProcessMonitor),
            "vim" | "vi" | "line_editor" => Ok(Application::LineEditor),
            "com" | "com_chat" => Ok(Application::ComChat),
            other => Err(format!("unknown application: {}", other)),
        }
    }
}

/// Something that happened in a chat, read off the screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScreenEvent {
    /// A line said in a room.
    ChatMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        user: String,
        text: String,
        /// Time printed next to the line, `HH:MM` or `HH:MM:SS`.
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    /// A private message addressed to us.
    PrivateMessage { from: String, text: String },
    /// The client reports being in a different room.
    RoomChanged { room: String },
}

/// Structured reconstruction of one terminal frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedScreen {
    /// The input, decoded lossily.
    pub raw_data: String,
    pub application: Application,
    pub elements: Vec<ScreenElement>,
    pub width: usize,
    pub height: usize,
    pub cursor: Position,
    pub captured_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<ScreenEvent>,
    /// Grid rows with trailing blanks removed.
    #[serde(default)]
    pub lines: Vec<String>,
}

impl ParsedScreen {
    /// True when the input was rejected as noise.
    pub fn is_degraded(&self) -> bool {
        self.metadata.contains_key(PARSE_ERROR)
    }

    /// Surfaces degradation as an error for callers that want to log it.
    pub fn check(&self) -> Result<(), ScreenError> {
        match self.metadata.get(PARSE_ERROR) {
            Some(reason) => Err(ScreenError::ParseDegraded(
                reason.as_str().unwrap_or("unknown").to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Elements of one type, in screen order.
    pub fn elements_of(&self, element_type: ElementType) -> impl Iterator<Item = &ScreenElement> {
        self.elements
            .iter()
            .filter(move |e| e.element_type == element_type)
    }
}
