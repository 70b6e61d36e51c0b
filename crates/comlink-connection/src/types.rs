//! Connection state, metadata and lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use comlink_models::ConnectionId;

/// The five transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Shell,
    Socket,
    Http,
    Serial,
    Telnet,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Shell => "shell",
            TransportKind::Socket => "socket",
            TransportKind::Http => "http",
            TransportKind::Serial => "serial",
            TransportKind::Telnet => "telnet",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a connection.
///
/// ```text
/// Disconnected --connect--> Connecting --ok--> Connected
///                           Connecting --fail--> Error
/// Connected --disconnect--> Disconnected
/// Connected --transport failure--> Error
/// Error --connect--> Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of a connection for operators and the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub kind: TransportKind,
    /// Where the transport points (host, URL, device path, tmux session).
    pub endpoint: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A lifecycle transition, published after the state changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { id: ConnectionId },
    Disconnected { id: ConnectionId },
    Error { id: ConnectionId, message: String },
}

impl ConnectionEvent {
    pub fn id(&self) -> &ConnectionId {
        match self {
            ConnectionEvent::Connected { id }
            | ConnectionEvent::Disconnected { id }
            | ConnectionEvent::Error { id, .. } => id,
        }
    }
}
