//! Transport variants behind one capability contract.
//!
//! [`Transport`] is a closed set: every variant owns its protocol state and
//! exposes only `open`, `close`, `send` and `receive`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConnectionError, Result};
use crate::types::TransportKind;

pub mod http;
pub mod serial;
pub mod shell;
pub mod socket;
pub mod telnet;

pub use http::HttpTransport;
pub use serial::SerialTransport;
pub use shell::ShellTransport;
pub use socket::SocketTransport;
pub use telnet::TelnetTransport;

fn default_poll_ms() -> u64 {
    500
}

fn default_send_path() -> String {
    "send".to_string()
}

fn default_poll_path() -> String {
    "poll".to_string()
}

/// Serializable description of a transport, as found in the gateway config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Interactive remote shell hosted in a detached tmux session.
    Shell {
        /// tmux session name.
        session: String,
        /// Command started in the session, e.g. `ssh -t user@sdf.org`.
        command: String,
        #[serde(default = "default_poll_ms")]
        poll_ms: u64,
    },
    /// Websocket push channel.
    Socket { url: String },
    /// Request/response endpoint.
    Http {
        /// Base URL; paths are joined onto it, so keep the trailing slash.
        base_url: String,
        #[serde(default = "default_send_path")]
        send_path: String,
        #[serde(default = "default_poll_path")]
        poll_path: String,
        #[serde(default = "default_poll_ms")]
        poll_ms: u64,
    },
    /// Character device, line oriented. Line settings are configured outside.
    Serial { device: PathBuf },
    /// Plain telnet.
    Telnet { host: String, port: u16 },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Shell { .. } => TransportKind::Shell,
            TransportConfig::Socket { .. } => TransportKind::Socket,
            TransportConfig::Http { .. } => TransportKind::Http,
            TransportConfig::Serial { .. } => TransportKind::Serial,
            TransportConfig::Telnet { .. } => TransportKind::Telnet,
        }
    }
}

/// One transport, exclusively owned by its connection.
#[derive(Debug)]
pub enum Transport {
    Shell(ShellTransport),
    Socket(SocketTransport),
    Http(HttpTransport),
    Serial(SerialTransport),
    Telnet(TelnetTransport),
}

impl Transport {
    /// Builds a transport from its config, validating URLs.
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Ok(match config {
            TransportConfig::Shell {
                session,
                command,
                poll_ms,
            } => Transport::Shell(
                ShellTransport::new(session, command).with_poll(Duration::from_millis(*poll_ms)),
            ),
            TransportConfig::Socket { url } => Transport::Socket(SocketTransport::new(url)?),
            TransportConfig::Http {
                base_url,
                send_path,
                poll_path,
                poll_ms,
            } => Transport::Http(
                HttpTransport::new(base_url)?
                    .with_paths(send_path, poll_path)
                    .with_poll(Duration::from_millis(*poll_ms)),
            ),
            TransportConfig::Serial { device } => Transport::Serial(SerialTransport::new(device)),
            TransportConfig::Telnet { host, port } => {
                if host.is_empty() {
                    return Err(ConnectionError::InvalidConfig("telnet host is empty".into()));
                }
                Transport::Telnet(TelnetTransport::new(host, *port))
            }
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Shell(_) => TransportKind::Shell,
            Transport::Socket(_) => TransportKind::Socket,
            Transport::Http(_) => TransportKind::Http,
            Transport::Serial(_) => TransportKind::Serial,
            Transport::Telnet(_) => TransportKind::Telnet,
        }
    }

    /// Where the transport points, for display.
    pub fn endpoint(&self) -> String {
        match self {
            Transport::Shell(t) => t.endpoint(),
            Transport::Socket(t) => t.endpoint(),
            Transport::Http(t) => t.endpoint(),
            Transport::Serial(t) => t.endpoint(),
            Transport::Telnet(t) => t.endpoint(),
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        match self {
            Transport::Shell(t) => t.open().await,
            Transport::Socket(t) => t.open().await,
            Transport::Http(t) => t.open().await,
            Transport::Serial(t) => t.open().await,
            Transport::Telnet(t) => t.open().await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Transport::Shell(t) => t.close().await,
            Transport::Socket(t) => t.close().await,
            Transport::Http(t) => t.close().await,
            Transport::Serial(t) => t.close().await,
            Transport::Telnet(t) => t.close().await,
        }
    }

    pub async fn send(&mut self, data: &str) -> Result<()> {
        match self {
            Transport::Shell(t) => t.send(data).await,
            Transport::Socket(t) => t.send(data).await,
            Transport::Http(t) => t.send(data).await,
            Transport::Serial(t) => t.send(data).await,
            Transport::Telnet(t) => t.send(data).await,
        }
    }

    /// Waits for the next unit of data. Cancel-safe only at `.await`
    /// boundaries of the underlying I/O; callers bound it with a timeout.
    pub async fn receive(&mut self) -> Result<String> {
        match self {
            Transport::Shell(t) => t.receive().await,
            Transport::Socket(t) => t.receive().await,
            Transport::Http(t) => t.receive().await,
            Transport::Serial(t) => t.receive().await,
            Transport::Telnet(t) => t.receive().await,
        }
    }
}
