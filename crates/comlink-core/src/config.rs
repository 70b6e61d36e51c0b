//! Gateway configuration and state layout.
//!
//! # Storage Structure
//!
//! ```text
//! ~/.comlink/
//! ├── queue/              # One JSON file per queued message
//! ├── journal/            # Confirmation, report and supervision journals
//! ├── config/
//! │   └── gateway.json    # GatewayConfig
//! └── connections.json    # Connection registry snapshot
//! ```
//!
//! # Environment Variables
//!
//! - `COMLINK_STATE_DIR`: Override the base state directory

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use comlink_connection::TransportConfig;
use comlink_persistence::atomic::{atomic_write_json, ensure_dir};

use crate::error::{CoreError, Result};

/// Environment variable for a custom state directory.
pub const STATE_DIR_ENV: &str = "COMLINK_STATE_DIR";

const DEFAULT_STATE_DIR: &str = ".comlink";
const JOURNAL_SUBDIR: &str = "journal";
const CONFIG_SUBDIR: &str = "config";

/// The state directory.
///
/// 1. `COMLINK_STATE_DIR` if set
/// 2. `~/.comlink` if a home directory is available
/// 3. `.comlink` in the current directory
pub fn state_dir() -> PathBuf {
    std::env::var(STATE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(DEFAULT_STATE_DIR))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
        })
}

/// Paths of everything the gateway keeps on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths under [`state_dir`].
    pub fn from_env() -> Self {
        Self::new(state_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.root.join(JOURNAL_SUBDIR)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_SUBDIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("gateway.json")
    }

    pub fn connections_file(&self) -> PathBuf {
        self.root.join("connections.json")
    }

    pub fn confirmation_history(&self) -> PathBuf {
        self.journal_dir().join("confirmation_history.json")
    }

    pub fn report_journal(&self) -> PathBuf {
        self.journal_dir().join("execution_reports.json")
    }

    pub fn supervision_journal(&self) -> PathBuf {
        self.journal_dir().join("supervision.json")
    }

    /// Creates the directories.
    pub fn ensure(&self) -> Result<()> {
        ensure_dir(&self.root)?;
        ensure_dir(&self.journal_dir())?;
        ensure_dir(&self.config_dir())?;
        Ok(())
    }
}

/// How a logical channel's traffic is read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Terminal running the COM chat client.
    Com,
    /// Terminal running a login shell.
    Shell,
    /// Instant-messaging bridge exchanging lines or JSON objects.
    Messaging,
}

/// A connection to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub id: String,
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,
}

/// A logical channel and the connection that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    pub connection: String,
    pub kind: ChannelKind,
}

/// An OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub name: String,
    /// Base URL, e.g. `https://openrouter.ai/api/v1`.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Everything the gateway needs to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub connections: Vec<ConnectionSpec>,
    pub channels: Vec<ChannelSpec>,
    /// Allowed targets per source channel. Sources without an entry get the
    /// defaults described on [`GatewayConfig::allowed_targets`].
    pub routes: HashMap<String, Vec<String>>,
    /// Channel that COM commands execute on.
    pub com_channel: String,
    /// Channel that `sh:` commands execute on.
    pub shell_channel: String,
    /// Our own COM login, so our echoes are not read back as inbound chat.
    pub com_user: Option<String>,
    pub default_room: String,
    /// Routing core workers.
    pub workers: usize,
    pub model_timeout_ms: u64,
    /// How long to wait for a command's echo on screen.
    pub echo_wait_ms: u64,
    pub sweep_interval_ms: u64,
    pub primary_model: Option<ModelEndpoint>,
    pub fallback_model: Option<ModelEndpoint>,
    pub supervisor_model: Option<ModelEndpoint>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            channels: Vec::new(),
            routes: HashMap::new(),
            com_channel: "sdf_com".to_string(),
            shell_channel: "sdf_shell".to_string(),
            com_user: None,
            default_room: "lounge".to_string(),
            workers: 2,
            model_timeout_ms: 30_000,
            echo_wait_ms: 3_000,
            sweep_interval_ms: 5_000,
            primary_model: None,
            fallback_model: None,
            supervisor_model: None,
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no gateway config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)?;
        Ok(())
    }

    /// Checks that every channel names a configured connection and that ids
    /// are unique.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CoreError::InvalidConfig("workers must be at least 1".into()));
        }
        let mut ids = std::collections::HashSet::new();
        for c in &self.connections {
            if !ids.insert(c.id.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate connection id: {}",
                    c.id
                )));
            }
        }
        let mut names = std::collections::HashSet::new();
        let mut carried = std::collections::HashSet::new();
        for ch in &self.channels {
            if !carried.insert(ch.connection.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "connection {} carries more than one channel",
                    ch.connection
                )));
            }
            if !names.insert(ch.name.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate channel: {}",
                    ch.name
                )));
            }
            if !ids.contains(ch.connection.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "channel {} uses unknown connection {}",
                    ch.name, ch.connection
                )));
            }
        }
        for (source, targets) in &self.routes {
            for t in targets.iter().chain(std::iter::once(source)) {
                if !names.contains(t.as_str()) {
                    return Err(CoreError::InvalidConfig(format!(
                        "route {} -> {:?} names unknown channel {}",
                        source, targets, t
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn with_connection(mut self, id: impl Into<String>, transport: TransportConfig) -> Self {
        self.connections.push(ConnectionSpec {
            id: id.into(),
            transport,
            receive_timeout_ms: None,
        });
        self
    }

    pub fn with_channel(
        mut self,
        name: impl Into<String>,
        connection: impl Into<String>,
        kind: ChannelKind,
    ) -> Self {
        self.channels.push(ChannelSpec {
            name: name.into(),
            connection: connection.into(),
            kind,
        });
        self
    }

    pub fn with_route(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.routes.entry(source.into()).or_default().push(target.into());
        self
    }

    pub fn with_com_channel(mut self, name: impl Into<String>) -> Self {
        self.com_channel = name.into();
        self
    }

    pub fn with_shell_channel(mut self, name: impl Into<String>) -> Self {
        self.shell_channel = name.into();
        self
    }

    pub fn with_com_user(mut self, user: impl Into<String>) -> Self {
        self.com_user = Some(user.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_echo_wait(mut self, wait: Duration) -> Self {
        self.echo_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn echo_wait(&self) -> Duration {
        Duration::from_millis(self.echo_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn connection(&self, id: &str) -> Option<&ConnectionSpec> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// Whether `channel` yields whole screen captures rather than a stream
    /// of lines. Only the tmux-hosted shell repaints.
    pub fn is_snapshot(&self, channel: &str) -> bool {
        self.channel(channel)
            .and_then(|ch| self.connection(&ch.connection))
            .map(|c| matches!(c.transport, TransportConfig::Shell { .. }))
            .unwrap_or(false)
    }

    /// Where traffic from `source` may go.
    ///
    /// Configured routes win. Otherwise messaging channels talk to the COM
    /// channel and the COM channel talks to every messaging channel.
    pub fn allowed_targets(&self, source: &str) -> Vec<String> {
        if let Some(targets) = self.routes.get(source) {
            return targets.clone();
        }
        match self.channel(source).map(|c| c.kind) {
            Some(ChannelKind::Messaging) => vec![self.com_channel.clone()],
            Some(ChannelKind::Com) | Some(ChannelKind::Shell) => self
                .channels
                .iter()
                .filter(|c| c.kind == ChannelKind::Messaging)
                .map(|c| c.name.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}
