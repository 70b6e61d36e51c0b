//! Remote shell hosted in a detached tmux session.
//!
//! The session runs the configured command (normally `ssh -t user@host`);
//! input goes in with `send-keys` and output comes back as full pane
//! captures, escape sequences included, for the screen parser.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{ConnectionError, Result};

const KIND: &str = "shell";
const PANE_WIDTH: &str = "80";
const PANE_HEIGHT: &str = "24";

#[derive(Debug)]
pub struct ShellTransport {
    session: String,
    command: String,
    poll: Duration,
    tmux: Option<PathBuf>,
    last_capture: Option<String>,
}

impl ShellTransport {
    pub fn new(session: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            command: command.into(),
            poll: Duration::from_millis(500),
            tmux: None,
            last_capture: None,
        }
    }

    /// Sets how often the pane is captured while waiting for a change.
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("tmux:{} ({})", self.session, self.command)
    }

    /// Check if tmux is available in PATH.
    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    fn tmux(&self) -> Result<&PathBuf> {
        self.tmux
            .as_ref()
            .ok_or_else(|| ConnectionError::transport(KIND, "session not open"))
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<Output> {
        let tmux = self.tmux()?;
        trace!(args = ?args, "running tmux command");
        let output = Command::new(tmux).args(args).output().await?;
        trace!(status = %output.status, stdout_len = output.stdout.len(), "tmux command completed");
        Ok(output)
    }

    async fn run_tmux_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run_tmux(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ConnectionError::transport(
                KIND,
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    async fn session_exists(&self) -> bool {
        matches!(
            self.run_tmux(&["has-session", "-t", &self.session]).await,
            Ok(o) if o.status.success()
        )
    }

    pub async fn open(&mut self) -> Result<()> {
        let tmux = which::which("tmux")
            .map_err(|_| ConnectionError::transport(KIND, "tmux not found in PATH"))?;
        self.tmux = Some(tmux);
        self.last_capture = None;

        if self.session_exists().await {
            debug!(session = %self.session, "reusing tmux session");
            return Ok(());
        }

        debug!(session = %self.session, command = %self.command, "creating tmux session");
        self.run_tmux_checked(&[
            "new-session",
            "-d",
            "-s",
            &self.session,
            "-x",
            PANE_WIDTH,
            "-y",
            PANE_HEIGHT,
            &self.command,
        ])
        .await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.tmux.is_some() && self.session_exists().await {
            debug!(session = %self.session, "killing tmux session");
            self.run_tmux_checked(&["kill-session", "-t", &self.session])
                .await?;
        }
        self.tmux = None;
        self.last_capture = None;
        Ok(())
    }

    /// Types `data` literally, then presses Enter.
    pub async fn send(&mut self, data: &str) -> Result<()> {
        self.run_tmux_checked(&["send-keys", "-t", &self.session, "-l", data])
            .await?;
        self.run_tmux_checked(&["send-keys", "-t", &self.session, "Enter"])
            .await?;
        Ok(())
    }

    /// Returns the next pane capture that differs from the previous one.
    pub async fn receive(&mut self) -> Result<String> {
        loop {
            let capture = self
                .run_tmux_checked(&["capture-pane", "-p", "-e", "-t", &self.session])
                .await?;
            if self.last_capture.as_deref() != Some(capture.as_str()) {
                self.last_capture = Some(capture.clone());
                return Ok(capture);
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}
