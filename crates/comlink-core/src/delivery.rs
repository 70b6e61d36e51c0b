//! The send side: the only code that calls `send` on a connection.
//!
//! [`Delivery::deliver`] puts outbound text on a channel;
//! [`Delivery::execute`] runs a dispatched command against the COM client
//! or the shell and watches the screen for what came back.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use comlink_connection::ConnectionManager;
use comlink_models::{Command, ConnectionId};
use comlink_screen::{count_echoes, find_echo, to_plain_text, Echo, ParsedScreen, ScreenEvent};

use crate::config::{ChannelKind, GatewayConfig};
use crate::error::{CoreError, Result};

const FRAME_CAPACITY: usize = 64;
/// Shell output lines kept in a report.
const OUTPUT_LINES: usize = 20;
/// Appended to every shell command so its exit status shows on screen.
const STATUS_MARK: &str = "__comlink_rc=";

#[derive(Debug)]
struct Feed {
    sender: broadcast::Sender<Arc<ParsedScreen>>,
    latest: Option<Arc<ParsedScreen>>,
}

impl Feed {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(FRAME_CAPACITY).0,
            latest: None,
        }
    }
}

/// Parsed frames per channel, fanned out to whoever is watching.
#[derive(Debug, Default)]
pub struct FrameHub {
    channels: Mutex<HashMap<String, Feed>>,
}

impl FrameHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<ParsedScreen>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(Feed::new)
            .sender
            .subscribe()
    }

    /// The last frame published on `channel`.
    pub fn latest(&self, channel: &str) -> Option<Arc<ParsedScreen>> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel).and_then(|feed| feed.latest.clone())
    }

    pub fn publish(&self, channel: &str, screen: Arc<ParsedScreen>) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let feed = channels.entry(channel.to_string()).or_insert_with(Feed::new);
        feed.latest = Some(Arc::clone(&screen));
        // No watchers is fine
        let _ = feed.sender.send(screen);
    }
}

/// The COM room we believe we are in.
#[derive(Debug)]
pub struct RoomTracker {
    room: RwLock<String>,
}

impl RoomTracker {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: RwLock::new(room.into()),
        }
    }

    pub fn current(&self) -> String {
        self.room
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, room: impl Into<String>) {
        let room = room.into();
        let mut current = self.room.write().unwrap_or_else(PoisonError::into_inner);
        if *current != room {
            info!(from = %current, to = %room, "COM room changed");
            *current = room;
        }
    }
}

/// Outcome of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub success: bool,
    pub message: String,
    /// When the remote side acknowledged the command on screen.
    pub delivery_timestamp: Option<DateTime<Utc>>,
}

impl Execution {
    fn ok(message: impl Into<String>, at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            message: message.into(),
            delivery_timestamp: at,
        }
    }

    fn unsuccessful(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            delivery_timestamp: None,
        }
    }

    fn failed(error: &CoreError) -> Self {
        Self::unsuccessful(error.to_string())
    }
}

/// Sends text and commands over the registered connections.
pub struct Delivery {
    manager: Arc<ConnectionManager>,
    config: Arc<GatewayConfig>,
    frames: Arc<FrameHub>,
    room: Arc<RoomTracker>,
}

impl Delivery {
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: Arc<GatewayConfig>,
        frames: Arc<FrameHub>,
        room: Arc<RoomTracker>,
    ) -> Self {
        Self {
            manager,
            config,
            frames,
            room,
        }
    }

    fn connection_for(&self, channel: &str) -> Result<(ConnectionId, ChannelKind)> {
        let spec = self
            .config
            .channel(channel)
            .ok_or_else(|| CoreError::UnknownChannel(channel.to_string()))?;
        Ok((ConnectionId::from(spec.connection.as_str()), spec.kind))
    }

    async fn send_line(&self, channel: &str, line: &str) -> Result<()> {
        let (id, _) = self.connection_for(channel)?;
        self.manager.send(&id, line).await?;
        Ok(())
    }

    /// Puts `text` on `channel`. Terminal channels get one line at a time;
    /// messaging channels get the text whole.
    pub async fn deliver(&self, channel: &str, text: &str) -> Result<()> {
        let (id, kind) = self.connection_for(channel)?;
        match kind {
            ChannelKind::Messaging => self.manager.send(&id, text).await?,
            ChannelKind::Com | ChannelKind::Shell => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    self.manager.send(&id, line).await?;
                }
            }
        }
        debug!(channel = %channel, len = text.len(), "delivered");
        Ok(())
    }

    /// Runs `command`. Never fails: problems become an unsuccessful
    /// [`Execution`].
    pub async fn execute(&self, command: &Command) -> Execution {
        let com = self.config.com_channel.clone();
        match command {
            Command::SendRoomMessage { text } => {
                let echo = Echo::new(text, Utc::now()).from_user(self.config.com_user.as_deref());
                // A repainted screen still shows earlier copies of the line
                let baseline = match self.frames.latest(&com) {
                    Some(before) if self.config.is_snapshot(&com) => count_echoes(&before, &echo),
                    _ => 0,
                };
                let echo = echo.after(baseline);

                let mut frames = self.frames.subscribe(&com);
                if let Err(e) = self.send_line(&com, text).await {
                    return Execution::failed(&e);
                }
                let room = self.room.current();
                match self.wait_for(&mut frames, |s| find_echo(s, &echo)).await {
                    Some(at) => Execution::ok(format!("Delivered to {}.", room), Some(at)),
                    None => Execution::ok(
                        format!("Sent to {}; no echo seen on screen yet.", room),
                        None,
                    ),
                }
            }
            Command::SwitchRoom { room } => {
                let mut frames = self.frames.subscribe(&com);
                if let Err(e) = self.send_line(&com, &format!("g {}", room)).await {
                    return Execution::failed(&e);
                }
                let seen = self
                    .wait_for(&mut frames, |s| {
                        s.events.iter().find_map(|e| match e {
                            ScreenEvent::RoomChanged { room: r } if r == room => {
                                Some(s.captured_at)
                            }
                            _ => None,
                        })
                    })
                    .await;
                self.room.set(room.clone());
                match seen {
                    Some(at) => Execution::ok(format!("Now in {}.", room), Some(at)),
                    None => Execution::ok(
                        format!("Switch to {} sent; not yet confirmed on screen.", room),
                        None,
                    ),
                }
            }
            Command::SendPrivateMessage { user, text } => {
                match self.send_line(&com, &format!("s {} {}", user, text)).await {
                    Ok(()) => Execution::ok(format!("Sent to {}.", user), None),
                    Err(e) => Execution::failed(&e),
                }
            }
            Command::RunShellCommand { command } => self.run_shell(command).await,
        }
    }

    async fn run_shell(&self, command: &str) -> Execution {
        let shell = self.config.shell_channel.clone();
        let snapshot = self.config.is_snapshot(&shell);
        let mut frames = self.frames.subscribe(&shell);
        if let Err(e) = self.send_line(&shell, &with_status(command)).await {
            return Execution::failed(&e);
        }

        let deadline = Instant::now() + self.config.echo_wait();
        let mut seen: Vec<Arc<ParsedScreen>> = Vec::new();
        loop {
            match timeout_at(deadline, frames.recv()).await {
                Ok(Ok(screen)) => {
                    seen.push(screen);
                    if shell_output(&seen, snapshot).status.is_some() {
                        break;
                    }
                }
                Ok(Err(RecvError::Lagged(n))) => {
                    warn!(skipped = n, "shell frames lagged");
                }
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }

        let ShellOutput { text, status } = shell_output(&seen, snapshot);
        info!(command = %command, status = ?status, lines = text.lines().count(), "shell command ran");
        let text = if text.is_empty() {
            "(no output)".to_string()
        } else {
            text
        };
        match status {
            Some(0) => Execution::ok(text, None),
            Some(code) => Execution::unsuccessful(format!("{}\n(exit status {})", text, code)),
            None => Execution::unsuccessful(format!(
                "{}\n(no exit status within {}s)",
                text,
                self.config.echo_wait().as_secs()
            )),
        }
    }

    /// Waits up to the echo window for a frame `accept` takes.
    async fn wait_for<T>(
        &self,
        frames: &mut broadcast::Receiver<Arc<ParsedScreen>>,
        mut accept: impl FnMut(&ParsedScreen) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + self.config.echo_wait();
        loop {
            match timeout_at(deadline, frames.recv()).await {
                Ok(Ok(screen)) => {
                    if let Some(found) = accept(&screen) {
                        return Some(found);
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) | Err(_) => return None,
            }
        }
    }
}

/// `command` followed by an echo of its exit status.
pub fn with_status(command: &str) -> String {
    format!(
        "{}; echo {}$?",
        command.trim().trim_end_matches(';'),
        STATUS_MARK
    )
}

fn exit_status(line: &str) -> Option<i32> {
    line.trim().strip_prefix(STATUS_MARK)?.parse().ok()
}

/// What a shell command printed and how it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub text: String,
    /// `None` until the status line has been seen.
    pub status: Option<i32>,
}

/// Reads a shell command's output from the frames seen after it was sent
/// with [`with_status`].
///
/// A snapshot channel repaints the whole pane, so only the last frame
/// counts and the output starts after the last line echoing the command. A
/// stream channel's frames are consecutive pieces of output. Output ends at
/// the status line.
pub fn shell_output(frames: &[Arc<ParsedScreen>], snapshot: bool) -> ShellOutput {
    let typed = format!("{}$?", STATUS_MARK);
    let lines: Vec<String> = if snapshot {
        let Some(last) = frames.last() else {
            return ShellOutput {
                text: String::new(),
                status: None,
            };
        };
        let text = to_plain_text(last);
        let all: Vec<&str> = text.lines().collect();
        let start = all
            .iter()
            .rposition(|l| l.contains(&typed))
            .map(|i| i + 1)
            .unwrap_or(0);
        all[start..].iter().map(|l| l.to_string()).collect()
    } else {
        frames
            .iter()
            .flat_map(|f| {
                to_plain_text(f)
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|l| !l.contains(&typed))
            .collect()
    };

    let mut status = None;
    let mut output: Vec<&str> = Vec::new();
    for line in &lines {
        if let Some(code) = exit_status(line) {
            status = Some(code);
            break;
        }
        let line = line.trim_end();
        if !line.is_empty() {
            output.push(line);
        }
    }
    let skip = output.len().saturating_sub(OUTPUT_LINES);
    ShellOutput {
        text: output[skip..].join("\n"),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comlink_screen::{parse, Application};

    fn frame(text: &str) -> Arc<ParsedScreen> {
        Arc::new(parse(text.as_bytes(), Application::Generic))
    }

    #[test]
    fn test_with_status_appends_exit_code_echo() {
        assert_eq!(with_status("uptime"), "uptime; echo __comlink_rc=$?");
        assert_eq!(with_status(" ls -la; "), "ls -la; echo __comlink_rc=$?");
    }

    #[test]
    fn test_snapshot_output_follows_last_echo() {
        let frames = vec![
            frame("$ ls; echo __comlink_rc=$?\nold\n__comlink_rc=0\n$ "),
            frame(
                "$ ls; echo __comlink_rc=$?\nold\n__comlink_rc=0\n\
                 $ uptime; echo __comlink_rc=$?\n 12:00 up 3 days\n__comlink_rc=0\n$ ",
            ),
        ];
        let out = shell_output(&frames, true);
        assert_eq!(out.text, " 12:00 up 3 days");
        assert_eq!(out.status, Some(0));
    }

    #[test]
    fn test_snapshot_without_status_is_unfinished() {
        let frames = vec![frame("$ make; echo __comlink_rc=$?\ncompiling\n")];
        let out = shell_output(&frames, true);
        assert_eq!(out.text, "compiling");
        assert_eq!(out.status, None);
    }

    #[test]
    fn test_stream_output_reports_failure_status() {
        let frames = vec![
            frame("nosuchcmd; echo __comlink_rc=$?"),
            frame("bash: nosuchcmd: command not found"),
            frame("__comlink_rc=127"),
        ];
        let out = shell_output(&frames, false);
        assert_eq!(out.text, "bash: nosuchcmd: command not found");
        assert_eq!(out.status, Some(127));
        assert_eq!(shell_output(&[], true).text, "");
    }

    #[test]
    fn test_output_keeps_tail() {
        let text: Vec<String> = (0..30).map(|i| format!("line {}", i)).collect();
        let frames: Vec<_> = text.iter().map(|l| frame(l)).collect();
        let out = shell_output(&frames, false);
        assert_eq!(out.text.lines().count(), OUTPUT_LINES);
        assert!(out.text.ends_with("line 29"));
    }

    #[test]
    fn test_room_tracker() {
        let room = RoomTracker::new("lounge");
        assert_eq!(room.current(), "lounge");
        room.set("hackers");
        assert_eq!(room.current(), "hackers");
    }

    #[tokio::test]
    async fn test_frame_hub_fans_out_per_channel() {
        let hub = FrameHub::new();
        let mut com = hub.subscribe("sdf_com");
        let mut shell = hub.subscribe("sdf_shell");

        hub.publish("sdf_com", frame("hello"));
        assert_eq!(to_plain_text(&com.recv().await.unwrap()), "hello");
        assert!(shell.try_recv().is_err());
        assert_eq!(to_plain_text(&hub.latest("sdf_com").unwrap()), "hello");
        assert!(hub.latest("sdf_shell").is_none());

        // Publishing with nobody listening is not an error
        hub.publish("other", frame("x"));
    }
}
