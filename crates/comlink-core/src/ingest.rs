//! The receive side: turns connection traffic into inbound queue entries.
//!
//! One loop per channel. Terminal channels are parsed into screens, which
//! are published for the delivery side to watch; COM chat events and
//! messaging traffic are enqueued for the routing core. Nothing read here
//! is acted on directly.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use comlink_connection::{ConnectionError, ConnectionManager};
use comlink_models::{meta, ConnectionId, MessageBuilder, Priority, Stage};
use comlink_queue::MessageQueue;
use comlink_screen::{Application, ScreenEvent, ScreenParser};

use crate::config::{ChannelKind, ChannelSpec, GatewayConfig};
use crate::delivery::{FrameHub, RoomTracker};
use crate::error::Result;

/// Target of inbound traffic the routing core has not routed yet.
pub const UNROUTED: &str = "*";

const RETRY_DELAY: Duration = Duration::from_secs(1);
const PRIVATE_PRIORITY: u8 = 7;

/// A line from a messaging bridge: JSON `{"user": .., "text": ..}` or
/// plain text.
#[derive(Debug, Deserialize)]
struct BridgeLine {
    #[serde(default)]
    user: Option<String>,
    #[serde(alias = "content")]
    text: String,
}

/// Per-channel read state.
#[derive(Debug)]
pub struct ChannelReader {
    application: Application,
    snapshot: bool,
    /// Events on the previous snapshot, `None` before the first one.
    previous: Option<HashSet<String>>,
}

impl ChannelReader {
    pub fn new(kind: ChannelKind, snapshot: bool) -> Self {
        let application = match kind {
            ChannelKind::Com => Application::ComChat,
            ChannelKind::Shell | ChannelKind::Messaging => Application::Generic,
        };
        Self {
            application,
            snapshot,
            previous: None,
        }
    }

    /// Events not seen before. A snapshot repaints everything still on
    /// screen, so only events absent from the previous capture are new, and
    /// the first capture is the baseline.
    fn fresh(&mut self, events: Vec<ScreenEvent>) -> Vec<ScreenEvent> {
        if !self.snapshot {
            return events;
        }
        let keys: Vec<String> = events
            .iter()
            .map(|e| serde_json::to_string(e).unwrap_or_default())
            .collect();
        let fresh = match &self.previous {
            Some(prev) => events
                .into_iter()
                .zip(&keys)
                .filter(|(_, k)| !prev.contains(*k))
                .map(|(e, _)| e)
                .collect(),
            None => events
                .into_iter()
                .filter(|e| matches!(e, ScreenEvent::RoomChanged { .. }))
                .collect(),
        };
        self.previous = Some(keys.into_iter().collect());
        fresh
    }
}

/// Reads every channel and feeds the queue.
pub struct Ingest {
    queue: Arc<MessageQueue>,
    manager: Arc<ConnectionManager>,
    config: Arc<GatewayConfig>,
    frames: Arc<FrameHub>,
    room: Arc<RoomTracker>,
    parser: ScreenParser,
}

impl Ingest {
    pub fn new(
        queue: Arc<MessageQueue>,
        manager: Arc<ConnectionManager>,
        config: Arc<GatewayConfig>,
        frames: Arc<FrameHub>,
        room: Arc<RoomTracker>,
    ) -> Self {
        Self {
            queue,
            manager,
            config,
            frames,
            room,
            parser: ScreenParser::new(),
        }
    }

    /// Receives from `channel` until shutdown. Transport failures are
    /// retried after a pause; only an unavailable queue store ends the loop
    /// with an error.
    pub async fn run(
        self: Arc<Self>,
        channel: ChannelSpec,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let id = ConnectionId::from(channel.connection.as_str());
        let mut reader = ChannelReader::new(channel.kind, self.config.is_snapshot(&channel.name));
        info!(channel = %channel.name, connection = %id, "ingest started");

        loop {
            tokio::select! {
                received = self.manager.receive(&id) => match received {
                    Ok(data) => {
                        self.ingest(&channel, &mut reader, &data)?;
                    }
                    Err(ConnectionError::Timeout { .. }) => {}
                    Err(e) => {
                        debug!(channel = %channel.name, error = %e, "receive failed");
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                            _ = shutdown.changed() => {}
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                        if let Err(e) = self.manager.connect(&id).await {
                            warn!(channel = %channel.name, error = %e, "reconnect failed");
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(channel = %channel.name, "ingest stopped");
        Ok(())
    }

    /// Handles one piece of received data. Returns how many messages were
    /// enqueued.
    pub fn ingest(
        &self,
        channel: &ChannelSpec,
        reader: &mut ChannelReader,
        data: &str,
    ) -> Result<usize> {
        match channel.kind {
            ChannelKind::Messaging => self.ingest_bridge(channel, data),
            ChannelKind::Shell => {
                let screen = self.parser.parse(data.as_bytes(), reader.application);
                self.frames.publish(&channel.name, Arc::new(screen));
                Ok(0)
            }
            ChannelKind::Com => {
                let screen = self.parser.parse(data.as_bytes(), reader.application);
                if screen.is_degraded() {
                    debug!(channel = %channel.name, "degraded frame");
                }
                let events = reader.fresh(screen.events.clone());
                self.frames.publish(&channel.name, Arc::new(screen));

                let mut enqueued = 0;
                for event in events {
                    if self.ingest_event(channel, event)? {
                        enqueued += 1;
                    }
                }
                Ok(enqueued)
            }
        }
    }

    fn ingest_event(&self, channel: &ChannelSpec, event: ScreenEvent) -> Result<bool> {
        let own = self.config.com_user.as_deref();
        let builder = match event {
            ScreenEvent::RoomChanged { room } => {
                self.room.set(room);
                return Ok(false);
            }
            ScreenEvent::ChatMessage { user, .. } if Some(user.as_str()) == own => {
                return Ok(false);
            }
            ScreenEvent::ChatMessage {
                room, user, text, ..
            } => {
                let room = room.unwrap_or_else(|| self.room.current());
                MessageBuilder::new(&channel.name, UNROUTED, text)
                    .user(user)
                    .with_metadata(meta::ROOM, room)
            }
            ScreenEvent::PrivateMessage { from, text } => {
                MessageBuilder::new(&channel.name, UNROUTED, text)
                    .user(from)
                    .priority(Priority::new(PRIVATE_PRIORITY))
            }
        };
        let message = self.queue.enqueue(builder.stage(Stage::Inbound))?;
        debug!(id = %message.message_id, channel = %channel.name, "chat line queued");
        Ok(true)
    }

    fn ingest_bridge(&self, channel: &ChannelSpec, data: &str) -> Result<usize> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(0);
        }
        let line = serde_json::from_str::<BridgeLine>(data).unwrap_or_else(|_| BridgeLine {
            user: None,
            text: data.to_string(),
        });
        if line.text.trim().is_empty() {
            return Ok(0);
        }

        let mut builder =
            MessageBuilder::new(&channel.name, UNROUTED, line.text).stage(Stage::Inbound);
        if let Some(user) = line.user {
            builder = builder.user(user);
        }
        let message = self.queue.enqueue(builder)?;
        debug!(id = %message.message_id, channel = %channel.name, "bridge message queued");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comlink_connection::TransportConfig;
    use comlink_persistence::QueueStore;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        queue: Arc<MessageQueue>,
        frames: Arc<FrameHub>,
        room: Arc<RoomTracker>,
        ingest: Ingest,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let queue = Arc::new(MessageQueue::new(QueueStore::new(dir.path())));
        let config = GatewayConfig::new()
            .with_connection(
                "sdf",
                TransportConfig::Telnet {
                    host: "localhost".into(),
                    port: 2323,
                },
            )
            .with_connection(
                "bridge",
                TransportConfig::Socket {
                    url: "ws://localhost:9000".into(),
                },
            )
            .with_channel("sdf_com", "sdf", ChannelKind::Com)
            .with_channel("feishu", "bridge", ChannelKind::Messaging)
            .with_com_user("me");
        let frames = Arc::new(FrameHub::new());
        let room = Arc::new(RoomTracker::new("lounge"));
        let ingest = Ingest::new(
            queue.clone(),
            Arc::new(ConnectionManager::new()),
            Arc::new(config),
            frames.clone(),
            room.clone(),
        );
        Fixture {
            _dir: dir,
            queue,
            frames,
            room,
            ingest,
        }
    }

    fn com() -> ChannelSpec {
        ChannelSpec {
            name: "sdf_com".into(),
            connection: "sdf".into(),
            kind: ChannelKind::Com,
        }
    }

    fn bridge() -> ChannelSpec {
        ChannelSpec {
            name: "feishu".into(),
            connection: "bridge".into(),
            kind: ChannelKind::Messaging,
        }
    }

    #[test]
    fn test_stream_chat_lines_are_queued() {
        let f = fixture();
        let mut reader = ChannelReader::new(ChannelKind::Com, false);

        assert_eq!(f.ingest.ingest(&com(), &mut reader, "[bob] hello there").unwrap(), 1);
        // Our own echo is not inbound traffic
        assert_eq!(f.ingest.ingest(&com(), &mut reader, "[me] hi bob").unwrap(), 0);

        let msg = f.queue.try_dequeue().unwrap().unwrap();
        assert_eq!(msg.source, "sdf_com");
        assert_eq!(msg.target, UNROUTED);
        assert_eq!(msg.content, "hello there");
        assert_eq!(msg.user(), Some("bob"));
        assert_eq!(msg.meta_str(meta::ROOM), Some("lounge"));
        assert_eq!(msg.stage, Stage::Inbound);
    }

    #[test]
    fn test_room_change_updates_tracker() {
        let f = fixture();
        let mut reader = ChannelReader::new(ChannelKind::Com, false);
        f.ingest
            .ingest(&com(), &mut reader, "[you are in 'hackers' among 3]")
            .unwrap();
        assert_eq!(f.room.current(), "hackers");
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_snapshot_only_queues_new_lines() {
        let f = fixture();
        let mut reader = ChannelReader::new(ChannelKind::Com, true);

        let first = "[you are in 'lounge' among 4]\n[alice] hi all";
        assert_eq!(f.ingest.ingest(&com(), &mut reader, first).unwrap(), 0);

        let second = "[you are in 'lounge' among 4]\n[alice] hi all\n[bob] hey alice";
        assert_eq!(f.ingest.ingest(&com(), &mut reader, second).unwrap(), 1);
        assert_eq!(f.queue.try_dequeue().unwrap().unwrap().content, "hey alice");

        assert_eq!(f.ingest.ingest(&com(), &mut reader, second).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_frames_are_published_with_events() {
        let f = fixture();
        let mut watcher = f.frames.subscribe("sdf_com");
        let mut reader = ChannelReader::new(ChannelKind::Com, false);
        f.ingest.ingest(&com(), &mut reader, "[me] ping").unwrap();

        let screen = watcher.recv().await.unwrap();
        let echo = comlink_screen::Echo::new("ping", screen.captured_at).from_user(Some("me"));
        assert!(comlink_screen::find_echo(&screen, &echo).is_some());
    }

    #[test]
    fn test_bridge_json_and_plain_text() {
        let f = fixture();
        let mut reader = ChannelReader::new(ChannelKind::Messaging, false);

        f.ingest
            .ingest(&bridge(), &mut reader, r#"{"user": "alice", "text": "sh: ls -la"}"#)
            .unwrap();
        f.ingest.ingest(&bridge(), &mut reader, "just text").unwrap();
        assert_eq!(f.ingest.ingest(&bridge(), &mut reader, "   ").unwrap(), 0);

        let first = f.queue.try_dequeue().unwrap().unwrap();
        assert_eq!(first.content, "sh: ls -la");
        assert_eq!(first.user(), Some("alice"));
        let second = f.queue.try_dequeue().unwrap().unwrap();
        assert_eq!(second.content, "just text");
        assert_eq!(second.user(), None);
    }
}
