//! End-to-end flows against a local COM emulator and a line-based IM bridge,
//! both spoken to over telnet.

use std::sync::Arc;
use std::time::Duration;

use comlink_connection::TransportConfig;
use comlink_core::{ChannelKind, Gateway, GatewayConfig, PassthroughModel, StatePaths};
use comlink_models::{ExecutionReport, ReportType};
use comlink_persistence::Journal;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Answers the commands a COM session understands: `g room` moves rooms,
/// `s user text` is swallowed, anything else is said in the room and
/// echoed back under the bot's name.
async fn com_emulator(listener: TcpListener) -> Arc<Mutex<OwnedWriteHalf>> {
    let (stream, _) = listener.accept().await.unwrap();
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let out = Arc::clone(&writer);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end_matches('\r').to_string();
            let reply = if let Some(room) = line.strip_prefix("g ") {
                format!("you are in '{}'\r\n", room)
            } else if line.starts_with("s ") || line.is_empty() {
                continue;
            } else {
                format!("[bot] {}\r\n", line)
            };
            if out.lock().await.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    writer
}

/// A bash-like shell: `true` succeeds, every other command is missing.
async fn shell_emulator(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let (reader, mut writer) = stream.into_split();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end_matches('\r');
            let Some(command) = line.strip_suffix("; echo __comlink_rc=$?") else {
                continue;
            };
            let reply = if command == "true" {
                "__comlink_rc=0\r\n".to_string()
            } else {
                format!(
                    "bash: {}: command not found\r\n__comlink_rc=127\r\n",
                    command
                )
            };
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
}

struct Bridge {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Bridge {
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn say(&mut self, user: &str, text: &str) {
        let line = serde_json::json!({ "user": user, "text": text }).to_string();
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Reads until a line matches, failing the test after [`WAIT`].
    async fn expect(&mut self, pred: impl Fn(&str) -> bool) -> String {
        timeout(WAIT, async {
            loop {
                let line = self.lines.next_line().await.unwrap().unwrap();
                let line = line.trim_end_matches('\r').to_string();
                if pred(&line) {
                    return line;
                }
            }
        })
        .await
        .expect("bridge saw no matching line")
    }
}

struct Setup {
    dir: TempDir,
    gateway: Gateway,
    com: Arc<Mutex<OwnedWriteHalf>>,
    bridge: Bridge,
}

fn base_config(com_port: u16, bridge_port: u16) -> GatewayConfig {
    GatewayConfig::new()
        .with_connection(
            "sdf",
            TransportConfig::Telnet {
                host: "127.0.0.1".into(),
                port: com_port,
            },
        )
        .with_connection(
            "im",
            TransportConfig::Telnet {
                host: "127.0.0.1".into(),
                port: bridge_port,
            },
        )
        .with_channel("sdf_com", "sdf", ChannelKind::Com)
        .with_channel("feishu", "im", ChannelKind::Messaging)
        .with_com_user("bot")
        .with_workers(1)
        .with_echo_wait(Duration::from_secs(3))
}

async fn setup() -> Setup {
    let com_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let com_port = com_listener.local_addr().unwrap().port();
    let bridge_port = bridge_listener.local_addr().unwrap().port();
    start(
        base_config(com_port, bridge_port),
        com_listener,
        bridge_listener,
    )
    .await
}

async fn start(config: GatewayConfig, com: TcpListener, bridge: TcpListener) -> Setup {
    let dir = tempdir().unwrap();
    let mut gateway = Gateway::new(config, StatePaths::new(dir.path()))
        .unwrap()
        .with_model(Arc::new(PassthroughModel));

    let (com, bridge, started) = tokio::join!(
        com_emulator(com),
        Bridge::accept(bridge),
        gateway.start()
    );
    started.unwrap();

    Setup {
        dir,
        gateway,
        com,
        bridge,
    }
}

fn journaled_reports(dir: &TempDir) -> Vec<ExecutionReport> {
    let paths = StatePaths::new(dir.path());
    Journal::<ExecutionReport>::new(paths.report_journal(), 100)
        .entries()
        .unwrap()
}

#[tokio::test]
async fn test_fuzzy_room_switch_runs_after_confirmation() {
    let mut s = setup().await;

    s.bridge.say("alice", "switch to the hackers room").await;
    let prompt = s.bridge.expect(|l| l.contains("Reply \"confirm ")).await;
    let id = prompt
        .split("confirm ")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();

    s.bridge.say("alice", &format!("confirm {}", id)).await;
    s.bridge
        .expect(|l| l.starts_with("[ok] Room switched"))
        .await;
    assert_eq!(s.gateway.room(), "hackers");

    // Replaying the reply finds nothing pending
    s.bridge.say("alice", &format!("confirm {}", id)).await;
    let refused = s.bridge.expect(|l| l.contains(&id)).await;
    assert!(!refused.starts_with("[ok]"));

    s.gateway.shutdown().await.unwrap();
    let switched = journaled_reports(&s.dir)
        .into_iter()
        .filter(|r| r.report_type == ReportType::RoomSwitched)
        .count();
    assert_eq!(switched, 1);
}

#[tokio::test]
async fn test_prefixed_room_message_runs_immediately() {
    let mut s = setup().await;

    s.bridge.say("alice", "com: hello from the bridge").await;
    let report = s
        .bridge
        .expect(|l| l.starts_with("[ok]") || l.starts_with("[failed]"))
        .await;
    assert!(report.starts_with("[ok] Room message sent"), "{}", report);

    s.gateway.shutdown().await.unwrap();
    let reports = journaled_reports(&s.dir);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].delivery_timestamp.is_some());
}

#[tokio::test]
async fn test_com_chat_reaches_the_bridge() {
    let mut s = setup().await;

    s.com
        .lock()
        .await
        .write_all(b"[carol] anyone around?\r\n")
        .await
        .unwrap();
    s.bridge.expect(|l| l.contains("anyone around?")).await;

    s.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shell_command_without_shell_channel_reports_failure() {
    let mut s = setup().await;

    s.bridge.say("alice", "sh: uptime").await;
    s.bridge.expect(|l| l.starts_with("[failed]")).await;

    s.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shell_report_follows_exit_status() {
    let com_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shell_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = base_config(
        com_listener.local_addr().unwrap().port(),
        bridge_listener.local_addr().unwrap().port(),
    )
    .with_connection(
        "shell",
        TransportConfig::Telnet {
            host: "127.0.0.1".into(),
            port: shell_listener.local_addr().unwrap().port(),
        },
    )
    .with_channel("sdf_shell", "shell", ChannelKind::Shell);

    let (_, mut s) = tokio::join!(
        shell_emulator(shell_listener),
        start(config, com_listener, bridge_listener)
    );

    s.bridge.say("alice", "sh: nosuchcmd").await;
    let report = s
        .bridge
        .expect(|l| l.starts_with("[ok]") || l.starts_with("[failed]"))
        .await;
    assert!(report.starts_with("[failed]"), "{}", report);

    s.bridge.say("alice", "sh: true").await;
    let report = s
        .bridge
        .expect(|l| l.starts_with("[ok]") || l.starts_with("[failed]"))
        .await;
    assert!(report.starts_with("[ok]"), "{}", report);

    s.gateway.shutdown().await.unwrap();
    let reports = journaled_reports(&s.dir);
    assert_eq!(reports.len(), 2);
    assert!(!reports[0].success);
    assert!(reports[0].message.contains("command not found"));
    assert!(reports[0].message.contains("exit status 127"));
    assert!(!reports[0].message.contains("__comlink_rc"));
    assert!(reports[1].success);
}
