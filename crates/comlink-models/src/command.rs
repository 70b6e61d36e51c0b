//! Commands that the dispatcher hands to execution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The four command kinds reachable through a hardcoded prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SendRoomMessage,
    RunShellCommand,
    SwitchRoom,
    SendPrivateMessage,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::SendRoomMessage => "send_room_message",
            CommandKind::RunShellCommand => "run_shell_command",
            CommandKind::SwitchRoom => "switch_room",
            CommandKind::SendPrivateMessage => "send_private_message",
        };
        write!(f, "{}", s)
    }
}

/// A fully parsed command, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    SendRoomMessage { text: String },
    RunShellCommand { command: String },
    SwitchRoom { room: String },
    SendPrivateMessage { user: String, text: String },
}

impl Command {
    /// Returns the kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SendRoomMessage { .. } => CommandKind::SendRoomMessage,
            Command::RunShellCommand { .. } => CommandKind::RunShellCommand,
            Command::SwitchRoom { .. } => CommandKind::SwitchRoom,
            Command::SendPrivateMessage { .. } => CommandKind::SendPrivateMessage,
        }
    }

    /// Human-readable summary used in reports and logs.
    pub fn describe(&self) -> String {
        match self {
            Command::SendRoomMessage { text } => format!("say \"{}\"", text),
            Command::RunShellCommand { command } => format!("run `{}`", command),
            Command::SwitchRoom { room } => format!("switch to room {}", room),
            Command::SendPrivateMessage { user, text } => {
                format!("tell {} \"{}\"", user, text)
            }
        }
    }
}

/// Who asked for something: a channel and, when known, a user on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub channel: String,
    #[serde(default)]
    pub user: String,
}

impl Origin {
    pub fn new(channel: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            user: user.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind() {
        let cmd = Command::SendPrivateMessage {
            user: "bob".into(),
            text: "hi".into(),
        };
        assert_eq!(cmd.kind(), CommandKind::SendPrivateMessage);
    }

    #[test]
    fn test_command_serialization_is_tagged() {
        let cmd = Command::SwitchRoom {
            room: "hackers".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "switch_room");
        assert_eq!(json["room"], "hackers");

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }
}
