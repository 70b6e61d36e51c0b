//! Fuzzy natural-language intents.
//!
//! Patterns are tried in declaration order and the first one that matches
//! and yields a usable command wins. A match never executes anything on its
//! own; it only proposes a command for confirmation.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use comlink_models::Command;

/// What a fuzzy pattern thinks the user wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RoomSwitch,
    PrivateMessage,
    RoomMessage,
    ShellCommand,
}

impl Intent {
    /// Short description used in confirmation prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Intent::RoomSwitch => "room switch",
            Intent::PrivateMessage => "private message",
            Intent::RoomMessage => "room message",
            Intent::ShellCommand => "shell command",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A compiled intent pattern.
#[derive(Debug)]
pub struct IntentPattern {
    pub name: &'static str,
    pub intent: Intent,
    regex: Regex,
}

impl IntentPattern {
    fn new(name: &'static str, intent: Intent, pattern: &str) -> Self {
        Self {
            name,
            intent,
            regex: Regex::new(pattern).expect("Invalid intent regex"),
        }
    }

    /// The proposed command, if the text matches and the captures make sense.
    pub fn propose(&self, text: &str) -> Option<Command> {
        let caps = self.regex.captures(text)?;
        build(self.intent, &caps)
    }
}

/// A successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentMatch {
    pub intent: Intent,
    pub pattern: &'static str,
    pub command: Command,
}

/// Words that look like a recipient but address the room or the bot.
const NOT_A_USER: &[&str] = &[
    "me", "us", "you", "everyone", "everybody", "all", "room", "them", "him", "her",
];

fn group(caps: &Captures, i: usize) -> Option<String> {
    caps.get(i)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn build(intent: Intent, caps: &Captures) -> Option<Command> {
    match intent {
        Intent::RoomSwitch => Some(Command::SwitchRoom {
            room: group(caps, 1)?,
        }),
        Intent::PrivateMessage => {
            let user = group(caps, 1)?;
            if NOT_A_USER.iter().any(|w| w.eq_ignore_ascii_case(&user)) {
                return None;
            }
            Some(Command::SendPrivateMessage {
                user,
                text: group(caps, 2)?,
            })
        }
        Intent::RoomMessage => Some(Command::SendRoomMessage {
            text: group(caps, 1)?,
        }),
        Intent::ShellCommand => Some(Command::RunShellCommand {
            command: group(caps, 1)?,
        }),
    }
}

/// All intent patterns, in match order.
pub fn intent_patterns() -> &'static [IntentPattern] {
    static PATTERNS: OnceLock<Vec<IntentPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            IntentPattern::new(
                "switch_room",
                Intent::RoomSwitch,
                r"(?i)^(?:please\s+)?(?:(?:switch|go|move|change|jump)\s+(?:over\s+)?(?:to|into)|join|enter)\s+(?:the\s+)?(?:room\s+)?#?([\w-]+)(?:\s+(?:room|channel))?\s*[.!]?$",
            ),
            IntentPattern::new(
                "switch_room_zh",
                Intent::RoomSwitch,
                r"^(?:请)?(?:切换到?|去|进入|换到|跳转到?|转到)\s*(\S+?)\s*(?:房间|聊天室|频道)$",
            ),
            IntentPattern::new(
                "tell_user",
                Intent::PrivateMessage,
                r"(?i)^(?:please\s+)?(?:tell|message|whisper(?:\s+to)?|pm|dm)\s+@?([\w-]+)(?:\s+that\s+|\s*[:,]\s*)(.+)$",
            ),
            IntentPattern::new(
                "tell_user_zh",
                Intent::PrivateMessage,
                r"^(?:私聊|告诉|私信|悄悄话|给)\s*(\S+?)\s*(?:说|发|，|,|:|：)\s*(.+)$",
            ),
            IntentPattern::new(
                "say_in_room",
                Intent::RoomMessage,
                r"(?i)^(?:please\s+)?(?:say|post|send|announce)\s+(.+?)\s+(?:in|to|on)\s+(?:the\s+)?(?:com|chat|room)$",
            ),
            IntentPattern::new(
                "tell_room",
                Intent::RoomMessage,
                r"(?i)^(?:tell|ask)\s+(?:the\s+)?(?:room|everyone|everybody)(?:\s+that\s+|\s*[:,]\s*)(.+)$",
            ),
            IntentPattern::new(
                "say_in_room_zh",
                Intent::RoomMessage,
                r"^(?:发送|发)\s*(.+?)\s*到\s*(?:com|群|房间)$",
            ),
            IntentPattern::new(
                "com_say_zh",
                Intent::RoomMessage,
                r"^(?:在)?com(?:里|中)?(?:说|发送|发)\s*(.+)$",
            ),
            IntentPattern::new("broadcast_zh", Intent::RoomMessage, r"^群发\s*(.+)$"),
            IntentPattern::new(
                "run_command",
                Intent::ShellCommand,
                r"(?i)^(?:please\s+)?(?:run|execute|exec)\s+(?:the\s+)?(?:command\s+)?[`'\x22]?(.+?)[`'\x22]?$",
            ),
            IntentPattern::new(
                "run_command_zh",
                Intent::ShellCommand,
                r"^(?:执行|运行|跑)\s*(?:命令)?\s*[`'\x22]?(.+?)[`'\x22]?\s*(?:命令)?$",
            ),
        ]
    })
}

/// First intent whose pattern matches `text`.
pub fn match_intent(text: &str) -> Option<IntentMatch> {
    let text = text.trim();
    intent_patterns().iter().find_map(|p| {
        p.propose(text).map(|command| IntentMatch {
            intent: p.intent,
            pattern: p.name,
            command,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposed(text: &str) -> Option<Command> {
        match_intent(text).map(|m| m.command)
    }

    #[test]
    fn test_switch_room() {
        let m = match_intent("switch to the hackers room").unwrap();
        assert_eq!(m.intent, Intent::RoomSwitch);
        assert_eq!(
            m.command,
            Command::SwitchRoom {
                room: "hackers".into()
            }
        );
        assert_eq!(
            proposed("go to lounge"),
            Some(Command::SwitchRoom {
                room: "lounge".into()
            })
        );
        assert_eq!(
            proposed("Join #games"),
            Some(Command::SwitchRoom {
                room: "games".into()
            })
        );
    }

    #[test]
    fn test_switch_room_zh() {
        assert_eq!(
            proposed("切换到hackers房间"),
            Some(Command::SwitchRoom {
                room: "hackers".into()
            })
        );
    }

    #[test]
    fn test_tell_user() {
        assert_eq!(
            proposed("tell bob that the build is green"),
            Some(Command::SendPrivateMessage {
                user: "bob".into(),
                text: "the build is green".into()
            })
        );
        assert_eq!(
            proposed("告诉alice，明天见"),
            Some(Command::SendPrivateMessage {
                user: "alice".into(),
                text: "明天见".into()
            })
        );
    }

    #[test]
    fn test_tell_everyone_is_a_room_message() {
        let m = match_intent("tell everyone that lunch is ready").unwrap();
        assert_eq!(m.intent, Intent::RoomMessage);
        assert_eq!(
            m.command,
            Command::SendRoomMessage {
                text: "lunch is ready".into()
            }
        );
    }

    #[test]
    fn test_say_in_room() {
        assert_eq!(
            proposed("say hello folks in com"),
            Some(Command::SendRoomMessage {
                text: "hello folks".into()
            })
        );
        assert_eq!(
            proposed("群发 大家好"),
            Some(Command::SendRoomMessage {
                text: "大家好".into()
            })
        );
    }

    #[test]
    fn test_run_command() {
        assert_eq!(
            proposed("run `uptime`"),
            Some(Command::RunShellCommand {
                command: "uptime".into()
            })
        );
        assert_eq!(
            proposed("执行 ls -la"),
            Some(Command::RunShellCommand {
                command: "ls -la".into()
            })
        );
    }

    #[test]
    fn test_plain_conversation_does_not_match() {
        assert!(match_intent("how is everyone doing today?").is_none());
        assert!(match_intent("tell me a joke").is_none());
        assert!(match_intent("").is_none());
    }
}
