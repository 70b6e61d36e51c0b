//! The hardcoded command prefixes.
//!
//! This table is a compile-time constant. Nothing in the workspace can add,
//! remove or rewrite an entry at runtime.

use comlink_models::{Command, CommandKind};

use crate::error::{DispatchError, Result};

/// One literal prefix and the command kind it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardcodedRoute {
    pub prefix: &'static str,
    pub kind: CommandKind,
    pub usage: &'static str,
}

/// Exactly four routes. Prefixes are case-sensitive and must lead the input.
pub const ROUTES: [HardcodedRoute; 4] = [
    HardcodedRoute {
        prefix: "com:",
        kind: CommandKind::SendRoomMessage,
        usage: "com: <message>     say something in the current room",
    },
    HardcodedRoute {
        prefix: "sh:",
        kind: CommandKind::RunShellCommand,
        usage: "sh: <command>      run a shell command",
    },
    HardcodedRoute {
        prefix: "g:",
        kind: CommandKind::SwitchRoom,
        usage: "g: <room>          switch to another room",
    },
    HardcodedRoute {
        prefix: "s:",
        kind: CommandKind::SendPrivateMessage,
        usage: "s: <user> <text>   send a private message",
    },
];

/// Route whose prefix starts `text` (after leading whitespace), with the
/// trimmed remainder.
pub fn match_prefix(text: &str) -> Option<(&'static HardcodedRoute, &str)> {
    let text = text.trim_start();
    ROUTES
        .iter()
        .find_map(|route| text.strip_prefix(route.prefix).map(|rest| (route, rest.trim())))
}

/// The route for a command kind.
pub fn route_for(kind: CommandKind) -> &'static HardcodedRoute {
    match kind {
        CommandKind::SendRoomMessage => &ROUTES[0],
        CommandKind::RunShellCommand => &ROUTES[1],
        CommandKind::SwitchRoom => &ROUTES[2],
        CommandKind::SendPrivateMessage => &ROUTES[3],
    }
}

fn invalid(route: &HardcodedRoute, reason: &str) -> DispatchError {
    DispatchError::InvalidCommand {
        prefix: route.prefix,
        reason: reason.to_string(),
    }
}

/// Builds the command for `route` from the text after the prefix.
pub fn build_command(route: &HardcodedRoute, rest: &str) -> Result<Command> {
    let rest = rest.trim();
    match route.kind {
        CommandKind::SendRoomMessage => {
            if rest.is_empty() {
                return Err(invalid(route, "message is empty"));
            }
            Ok(Command::SendRoomMessage {
                text: rest.to_string(),
            })
        }
        CommandKind::RunShellCommand => {
            if rest.is_empty() {
                return Err(invalid(route, "command is empty"));
            }
            Ok(Command::RunShellCommand {
                command: rest.to_string(),
            })
        }
        CommandKind::SwitchRoom => match rest.split_whitespace().next() {
            Some(room) => Ok(Command::SwitchRoom {
                room: room.to_string(),
            }),
            None => Err(invalid(route, "room name is missing")),
        },
        CommandKind::SendPrivateMessage => {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let user = parts.next().unwrap_or_default();
            let text = parts.next().unwrap_or_default().trim();
            if user.is_empty() {
                return Err(invalid(route, "user is missing"));
            }
            if text.is_empty() {
                return Err(invalid(route, "message is empty"));
            }
            Ok(Command::SendPrivateMessage {
                user: user.to_string(),
                text: text.to_string(),
            })
        }
    }
}

/// Parses prefixed input. `None` when no prefix matches.
pub fn parse(text: &str) -> Option<Result<Command>> {
    match_prefix(text).map(|(route, rest)| build_command(route, rest))
}

/// Renders a command in prefix form, e.g. `g: hackers`.
pub fn render(command: &Command) -> String {
    let prefix = route_for(command.kind()).prefix;
    match command {
        Command::SendRoomMessage { text } => format!("{} {}", prefix, text),
        Command::RunShellCommand { command } => format!("{} {}", prefix, command),
        Command::SwitchRoom { room } => format!("{} {}", prefix, room),
        Command::SendPrivateMessage { user, text } => format!("{} {} {}", prefix, user, text),
    }
}

/// Usage lines for every prefix.
pub fn help_text() -> String {
    let mut out = String::from("Commands:\n");
    for route in &ROUTES {
        out.push_str("  ");
        out.push_str(route.usage);
        out.push('\n');
    }
    out.push_str("Anything else is treated as conversation.");
    out
}
