//! Turns inbound text into an action.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use comlink_models::{Command, ConfirmationId, MessageId, Origin};

use crate::confirmation::{
    ConfirmationBook, ConfirmationReason, ConfirmationRequest, PendingConfirmation,
};
use crate::error::{DispatchError, Result};
use crate::patterns::{match_intent, Intent};
use crate::routes;
use crate::safety::{assess, RiskAssessment, RiskLevel};

/// A confirmation reply. The first token decides; tokens are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Confirm(ConfirmationId),
    Reject(ConfirmationId),
    Cancel,
}

/// Reads `confirm <id>`, `reject <id>` or `cancel`.
pub fn parse_reply(text: &str) -> Option<Reply> {
    let mut tokens = text.split_whitespace();
    let first = tokens.next()?;
    let id = ConfirmationId::from_string(tokens.next().unwrap_or_default());
    match first {
        "confirm" => Some(Reply::Confirm(id)),
        "reject" => Some(Reply::Reject(id)),
        "cancel" => Some(Reply::Cancel),
        _ => None,
    }
}

/// What to do with one piece of input.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Run now. `confirmation` is set when this is a confirmed entry.
    Execute {
        command: Command,
        confirmation: Option<ConfirmationId>,
    },
    /// A confirmation was opened; send its prompt to the user.
    AwaitConfirmation(PendingConfirmation),
    /// `reject <id>` succeeded.
    Rejected(PendingConfirmation),
    /// `cancel` dropped these entries (possibly none).
    Cancelled(Vec<PendingConfirmation>),
    /// Ordinary conversation, passed on unchanged.
    Conversation(String),
}

/// Applies the reply grammar, the prefix table, the shell risk rules and the
/// fuzzy intents, in that order.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    book: Arc<ConfirmationBook>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(ConfirmationBook::new()))
    }
}

impl Dispatcher {
    pub fn new(book: Arc<ConfirmationBook>) -> Self {
        Self { book }
    }

    pub fn book(&self) -> &Arc<ConfirmationBook> {
        &self.book
    }

    pub fn dispatch(
        &self,
        text: &str,
        origin: &Origin,
        message_id: Option<&MessageId>,
    ) -> Result<Outcome> {
        self.dispatch_at(text, origin, message_id, Utc::now())
    }

    /// Dispatches `text` as of `now`.
    pub fn dispatch_at(
        &self,
        text: &str,
        origin: &Origin,
        message_id: Option<&MessageId>,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let text = text.trim();

        if let Some(reply) = parse_reply(text) {
            debug!(user = %origin.user, reply = ?reply, "confirmation reply");
            return match reply {
                Reply::Confirm(id) => {
                    let c = self.book.confirm_at(&id, now)?;
                    Ok(Outcome::Execute {
                        command: c.command,
                        confirmation: Some(c.confirmation_id),
                    })
                }
                Reply::Reject(id) => Ok(Outcome::Rejected(self.book.reject_at(&id, now)?)),
                Reply::Cancel => Ok(Outcome::Cancelled(self.book.cancel_all_at(origin, now)?)),
            };
        }

        if let Some((route, rest)) = routes::match_prefix(text) {
            let command = routes::build_command(route, rest)?;
            debug!(prefix = route.prefix, kind = %command.kind(), "hardcoded route");
            if let Some((shell, risk)) = shell_risk(&command) {
                match risk.level {
                    RiskLevel::Prohibited => return Err(prohibited(&shell)),
                    RiskLevel::Dangerous => {
                        let rule = risk.rule.unwrap_or_default();
                        info!(rule = %rule, "dangerous shell command needs confirmation");
                        let c = self.book.open_at(
                            ConfirmationRequest {
                                origin: origin.clone(),
                                message_id: message_id.cloned(),
                                original_input: text.to_string(),
                                intent: Intent::ShellCommand,
                                command,
                                reason: ConfirmationReason::DangerousCommand {
                                    rule,
                                    description: risk.reason.unwrap_or_default(),
                                },
                            },
                            now,
                        )?;
                        return Ok(Outcome::AwaitConfirmation(c));
                    }
                    RiskLevel::Safe => {}
                }
            }
            return Ok(Outcome::Execute {
                command,
                confirmation: None,
            });
        }

        if let Some(m) = match_intent(text) {
            let mut reason = ConfirmationReason::AmbiguousIntent {
                pattern: m.pattern.to_string(),
            };
            if let Some((shell, risk)) = shell_risk(&m.command) {
                match risk.level {
                    RiskLevel::Prohibited => return Err(prohibited(&shell)),
                    RiskLevel::Dangerous => {
                        reason = ConfirmationReason::DangerousCommand {
                            rule: risk.rule.unwrap_or_default(),
                            description: risk.reason.unwrap_or_default(),
                        };
                    }
                    RiskLevel::Safe => {}
                }
            }
            debug!(pattern = m.pattern, intent = %m.intent, "fuzzy intent matched");
            let c = self.book.open_at(
                ConfirmationRequest {
                    origin: origin.clone(),
                    message_id: message_id.cloned(),
                    original_input: text.to_string(),
                    intent: m.intent,
                    command: m.command,
                    reason,
                },
                now,
            )?;
            return Ok(Outcome::AwaitConfirmation(c));
        }

        Ok(Outcome::Conversation(text.to_string()))
    }

    pub fn sweep(&self) -> Result<Vec<PendingConfirmation>> {
        self.book.sweep()
    }
}

fn shell_risk(command: &Command) -> Option<(String, RiskAssessment)> {
    match command {
        Command::RunShellCommand { command } => Some((command.clone(), assess(command))),
        _ => None,
    }
}

fn prohibited(command: &str) -> DispatchError {
    warn!(command = %command, "prohibited command rejected");
    DispatchError::Prohibited {
        command: command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new("feishu", "alice")
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(
            parse_reply("confirm conf-1234abcd"),
            Some(Reply::Confirm(ConfirmationId::from("conf-1234abcd")))
        );
        assert_eq!(
            parse_reply("reject conf-1"),
            Some(Reply::Reject(ConfirmationId::from("conf-1")))
        );
        assert_eq!(parse_reply("cancel"), Some(Reply::Cancel));
        assert_eq!(parse_reply("Confirm conf-1"), None);
        assert_eq!(parse_reply("hello"), None);
    }

    #[test]
    fn test_prefixed_shell_runs_immediately() {
        let d = Dispatcher::default();
        let out = d.dispatch("sh: ls -la", &origin(), None).unwrap();
        assert_eq!(
            out,
            Outcome::Execute {
                command: Command::RunShellCommand {
                    command: "ls -la".into()
                },
                confirmation: None,
            }
        );
        assert_eq!(d.book().pending_count().unwrap(), 0);
    }

    #[test]
    fn test_dangerous_prefixed_shell_needs_confirmation() {
        let d = Dispatcher::default();
        match d.dispatch("sh: rm -rf /tmp/x", &origin(), None).unwrap() {
            Outcome::AwaitConfirmation(c) => {
                assert_eq!(c.suggested_command, "sh: rm -rf /tmp/x");
                assert!(matches!(
                    c.reason,
                    ConfirmationReason::DangerousCommand { ref rule, .. } if rule == "rm_rf_root"
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prohibited_shell_is_rejected() {
        let d = Dispatcher::default();
        assert!(matches!(
            d.dispatch("sh: rm -rf /", &origin(), None),
            Err(DispatchError::Prohibited { .. })
        ));
        assert!(matches!(
            d.dispatch("run reboot", &origin(), None),
            Err(DispatchError::Prohibited { .. })
        ));
        assert_eq!(d.book().pending_count().unwrap(), 0);
    }

    #[test]
    fn test_fuzzy_opens_confirmation() {
        let d = Dispatcher::default();
        let c = match d
            .dispatch("switch to the hackers room", &origin(), None)
            .unwrap()
        {
            Outcome::AwaitConfirmation(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(c.suggested_command, "g: hackers");
        assert_eq!(d.book().pending_count().unwrap(), 1);

        let out = d
            .dispatch(&format!("confirm {}", c.confirmation_id), &origin(), None)
            .unwrap();
        assert_eq!(
            out,
            Outcome::Execute {
                command: Command::SwitchRoom {
                    room: "hackers".into()
                },
                confirmation: Some(c.confirmation_id.clone()),
            }
        );
    }

    #[test]
    fn test_conversation_passes_through() {
        let d = Dispatcher::default();
        assert_eq!(
            d.dispatch("  what's new today?  ", &origin(), None).unwrap(),
            Outcome::Conversation("what's new today?".into())
        );
    }

    #[test]
    fn test_unknown_confirmation_id() {
        let d = Dispatcher::default();
        assert!(matches!(
            d.dispatch("confirm conf-nope", &origin(), None),
            Err(DispatchError::ConfirmationNotPending(_))
        ));
        assert!(matches!(
            d.dispatch("confirm", &origin(), None),
            Err(DispatchError::ConfirmationNotPending(_))
        ));
    }
}
