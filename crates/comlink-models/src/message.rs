//! Queue message types.
//!
//! Every piece of cross-component traffic is a [`QueueMessage`]. A message is
//! never edited after it is enqueued; a transformation produces a new message
//! that points back at its origin through [`meta::DERIVED_FROM`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::ids::MessageId;

/// Well-known metadata keys.
pub mod meta {
    /// Id of the message this one was derived from.
    pub const DERIVED_FROM: &str = "derived_from";
    /// User on the originating channel.
    pub const USER: &str = "user";
    /// Number of times the model was unavailable for this content.
    pub const MODEL_ATTEMPTS: &str = "model_attempts";
    /// Serialized command carried by a command-stage message.
    pub const COMMAND: &str = "command";
    /// Serialized execution report carried by a review-stage message.
    pub const REPORT: &str = "report";
    /// Delivery timestamp taken from a terminal echo.
    pub const DELIVERY_TIMESTAMP: &str = "delivery_timestamp";
    /// Set when review text was delivered without model phrasing.
    pub const MODEL_BYPASSED: &str = "model_bypassed";
    /// COM room a chat line was seen in.
    pub const ROOM: &str = "room";
    /// Literal text the model must keep when rephrasing (confirmation ids).
    pub const PRESERVE: &str = "preserve";
    /// Confirmation a command-stage message was released by.
    pub const CONFIRMATION: &str = "confirmation";
    /// Set on messages reloaded from the store after a restart. Never
    /// persisted and never inherited.
    pub const REDELIVERED: &str = "redelivered";
}

/// Message priority in `1..=10`, 10 being the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority.
    pub const MIN: Priority = Priority(1);
    /// Highest priority.
    pub const MAX: Priority = Priority(10);
    /// Priority used when none is given.
    pub const NORMAL: Priority = Priority(5);

    /// Creates a priority, clamping into `1..=10`.
    pub fn new(value: u8) -> Self {
        Self(value.clamp(Self::MIN.0, Self::MAX.0))
    }

    /// Returns the numeric value.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// One step lower, never below [`Priority::MIN`].
    pub fn decremented(&self) -> Self {
        Self::new(self.0.saturating_sub(1))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("priority {} outside 1..=10", value))
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which leg of the routing gate a message is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Raw traffic from a connection, not yet inspected.
    #[default]
    Inbound,
    /// Text produced by the system (reports, prompts) awaiting model phrasing.
    Review,
    /// A dispatched command awaiting execution.
    Command,
    /// Content cleared for delivery to its target channel.
    Outbound,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Inbound => "inbound",
            Stage::Review => "review",
            Stage::Command => "command",
            Stage::Outbound => "outbound",
        };
        write!(f, "{}", s)
    }
}

/// A message in transit through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique identifier, assigned when the message is built for enqueue.
    pub message_id: MessageId,

    /// Logical channel the message came from.
    pub source: String,

    /// Logical channel the message is headed to.
    pub target: String,

    /// Message body.
    pub content: String,

    /// Dequeue priority.
    pub priority: Priority,

    /// Enqueue time.
    pub timestamp: DateTime<Utc>,

    /// Routing stage.
    #[serde(default)]
    pub stage: Stage,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueueMessage {
    /// Returns a metadata value as a string, if present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// The originating user, when the channel reported one.
    pub fn user(&self) -> Option<&str> {
        self.meta_str(meta::USER)
    }

    /// Id of the message this one was derived from.
    pub fn derived_from(&self) -> Option<MessageId> {
        self.meta_str(meta::DERIVED_FROM).map(MessageId::from)
    }

    /// Whether this message was handed out again after a restart.
    pub fn is_redelivered(&self) -> bool {
        self.metadata
            .get(meta::REDELIVERED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// How many times the model has already failed on this content.
    pub fn model_attempts(&self) -> u64 {
        self.metadata
            .get(meta::MODEL_ATTEMPTS)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}
