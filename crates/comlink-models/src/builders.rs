//! Builder for queue messages.

use chrono::Utc;
use std::collections::HashMap;

use crate::ids::MessageId;
use crate::message::{meta, Priority, QueueMessage, Stage};

/// Builder for creating [`QueueMessage`] instances with a fluent API.
///
/// The id and timestamp are assigned by [`MessageBuilder::build`], which the
/// queue calls at enqueue time.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    source: String,
    target: String,
    content: String,
    priority: Priority,
    stage: Stage,
    metadata: HashMap<String, serde_json::Value>,
}

impl MessageBuilder {
    /// Creates a new MessageBuilder with required fields.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            content: content.into(),
            priority: Priority::default(),
            stage: Stage::default(),
            metadata: HashMap::new(),
        }
    }

    /// Starts a new message derived from `origin`.
    ///
    /// Source, target, priority and metadata are inherited and the
    /// back-reference to `origin` is recorded.
    pub fn derive(origin: &QueueMessage, content: impl Into<String>) -> Self {
        let mut metadata = origin.metadata.clone();
        metadata.remove(meta::REDELIVERED);
        metadata.insert(
            meta::DERIVED_FROM.to_string(),
            serde_json::Value::String(origin.message_id.to_string()),
        );
        Self {
            source: origin.source.clone(),
            target: origin.target.clone(),
            content: content.into(),
            priority: origin.priority,
            stage: origin.stage,
            metadata,
        }
    }

    /// Sets the source channel.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the target channel.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the routing stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Sets the originating user.
    pub fn user(self, user: impl Into<String>) -> Self {
        self.with_metadata(meta::USER, user.into())
    }

    /// Adds a metadata value.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Removes a metadata value.
    pub fn without_metadata(mut self, key: &str) -> Self {
        self.metadata.remove(key);
        self
    }

    /// Returns the configured stage.
    pub fn current_stage(&self) -> Stage {
        self.stage
    }

    /// Builds the message, assigning a fresh id and the current time.
    pub fn build(self) -> QueueMessage {
        QueueMessage {
            message_id: MessageId::new(),
            source: self.source,
            target: self.target,
            content: self.content,
            priority: self.priority,
            timestamp: Utc::now(),
            stage: self.stage,
            metadata: self.metadata,
        }
    }
}
