//! Durable record of every queued message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use comlink_models::{MessageId, QueueMessage};

use crate::atomic::{atomic_write_json, ensure_dir, read_json, remove_if_exists};
use crate::error::{PersistenceError, Result};

/// Delivery status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting in the queue.
    Pending,
    /// Handed to a consumer, not yet acknowledged.
    InFlight,
    /// Acknowledged by a consumer.
    Completed,
    /// Given up on.
    Failed,
}

impl DeliveryStatus {
    /// Whether a message in this status must be redelivered after a restart.
    pub fn needs_redelivery(&self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::InFlight)
    }
}

/// A queued message with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The message, exactly as enqueued.
    pub message: QueueMessage,
    pub status: DeliveryStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When a consumer began acting on the message. Set before side effects
    /// that must not be repeated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// A freshly enqueued message.
    pub fn pending(message: QueueMessage) -> Self {
        Self {
            message,
            status: DeliveryStatus::Pending,
            updated_at: Utc::now(),
            error: None,
            started_at: None,
        }
    }
}

/// Stores one JSON document per message:
/// ```text
/// base_path/
/// └── queue/
///     ├── msg-0b6f....json
///     └── msg-9a1c....json
/// ```
pub struct QueueStore {
    dir: PathBuf,
}

impl QueueStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: base_path.into().join("queue"),
        }
    }

    fn path(&self, id: &MessageId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Checks that the store directory exists and is writable.
    pub fn probe(&self) -> Result<()> {
        ensure_dir(&self.dir)?;
        let probe = self.dir.join(".probe");
        fs::write(&probe, b"ok").map_err(|source| PersistenceError::WriteError {
            path: probe.clone(),
            source,
        })?;
        remove_if_exists(&probe)
    }

    /// Writes (or overwrites) a stored message.
    pub fn save(&self, stored: &StoredMessage) -> Result<()> {
        atomic_write_json(&self.path(&stored.message.message_id), stored)
    }

    /// Loads a stored message by id.
    pub fn load(&self, id: &MessageId) -> Result<StoredMessage> {
        let path = self.path(id);
        if !path.exists() {
            return Err(PersistenceError::MessageNotFound(id.to_string()));
        }
        read_json(&path)
    }

    /// Updates the delivery status of a stored message.
    pub fn set_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<StoredMessage> {
        self.update(id, status, None)
    }

    /// Marks a message failed with a reason.
    pub fn set_failed(&self, id: &MessageId, error: impl Into<String>) -> Result<StoredMessage> {
        self.update(id, DeliveryStatus::Failed, Some(error.into()))
    }

    /// Records that a consumer has started acting on a message.
    pub fn mark_started(&self, id: &MessageId) -> Result<StoredMessage> {
        let mut stored = self.load(id)?;
        let now = Utc::now();
        stored.started_at = Some(now);
        stored.updated_at = now;
        self.save(&stored)?;
        Ok(stored)
    }

    /// Messages whose `derived_from` is `id`.
    pub fn derived_from(&self, id: &MessageId) -> Result<Vec<StoredMessage>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.message.derived_from().as_ref() == Some(id))
            .collect())
    }

    fn update(
        &self,
        id: &MessageId,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> Result<StoredMessage> {
        let mut stored = self.load(id)?;
        stored.status = status;
        stored.updated_at = Utc::now();
        if error.is_some() {
            stored.error = error;
        }
        self.save(&stored)?;
        Ok(stored)
    }

    /// Lists every stored message.
    ///
    /// Sorted by priority (highest first), then by timestamp (oldest first).
    /// Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<StoredMessage>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| PersistenceError::ReadError {
            path: self.dir.clone(),
            source,
        })?;

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::ReadError {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match read_json::<StoredMessage>(&path) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable queue entry"),
                }
            }
        }

        items.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then_with(|| a.message.timestamp.cmp(&b.message.timestamp))
        });
        Ok(items)
    }

    /// Deletes a stored message.
    pub fn remove(&self, id: &MessageId) -> Result<()> {
        remove_if_exists(&self.path(id))
    }

    /// Deletes every message in `status`; returns how many were removed.
    pub fn purge(&self, status: DeliveryStatus) -> Result<usize> {
        let mut removed = 0;
        for item in self.list()? {
            if item.status == status {
                self.remove(&item.message.message_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comlink_models::{MessageBuilder, Priority};
    use tempfile::tempdir;

    fn message(content: &str, priority: u8) -> QueueMessage {
        MessageBuilder::new("feishu", "sdf_com", content)
            .priority(Priority::new(priority))
            .with_metadata("user", "alice")
            .build()
    }

    #[test]
    fn test_save_and_load_keeps_fields_verbatim() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        let msg = message("hello", 7);

        store.save(&StoredMessage::pending(msg.clone())).unwrap();
        let loaded = store.load(&msg.message_id).unwrap();

        assert_eq!(loaded.message, msg);
        assert_eq!(loaded.status, DeliveryStatus::Pending);
        assert!(dir
            .path()
            .join("queue")
            .join(format!("{}.json", msg.message_id))
            .exists());
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path());

        let result = store.load(&MessageId::new());
        assert!(matches!(result, Err(PersistenceError::MessageNotFound(_))));
    }

    #[test]
    fn test_set_status() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        let msg = message("hello", 5);
        store.save(&StoredMessage::pending(msg.clone())).unwrap();

        store
            .set_status(&msg.message_id, DeliveryStatus::InFlight)
            .unwrap();
        let failed = store.set_failed(&msg.message_id, "boom").unwrap();

        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_list_sorted_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path());

        let low = message("low", 2);
        let high = message("high", 9);
        store.save(&StoredMessage::pending(low)).unwrap();
        store.save(&StoredMessage::pending(high)).unwrap();
        fs::write(dir.path().join("queue/broken.json"), "{").unwrap();

        let items = store.list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].message.content, "high");
        assert_eq!(items[1].message.content, "low");
    }

    #[test]
    fn test_purge_completed() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        let done = message("done", 5);
        let waiting = message("waiting", 5);
        store.save(&StoredMessage::pending(done.clone())).unwrap();
        store.save(&StoredMessage::pending(waiting)).unwrap();
        store
            .set_status(&done.message_id, DeliveryStatus::Completed)
            .unwrap();

        assert_eq!(store.purge(DeliveryStatus::Completed).unwrap(), 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_probe_creates_dir() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("state"));
        store.probe().unwrap();
        assert!(dir.path().join("state/queue").is_dir());
    }
}
