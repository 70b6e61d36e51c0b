//! Persistence layer for comlink.
//!
//! Everything the gateway must not lose goes through here: each queued
//! message is one JSON document keyed by its id, and bounded journals keep
//! recent confirmation decisions, execution reports and supervision
//! findings. All writes go through a temp file followed by a rename.
//!
//! # Example
//!
//! ```no_run
//! use comlink_persistence::{DeliveryStatus, QueueStore, StoredMessage};
//! use comlink_models::MessageBuilder;
//!
//! let store = QueueStore::new("/home/user/.comlink");
//!
//! let msg = MessageBuilder::new("feishu", "sdf_com", "hi").build();
//! store.save(&StoredMessage::pending(msg.clone())).unwrap();
//!
//! store.set_status(&msg.message_id, DeliveryStatus::Completed).unwrap();
//! ```

pub mod atomic;
pub mod error;
pub mod journal;
pub mod queue_store;

pub use atomic::{atomic_write_json, read_json, read_json_optional};
pub use error::{PersistenceError, Result};
pub use journal::Journal;
pub use queue_store::{DeliveryStatus, QueueStore, StoredMessage};
