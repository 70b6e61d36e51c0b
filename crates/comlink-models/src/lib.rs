//! Core data models for comlink.
//!
//! This crate provides the types that cross component boundaries in the
//! gateway: queue messages and their stages, dispatched commands, and the
//! execution reports that close the loop back to the sender.
//!
//! # Example
//!
//! ```
//! use comlink_models::{MessageBuilder, Priority, Stage};
//!
//! let msg = MessageBuilder::new("feishu", "sdf_com", "hello lounge")
//!     .priority(Priority::new(7))
//!     .stage(Stage::Inbound)
//!     .build();
//!
//! assert_eq!(msg.priority.value(), 7);
//! assert!(msg.message_id.as_str().starts_with("msg-"));
//! ```

pub mod builders;
pub mod command;
pub mod ids;
pub mod message;
pub mod report;

// Re-export main types
pub use builders::MessageBuilder;
pub use command::{Command, CommandKind, Origin};
pub use ids::{ConfirmationId, ConnectionId, MessageId};
pub use message::{meta, Priority, QueueMessage, Stage};
pub use report::{ExecutionReport, ReportType};
