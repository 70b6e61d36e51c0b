//! Durable priority message queue.
//!
//! The queue is the single transit point for traffic between gateway
//! components. Each message is written to disk before `enqueue` returns,
//! consumers block in `dequeue` until work arrives, and anything not yet
//! acknowledged is redelivered by `recover` after a restart.
//!
//! # Example
//!
//! ```no_run
//! use comlink_models::{MessageBuilder, Priority};
//! use comlink_persistence::QueueStore;
//! use comlink_queue::MessageQueue;
//!
//! # async fn run() -> comlink_queue::Result<()> {
//! let queue = MessageQueue::new(QueueStore::new("/tmp/comlink"));
//! queue.recover()?;
//!
//! queue.enqueue(MessageBuilder::new("feishu", "sdf_com", "hi").priority(Priority::new(8)))?;
//!
//! let msg = queue.dequeue().await?;
//! queue.ack(&msg.message_id)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod queue;

pub use error::{QueueError, Result};
pub use queue::{MessageQueue, QueueStats};
