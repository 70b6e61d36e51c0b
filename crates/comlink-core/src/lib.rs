//! Gateway core for comlink.
//!
//! Ties the lower crates into a running gateway:
//!
//! - [`ingest`] reads every channel, parses terminal output and enqueues
//!   what it finds
//! - [`router`] drains the queue, runs the dispatcher and the language
//!   model, and moves each message one leg along the gate
//! - [`delivery`] is the only caller of `send`, for outbound text and for
//!   dispatched commands
//! - [`reporter`] closes the loop with one execution report per command
//! - [`supervisor`] double-checks model output off the critical path
//! - [`gateway`] owns the tasks and their shutdown
//!
//! # Example
//!
//! ```no_run
//! use comlink_core::{Gateway, GatewayConfig, StatePaths};
//!
//! # async fn run() -> comlink_core::Result<()> {
//! let paths = StatePaths::from_env();
//! let config = GatewayConfig::load(&paths.config_file())?;
//!
//! let mut gateway = Gateway::new(config, paths)?;
//! gateway.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! gateway.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod model;
pub mod reporter;
pub mod router;
pub mod supervisor;

pub use config::{
    state_dir, ChannelKind, ChannelSpec, ConnectionSpec, GatewayConfig, ModelEndpoint, StatePaths,
    STATE_DIR_ENV,
};
pub use delivery::{Delivery, Execution, FrameHub, RoomTracker};
pub use error::{CoreError, ModelError, Result};
pub use gateway::{build_model, Gateway};
pub use ingest::{ChannelReader, Ingest, UNROUTED};
pub use model::{
    ChatCompletionsModel, FailoverModel, FailoverStatus, LanguageModel, ModelContext,
    PassthroughModel, Purpose,
};
pub use reporter::Reporter;
pub use router::RoutingCore;
pub use supervisor::{Exchange, SupervisionRecord, Supervisor};
