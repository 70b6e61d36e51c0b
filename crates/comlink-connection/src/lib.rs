//! Connection lifecycle management for comlink.
//!
//! A [`Connection`] wraps one transport (a tmux-hosted remote shell, a
//! websocket push channel, HTTP, a serial device or telnet) behind the same
//! `connect`/`disconnect`/`send`/`receive` contract and an explicit state
//! machine. The [`ConnectionManager`] owns every connection and is the only
//! place one is ever removed.
//!
//! Lifecycle changes are published as [`ConnectionEvent`]s on a bounded
//! broadcast channel, after the state has been updated and before the
//! operation returns.
//!
//! # Example
//!
//! ```no_run
//! use comlink_connection::{Connection, ConnectionManager, Transport, TransportConfig};
//!
//! # async fn run() -> comlink_connection::Result<()> {
//! let manager = ConnectionManager::new();
//! let mut events = manager.subscribe();
//!
//! let transport = Transport::from_config(&TransportConfig::Telnet {
//!     host: "localhost".into(),
//!     port: 2323,
//! })?;
//! let id = manager.register(Connection::new("local", transport)).await?;
//!
//! let results = manager.connect_all().await;
//! if results[&id] {
//!     manager.send(&id, "hello").await?;
//!     println!("{}", manager.receive(&id).await?);
//! }
//! println!("{:?}", events.recv().await);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod manager;
pub mod transport;
pub mod types;

pub use connection::Connection;
pub use error::{ConnectionError, Result};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use transport::{Transport, TransportConfig};
pub use types::{ConnectionEvent, ConnectionInfo, ConnectionState, TransportKind};
