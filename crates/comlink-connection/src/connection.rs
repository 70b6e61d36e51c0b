//! A single connection: one transport plus its lifecycle state.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use comlink_models::ConnectionId;

use crate::error::{ConnectionError, Result};
use crate::transport::Transport;
use crate::types::{ConnectionEvent, ConnectionInfo, ConnectionState, TransportKind};

/// Default bound on a single `receive`.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the event channel a standalone connection creates for itself.
const STANDALONE_EVENT_CAPACITY: usize = 64;

/// One unit of network or process I/O with an explicit state machine.
///
/// State transitions happen before the matching [`ConnectionEvent`] is sent,
/// and both happen before the operation returns.
#[derive(Debug)]
pub struct Connection {
    info: ConnectionInfo,
    transport: Transport,
    receive_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    /// Creates a disconnected connection with a caller-assigned id.
    pub fn new(id: impl Into<ConnectionId>, transport: Transport) -> Self {
        let (events, _) = broadcast::channel(STANDALONE_EVENT_CAPACITY);
        let info = ConnectionInfo {
            id: id.into(),
            kind: transport.kind(),
            endpoint: transport.endpoint(),
            state: ConnectionState::Disconnected,
            connected_at: None,
            last_activity: None,
            last_error: None,
            metadata: HashMap::new(),
        };
        Self {
            info,
            transport,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            events,
        }
    }

    /// Creates a disconnected connection with a generated id.
    pub fn with_generated_id(transport: Transport) -> Self {
        Self::new(ConnectionId::new(), transport)
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Attaches a free-form label shown in snapshots.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.metadata.insert(key.into(), value.into());
        self
    }

    /// Routes lifecycle events to `sink` instead of this connection's own channel.
    pub fn set_event_sink(&mut self, sink: broadcast::Sender<ConnectionEvent>) {
        self.events = sink;
    }

    /// Subscribes to this connection's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn id(&self) -> &ConnectionId {
        &self.info.id
    }

    pub fn kind(&self) -> TransportKind {
        self.info.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.info.state
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// Snapshot of the current state and metadata.
    pub fn info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Moves to `Error`, records the message and emits before handing the error back.
    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        let message = err.to_string();
        warn!(id = %self.info.id, error = %message, "connection failed");
        self.info.state = ConnectionState::Error;
        self.info.last_error = Some(message.clone());
        self.emit(ConnectionEvent::Error {
            id: self.info.id.clone(),
            message,
        });
        err
    }

    fn require_connected(&self) -> Result<()> {
        if self.info.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected {
                id: self.info.id.to_string(),
                state: self.info.state,
            })
        }
    }

    /// Opens the transport. Allowed from `Disconnected` and `Error`; a no-op
    /// when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.info.state == ConnectionState::Connected {
            return Ok(());
        }

        self.info.state = ConnectionState::Connecting;
        debug!(id = %self.info.id, endpoint = %self.info.endpoint, "connecting");

        match self.transport.open().await {
            Ok(()) => {
                let now = Utc::now();
                self.info.state = ConnectionState::Connected;
                self.info.connected_at = Some(now);
                self.info.last_activity = Some(now);
                self.info.last_error = None;
                info!(
                    id = %self.info.id,
                    kind = %self.info.kind,
                    endpoint = %self.info.endpoint,
                    "connection established"
                );
                self.emit(ConnectionEvent::Connected {
                    id: self.info.id.clone(),
                });
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Closes the transport. A no-op when already disconnected.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.info.state == ConnectionState::Disconnected {
            return Ok(());
        }

        if let Err(e) = self.transport.close().await {
            return Err(self.fail(e));
        }

        self.info.state = ConnectionState::Disconnected;
        self.info.connected_at = None;
        info!(id = %self.info.id, "connection closed");
        self.emit(ConnectionEvent::Disconnected {
            id: self.info.id.clone(),
        });
        Ok(())
    }

    /// Sends one unit of data. Sends on one connection are delivered in call order.
    pub async fn send(&mut self, data: &str) -> Result<()> {
        self.require_connected()?;
        match self.transport.send(data).await {
            Ok(()) => {
                self.info.last_activity = Some(Utc::now());
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Waits up to the receive timeout for the next unit of data.
    ///
    /// A timeout leaves the connection `Connected`; a transport failure moves
    /// it to `Error`.
    pub async fn receive(&mut self) -> Result<String> {
        self.require_connected()?;
        match tokio::time::timeout(self.receive_timeout, self.transport.receive()).await {
            Err(_) => Err(ConnectionError::Timeout {
                id: self.info.id.to_string(),
                after: self.receive_timeout,
            }),
            Ok(Err(e)) => Err(self.fail(e)),
            Ok(Ok(data)) => {
                self.info.last_activity = Some(Utc::now());
                Ok(data)
            }
        }
    }
}
