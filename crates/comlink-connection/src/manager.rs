//! Registry of connections and aggregate lifecycle operations.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use comlink_models::ConnectionId;

use crate::connection::Connection;
use crate::error::{ConnectionError, Result};
use crate::types::{ConnectionEvent, ConnectionInfo, ConnectionState};

const EVENT_CAPACITY: usize = 256;

/// Shared handle to a registered connection.
pub type ConnectionHandle = Arc<Mutex<Connection>>;

/// Owns every connection. Each connection sits behind its own lock, so
/// unrelated connections never wait on each other; the registry lock is held
/// only to look up, insert or remove entries.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connections: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to lifecycle events of every registered connection.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Registers a connection and returns its id.
    ///
    /// Fails with `DuplicateId` if the id is taken; the existing entry is
    /// left untouched.
    pub async fn register(&self, mut connection: Connection) -> Result<ConnectionId> {
        let id = connection.id().clone();
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(ConnectionError::DuplicateId(id.to_string()));
        }
        connection.set_event_sink(self.events.clone());
        info!(id = %id, kind = %connection.kind(), "connection registered");
        connections.insert(id.clone(), Arc::new(Mutex::new(connection)));
        Ok(id)
    }

    /// Disconnects and removes a connection.
    pub async fn deregister(&self, id: &ConnectionId) -> Result<()> {
        let handle = self
            .connections
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ConnectionError::NotFound(id.to_string()))?;

        let mut connection = handle.lock().await;
        if let Err(e) = connection.disconnect().await {
            warn!(id = %id, error = %e, "disconnect during deregistration failed");
        }
        info!(id = %id, "connection deregistered");
        Ok(())
    }

    pub async fn get(&self, id: &ConnectionId) -> Result<ConnectionHandle> {
        self.connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConnectionError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn state(&self, id: &ConnectionId) -> Result<ConnectionState> {
        Ok(self.get(id).await?.lock().await.state())
    }

    pub async fn info(&self, id: &ConnectionId) -> Result<ConnectionInfo> {
        Ok(self.get(id).await?.lock().await.info())
    }

    /// Snapshots of all connections, ordered by id.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let handles = self.handles().await;
        let mut infos = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            infos.push(handle.lock().await.info());
        }
        infos
    }

    async fn handles(&self) -> Vec<(ConnectionId, ConnectionHandle)> {
        let mut handles: Vec<_> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    pub async fn connect(&self, id: &ConnectionId) -> Result<()> {
        self.get(id).await?.lock().await.connect().await
    }

    pub async fn disconnect(&self, id: &ConnectionId) -> Result<()> {
        self.get(id).await?.lock().await.disconnect().await
    }

    pub async fn send(&self, id: &ConnectionId, data: &str) -> Result<()> {
        self.get(id).await?.lock().await.send(data).await
    }

    pub async fn receive(&self, id: &ConnectionId) -> Result<String> {
        self.get(id).await?.lock().await.receive().await
    }

    /// Connects every registered connection concurrently.
    pub async fn connect_all(&self) -> HashMap<ConnectionId, bool> {
        let results = join_all(self.handles().await.into_iter().map(|(id, handle)| async move {
            let ok = match handle.lock().await.connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(id = %id, error = %e, "connect failed");
                    false
                }
            };
            (id, ok)
        }))
        .await;
        debug!(
            total = results.len(),
            connected = results.iter().filter(|(_, ok)| *ok).count(),
            "connect_all finished"
        );
        results.into_iter().collect()
    }

    /// Disconnects every registered connection concurrently.
    pub async fn disconnect_all(&self) -> HashMap<ConnectionId, bool> {
        join_all(self.handles().await.into_iter().map(|(id, handle)| async move {
            let ok = match handle.lock().await.disconnect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(id = %id, error = %e, "disconnect failed");
                    false
                }
            };
            (id, ok)
        }))
        .await
        .into_iter()
        .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TelnetTransport, Transport};

    fn telnet(id: &str) -> Connection {
        Connection::new(id, Transport::Telnet(TelnetTransport::new("127.0.0.1", 23)))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let manager = ConnectionManager::new();
        let id = manager.register(telnet("a")).await.unwrap();
        assert_eq!(id.as_str(), "a");
        assert_eq!(manager.state(&id).await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let manager = ConnectionManager::new();
        let missing = ConnectionId::from("nope");
        assert!(matches!(
            manager.get(&missing).await,
            Err(ConnectionError::NotFound(_))
        ));
        assert!(matches!(
            manager.deregister(&missing).await,
            Err(ConnectionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister_removes() {
        let manager = ConnectionManager::new();
        let id = manager.register(telnet("a")).await.unwrap();
        manager.deregister(&id).await.unwrap();
        assert!(!manager.contains(&id).await);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let manager = ConnectionManager::new();
        manager.register(telnet("b")).await.unwrap();
        manager.register(telnet("a")).await.unwrap();
        let ids: Vec<_> = manager
            .list()
            .await
            .into_iter()
            .map(|i| i.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
