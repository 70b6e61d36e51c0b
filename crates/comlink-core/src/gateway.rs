//! Gateway runtime: wires the pieces together and owns the background
//! tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use comlink_connection::{Connection, ConnectionManager, Transport};
use comlink_dispatch::{ConfirmationBook, Dispatcher, PendingConfirmation};
use comlink_models::{meta, ConnectionId, MessageBuilder, Stage};
use comlink_persistence::{atomic_write_json, Journal, QueueStore};
use comlink_queue::MessageQueue;

use crate::config::{GatewayConfig, ModelEndpoint, StatePaths};
use crate::delivery::{Delivery, FrameHub, RoomTracker};
use crate::error::{CoreError, Result};
use crate::ingest::Ingest;
use crate::model::{ChatCompletionsModel, FailoverModel, LanguageModel, PassthroughModel};
use crate::reporter::Reporter;
use crate::router::RoutingCore;
use crate::supervisor::{self, Supervisor};

/// Receive timeout for connections whose config does not set one. Short,
/// because a pending receive holds the connection while delivery waits.
const INGEST_RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

fn endpoint_model(endpoint: &ModelEndpoint) -> Result<Arc<dyn LanguageModel>> {
    Ok(Arc::new(ChatCompletionsModel::from_endpoint(endpoint.clone())?))
}

/// Builds the model the routing core calls: the configured primary and
/// fallback behind a [`FailoverModel`], or a passthrough when no endpoint is
/// configured.
pub fn build_model(config: &GatewayConfig) -> Result<Arc<dyn LanguageModel>> {
    let primary: Arc<dyn LanguageModel> = match &config.primary_model {
        Some(endpoint) => endpoint_model(endpoint)?,
        None => {
            info!("no language model configured, relaying text unchanged");
            Arc::new(PassthroughModel)
        }
    };
    let mut failover = FailoverModel::new(primary).with_timeout(config.model_timeout());
    if let Some(endpoint) = &config.fallback_model {
        failover = failover.with_fallback(endpoint_model(endpoint)?);
    }
    Ok(Arc::new(failover))
}

/// Queues a reply to everyone whose confirmation lapsed. Returns how many
/// replies were queued.
pub fn notify_expired(queue: &MessageQueue, expired: &[PendingConfirmation]) -> Result<usize> {
    for c in expired {
        let id = c.confirmation_id.as_str();
        let text = format!(
            "Confirmation {} expired; `{}` was not run.",
            id, c.suggested_command
        );
        queue.enqueue(
            MessageBuilder::new(&c.origin.channel, &c.origin.channel, text)
                .stage(Stage::Review)
                .user(c.origin.user.clone())
                .with_metadata(meta::PRESERVE, id),
        )?;
    }
    Ok(expired.len())
}

/// The running gateway.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    paths: StatePaths,
    queue: Arc<MessageQueue>,
    manager: Arc<ConnectionManager>,
    dispatcher: Dispatcher,
    model: Arc<dyn LanguageModel>,
    supervisor_model: Option<Arc<dyn LanguageModel>>,
    frames: Arc<FrameHub>,
    room: Arc<RoomTracker>,
    handles: Vec<JoinHandle<()>>,
    fatal_tx: mpsc::Sender<CoreError>,
    fatal_rx: mpsc::Receiver<CoreError>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: bool,
}

impl Gateway {
    /// Creates a gateway with models built from `config`.
    pub fn new(config: GatewayConfig, paths: StatePaths) -> Result<Self> {
        config.validate()?;
        let model = build_model(&config)?;
        let supervisor_model = match &config.supervisor_model {
            Some(endpoint) => Some(endpoint_model(endpoint)?),
            None => None,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);

        Ok(Self {
            queue: Arc::new(MessageQueue::new(QueueStore::new(paths.root()))),
            manager: Arc::new(ConnectionManager::new()),
            dispatcher: Dispatcher::new(Arc::new(ConfirmationBook::with_journal(
                paths.confirmation_history(),
            ))),
            model,
            supervisor_model,
            frames: Arc::new(FrameHub::new()),
            room: Arc::new(RoomTracker::new(config.default_room.clone())),
            config: Arc::new(config),
            paths,
            handles: Vec::new(),
            fatal_tx,
            fatal_rx,
            shutdown_tx,
            shutdown_rx,
            started: false,
        })
    }

    /// Replaces the routing model.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = model;
        self
    }

    /// Replaces the dispatcher and its confirmation book.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replaces the supervision model.
    pub fn with_supervisor_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.supervisor_model = Some(model);
        self
    }

    /// Recovers the queue, connects every configured connection and starts
    /// the workers.
    ///
    /// Connection failures are logged and retried by the ingest loops; an
    /// unavailable queue store fails the start.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(CoreError::AlreadyStarted);
        }
        info!(root = %self.paths.root().display(), "starting gateway");

        self.paths.ensure()?;
        let recovered = self.queue.recover()?;
        if recovered > 0 {
            info!(count = recovered, "redelivering messages from previous run");
        }

        self.register_connections().await?;
        for (id, ok) in self.manager.connect_all().await {
            if !ok {
                warn!(id = %id, "connection failed to come up, will retry");
            }
        }
        self.spawn_snapshot_writer();

        let (supervisor, handle) = Supervisor::spawn(
            self.supervisor_model.clone(),
            Journal::new(self.paths.supervision_journal(), supervisor::JOURNAL_CAPACITY),
            self.shutdown_rx.clone(),
        );
        self.handles.push(handle);

        let delivery = Arc::new(Delivery::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.config),
            Arc::clone(&self.frames),
            Arc::clone(&self.room),
        ));
        let core = Arc::new(
            RoutingCore::new(
                Arc::clone(&self.queue),
                self.dispatcher.clone(),
                Arc::clone(&self.model),
                delivery,
                Reporter::new(Arc::clone(&self.queue)).with_journal(self.paths.report_journal()),
                Arc::clone(&self.config),
            )
            .with_supervisor(supervisor),
        );
        for worker in 0..self.config.workers {
            let core = Arc::clone(&core);
            let shutdown = self.shutdown_rx.clone();
            let fatal = self.fatal_tx.clone();
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = core.run_worker(worker, shutdown).await {
                    error!(worker, error = %e, "routing worker stopped");
                    let _ = fatal.send(e).await;
                }
            }));
        }

        let ingest = Arc::new(Ingest::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.manager),
            Arc::clone(&self.config),
            Arc::clone(&self.frames),
            Arc::clone(&self.room),
        ));
        for channel in self.config.channels.clone() {
            let ingest = Arc::clone(&ingest);
            let shutdown = self.shutdown_rx.clone();
            let fatal = self.fatal_tx.clone();
            self.handles.push(tokio::spawn(async move {
                let name = channel.name.clone();
                if let Err(e) = ingest.run(channel, shutdown).await {
                    error!(channel = %name, error = %e, "ingest stopped");
                    let _ = fatal.send(e).await;
                }
            }));
        }

        self.spawn_sweeper();

        self.started = true;
        info!(
            workers = self.config.workers,
            channels = self.config.channels.len(),
            "gateway started"
        );
        Ok(())
    }

    async fn register_connections(&self) -> Result<()> {
        for spec in &self.config.connections {
            let id = ConnectionId::from(spec.id.as_str());
            if self.manager.contains(&id).await {
                continue;
            }
            let timeout = spec
                .receive_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(INGEST_RECEIVE_TIMEOUT);
            let connection = Connection::new(id, Transport::from_config(&spec.transport)?)
                .with_receive_timeout(timeout);
            self.manager.register(connection).await?;
        }
        Ok(())
    }

    /// Keeps `connections.json` in step with lifecycle events.
    fn spawn_snapshot_writer(&mut self) {
        let manager = Arc::clone(&self.manager);
        let path = self.paths.connections_file();
        let mut events = manager.subscribe();
        let mut shutdown = self.shutdown_rx.clone();

        self.handles.push(tokio::spawn(async move {
            loop {
                let list = manager.list().await;
                if let Err(e) = atomic_write_json(&path, &list) {
                    warn!(error = %e, "failed to write connection snapshot");
                }
                tokio::select! {
                    event = events.recv() => {
                        if let Err(tokio::sync::broadcast::error::RecvError::Closed) = event {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Expires stale confirmations so their slots free up even when nobody
    /// is typing, and tells their owners.
    fn spawn_sweeper(&mut self) {
        let dispatcher = self.dispatcher.clone();
        let queue = Arc::clone(&self.queue);
        let interval = self.config.sweep_interval();
        let mut shutdown = self.shutdown_rx.clone();

        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = match dispatcher.sweep() {
                            Ok(expired) => expired,
                            Err(e) => {
                                warn!(error = %e, "confirmation sweep failed");
                                continue;
                            }
                        };
                        if let Err(e) = notify_expired(&queue, &expired) {
                            warn!(error = %e, "failed to queue expiry notices");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stops every task, disconnects all connections and writes a final
    /// connection snapshot.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.started {
            return Err(CoreError::NotStarted);
        }
        info!("shutting down gateway");

        self.shutdown_tx.send(true).map_err(|e| {
            CoreError::Shutdown(format!("failed to send shutdown signal: {}", e))
        })?;
        for handle in self.handles.drain(..) {
            handle
                .await
                .map_err(|e| CoreError::Shutdown(format!("task panicked: {}", e)))?;
        }

        for (id, ok) in self.manager.disconnect_all().await {
            if !ok {
                debug!(id = %id, "disconnect failed during shutdown");
            }
        }
        let list = self.manager.list().await;
        atomic_write_json(&self.paths.connections_file(), &list)?;

        // Re-arm for a later start
        let _ = self.shutdown_tx.send(false);
        self.started = false;
        info!("gateway stopped");
        Ok(())
    }

    /// Waits for a fatal error from a background task (an unavailable queue
    /// store).
    pub async fn fatal(&mut self) -> Option<CoreError> {
        self.fatal_rx.recv().await
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.manager)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn room(&self) -> String {
        self.room.current()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.started {
            let _ = self.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_start_and_shutdown_without_connections() {
        let dir = tempdir().unwrap();
        let mut gateway = Gateway::new(GatewayConfig::default(), StatePaths::new(dir.path())).unwrap();

        gateway.start().await.unwrap();
        assert!(gateway.is_started());
        assert!(matches!(gateway.start().await, Err(CoreError::AlreadyStarted)));

        gateway.shutdown().await.unwrap();
        assert!(!gateway.is_started());
        assert!(dir.path().join("connections.json").exists());
        assert!(matches!(gateway.shutdown().await, Err(CoreError::NotStarted)));
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let dir = tempdir().unwrap();
        let mut gateway = Gateway::new(GatewayConfig::default(), StatePaths::new(dir.path())).unwrap();
        gateway.start().await.unwrap();
        gateway.shutdown().await.unwrap();
        gateway.start().await.unwrap();
        gateway.shutdown().await.unwrap();
    }

    #[test]
    fn test_expired_confirmation_is_reported_to_its_owner() {
        let dir = tempdir().unwrap();
        let queue = MessageQueue::new(QueueStore::new(dir.path()));
        let dispatcher = Dispatcher::default();
        let origin = comlink_models::Origin::new("feishu", "alice");
        let opened = dispatcher
            .dispatch("switch to the hackers room", &origin, None)
            .unwrap();
        assert!(matches!(opened, comlink_dispatch::Outcome::AwaitConfirmation(_)));

        let later = chrono::Utc::now() + chrono::Duration::seconds(61);
        let expired = dispatcher.book().sweep_at(later).unwrap();
        assert_eq!(notify_expired(&queue, &expired).unwrap(), 1);

        let notice = queue.try_dequeue().unwrap().unwrap();
        let id = expired[0].confirmation_id.as_str();
        assert_eq!(notice.stage, Stage::Review);
        assert_eq!(notice.target, "feishu");
        assert_eq!(notice.user(), Some("alice"));
        assert_eq!(notice.meta_str(meta::PRESERVE), Some(id));
        assert!(notice.content.contains(id));
        assert!(notice.content.contains("expired"));
        assert_eq!(notify_expired(&queue, &[]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_tells_the_user_when_a_confirmation_lapses() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::default().with_sweep_interval(Duration::from_millis(20));
        let book = ConfirmationBook::new().with_timeout(chrono::Duration::milliseconds(50));
        let mut gateway = Gateway::new(config, StatePaths::new(dir.path()))
            .unwrap()
            .with_dispatcher(Dispatcher::new(Arc::new(book)));
        gateway.start().await.unwrap();

        let origin = comlink_models::Origin::new("feishu", "alice");
        let outcome = gateway
            .dispatcher()
            .dispatch("switch to the hackers room", &origin, None)
            .unwrap();
        let c = match outcome {
            comlink_dispatch::Outcome::AwaitConfirmation(c) => c,
            other => panic!("expected a confirmation, got {:?}", other),
        };
        let id = c.confirmation_id.as_str().to_string();

        let store = QueueStore::new(dir.path());
        let notice = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = store
                    .list()
                    .unwrap()
                    .into_iter()
                    .map(|s| s.message)
                    .find(|m| m.stage == Stage::Review && m.content.contains(&id));
                if let Some(found) = found {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no expiry notice queued");

        assert_eq!(notice.target, "feishu");
        assert!(notice.content.contains("expired"));
        assert!(gateway.dispatcher().book().pending().unwrap().is_empty());
        gateway.shutdown().await.unwrap();
    }

    #[test]
    fn test_build_model_without_endpoints() {
        let model = build_model(&GatewayConfig::default()).unwrap();
        assert_eq!(model.name(), "failover");
    }
}
