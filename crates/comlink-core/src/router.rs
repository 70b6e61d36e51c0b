//! The routing core.
//!
//! Workers drain the queue and move each message one leg along the gate:
//!
//! ```text
//! Inbound --dispatcher--> Command --delivery--> Review (report)
//!    |                                            |
//!    +--model--> Outbound <--------model----------+
//! ```
//!
//! Replies produced by the system (confirmation prompts, rejections,
//! reports) are `Review` messages, phrased by the model before they become
//! `Outbound`. Only `Outbound` and `Command` messages reach a connection.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use comlink_dispatch::{help_text, routes, Dispatcher, Outcome};
use comlink_models::{
    meta, Command, ConfirmationId, ExecutionReport, MessageBuilder, MessageId, Origin,
    QueueMessage, Stage,
};
use comlink_queue::{MessageQueue, QueueError};

use crate::config::{ChannelKind, GatewayConfig};
use crate::delivery::Delivery;
use crate::error::{CoreError, ModelError, Result};
use crate::model::{LanguageModel, ModelContext, Purpose};
use crate::reporter::Reporter;
use crate::supervisor::{Exchange, Supervisor};

/// Message ids remembered for de-duplication.
const SEEN_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Seen {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl Seen {
    /// Returns false if `id` was already handled.
    fn insert(&mut self, id: &MessageId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Consumes the queue and applies the routing rules.
pub struct RoutingCore {
    queue: Arc<MessageQueue>,
    dispatcher: Dispatcher,
    model: Arc<dyn LanguageModel>,
    delivery: Arc<Delivery>,
    reporter: Reporter,
    config: Arc<GatewayConfig>,
    supervisor: Option<Supervisor>,
    seen: Mutex<Seen>,
}

impl RoutingCore {
    pub fn new(
        queue: Arc<MessageQueue>,
        dispatcher: Dispatcher,
        model: Arc<dyn LanguageModel>,
        delivery: Arc<Delivery>,
        reporter: Reporter,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            model,
            delivery,
            reporter,
            config,
            supervisor: None,
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Runs one worker until shutdown. Returns an error only when the queue
    /// store is unavailable, which the gateway treats as fatal.
    pub async fn run_worker(
        self: Arc<Self>,
        worker: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        debug!(worker, "routing worker started");
        loop {
            tokio::select! {
                dequeued = self.queue.dequeue() => {
                    let message = dequeued?;
                    self.process(message).await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(worker, "routing worker stopped");
        Ok(())
    }

    /// Handles one dequeued message and acknowledges it.
    ///
    /// A failure is recorded against the message and swallowed, except
    /// for an unavailable queue store.
    pub async fn process(&self, message: QueueMessage) -> Result<()> {
        let id = message.message_id.clone();
        let first = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&id);
        if !first {
            debug!(id = %id, "duplicate delivery skipped");
            return self.skip(&id);
        }
        if message.is_redelivered() && self.handled_before_restart(&message)? {
            return self.skip(&id);
        }

        match self.handle(&message).await {
            Ok(()) => self.queue.ack(&id)?,
            Err(e) if e.is_storage_unavailable() => return Err(e),
            Err(e) => {
                warn!(id = %id, stage = %message.stage, error = %e, "message handling failed");
                self.queue.fail(&id, &e.to_string())?;
            }
        }
        Ok(())
    }

    fn skip(&self, id: &MessageId) -> Result<()> {
        match self.queue.ack(id) {
            Ok(()) | Err(QueueError::NotInFlight(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Checks the store for traces of a previous run handling `message`.
    ///
    /// Anything derived from it means it was handled. A command that was
    /// started but left no report is reported as interrupted rather than
    /// run a second time.
    fn handled_before_restart(&self, message: &QueueMessage) -> Result<bool> {
        let id = &message.message_id;
        if self.queue.has_derived(id)? {
            info!(id = %id, stage = %message.stage, "already handled before restart");
            return Ok(true);
        }
        if message.stage != Stage::Command || !self.queue.was_started(id)? {
            return Ok(false);
        }

        let command = Self::command(message)?;
        warn!(id = %id, command = %command.describe(), "command interrupted by restart, not rerun");
        let report = ExecutionReport::for_command(
            &Self::origin(message),
            &command,
            false,
            "Interrupted by a restart; not run again. Send it again if it is still needed.",
        );
        self.reporter.report(message, report)?;
        Ok(true)
    }

    async fn handle(&self, message: &QueueMessage) -> Result<()> {
        match message.stage {
            Stage::Inbound => self.route_inbound(message).await,
            Stage::Review => self.review(message).await,
            Stage::Command => self.run_command(message).await,
            Stage::Outbound => {
                self.delivery
                    .deliver(&message.target, &message.content)
                    .await
            }
        }
    }

    fn origin(message: &QueueMessage) -> Origin {
        Origin::new(&message.source, message.user().unwrap_or_default())
    }

    fn is_com(&self, channel: &str) -> bool {
        self.config.channel(channel).map(|c| c.kind) == Some(ChannelKind::Com)
    }

    async fn route_inbound(&self, message: &QueueMessage) -> Result<()> {
        let origin = Self::origin(message);

        // Chat seen in a COM room is conversation, never a command
        if !self.is_com(&message.source) {
            if message.content.trim() == "help" {
                return self.reply(message, help_text(), None);
            }
            let outcome =
                self.dispatcher
                    .dispatch(&message.content, &origin, Some(&message.message_id));
            match outcome {
                Ok(Outcome::Execute {
                    command,
                    confirmation,
                }) => return self.enqueue_command(message, command, confirmation),
                Ok(Outcome::AwaitConfirmation(c)) => {
                    return self.reply(message, c.prompt(), Some(c.confirmation_id.as_str()));
                }
                Ok(Outcome::Rejected(c)) => {
                    let text = format!(
                        "Rejected {}: `{}` will not run.",
                        c.confirmation_id, c.suggested_command
                    );
                    return self.reply(message, text, Some(c.confirmation_id.as_str()));
                }
                Ok(Outcome::Cancelled(cancelled)) => {
                    let text = if cancelled.is_empty() {
                        "Nothing pending to cancel.".to_string()
                    } else {
                        let ids: Vec<&str> = cancelled
                            .iter()
                            .map(|c| c.confirmation_id.as_str())
                            .collect();
                        format!(
                            "Cancelled {} pending command(s): {}.",
                            ids.len(),
                            ids.join(", ")
                        )
                    };
                    return self.reply(message, text, None);
                }
                Ok(Outcome::Conversation(_)) => {}
                Err(e) => {
                    info!(user = %origin.user, error = %e, "input refused");
                    return self.reply(message, e.user_message(), None);
                }
            }
        }

        self.converse(message, &origin).await
    }

    /// Queues a system reply to the sender for phrasing.
    fn reply(&self, cause: &QueueMessage, text: String, preserve: Option<&str>) -> Result<()> {
        let mut builder = MessageBuilder::derive(cause, text)
            .target(cause.source.clone())
            .stage(Stage::Review);
        if let Some(keep) = preserve {
            builder = builder.with_metadata(meta::PRESERVE, keep);
        }
        self.queue.enqueue(builder)?;
        Ok(())
    }

    fn enqueue_command(
        &self,
        cause: &QueueMessage,
        command: Command,
        confirmation: Option<ConfirmationId>,
    ) -> Result<()> {
        let target = match command {
            Command::RunShellCommand { .. } => self.config.shell_channel.clone(),
            _ => self.config.com_channel.clone(),
        };
        let mut builder = MessageBuilder::derive(cause, routes::render(&command))
            .target(target)
            .stage(Stage::Command)
            .with_metadata(meta::COMMAND, serde_json::to_value(&command)?);
        if let Some(id) = confirmation {
            builder = builder.with_metadata(meta::CONFIRMATION, id.to_string());
        }
        let queued = self.queue.enqueue(builder)?;
        info!(id = %queued.message_id, command = %queued.content, "command queued");
        Ok(())
    }

    async fn converse(&self, message: &QueueMessage, origin: &Origin) -> Result<()> {
        let targets = self.config.allowed_targets(&message.source);
        let Some(default_target) = targets.first().cloned() else {
            debug!(source = %message.source, "no route for conversation");
            return Ok(());
        };

        let context = ModelContext::new(Purpose::Conversation, &message.source)
            .with_user(message.user())
            .with_room(message.meta_str(meta::ROOM));
        let decided: std::result::Result<(String, Option<String>), ModelError> = async {
            let response = self.model.process(&message.content, &context).await?;
            let target = self.model.decide_route(&message.content, &targets).await?;
            Ok((response, target))
        }
        .await;

        let (response, target) = match decided {
            Ok(decided) => decided,
            Err(e) => return self.model_unavailable(message, origin, e),
        };
        let target = match target {
            Some(t) if targets.contains(&t) => t,
            Some(t) => {
                warn!(proposed = %t, source = %message.source, "route not allowed, using default");
                default_target
            }
            None => default_target,
        };

        let queued = self.queue.enqueue(
            MessageBuilder::derive(message, response.clone())
                .target(target)
                .stage(Stage::Outbound),
        )?;
        debug!(id = %queued.message_id, target = %queued.target, "conversation routed");
        self.observe(Exchange::new("relay", &message.content, response));
        Ok(())
    }

    /// First failure: requeue once one priority step lower. Second: an
    /// error report.
    fn model_unavailable(
        &self,
        message: &QueueMessage,
        origin: &Origin,
        error: ModelError,
    ) -> Result<()> {
        if message.model_attempts() == 0 {
            warn!(id = %message.message_id, error = %error, "model unavailable, requeueing once");
            self.queue.enqueue(
                MessageBuilder::derive(message, message.content.clone())
                    .priority(message.priority.decremented())
                    .with_metadata(meta::MODEL_ATTEMPTS, 1),
            )?;
            return Ok(());
        }

        let report = ExecutionReport::error(
            origin,
            "relay message",
            format!("Language model unavailable: {}", error),
        );
        if self.is_com(&message.source) {
            // A COM room is not told about our outages
            warn!(id = %message.message_id, error = %error, "dropping COM line, model unavailable");
            self.reporter.record(report);
        } else {
            self.reporter.report(message, report)?;
        }
        Ok(())
    }

    async fn review(&self, message: &QueueMessage) -> Result<()> {
        let preserve = message.meta_str(meta::PRESERVE);
        let context = ModelContext::new(Purpose::Review, &message.target)
            .with_user(message.user())
            .with_preserve(preserve);

        let (text, bypassed) = match self.model.process(&message.content, &context).await {
            Ok(text) if preserve.map_or(true, |p| text.contains(p)) => (text, false),
            Ok(_) => {
                warn!(id = %message.message_id, "model dropped required text, sending canonical");
                (message.content.clone(), true)
            }
            Err(e) => {
                warn!(id = %message.message_id, error = %e, "model unavailable, sending canonical");
                (message.content.clone(), true)
            }
        };

        let mut builder = MessageBuilder::derive(message, text.clone())
            .stage(Stage::Outbound)
            .without_metadata(meta::PRESERVE);
        if bypassed {
            builder = builder.with_metadata(meta::MODEL_BYPASSED, true);
        } else {
            self.observe(
                Exchange::new("review", &message.content, text).with_actual(&message.content),
            );
        }
        self.queue.enqueue(builder)?;
        Ok(())
    }

    fn command(message: &QueueMessage) -> Result<Command> {
        message
            .metadata
            .get(meta::COMMAND)
            .cloned()
            .map(serde_json::from_value::<Command>)
            .transpose()?
            .ok_or_else(|| CoreError::MalformedMessage {
                id: message.message_id.to_string(),
                reason: "command stage without a command".into(),
            })
    }

    async fn run_command(&self, message: &QueueMessage) -> Result<()> {
        let command = Self::command(message)?;
        let origin = Self::origin(message);

        self.queue.mark_started(&message.message_id)?;
        info!(command = %command.describe(), user = %origin.user, "executing");
        let execution = self.delivery.execute(&command).await;

        let mut report =
            ExecutionReport::for_command(&origin, &command, execution.success, execution.message);
        if let Some(at) = execution.delivery_timestamp {
            report = report.with_delivery_timestamp(at);
        }
        self.reporter.report(message, report)?;
        Ok(())
    }

    fn observe(&self, exchange: Exchange) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.observe(exchange);
        }
    }
}
