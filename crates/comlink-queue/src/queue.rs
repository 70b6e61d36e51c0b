//! MessageQueue - strict priority queue with FIFO tie-break and a disk
//! record per message.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use comlink_models::{meta, MessageBuilder, MessageId, Priority, QueueMessage};
use comlink_persistence::{DeliveryStatus, QueueStore, StoredMessage};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};

/// Heap entry.
///
/// # Ordering Rules
///
/// 1. Higher priority comes first
/// 2. For same priority, older timestamp comes first
/// 3. For same timestamp, earlier insertion comes first
///
/// The comparisons are inverted where needed because `BinaryHeap` is a
/// max-heap.
#[derive(Debug)]
struct Queued {
    priority: Priority,
    timestamp: DateTime<Utc>,
    seq: u64,
    message: QueueMessage,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<Queued>,
    in_flight: HashMap<MessageId, QueueMessage>,
    /// Every id currently held in `heap` or `in_flight`.
    known: HashSet<MessageId>,
    next_seq: u64,
    completed: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            in_flight: HashMap::new(),
            known: HashSet::new(),
            next_seq: 0,
            completed: 0,
        }
    }

    fn push(&mut self, message: QueueMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.known.insert(message.message_id.clone());
        self.heap.push(Queued {
            priority: message.priority,
            timestamp: message.timestamp,
            seq,
            message,
        });
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Waiting to be dequeued.
    pub queued: usize,
    /// Dequeued but not yet acknowledged.
    pub in_flight: usize,
    /// Acknowledged since this process started.
    pub completed: u64,
}

/// Durable, priority-ordered, multi-consumer queue.
///
/// # Concurrency
///
/// Queue state sits behind one `Mutex`; the lock is never held across an
/// `.await`. Blocked consumers park on a `Notify` that `enqueue` signals.
///
/// # Durability
///
/// A message is persisted as `Pending` before it becomes visible, flipped to
/// `InFlight` when handed out, and to `Completed` or `Failed` when the
/// consumer reports back. Delivery is at-least-once; consumers de-duplicate
/// by `message_id`.
pub struct MessageQueue {
    store: QueueStore,
    state: Mutex<QueueState>,
    available: Notify,
}

impl MessageQueue {
    /// Creates an empty queue backed by `store`.
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState::new()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| QueueError::LockPoisoned(e.to_string()))
    }

    /// Reloads every stored message that was pending or in flight when the
    /// previous process stopped. Returns how many were requeued.
    ///
    /// Reloaded messages carry [`meta::REDELIVERED`] so consumers know to
    /// check [`MessageQueue::has_derived`] and [`MessageQueue::was_started`]
    /// before repeating work.
    pub fn recover(&self) -> Result<usize> {
        self.store.probe()?;
        let stored = self.store.list()?;

        let mut state = self.lock()?;
        let mut recovered = 0;
        for item in stored {
            if !item.status.needs_redelivery() || state.known.contains(&item.message.message_id) {
                continue;
            }
            if item.status == DeliveryStatus::InFlight {
                self.store
                    .set_status(&item.message.message_id, DeliveryStatus::Pending)?;
            }
            let mut message = item.message;
            message
                .metadata
                .insert(meta::REDELIVERED.to_string(), true.into());
            state.push(message);
            recovered += 1;
        }
        drop(state);

        if recovered > 0 {
            info!(count = recovered, "recovered queued messages");
            for _ in 0..recovered {
                self.available.notify_one();
            }
        }
        Ok(recovered)
    }

    /// Builds, persists and queues a message.
    ///
    /// The message id and timestamp are assigned here. Fails with
    /// [`QueueError::StorageUnavailable`] if the message cannot be recorded,
    /// in which case nothing is queued.
    pub fn enqueue(&self, builder: MessageBuilder) -> Result<QueueMessage> {
        let mut state = self.lock()?;
        let message = builder.build();

        // Persist first (crash safety)
        self.store.save(&StoredMessage::pending(message.clone()))?;

        state.push(message.clone());
        drop(state);

        debug!(
            id = %message.message_id,
            stage = %message.stage,
            priority = %message.priority,
            source = %message.source,
            target = %message.target,
            "enqueued"
        );
        self.available.notify_one();
        Ok(message)
    }

    /// Removes and returns the best message, if any, without waiting.
    pub fn try_dequeue(&self) -> Result<Option<QueueMessage>> {
        let mut state = self.lock()?;
        let Some(entry) = state.heap.pop() else {
            return Ok(None);
        };

        let id = entry.message.message_id.clone();
        if let Err(e) = self.store.set_status(&id, DeliveryStatus::InFlight) {
            state.heap.push(entry);
            return Err(e.into());
        }

        state.in_flight.insert(id, entry.message.clone());
        Ok(Some(entry.message))
    }

    /// Waits until a message is available and returns it.
    pub async fn dequeue(&self) -> Result<QueueMessage> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_dequeue()? {
                return Ok(message);
            }
            notified.await;
        }
    }

    /// Like [`MessageQueue::dequeue`], giving up after `timeout`.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Result<Option<QueueMessage>> {
        match tokio::time::timeout(timeout, self.dequeue()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Marks an in-flight message as done.
    pub fn ack(&self, id: &MessageId) -> Result<()> {
        let mut state = self.lock()?;
        if state.in_flight.remove(id).is_none() {
            return Err(QueueError::NotInFlight(id.to_string()));
        }
        state.known.remove(id);
        state.completed += 1;
        drop(state);

        self.store.set_status(id, DeliveryStatus::Completed)?;
        Ok(())
    }

    /// Marks an in-flight message as failed; it is not redelivered.
    pub fn fail(&self, id: &MessageId, reason: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.in_flight.remove(id).is_none() {
            return Err(QueueError::NotInFlight(id.to_string()));
        }
        state.known.remove(id);
        drop(state);

        warn!(id = %id, reason = %reason, "message failed");
        self.store.set_failed(id, reason)?;
        Ok(())
    }

    /// Records durably that the consumer is about to act on `id`.
    pub fn mark_started(&self, id: &MessageId) -> Result<()> {
        self.store.mark_started(id)?;
        Ok(())
    }

    /// Whether `id` was marked started by an earlier consumer.
    pub fn was_started(&self, id: &MessageId) -> Result<bool> {
        Ok(self.store.load(id)?.started_at.is_some())
    }

    /// Whether any stored message was derived from `id`, meaning `id` was
    /// already handled.
    pub fn has_derived(&self, id: &MessageId) -> Result<bool> {
        Ok(!self.store.derived_from(id)?.is_empty())
    }

    /// Returns a copy of the message that would be dequeued next.
    pub fn peek(&self) -> Option<QueueMessage> {
        let state = self.state.lock().ok()?;
        state.heap.peek().map(|q| q.message.clone())
    }

    /// Number of messages waiting.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.heap.len()).unwrap_or(0)
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    pub fn stats(&self) -> Result<QueueStats> {
        let state = self.lock()?;
        Ok(QueueStats {
            queued: state.heap.len(),
            in_flight: state.in_flight.len(),
            completed: state.completed,
        })
    }

    /// Deletes the disk records of acknowledged messages.
    pub fn purge_completed(&self) -> Result<usize> {
        Ok(self.store.purge(DeliveryStatus::Completed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comlink_models::Stage;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn msg(content: &str, priority: u8) -> MessageBuilder {
        MessageBuilder::new("feishu", "sdf_com", content).priority(Priority::new(priority))
    }

    fn queue(dir: &std::path::Path) -> MessageQueue {
        MessageQueue::new(QueueStore::new(dir))
    }

    #[test]
    fn test_priority_beats_enqueue_order() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());

        q.enqueue(msg("low", 2)).unwrap();
        q.enqueue(msg("high", 9)).unwrap();

        assert_eq!(q.try_dequeue().unwrap().unwrap().content, "high");
        assert_eq!(q.try_dequeue().unwrap().unwrap().content, "low");
        assert!(q.try_dequeue().unwrap().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());

        for i in 0..5 {
            q.enqueue(msg(&format!("m{}", i), 5)).unwrap();
        }

        let order: Vec<String> = (0..5)
            .map(|_| q.try_dequeue().unwrap().unwrap().content)
            .collect();
        assert_eq!(order, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_enqueue_persists_before_returning() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());

        let m = q.enqueue(msg("durable", 5).stage(Stage::Review)).unwrap();

        let stored = QueueStore::new(dir.path()).load(&m.message_id).unwrap();
        assert_eq!(stored.message, m);
        assert_eq!(stored.status, DeliveryStatus::Pending);
    }

    #[test]
    fn test_enqueue_fails_when_storage_unavailable() {
        let dir = tempdir().unwrap();
        // A file where the queue directory should be.
        std::fs::write(dir.path().join("queue"), b"blocker").unwrap();
        let q = queue(dir.path());

        let result = q.enqueue(msg("lost", 5));
        assert!(matches!(result, Err(QueueError::StorageUnavailable(_))));
        assert!(q.is_empty());
    }

    #[test]
    fn test_ack_and_stats() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        q.enqueue(msg("a", 5)).unwrap();
        q.enqueue(msg("b", 5)).unwrap();

        let a = q.try_dequeue().unwrap().unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.in_flight, 1);

        q.ack(&a.message_id).unwrap();
        assert_eq!(q.stats().unwrap().completed, 1);
        assert!(matches!(
            q.ack(&a.message_id),
            Err(QueueError::NotInFlight(_))
        ));

        let stored = QueueStore::new(dir.path()).load(&a.message_id).unwrap();
        assert_eq!(stored.status, DeliveryStatus::Completed);
        assert_eq!(q.purge_completed().unwrap(), 1);
    }

    #[test]
    fn test_recover_redelivers_unacked() {
        let dir = tempdir().unwrap();
        let (pending_id, in_flight_id) = {
            let q = queue(dir.path());
            let done = q.enqueue(msg("done", 5)).unwrap();
            let flying = q.enqueue(msg("flying", 6)).unwrap();
            let pending = q.enqueue(msg("pending", 4)).unwrap();

            // Dequeue order: flying (6), done (5).
            let first = q.try_dequeue().unwrap().unwrap();
            assert_eq!(first.message_id, flying.message_id);
            let second = q.try_dequeue().unwrap().unwrap();
            q.ack(&second.message_id).unwrap();
            assert_eq!(second.message_id, done.message_id);
            (pending.message_id, flying.message_id)
        };

        let restarted = queue(dir.path());
        assert_eq!(restarted.recover().unwrap(), 2);

        let a = restarted.try_dequeue().unwrap().unwrap();
        let b = restarted.try_dequeue().unwrap().unwrap();
        assert_eq!(a.message_id, in_flight_id);
        assert_eq!(b.message_id, pending_id);
        assert!(restarted.try_dequeue().unwrap().is_none());
    }

    #[test]
    fn test_recovered_messages_know_their_history() {
        let dir = tempdir().unwrap();
        let (started, quiet) = {
            let q = queue(dir.path());
            let started = q.enqueue(msg("started", 6)).unwrap();
            let quiet = q.enqueue(msg("quiet", 5)).unwrap();
            q.try_dequeue().unwrap().unwrap();
            q.mark_started(&started.message_id).unwrap();
            q.enqueue(MessageBuilder::derive(&started, "reply")).unwrap();
            (started.message_id, quiet.message_id)
        };

        let q = queue(dir.path());
        assert_eq!(q.recover().unwrap(), 3);
        let first = q.try_dequeue().unwrap().unwrap();
        assert_eq!(first.message_id, started);
        assert!(first.is_redelivered());
        assert!(q.was_started(&started).unwrap());
        assert!(q.has_derived(&started).unwrap());
        assert!(!q.was_started(&quiet).unwrap());
        assert!(!q.has_derived(&quiet).unwrap());

        // Work derived from a redelivered message is new work
        let child = q.enqueue(MessageBuilder::derive(&first, "again")).unwrap();
        assert!(!child.is_redelivered());
    }

    #[test]
    fn test_recover_twice_does_not_duplicate() {
        let dir = tempdir().unwrap();
        queue(dir.path()).enqueue(msg("once", 5)).unwrap();

        let q = queue(dir.path());
        assert_eq!(q.recover().unwrap(), 1);
        assert_eq!(q.recover().unwrap(), 0);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let dir = tempdir().unwrap();
        let q = Arc::new(queue(dir.path()));

        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        q.enqueue(msg("wake", 5)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.content, "wake");
    }

    #[tokio::test]
    async fn test_dequeue_timeout_returns_none() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        let got = q.dequeue_timeout(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }
}
