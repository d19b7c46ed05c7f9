//! Offline outbox: bounded, age-limited, durably persisted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ridelink_core::config::QueueConfig;
use ridelink_core::result::AppResult;
use ridelink_core::traits::KeyValueStore;

use crate::connection::timer::{ScheduledTask, TimerSlot};
use crate::transport::TransportSink;

/// An outbound event waiting for a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Local identity, stable while the entry is in flight.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Event name.
    pub event: String,
    /// Event payload, sent as-is.
    pub payload: serde_json::Value,
    /// When the message was first queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed flush attempts so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedMessage {
    /// Create a fresh entry stamped with the current time.
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event: event.into(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    /// Queue length after the append.
    pub queue_size: usize,
    /// Entry evicted to make room, if the queue was full.
    pub evicted: Option<QueuedMessage>,
}

/// Result of a flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries delivered and removed.
    pub success_count: usize,
    /// Entries that failed and were re-queued.
    pub failed_count: usize,
    /// Entries pruned before sending.
    pub pruned_count: usize,
}

/// Buffers outbound events while the channel is down.
///
/// Appends are accepted in every connection state. Every mutation schedules
/// a debounced write of the whole list under one storage key;
/// [`OfflineQueue::persist_now`] forces an immediate write.
#[derive(Debug)]
pub struct OfflineQueue {
    config: QueueConfig,
    entries: Arc<Mutex<VecDeque<QueuedMessage>>>,
    store: Arc<dyn KeyValueStore>,
    persist_task: Arc<TimerSlot>,
    /// Serializes snapshot-and-write so a later write never lands first.
    writes: Arc<tokio::sync::Mutex<()>>,
    flushing: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Create an empty queue. Call [`OfflineQueue::load`] to restore state.
    pub fn new(config: QueueConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(VecDeque::new())),
            store,
            persist_task: Arc::new(TimerSlot::new()),
            writes: Arc::new(tokio::sync::Mutex::new(())),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore persisted entries, discarding any that already aged out.
    ///
    /// Corrupt persisted data is logged and replaced by an empty queue.
    pub async fn load(&self) -> AppResult<usize> {
        let raw = self.store.get(&self.config.storage_key).await?;
        let Some(raw) = raw else {
            return Ok(0);
        };

        let stored: Vec<QueuedMessage> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    key = %self.config.storage_key,
                    error = %e,
                    "Persisted offline queue is unreadable, starting empty"
                );
                return Ok(0);
            }
        };

        let total = stored.len();
        let now = Utc::now();
        let mut restored: VecDeque<QueuedMessage> = stored
            .into_iter()
            .filter(|m| !self.is_stale(m, now))
            .collect();
        while restored.len() > self.config.max_size {
            restored.pop_front();
        }

        let count = restored.len();
        *self.lock() = restored;
        info!(
            restored = count,
            discarded = total - count,
            "Offline queue loaded"
        );
        Ok(count)
    }

    /// Append an entry, evicting the oldest when full.
    pub fn enqueue(&self, event: impl Into<String>, payload: serde_json::Value) -> EnqueueOutcome {
        let message = QueuedMessage::new(event, payload);
        let outcome = {
            let mut entries = self.lock();
            let evicted = if entries.len() >= self.config.max_size {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(message);
            EnqueueOutcome {
                queue_size: entries.len(),
                evicted,
            }
        };

        if let Some(evicted) = &outcome.evicted {
            warn!(
                event = %evicted.event,
                enqueued_at = %evicted.enqueued_at,
                "Offline queue full, evicted oldest entry"
            );
        }
        debug!(queue_size = outcome.queue_size, "Message queued");

        self.schedule_persist();
        outcome
    }

    /// Drop entries past the age or retry limits. Returns how many went.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|m| !self.is_stale(m, now));
            before - entries.len()
        };
        if removed > 0 {
            info!(removed, "Pruned stale offline queue entries");
            self.schedule_persist();
        }
        removed
    }

    /// Send every live entry in enqueue order.
    ///
    /// Entries stay queued while in flight and leave only once delivered, so
    /// a forced persist mid-pass still writes them. A failed send only
    /// affects its own entry: its retry count goes up and the pass continues.
    /// Concurrent flushes run one after the other.
    pub async fn flush(&self, sink: &dyn TransportSink) -> FlushReport {
        let _guard = self.flushing.lock().await;

        let mut report = FlushReport {
            pruned_count: self.prune(),
            ..FlushReport::default()
        };
        let pending = self.snapshot();
        if pending.is_empty() {
            return report;
        }

        for message in pending {
            match sink.send(&message.event, message.payload.clone()).await {
                Ok(()) => {
                    self.remove(message.id);
                    report.success_count += 1;
                }
                Err(e) => {
                    let retry_count = self.record_failure(message.id);
                    warn!(
                        event = %message.event,
                        retry_count = ?retry_count,
                        error = %e,
                        "Queued message failed to send"
                    );
                    report.failed_count += 1;
                }
            }
        }

        info!(
            success = report.success_count,
            failed = report.failed_count,
            pruned = report.pruned_count,
            "Offline queue flushed"
        );
        self.schedule_persist();
        report
    }

    /// Write the current contents immediately, cancelling any pending
    /// debounced write.
    pub async fn persist_now(&self) -> AppResult<()> {
        self.persist_task.cancel();
        let _write = self.writes.lock().await;
        let snapshot = self.snapshot();
        write_snapshot(self.store.as_ref(), &self.config.storage_key, &snapshot).await
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.lock().iter().cloned().collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether a debounced write is waiting.
    pub fn persist_pending(&self) -> bool {
        self.persist_task.is_pending()
    }

    fn is_stale(&self, message: &QueuedMessage, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(message.enqueued_at);
        let too_old = age.num_milliseconds() > self.config.max_age().as_millis() as i64;
        too_old || message.retry_count > self.config.max_retries
    }

    /// Drop a delivered entry. It may already be gone if it was evicted.
    fn remove(&self, id: Uuid) {
        let mut entries = self.lock();
        if let Some(index) = entries.iter().position(|m| m.id == id) {
            entries.remove(index);
        }
    }

    /// Bump an entry's retry count, returning the new count if still queued.
    fn record_failure(&self, id: Uuid) -> Option<u32> {
        let mut entries = self.lock();
        let message = entries.iter_mut().find(|m| m.id == id)?;
        message.retry_count += 1;
        Some(message.retry_count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Coalesce writes: a write still waiting out its debounce will pick up
    /// this mutation.
    fn schedule_persist(&self) {
        if self.persist_task.is_pending() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No runtime available, skipping debounced persist");
            return;
        }

        let entries = Arc::clone(&self.entries);
        let store = Arc::clone(&self.store);
        let key = self.config.storage_key.clone();
        let slot = Arc::clone(&self.persist_task);
        let writes = Arc::clone(&self.writes);
        let task = ScheduledTask::after(
            "queue-persist",
            self.config.persist_debounce(),
            async move {
                // Mutations from here on arm a fresh write.
                slot.clear();
                let _write = writes.lock().await;
                let snapshot: Vec<QueuedMessage> = entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect();
                if let Err(e) = write_snapshot(store.as_ref(), &key, &snapshot).await {
                    warn!(key = %key, error = %e, "Debounced queue persist failed");
                }
            },
        );
        self.persist_task.replace(task);
    }
}

async fn write_snapshot(
    store: &dyn KeyValueStore,
    key: &str,
    snapshot: &[QueuedMessage],
) -> AppResult<()> {
    if snapshot.is_empty() {
        store.delete(key).await?;
    } else {
        let json = serde_json::to_string(snapshot)?;
        store.set(key, &json).await?;
    }
    debug!(key, entries = snapshot.len(), "Offline queue persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use ridelink_core::error::AppError;

    use super::*;
    use crate::storage::MemoryStore;

    const KEY: &str = "ridelink.offline_queue";

    /// Sink that fails for configured event names.
    #[derive(Debug, Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
        fail_events: Vec<String>,
    }

    #[async_trait]
    impl TransportSink for RecordingSink {
        async fn send(&self, event: &str, payload: serde_json::Value) -> AppResult<()> {
            if self.fail_events.iter().any(|e| e == event) {
                return Err(AppError::transport("socket reset"));
            }
            self.sent.lock().unwrap().push((event.to_string(), payload));
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Sink whose every send takes a second.
    #[derive(Debug, Default)]
    struct SlowSink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TransportSink for SlowSink {
        async fn send(&self, event: &str, _payload: serde_json::Value) -> AppResult<()> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.sent.lock().unwrap().push(event.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Store whose writes take 200ms.
    #[derive(Debug)]
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KeyValueStore for SlowStore {
        async fn get(&self, key: &str) -> AppResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> AppResult<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> AppResult<()> {
            self.inner.delete(key).await
        }
    }

    fn queue_with(max_size: usize, store: Arc<MemoryStore>) -> OfflineQueue {
        let config = QueueConfig {
            max_size,
            ..QueueConfig::default()
        };
        OfflineQueue::new(config, store)
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let queue = queue_with(3, Arc::new(MemoryStore::new()));
        for i in 0..4 {
            queue.enqueue("chat_message", json!({"n": i}));
        }
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 3);
        let order: Vec<i64> = snapshot
            .iter()
            .map(|m| m.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_enqueue_reports_eviction() {
        let queue = queue_with(1, Arc::new(MemoryStore::new()));
        assert!(queue.enqueue("a", json!({})).evicted.is_none());
        let outcome = queue.enqueue("b", json!({}));
        assert_eq!(outcome.queue_size, 1);
        assert_eq!(outcome.evicted.map(|m| m.event).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_flush_sends_in_order() {
        let queue = queue_with(10, Arc::new(MemoryStore::new()));
        queue.enqueue("join_ride", json!({"rideId": "r-1"}));
        queue.enqueue("chat_message", json!({"text": "hi"}));
        queue.enqueue("leave_ride", json!({"rideId": "r-1"}));

        let sink = RecordingSink::default();
        let report = queue.flush(&sink).await;
        assert_eq!(report.success_count, 3);
        assert_eq!(report.failed_count, 0);
        assert!(queue.is_empty());

        let events: Vec<String> = sink
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(e, _)| e.clone())
            .collect();
        assert_eq!(events, vec!["join_ride", "chat_message", "leave_ride"]);
    }

    #[tokio::test]
    async fn test_failed_entry_requeued_without_blocking_others() {
        let queue = queue_with(10, Arc::new(MemoryStore::new()));
        queue.enqueue("a", json!({}));
        queue.enqueue("bad", json!({}));
        queue.enqueue("c", json!({}));

        let sink = RecordingSink {
            fail_events: vec!["bad".to_string()],
            ..RecordingSink::default()
        };
        let report = queue.flush(&sink).await;
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failed_count, 1);

        let remaining = queue.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event, "bad");
        assert_eq!(remaining[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_entry_dropped_after_max_retries() {
        let queue = queue_with(10, Arc::new(MemoryStore::new()));
        queue.enqueue("bad", json!({}));
        let sink = RecordingSink {
            fail_events: vec!["bad".to_string()],
            ..RecordingSink::default()
        };

        // max_retries = 3: the entry is attempted four times, then pruned.
        for attempt in 1..=4 {
            let report = queue.flush(&sink).await;
            assert_eq!(report.failed_count, 1, "attempt {attempt}");
        }
        let report = queue.flush(&sink).await;
        assert_eq!(report.pruned_count, 1);
        assert_eq!(report.failed_count, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_aged_entry_never_sent() {
        let queue = queue_with(10, Arc::new(MemoryStore::new()));
        queue.enqueue("fresh", json!({}));
        {
            let mut entries = queue.lock();
            let mut old = QueuedMessage::new("old", json!({}));
            old.enqueued_at = Utc::now() - chrono::Duration::seconds(301);
            entries.push_front(old);
        }

        let sink = RecordingSink::default();
        let report = queue.flush(&sink).await;
        assert_eq!(report.pruned_count, 1);
        assert_eq!(report.success_count, 1);
        assert_eq!(sink.sent.lock().unwrap()[0].0, "fresh");
    }

    #[tokio::test]
    async fn test_persist_now_and_load() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(10, store.clone());
        queue.enqueue("chat_message", json!({"text": "one"}));
        queue.enqueue("chat_message", json!({"text": "two"}));
        queue.persist_now().await.unwrap();
        assert!(!queue.persist_pending());

        let restored = queue_with(10, store.clone());
        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(restored.snapshot()[1].payload["text"], "two");
    }

    #[tokio::test]
    async fn test_load_discards_aged_entries() {
        let store = Arc::new(MemoryStore::new());
        let mut old = QueuedMessage::new("old", json!({}));
        old.enqueued_at = Utc::now() - chrono::Duration::minutes(10);
        let fresh = QueuedMessage::new("fresh", json!({}));
        store.set_json(KEY, &vec![old, fresh]).await.unwrap();

        let queue = queue_with(10, store);
        assert_eq!(queue.load().await.unwrap(), 1);
        assert_eq!(queue.snapshot()[0].event, "fresh");
    }

    #[tokio::test]
    async fn test_load_tolerates_corrupt_data() {
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "{not json").await.unwrap();
        let queue = queue_with(10, store);
        assert_eq!(queue.load().await.unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_is_debounced() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(10, store.clone());

        queue.enqueue("a", json!({}));
        queue.enqueue("b", json!({}));
        assert!(queue.persist_pending());
        assert_eq!(store.get(KEY).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let persisted: Vec<QueuedMessage> = store.get_json(KEY).await.unwrap().unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_clears_storage() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(10, store.clone());
        queue.enqueue("a", json!({}));
        queue.persist_now().await.unwrap();
        assert!(store.exists(KEY).await.unwrap());

        queue.flush(&RecordingSink::default()).await;
        queue.persist_now().await.unwrap();
        assert!(!store.exists(KEY).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_persist_during_flush_keeps_undelivered() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(queue_with(10, store.clone()));
        for i in 0..3 {
            queue.enqueue("chat_message", json!({"n": i}));
        }
        queue.persist_now().await.unwrap();

        let flushing = Arc::clone(&queue);
        let flush = tokio::spawn(async move { flushing.flush(&SlowSink::default()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.persist_now().await.unwrap();
        let persisted: Vec<QueuedMessage> = store.get_json(KEY).await.unwrap().unwrap();
        assert_eq!(persisted.len(), 3);

        // First entry delivered, second still in flight.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        queue.persist_now().await.unwrap();
        let persisted: Vec<QueuedMessage> = store.get_json(KEY).await.unwrap().unwrap();
        let order: Vec<i64> = persisted
            .iter()
            .map(|m| m.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2]);

        let report = flush.await.unwrap();
        assert_eq!(report.success_count, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_evicted_mid_flush_is_not_restored() {
        let queue = Arc::new(queue_with(2, Arc::new(MemoryStore::new())));
        queue.enqueue("a", json!({}));
        queue.enqueue("b", json!({}));

        let flushing = Arc::clone(&queue);
        let flush = tokio::spawn(async move { flushing.flush(&SlowSink::default()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // "a" is in flight and gets evicted to make room.
        queue.enqueue("c", json!({}));
        let report = flush.await.unwrap();
        assert_eq!(report.success_count, 2);

        let remaining: Vec<String> = queue.snapshot().into_iter().map(|m| m.event).collect();
        assert_eq!(remaining, vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_during_debounced_write_is_persisted() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
        });
        let queue = OfflineQueue::new(QueueConfig::default(), store.clone());

        queue.enqueue("a", json!({}));
        // The debounced write fired at 2s and is still inside `set`.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        queue.enqueue("b", json!({}));
        assert!(queue.persist_pending());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let persisted: Vec<QueuedMessage> = store.inner.get_json(KEY).await.unwrap().unwrap();
        let events: Vec<&str> = persisted.iter().map(|m| m.event.as_str()).collect();
        assert_eq!(events, vec!["a", "b"]);
    }
}
