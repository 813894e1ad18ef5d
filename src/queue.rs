//! # Durable Sync Queue Module
//!
//! Priority-ordered, persisted work queue with exponential-backoff retry.
//! Items are buffered here when downstream systems are unavailable and
//! drained by consumers with at-least-once semantics: `dequeue` never
//! removes, removal is explicit via `mark_processed` / `mark_failed`.
//!
//! The in-memory queue is always sorted by `(priority, created_at)`
//! ascending: critical first, then insertion order within a priority class.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncQueueConfig;
use crate::error::{RealtimeError, Result};
use crate::metrics::MetricsCollector;
use crate::storage::{PersistedQueue, PersistedQueueMetadata, QueueStore, QUEUE_SNAPSHOT_VERSION};
use crate::types::{
    ComponentHealth, HealthStatus, QueueStats, QueueStatusCounts, RealtimeSignal,
};

/// Queue priority classes, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl QueuePriority {
    /// Sort rank; lower sorts earlier
    pub fn rank(&self) -> u8 {
        match self {
            QueuePriority::Critical => 0,
            QueuePriority::High => 1,
            QueuePriority::Normal => 2,
            QueuePriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePriority::Critical => "critical",
            QueuePriority::High => "high",
            QueuePriority::Normal => "normal",
            QueuePriority::Low => "low",
        }
    }
}

/// Computed processing status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Due now or overdue
    Pending,
    /// Waiting for a scheduled retry
    Scheduled,
    /// Out of attempts, kept until explicit cleanup
    Failed,
}

/// One unit of durable retryable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Item identifier
    pub id: Uuid,

    /// Item type; selects the retry policy
    pub item_type: String,

    /// Opaque work payload
    pub payload: serde_json::Value,

    /// Owning organization
    pub organization_id: String,

    /// Priority class
    pub priority: QueuePriority,

    /// Creation timestamp; FIFO key within a priority class
    pub created_at: DateTime<Utc>,

    /// Earliest time the item is due
    pub scheduled_at: DateTime<Utc>,

    /// Delivery attempts so far
    pub attempts: u32,

    /// Attempt budget from the retry policy
    pub max_attempts: u32,

    /// Most recent delivery error
    pub last_error: Option<String>,

    /// Retry deadline recorded on the last failure
    pub retry_after: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Whether the item is due for delivery
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Whether the item has exhausted its attempts
    pub fn is_failed(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether the item outlived the queue's retention window
    pub fn is_expired(&self, now: DateTime<Utc>, max_age_seconds: u64) -> bool {
        (now - self.created_at).num_seconds() > max_age_seconds as i64
    }

    /// Computed processing status
    pub fn status(&self, now: DateTime<Utc>) -> QueueItemStatus {
        if self.is_failed() {
            QueueItemStatus::Failed
        } else if self.scheduled_at > now {
            QueueItemStatus::Scheduled
        } else {
            QueueItemStatus::Pending
        }
    }
}

/// Per-item-type retry policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First retry delay in milliseconds
    pub initial_delay_ms: u64,

    /// Delay ceiling in milliseconds
    pub max_delay_ms: u64,

    /// Geometric growth factor
    pub backoff_multiplier: f64,

    /// Attempt budget
    pub max_attempts: u32,

    /// Symmetric jitter as a fraction of the delay
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Deterministic backoff delay for the given attempt count (1-based),
    /// before jitter, capped at `max_delay_ms`
    pub fn base_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        (delay as u64).min(self.max_delay_ms)
    }

    /// Backoff delay with symmetric jitter applied, never above the ceiling
    pub fn delay_for_attempt(&self, attempts: u32) -> u64 {
        let base = self.base_delay_ms(attempts) as f64;
        let jitter = base * self.jitter_factor;
        let sampled = if jitter > 0.0 {
            base + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            base
        };
        (sampled.max(0.0) as u64).min(self.max_delay_ms)
    }
}

/// Fallback policy for item types without a dedicated entry
pub const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    initial_delay_ms: 1_000,
    max_delay_ms: 300_000,
    backoff_multiplier: 2.0,
    max_attempts: 3,
    jitter_factor: 0.1,
};

static RETRY_POLICIES: Lazy<HashMap<&'static str, RetryPolicy>> = Lazy::new(|| {
    HashMap::from([
        (
            "metrics",
            RetryPolicy {
                initial_delay_ms: 1_000,
                max_delay_ms: 300_000,
                backoff_multiplier: 2.0,
                max_attempts: 5,
                jitter_factor: 0.1,
            },
        ),
        (
            "session",
            RetryPolicy {
                initial_delay_ms: 2_000,
                max_delay_ms: 600_000,
                backoff_multiplier: 2.0,
                max_attempts: 3,
                jitter_factor: 0.15,
            },
        ),
        (
            "command",
            RetryPolicy {
                initial_delay_ms: 500,
                max_delay_ms: 60_000,
                backoff_multiplier: 1.5,
                max_attempts: 7,
                jitter_factor: 0.2,
            },
        ),
        (
            "interaction",
            RetryPolicy {
                initial_delay_ms: 1_000,
                max_delay_ms: 180_000,
                backoff_multiplier: 1.8,
                max_attempts: 4,
                jitter_factor: 0.1,
            },
        ),
        (
            "batch",
            RetryPolicy {
                initial_delay_ms: 5_000,
                max_delay_ms: 1_800_000,
                backoff_multiplier: 2.5,
                max_attempts: 3,
                jitter_factor: 0.05,
            },
        ),
    ])
});

/// Retry policy for a queue item type
pub fn retry_policy_for(item_type: &str) -> RetryPolicy {
    RETRY_POLICIES
        .get(item_type)
        .copied()
        .unwrap_or(DEFAULT_RETRY_POLICY)
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed_marks: AtomicU64,
    dropped: AtomicU64,
}

/// Durable, priority-ordered sync queue
#[derive(Clone)]
pub struct SyncQueue {
    config: Arc<SyncQueueConfig>,
    store: Arc<dyn QueueStore>,
    items: Arc<Mutex<Vec<QueueItem>>>,
    accepting: Arc<AtomicBool>,
    dirty: Arc<AtomicBool>,
    counters: Arc<QueueCounters>,
    metrics: MetricsCollector,
    signals: broadcast::Sender<RealtimeSignal>,
    shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
    persist_guard: Arc<tokio::sync::Mutex<()>>,
    cleanup_guard: Arc<tokio::sync::Mutex<()>>,
}

impl SyncQueue {
    /// Create a new queue over the given store
    pub fn new(
        config: SyncQueueConfig,
        store: Arc<dyn QueueStore>,
        metrics: MetricsCollector,
        signals: broadcast::Sender<RealtimeSignal>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            items: Arc::new(Mutex::new(Vec::new())),
            accepting: Arc::new(AtomicBool::new(true)),
            dirty: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(QueueCounters::default()),
            metrics,
            signals,
            shutdown_tx: Arc::new(Mutex::new(None)),
            persist_guard: Arc::new(tokio::sync::Mutex::new(())),
            cleanup_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Reload the last persisted snapshot; called once on startup
    pub async fn load(&self) -> Result<usize> {
        let snapshot = self.store.load_queue().await?;
        let Some(snapshot) = snapshot else {
            return Ok(0);
        };

        let count = snapshot.items.len();
        {
            let mut items = self.items.lock();
            *items = snapshot.items;
            // Stable sort restores the priority invariant without
            // disturbing FIFO order inside a class.
            items.sort_by_key(|item| (item.priority.rank(), item.created_at));
        }
        self.metrics.queue_size.set(count as i64);

        info!(
            "Loaded {} queue items persisted at {}",
            count, snapshot.metadata.persisted_at
        );
        Ok(count)
    }

    /// Start persistence and cleanup tickers
    pub async fn start(&self) -> Result<()> {
        info!("Starting Sync Queue");

        let (shutdown_tx, _) = broadcast::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx.clone());

        let queue = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let persist_every = StdDuration::from_secs(self.config.persistence_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persist_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => queue.run_persistence_tick().await,
                    _ = shutdown_rx.recv() => {
                        debug!("Queue persistence ticker received shutdown signal");
                        break;
                    }
                }
            }
        });

        let queue = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let cleanup_every = StdDuration::from_secs(self.config.cleanup_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => queue.run_cleanup_tick().await,
                    _ = shutdown_rx.recv() => {
                        debug!("Queue cleanup ticker received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop intake, cancel tickers, and persist synchronously
    pub async fn shutdown(&self) {
        info!("Stopping Sync Queue");
        self.accepting.store(false, Ordering::SeqCst);

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        if let Err(e) = self.persist().await {
            warn!("Final queue persistence failed: {}", e);
        }
    }

    /// Enqueue one unit of work.
    ///
    /// At capacity, expired and permanently-failed low-priority items are
    /// reclaimed first; if the queue is still full the call fails with
    /// `QueueFull` so the caller can apply its own backpressure.
    pub fn enqueue(
        &self,
        item_type: &str,
        payload: serde_json::Value,
        organization_id: &str,
        priority: QueuePriority,
    ) -> Result<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RealtimeError::internal("sync queue is shut down"));
        }
        if item_type.is_empty() {
            return Err(RealtimeError::validation_field(
                "item_type must not be empty",
                "item_type",
            ));
        }
        if organization_id.is_empty() {
            return Err(RealtimeError::validation_field(
                "organization_id must not be empty",
                "organization_id",
            ));
        }

        let now = Utc::now();
        let policy = retry_policy_for(item_type);
        let item = QueueItem {
            id: Uuid::new_v4(),
            item_type: item_type.to_string(),
            payload,
            organization_id: organization_id.to_string(),
            priority,
            created_at: now,
            scheduled_at: now,
            attempts: 0,
            max_attempts: policy.max_attempts,
            last_error: None,
            retry_after: None,
        };
        let item_id = item.id;

        let size = {
            let mut items = self.items.lock();
            if items.len() >= self.config.max_queue_size {
                let reclaimed = self.make_space_locked(&mut items, now);
                if reclaimed > 0 {
                    debug!("Reclaimed {} queue slots before enqueue", reclaimed);
                }
            }
            if items.len() >= self.config.max_queue_size {
                return Err(RealtimeError::queue_full(
                    items.len(),
                    self.config.max_queue_size,
                ));
            }

            // First item with a strictly lower priority class marks the
            // insert position; FIFO within the class.
            let position = items
                .iter()
                .position(|existing| existing.priority.rank() > item.priority.rank())
                .unwrap_or(items.len());
            items.insert(position, item);
            items.len()
        };

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
        self.metrics.queue_enqueued_total.inc();
        self.metrics.queue_size.set(size as i64);

        Ok(item_id)
    }

    /// Return up to `limit` due items without removing them
    pub fn dequeue(
        &self,
        limit: usize,
        types: Option<&[&str]>,
        organization_id: Option<&str>,
    ) -> Vec<QueueItem> {
        let now = Utc::now();
        let items = self.items.lock();
        items
            .iter()
            .filter(|item| item.is_due(now) && !item.is_failed())
            .filter(|item| match types {
                Some(types) => types.iter().any(|t| *t == item.item_type),
                None => true,
            })
            .filter(|item| match organization_id {
                Some(org) => item.organization_id == org,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove a successfully delivered item
    pub fn mark_processed(&self, item_id: Uuid) -> Result<bool> {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| item.id != item_id);
            before != items.len()
        };

        if removed {
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Relaxed);
            self.metrics.queue_processed_total.inc();
            self.metrics.queue_size.set(self.items.lock().len() as i64);
        } else {
            debug!("mark_processed for unknown item {}", item_id);
        }
        Ok(removed)
    }

    /// Record a delivery failure.
    ///
    /// Returns whether a retry was scheduled. Items out of attempts stay in
    /// the queue marked permanently failed until explicit cleanup.
    pub fn mark_failed(&self, item_id: Uuid, error: &str, schedule_retry: bool) -> Result<bool> {
        let now = Utc::now();
        let mut exhausted: Option<(Uuid, String)> = None;

        let retry_scheduled = {
            let mut items = self.items.lock();
            let Some(item) = items.iter_mut().find(|item| item.id == item_id) else {
                debug!("mark_failed for unknown item {}", item_id);
                return Ok(false);
            };

            item.attempts += 1;
            item.last_error = Some(error.to_string());

            if schedule_retry && item.attempts < item.max_attempts {
                let policy = retry_policy_for(&item.item_type);
                let delay_ms = policy.delay_for_attempt(item.attempts);
                let until = now + Duration::milliseconds(delay_ms as i64);
                item.scheduled_at = until;
                item.retry_after = Some(until);
                true
            } else {
                if item.is_failed() {
                    exhausted = Some((item.id, item.item_type.clone()));
                }
                false
            }
        };

        self.counters.failed_marks.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
        self.metrics.queue_failed_marks_total.inc();

        if let Some((id, item_type)) = exhausted {
            warn!(
                "Queue item {} of type {} exhausted its attempts: {}",
                id, item_type, error
            );
            let _ = self.signals.send(RealtimeSignal::QueueItemExhausted {
                item_id: id,
                item_type,
                error: error.to_string(),
            });
        }

        Ok(retry_scheduled)
    }

    /// Remove one item regardless of state
    pub fn remove_item(&self, item_id: Uuid) -> bool {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| item.id != item_id);
            before != items.len()
        };
        if removed {
            self.dirty.store(true, Ordering::Relaxed);
            self.metrics.queue_size.set(self.items.lock().len() as i64);
        }
        removed
    }

    /// Drop all permanently failed items; returns how many were removed
    pub fn clear_failed(&self) -> usize {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| !item.is_failed());
            before - items.len()
        };

        if removed > 0 {
            info!("Cleared {} permanently failed queue items", removed);
            self.counters
                .dropped
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Relaxed);
            self.metrics.queue_dropped_total.inc_by(removed as u64);
            self.metrics.queue_size.set(self.items.lock().len() as i64);
        }
        removed
    }

    /// Inspect queued items, optionally filtered
    pub fn get_items(
        &self,
        organization_id: Option<&str>,
        item_type: Option<&str>,
        limit: usize,
    ) -> Vec<QueueItem> {
        let items = self.items.lock();
        items
            .iter()
            .filter(|item| match organization_id {
                Some(org) => item.organization_id == org,
                None => true,
            })
            .filter(|item| match item_type {
                Some(t) => item.item_type == t,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Queue statistics snapshot
    pub fn get_stats(&self) -> QueueStats {
        let now = Utc::now();
        let items = self.items.lock();

        let mut by_status = QueueStatusCounts::default();
        let mut by_priority: HashMap<String, u64> = HashMap::new();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        let mut oldest: Option<DateTime<Utc>> = None;

        for item in items.iter() {
            match item.status(now) {
                QueueItemStatus::Pending => by_status.pending += 1,
                QueueItemStatus::Scheduled => by_status.scheduled += 1,
                QueueItemStatus::Failed => by_status.failed += 1,
            }
            *by_priority.entry(item.priority.as_str().to_string()).or_insert(0) += 1;
            *by_type.entry(item.item_type.clone()).or_insert(0) += 1;
            oldest = match oldest {
                Some(current) if current <= item.created_at => Some(current),
                _ => Some(item.created_at),
            };
        }

        QueueStats {
            total_items: items.len() as u64,
            by_status,
            by_priority,
            by_type,
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            processed_total: self.counters.processed.load(Ordering::Relaxed),
            failed_marks_total: self.counters.failed_marks.load(Ordering::Relaxed),
            dropped_total: self.counters.dropped.load(Ordering::Relaxed),
            oldest_item_at: oldest,
        }
    }

    /// Perform a health check
    pub fn health_check(&self) -> ComponentHealth {
        let started = Instant::now();
        let stats = self.get_stats();

        let status = if stats.total_items as usize >= self.config.max_queue_size {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ComponentHealth {
            component: "sync_queue".to_string(),
            status,
            last_check: Utc::now(),
            response_time_ms: started.elapsed().as_millis() as u64,
            details: HashMap::from([
                ("total_items".to_string(), stats.total_items.to_string()),
                ("failed".to_string(), stats.by_status.failed.to_string()),
            ]),
        }
    }

    /// Persist the current queue wholesale
    pub async fn persist(&self) -> Result<()> {
        let started = Instant::now();

        // Clear the flag before snapshotting; mutations landing after the
        // snapshot re-mark the queue dirty for the next tick.
        self.dirty.store(false, Ordering::Relaxed);

        // Copy the snapshot out; the store call happens without the lock.
        let snapshot = {
            let items = self.items.lock();
            items.clone()
        };
        let stats = self.get_stats();

        let persisted = PersistedQueue {
            items: snapshot,
            metadata: PersistedQueueMetadata {
                persisted_at: Utc::now(),
                version: QUEUE_SNAPSHOT_VERSION,
                stats,
            },
        };

        if let Err(e) = self.store.save_queue(&persisted).await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        self.metrics
            .queue_persist_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        debug!("Persisted {} queue items", persisted.items.len());
        Ok(())
    }

    async fn run_persistence_tick(&self) {
        if !self.dirty.load(Ordering::Relaxed) {
            return;
        }
        // Skip the tick if the previous persistence run is still active.
        let Ok(_guard) = self.persist_guard.try_lock() else {
            return;
        };
        if let Err(e) = self.persist().await {
            warn!("Queue persistence failed, will retry next tick: {}", e);
        }
    }

    async fn run_cleanup_tick(&self) {
        let Ok(_guard) = self.cleanup_guard.try_lock() else {
            return;
        };

        let now = Utc::now();
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| !item.is_expired(now, self.config.max_item_age_seconds));
            before - items.len()
        };

        if removed > 0 {
            info!("Queue cleanup expired {} items", removed);
            self.counters
                .dropped
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Relaxed);
            self.metrics.queue_dropped_total.inc_by(removed as u64);
            self.metrics.queue_size.set(self.items.lock().len() as i64);

            if let Err(e) = self.persist().await {
                warn!("Queue persistence after cleanup failed: {}", e);
            }
        }
    }

    /// Reclaim space: expired items first, then the oldest permanently
    /// failed low-priority items. Caller holds the items lock.
    fn make_space_locked(&self, items: &mut Vec<QueueItem>, now: DateTime<Utc>) -> usize {
        let before = items.len();
        items.retain(|item| !item.is_expired(now, self.config.max_item_age_seconds));

        while items.len() >= self.config.max_queue_size {
            let victim = items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_failed() && item.priority == QueuePriority::Low)
                .min_by_key(|(_, item)| item.created_at)
                .map(|(index, _)| index);
            match victim {
                Some(index) => {
                    items.remove(index);
                }
                None => break,
            }
        }

        let removed = before - items.len();
        if removed > 0 {
            self.counters
                .dropped
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.metrics.queue_dropped_total.inc_by(removed as u64);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn test_queue() -> (SyncQueue, Arc<InMemoryStorage>) {
        test_queue_with_config(SyncQueueConfig::default())
    }

    fn test_queue_with_config(config: SyncQueueConfig) -> (SyncQueue, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = MetricsCollector::new(&Config::default()).unwrap();
        let (signals, _) = broadcast::channel(16);
        let queue = SyncQueue::new(config, storage.clone(), metrics, signals);
        (queue, storage)
    }

    #[test]
    fn test_priority_ordering_with_fifo_ties() {
        let (queue, _) = test_queue();

        let low = queue
            .enqueue("metrics", json!({"n": 1}), "org-1", QueuePriority::Low)
            .unwrap();
        let normal_1 = queue
            .enqueue("metrics", json!({"n": 2}), "org-1", QueuePriority::Normal)
            .unwrap();
        let critical = queue
            .enqueue("metrics", json!({"n": 3}), "org-1", QueuePriority::Critical)
            .unwrap();
        let normal_2 = queue
            .enqueue("metrics", json!({"n": 4}), "org-1", QueuePriority::Normal)
            .unwrap();

        let items = queue.dequeue(10, None, None);
        let ids: Vec<_> = items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![critical, normal_1, normal_2, low]);
    }

    #[test]
    fn test_dequeue_filters_and_leaves_items() {
        let (queue, _) = test_queue();

        queue
            .enqueue("metrics", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();
        queue
            .enqueue("session", json!({}), "org-2", QueuePriority::Normal)
            .unwrap();

        let metrics_only = queue.dequeue(10, Some(&["metrics"]), None);
        assert_eq!(metrics_only.len(), 1);
        assert_eq!(metrics_only[0].item_type, "metrics");

        let org_2 = queue.dequeue(10, None, Some("org-2"));
        assert_eq!(org_2.len(), 1);

        // dequeue does not remove
        assert_eq!(queue.get_stats().total_items, 2);
    }

    #[test]
    fn test_mark_failed_schedules_backoff() {
        let (queue, _) = test_queue();
        let id = queue
            .enqueue("session", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();

        let retry = queue.mark_failed(id, "downstream 503", true).unwrap();
        assert!(retry);

        let item = &queue.get_items(None, None, 10)[0];
        assert_eq!(item.attempts, 1);
        assert_eq!(item.last_error.as_deref(), Some("downstream 503"));
        assert!(item.scheduled_at > Utc::now());
        assert_eq!(item.retry_after, Some(item.scheduled_at));

        // No longer due.
        assert!(queue.dequeue(10, None, None).is_empty());
    }

    #[test]
    fn test_retry_to_permanent_failure() {
        let (queue, _) = test_queue();
        let id = queue
            .enqueue("command", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();

        // command policy allows 7 attempts
        for attempt in 1..7 {
            let retry = queue.mark_failed(id, "boom", true).unwrap();
            assert!(retry, "attempt {} should schedule a retry", attempt);
        }
        let retry = queue.mark_failed(id, "boom", true).unwrap();
        assert!(!retry);

        let stats = queue.get_stats();
        assert_eq!(stats.by_status.failed, 1);
        assert_eq!(stats.total_items, 1);
        assert!(queue.dequeue(10, None, None).is_empty());

        assert_eq!(queue.clear_failed(), 1);
        assert_eq!(queue.get_stats().total_items, 0);
    }

    #[test]
    fn test_exhaustion_emits_signal() {
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = MetricsCollector::new(&Config::default()).unwrap();
        let (signals, mut signal_rx) = broadcast::channel(16);
        let queue = SyncQueue::new(SyncQueueConfig::default(), storage, metrics, signals);

        let id = queue
            .enqueue("batch", json!({}), "org-1", QueuePriority::High)
            .unwrap();
        for _ in 0..3 {
            queue.mark_failed(id, "unreachable", true).unwrap();
        }

        let signal = signal_rx.try_recv().unwrap();
        assert!(matches!(
            signal,
            RealtimeSignal::QueueItemExhausted { item_id, .. } if item_id == id
        ));
    }

    #[test]
    fn test_backoff_base_is_monotonic_and_capped() {
        let policy = retry_policy_for("command");
        let mut last = 0;
        for attempts in 1..=20 {
            let delay = policy.base_delay_ms(attempts);
            assert!(delay >= last);
            assert!(delay <= policy.max_delay_ms);
            last = delay;
        }
        assert_eq!(policy.base_delay_ms(1), 500);
        assert_eq!(policy.base_delay_ms(20), policy.max_delay_ms);
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let policy = retry_policy_for("metrics");
        for attempts in 1..=10 {
            let base = policy.base_delay_ms(attempts) as f64;
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempts) as f64;
                assert!(delay <= policy.max_delay_ms as f64);
                assert!(delay >= base * (1.0 - policy.jitter_factor) - 1.0);
                assert!(delay <= base * (1.0 + policy.jitter_factor) + 1.0);
            }
        }
    }

    #[test]
    fn test_queue_full_after_reclamation() {
        let (queue, _) = test_queue_with_config(SyncQueueConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        queue
            .enqueue("metrics", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();
        queue
            .enqueue("metrics", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();

        let result = queue.enqueue("metrics", json!({}), "org-1", QueuePriority::Normal);
        assert!(matches!(result, Err(RealtimeError::QueueFull { .. })));
    }

    #[test]
    fn test_make_space_drops_failed_low_priority() {
        let (queue, _) = test_queue_with_config(SyncQueueConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        let victim = queue
            .enqueue("session", json!({}), "org-1", QueuePriority::Low)
            .unwrap();
        // Exhaust the victim (session policy: 3 attempts).
        for _ in 0..3 {
            queue.mark_failed(victim, "gone", true).unwrap();
        }
        queue
            .enqueue("metrics", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();

        // Queue is full, but the failed low-priority item is reclaimable.
        let accepted = queue.enqueue("metrics", json!({}), "org-1", QueuePriority::High);
        assert!(accepted.is_ok());
        assert!(queue.get_items(None, None, 10).iter().all(|i| i.id != victim));
    }

    #[tokio::test]
    async fn test_persist_and_reload_round_trip() {
        let (queue, storage) = test_queue();

        queue
            .enqueue("metrics", json!({"seq": 1}), "org-1", QueuePriority::Critical)
            .unwrap();
        queue
            .enqueue("batch", json!({"seq": 2}), "org-1", QueuePriority::Low)
            .unwrap();
        queue.persist().await.unwrap();

        let metrics = MetricsCollector::new(&Config::default()).unwrap();
        let (signals, _) = broadcast::channel(16);
        let reloaded = SyncQueue::new(SyncQueueConfig::default(), storage, metrics, signals);
        assert_eq!(reloaded.load().await.unwrap(), 2);

        let items = reloaded.dequeue(10, None, None);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].priority, QueuePriority::Critical);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (queue, storage) = test_queue();
        queue
            .enqueue("metrics", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();

        queue.shutdown().await;

        let result = queue.enqueue("metrics", json!({}), "org-1", QueuePriority::Normal);
        assert!(result.is_err());

        // Final persist ran.
        let snapshot = storage.load_queue().await.unwrap().unwrap();
        assert_eq!(snapshot.items.len(), 1);
    }

    #[test]
    fn test_remove_item_is_idempotent() {
        let (queue, _) = test_queue();
        let id = queue
            .enqueue("metrics", json!({}), "org-1", QueuePriority::Normal)
            .unwrap();

        assert!(queue.remove_item(id));
        assert!(!queue.remove_item(id));
    }
}
