//! # Storage Seam
//!
//! Persistence is an external collaborator of the realtime core. This
//! module defines the records the core writes, the store traits it writes
//! them through, and an in-memory implementation used by tests and
//! single-process deployments.
//!
//! Metric rows are upserted by their deterministic window key, so a flush
//! replayed after a crash overwrites the same row instead of duplicating it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RealtimeError, Result};
use crate::queue::QueueItem;
use crate::types::QueueStats;

/// Version tag written into queue snapshots
pub const QUEUE_SNAPSHOT_VERSION: u32 = 1;

/// One aggregated metric row, produced by flushing a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Owning organization
    pub organization_id: String,

    /// User the window aggregates
    pub user_id: String,

    /// Window start (inclusive)
    pub window_start: DateTime<Utc>,

    /// Window end (exclusive)
    pub window_end: DateTime<Utc>,

    /// Window length in minutes
    pub window_minutes: u32,

    /// Commands executed in the window
    pub command_count: u64,

    /// Command rate normalized to an hourly figure
    pub commands_per_hour: f64,

    /// Commands that ended in error
    pub error_count: u64,

    /// error_count / command_count, 0.0 for empty windows
    pub error_rate: f64,

    /// Mean command execution time in milliseconds
    pub avg_execution_time_ms: f64,

    /// Agent interactions in the window
    pub agent_interactions: u64,

    /// Interaction count per agent name
    pub agent_usage: HashMap<String, u64>,

    /// Session lifecycle events in the window
    pub session_count: u64,

    /// Mean of collected productivity scores, if any were sampled
    pub avg_productivity_score: Option<f64>,

    /// When the row was produced
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    /// Deterministic upsert key for the row's window
    pub fn window_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.organization_id,
            self.user_id,
            self.window_start.timestamp(),
            self.window_minutes
        )
    }
}

/// Filter for querying stored metric rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub window_minutes: Option<u32>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl MetricsQuery {
    fn matches(&self, record: &MetricRecord) -> bool {
        if let Some(org) = &self.organization_id {
            if org != &record.organization_id {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if user != &record.user_id {
                return false;
            }
        }
        if let Some(window) = self.window_minutes {
            if window != record.window_minutes {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.window_start < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.window_start > to {
                return false;
            }
        }
        true
    }
}

/// Snapshot metadata stored alongside the queue items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueueMetadata {
    /// When the snapshot was taken
    pub persisted_at: DateTime<Utc>,

    /// Snapshot format version
    pub version: u32,

    /// Queue statistics at snapshot time
    pub stats: QueueStats,
}

/// Wholesale queue snapshot, rewritten on each persistence tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueue {
    /// All queue items in priority order
    pub items: Vec<QueueItem>,

    /// Snapshot metadata
    pub metadata: PersistedQueueMetadata,
}

/// Durable store for aggregated metric rows
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Upsert metric rows by window key
    async fn store_metrics(&self, records: &[MetricRecord]) -> Result<()>;

    /// Query stored rows
    async fn query_metrics(&self, query: &MetricsQuery) -> Result<Vec<MetricRecord>>;
}

/// Durable store for the serialized queue
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist the full queue snapshot
    async fn save_queue(&self, snapshot: &PersistedQueue) -> Result<()>;

    /// Load the last persisted snapshot, if any
    async fn load_queue(&self) -> Result<Option<PersistedQueue>>;
}

/// In-memory store implementing both persistence seams.
///
/// `fail_writes` simulates an unavailable backend so retry paths can be
/// exercised in tests.
#[derive(Default)]
pub struct InMemoryStorage {
    metrics: RwLock<HashMap<String, MetricRecord>>,
    queue: RwLock<Option<PersistedQueue>>,
    metric_writes: RwLock<u64>,
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated write failures
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of `store_metrics` calls that wrote at least one row
    pub fn metric_write_calls(&self) -> u64 {
        *self.metric_writes.read()
    }

    /// Number of distinct metric rows currently stored
    pub fn metric_row_count(&self) -> usize {
        self.metrics.read().len()
    }
}

#[async_trait]
impl MetricsStore for InMemoryStorage {
    async fn store_metrics(&self, records: &[MetricRecord]) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RealtimeError::storage_operation(
                "simulated write failure",
                "store_metrics",
            ));
        }
        if records.is_empty() {
            return Ok(());
        }

        let mut metrics = self.metrics.write();
        for record in records {
            metrics.insert(record.window_key(), record.clone());
        }
        *self.metric_writes.write() += 1;

        debug!("Stored {} metric rows", records.len());
        Ok(())
    }

    async fn query_metrics(&self, query: &MetricsQuery) -> Result<Vec<MetricRecord>> {
        let metrics = self.metrics.read();
        let mut rows: Vec<MetricRecord> = metrics
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        rows.sort_by_key(|record| record.window_start);
        Ok(rows)
    }
}

#[async_trait]
impl QueueStore for InMemoryStorage {
    async fn save_queue(&self, snapshot: &PersistedQueue) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RealtimeError::storage_operation(
                "simulated write failure",
                "save_queue",
            ));
        }
        *self.queue.write() = Some(snapshot.clone());
        debug!("Persisted queue snapshot of {} items", snapshot.items.len());
        Ok(())
    }

    async fn load_queue(&self) -> Result<Option<PersistedQueue>> {
        Ok(self.queue.read().clone())
    }
}
