//! # Aggregation Engine Module
//!
//! Streaming aggregation of raw telemetry events into fixed time-window
//! buckets, flushed periodically to durable storage. Ingestion failures go
//! to a bounded dead-letter list retried on its own schedule; a memory
//! watchdog emits a backpressure signal when process residency crosses the
//! configured watermark.
//!
//! Windows are half-open `[start, end)` intervals; a bucket becomes
//! flush-eligible only once its window has been closed for the configured
//! safety lag, leaving room for in-order-late events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::AggregationConfig;
use crate::error::{RealtimeError, Result};
use crate::events::{event_types, CommandStatus, Event, TelemetryPayload};
use crate::metrics::MetricsCollector;
use crate::storage::{MetricRecord, MetricsStore};
use crate::types::{AggregationStats, ComponentHealth, HealthStatus, RealtimeSignal};

/// Truncate a timestamp down to its window boundary
pub fn window_start(timestamp: DateTime<Utc>, window_minutes: u32) -> DateTime<Utc> {
    let window_seconds = window_minutes as i64 * 60;
    let seconds = timestamp.timestamp();
    let start = seconds - seconds.rem_euclid(window_seconds);
    DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(timestamp)
}

/// Exclusive end of the window containing `timestamp`
pub fn window_end(timestamp: DateTime<Utc>, window_minutes: u32) -> DateTime<Utc> {
    window_start(timestamp, window_minutes) + Duration::minutes(window_minutes as i64)
}

/// Key of one (organization, user, window-start) bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub organization_id: String,
    pub user_id: String,
    pub window_start: DateTime<Utc>,
}

/// Mutable accumulator for one bucket key and window size
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationBucket {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub organization_id: String,
    pub user_id: String,
    pub command_count: u64,
    pub agent_interactions: u64,
    pub total_execution_time_ms: u64,
    pub error_count: u64,
    pub agent_usage: HashMap<String, u64>,
    pub session_count: u64,
    pub productivity_scores: Vec<f64>,
    pub last_updated: DateTime<Utc>,
}

impl AggregationBucket {
    fn new(key: &BucketKey, window_minutes: u32) -> Self {
        Self {
            window_start: key.window_start,
            window_end: key.window_start + Duration::minutes(window_minutes as i64),
            organization_id: key.organization_id.clone(),
            user_id: key.user_id.clone(),
            command_count: 0,
            agent_interactions: 0,
            total_execution_time_ms: 0,
            error_count: 0,
            agent_usage: HashMap::new(),
            session_count: 0,
            productivity_scores: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    fn record_command(&mut self, status: CommandStatus, execution_time_ms: u64) {
        self.command_count += 1;
        self.total_execution_time_ms += execution_time_ms;
        if matches!(status, CommandStatus::Error | CommandStatus::Timeout) {
            self.error_count += 1;
        }
        self.last_updated = Utc::now();
    }

    fn record_agent_interaction(&mut self, agent_name: &str, duration_ms: Option<u64>) {
        self.agent_interactions += 1;
        *self.agent_usage.entry(agent_name.to_string()).or_insert(0) += 1;
        if let Some(duration) = duration_ms {
            self.total_execution_time_ms += duration;
        }
        self.last_updated = Utc::now();
    }

    fn record_session(&mut self) {
        self.session_count += 1;
        self.last_updated = Utc::now();
    }

    fn record_productivity(&mut self, score: f64) {
        self.productivity_scores.push(score);
        self.last_updated = Utc::now();
    }

    /// Whether the bucket's window closed before the cutoff
    fn is_flush_eligible(&self, cutoff: DateTime<Utc>) -> bool {
        self.window_end <= cutoff
    }

    /// Convert the bucket into one metric row
    fn to_metric_record(&self, window_minutes: u32) -> MetricRecord {
        let commands_per_hour = self.command_count as f64 * (60.0 / window_minutes as f64);
        let error_rate = if self.command_count > 0 {
            self.error_count as f64 / self.command_count as f64
        } else {
            0.0
        };
        let avg_execution_time_ms = if self.command_count > 0 {
            self.total_execution_time_ms as f64 / self.command_count as f64
        } else {
            0.0
        };
        let avg_productivity_score = if self.productivity_scores.is_empty() {
            None
        } else {
            Some(
                self.productivity_scores.iter().sum::<f64>()
                    / self.productivity_scores.len() as f64,
            )
        };

        MetricRecord {
            organization_id: self.organization_id.clone(),
            user_id: self.user_id.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
            window_minutes,
            command_count: self.command_count,
            commands_per_hour,
            error_count: self.error_count,
            error_rate,
            avg_execution_time_ms,
            agent_interactions: self.agent_interactions,
            agent_usage: self.agent_usage.clone(),
            session_count: self.session_count,
            avg_productivity_score,
            recorded_at: Utc::now(),
        }
    }
}

/// Event parked after a folding failure
#[derive(Debug, Clone)]
struct DeadLetterEntry {
    event: Event,
    error: String,
    timestamp: DateTime<Utc>,
    retries: u32,
}

#[derive(Default)]
struct AggregationCounters {
    ingested: AtomicU64,
    failures: AtomicU64,
    flushed: AtomicU64,
    rows_written: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

/// Streaming aggregation engine
#[derive(Clone)]
pub struct AggregationEngine {
    config: Arc<AggregationConfig>,
    store: Arc<dyn MetricsStore>,
    buckets: Arc<RwLock<HashMap<u32, HashMap<BucketKey, AggregationBucket>>>>,
    dead_letter: Arc<Mutex<VecDeque<DeadLetterEntry>>>,
    counters: Arc<AggregationCounters>,
    accepting: Arc<AtomicBool>,
    metrics: MetricsCollector,
    signals: broadcast::Sender<RealtimeSignal>,
    shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
    flush_guard: Arc<tokio::sync::Mutex<()>>,
    retry_guard: Arc<tokio::sync::Mutex<()>>,
}

impl AggregationEngine {
    /// Create a new engine over the given metrics store
    pub fn new(
        config: AggregationConfig,
        store: Arc<dyn MetricsStore>,
        metrics: MetricsCollector,
        signals: broadcast::Sender<RealtimeSignal>,
    ) -> Self {
        let mut windows = HashMap::new();
        for window in &config.window_minutes {
            windows.insert(*window, HashMap::new());
        }

        Self {
            config: Arc::new(config),
            store,
            buckets: Arc::new(RwLock::new(windows)),
            dead_letter: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::new(AggregationCounters::default()),
            accepting: Arc::new(AtomicBool::new(true)),
            metrics,
            signals,
            shutdown_tx: Arc::new(Mutex::new(None)),
            flush_guard: Arc::new(tokio::sync::Mutex::new(())),
            retry_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Start flush, dead-letter retry, and memory watchdog tickers
    pub async fn start(&self) -> Result<()> {
        info!("Starting Aggregation Engine");

        let (shutdown_tx, _) = broadcast::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx.clone());

        let engine = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let flush_every = StdDuration::from_secs(self.config.flush_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.run_flush_tick().await,
                    _ = shutdown_rx.recv() => {
                        debug!("Flush ticker received shutdown signal");
                        break;
                    }
                }
            }
        });

        let engine = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let retry_every = StdDuration::from_millis(self.config.retry_delay_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.run_retry_tick().await,
                    _ = shutdown_rx.recv() => {
                        debug!("Dead-letter ticker received shutdown signal");
                        break;
                    }
                }
            }
        });

        let engine = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let memory_every = StdDuration::from_secs(self.config.memory_check_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(memory_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.check_memory(),
                    _ = shutdown_rx.recv() => {
                        debug!("Memory watchdog received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop intake, cancel tickers, and flush everything synchronously
    pub async fn shutdown(&self) {
        info!("Stopping Aggregation Engine");
        self.accepting.store(false, Ordering::SeqCst);

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        // Final flush drains every bucket, open windows included; anything
        // left behind would be lost.
        if let Err(e) = self.flush_before(DateTime::<Utc>::MAX_UTC).await {
            warn!("Final aggregation flush failed: {}", e);
        }
    }

    /// Fold one telemetry event into every configured window.
    ///
    /// Field validation failures are rejected synchronously; folding
    /// failures park the event in the dead-letter list and still report
    /// failure so the caller can do its own logging.
    pub fn ingest(&self, event: &Event) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RealtimeError::internal("aggregation engine is shut down"));
        }

        self.validate(event)?;

        match self.fold_event(event) {
            Ok(()) => {
                self.counters.ingested.fetch_add(1, Ordering::Relaxed);
                self.metrics.telemetry_ingested_total.inc();
                self.update_bucket_gauge();
                Ok(())
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.ingest_failures_total.inc();
                self.push_dead_letter(event.clone(), e.to_string());
                Err(e)
            }
        }
    }

    /// Snapshot of all open buckets as metric rows, optionally scoped to
    /// one organization
    pub fn get_current_aggregations(&self, organization_id: Option<&str>) -> Vec<MetricRecord> {
        let buckets = self.buckets.read();
        let mut rows: Vec<MetricRecord> = buckets
            .iter()
            .flat_map(|(window, entries)| {
                entries
                    .values()
                    .filter(|bucket| match organization_id {
                        Some(org) => bucket.organization_id == org,
                        None => true,
                    })
                    .map(|bucket| bucket.to_metric_record(*window))
                    .collect::<Vec<_>>()
            })
            .collect();
        rows.sort_by_key(|row| (row.window_minutes, row.window_start));
        rows
    }

    /// Flush all currently eligible buckets; returns rows written
    pub async fn flush(&self) -> Result<usize> {
        self.flush_before(self.lag_cutoff(Utc::now())).await
    }

    /// Engine statistics snapshot
    pub fn get_stats(&self) -> AggregationStats {
        let open_buckets = {
            let buckets = self.buckets.read();
            buckets.values().map(|entries| entries.len() as u64).sum()
        };

        AggregationStats {
            events_ingested: self.counters.ingested.load(Ordering::Relaxed),
            ingest_failures: self.counters.failures.load(Ordering::Relaxed),
            open_buckets,
            buckets_flushed: self.counters.flushed.load(Ordering::Relaxed),
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            dead_letter_size: self.dead_letter.lock().len() as u64,
            dead_letter_retries: self.counters.retries.load(Ordering::Relaxed),
            dead_letter_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Perform a health check
    pub fn health_check(&self) -> ComponentHealth {
        let started = Instant::now();
        let stats = self.get_stats();

        let status = if stats.dead_letter_size as usize >= self.config.dead_letter_capacity {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ComponentHealth {
            component: "aggregation_engine".to_string(),
            status,
            last_check: Utc::now(),
            response_time_ms: started.elapsed().as_millis() as u64,
            details: HashMap::from([
                ("open_buckets".to_string(), stats.open_buckets.to_string()),
                (
                    "dead_letter_size".to_string(),
                    stats.dead_letter_size.to_string(),
                ),
            ]),
        }
    }

    fn validate(&self, event: &Event) -> Result<()> {
        if event.organization_id.is_empty() {
            return Err(RealtimeError::validation_field(
                "organization_id is required",
                "organization_id",
            ));
        }
        match &event.user_id {
            Some(user_id) if !user_id.is_empty() => {}
            _ => {
                return Err(RealtimeError::validation_field(
                    "user_id is required",
                    "user_id",
                ))
            }
        }
        match event.event_type.as_str() {
            event_types::COMMAND_EXECUTION
            | event_types::AGENT_INTERACTION
            | event_types::USER_SESSION
            | event_types::PRODUCTIVITY_METRIC => Ok(()),
            other => Err(RealtimeError::validation(format!(
                "no folding function for event type {}",
                other
            ))),
        }
    }

    /// Apply one event to its bucket in every configured window.
    ///
    /// The payload is checked against the event type before any bucket is
    /// touched, so a failed fold leaves no partial updates behind.
    fn fold_event(&self, event: &Event) -> Result<()> {
        enum FoldOp<'a> {
            Command(CommandStatus, u64),
            Agent(&'a str, Option<u64>),
            Session,
            Productivity(f64),
        }

        let op = match (&event.event_type[..], &event.payload) {
            (event_types::COMMAND_EXECUTION, TelemetryPayload::CommandExecution(p)) => {
                FoldOp::Command(p.status, p.execution_time_ms)
            }
            (event_types::AGENT_INTERACTION, TelemetryPayload::AgentInteraction(p)) => {
                FoldOp::Agent(&p.agent_name, p.duration_ms)
            }
            (event_types::USER_SESSION, TelemetryPayload::UserSession(_)) => FoldOp::Session,
            (event_types::PRODUCTIVITY_METRIC, TelemetryPayload::ProductivityMetric(p)) => {
                if !p.score.is_finite() {
                    return Err(RealtimeError::validation_field(
                        "productivity score must be finite",
                        "score",
                    ));
                }
                FoldOp::Productivity(p.score)
            }
            _ => {
                return Err(RealtimeError::validation(format!(
                    "payload does not match event type {}",
                    event.event_type
                )));
            }
        };

        let user_id = event.user_id.clone().unwrap_or_default();
        let timestamp = event.metadata.timestamp;

        let mut buckets = self.buckets.write();
        for (window, entries) in buckets.iter_mut() {
            let key = BucketKey {
                organization_id: event.organization_id.clone(),
                user_id: user_id.clone(),
                window_start: window_start(timestamp, *window),
            };
            let bucket = entries
                .entry(key.clone())
                .or_insert_with(|| AggregationBucket::new(&key, *window));

            match &op {
                FoldOp::Command(status, execution_time_ms) => {
                    bucket.record_command(*status, *execution_time_ms)
                }
                FoldOp::Agent(agent_name, duration_ms) => {
                    bucket.record_agent_interaction(agent_name, *duration_ms)
                }
                FoldOp::Session => bucket.record_session(),
                FoldOp::Productivity(score) => bucket.record_productivity(*score),
            }
        }

        Ok(())
    }

    fn push_dead_letter(&self, event: Event, error: String) {
        let mut overflowed: Option<DeadLetterEntry> = None;
        {
            let mut dead_letter = self.dead_letter.lock();
            if dead_letter.len() >= self.config.dead_letter_capacity {
                overflowed = dead_letter.pop_front();
            }
            dead_letter.push_back(DeadLetterEntry {
                event,
                error,
                timestamp: Utc::now(),
                retries: 0,
            });
            self.metrics.dead_letter_size.set(dead_letter.len() as i64);
        }

        if let Some(entry) = overflowed {
            warn!(
                "Dead-letter list full, dropping oldest event {}",
                entry.event.id
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.dead_letter_dropped_total.inc();
            let _ = self.signals.send(RealtimeSignal::DeadLetterDropped {
                event_id: entry.event.id,
                error: entry.error,
            });
        }
    }

    async fn run_flush_tick(&self) {
        // Skip the tick if the previous flush is still running.
        let Ok(_guard) = self.flush_guard.try_lock() else {
            return;
        };
        if let Err(e) = self.flush_before(self.lag_cutoff(Utc::now())).await {
            warn!("Aggregation flush failed, buckets retained: {}", e);
        }
    }

    /// Cutoff applying the configured safety lag to `now`
    fn lag_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.flush_lag_seconds as i64)
    }

    /// Flush every bucket whose window closed before `cutoff`.
    ///
    /// Writes are batched per window size; a failed batch leaves its
    /// buckets in place for the next tick. Storage upserts by window key
    /// keep a replayed flush idempotent.
    async fn flush_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let started = Instant::now();
        let windows: Vec<u32> = {
            let buckets = self.buckets.read();
            buckets.keys().copied().collect()
        };

        let mut total_rows = 0;
        let mut first_error: Option<RealtimeError> = None;

        for window in windows {
            // Copy eligible buckets out so no lock is held over the write.
            let eligible: Vec<(BucketKey, MetricRecord)> = {
                let buckets = self.buckets.read();
                buckets
                    .get(&window)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|(_, bucket)| bucket.is_flush_eligible(cutoff))
                            .map(|(key, bucket)| (key.clone(), bucket.to_metric_record(window)))
                            .collect()
                    })
                    .unwrap_or_default()
            };

            if eligible.is_empty() {
                continue;
            }

            let records: Vec<MetricRecord> =
                eligible.iter().map(|(_, record)| record.clone()).collect();

            match self.store.store_metrics(&records).await {
                Ok(()) => {
                    let mut buckets = self.buckets.write();
                    if let Some(entries) = buckets.get_mut(&window) {
                        for (key, _) in &eligible {
                            entries.remove(key);
                        }
                    }
                    drop(buckets);

                    total_rows += records.len();
                    self.counters
                        .flushed
                        .fetch_add(eligible.len() as u64, Ordering::Relaxed);
                    self.counters
                        .rows_written
                        .fetch_add(records.len() as u64, Ordering::Relaxed);
                    self.metrics
                        .buckets_flushed_total
                        .inc_by(eligible.len() as u64);
                    self.metrics
                        .metric_rows_written_total
                        .inc_by(records.len() as u64);

                    debug!(
                        "Flushed {} buckets for the {}-minute window",
                        eligible.len(),
                        window
                    );
                }
                Err(e) => {
                    warn!(
                        "Flush of {} buckets for the {}-minute window failed: {}",
                        eligible.len(),
                        window,
                        e
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        self.update_bucket_gauge();
        self.metrics
            .flush_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match first_error {
            Some(e) if total_rows == 0 => Err(e),
            _ => Ok(total_rows),
        }
    }

    async fn run_retry_tick(&self) {
        let Ok(_guard) = self.retry_guard.try_lock() else {
            return;
        };

        let now = Utc::now();
        let min_age = Duration::milliseconds(self.config.retry_delay_ms as i64);

        // Drain due entries under the lock, retry them without it.
        let due: Vec<DeadLetterEntry> = {
            let mut dead_letter = self.dead_letter.lock();
            let mut due = Vec::new();
            let mut keep = VecDeque::with_capacity(dead_letter.len());
            while let Some(entry) = dead_letter.pop_front() {
                if now - entry.timestamp >= min_age {
                    due.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *dead_letter = keep;
            due
        };

        if due.is_empty() {
            return;
        }

        let mut requeue = Vec::new();
        for mut entry in due {
            self.counters.retries.fetch_add(1, Ordering::Relaxed);

            match self.fold_event(&entry.event) {
                Ok(()) => {
                    debug!("Dead-letter retry succeeded for event {}", entry.event.id);
                    self.counters.ingested.fetch_add(1, Ordering::Relaxed);
                    self.metrics.telemetry_ingested_total.inc();
                }
                Err(e) => {
                    entry.retries += 1;
                    entry.timestamp = now;
                    entry.error = e.to_string();

                    if entry.retries >= self.config.max_retries {
                        warn!(
                            "Dropping event {} after {} dead-letter retries: {}",
                            entry.event.id, entry.retries, entry.error
                        );
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        self.metrics.dead_letter_dropped_total.inc();
                        let _ = self.signals.send(RealtimeSignal::DeadLetterDropped {
                            event_id: entry.event.id,
                            error: entry.error,
                        });
                    } else {
                        requeue.push(entry);
                    }
                }
            }
        }

        let mut dead_letter = self.dead_letter.lock();
        dead_letter.extend(requeue);
        self.metrics.dead_letter_size.set(dead_letter.len() as i64);
    }

    fn check_memory(&self) {
        let Some(bytes) = self.metrics.resident_memory_bytes() else {
            return;
        };
        let used_mb = bytes / (1024 * 1024);
        let threshold_mb =
            (self.config.max_memory_usage_mb as f64 * self.config.memory_high_watermark) as u64;

        if used_mb >= threshold_mb {
            warn!(
                "Memory high watermark crossed: {} MB used of {} MB budget",
                used_mb, self.config.max_memory_usage_mb
            );
            let _ = self.signals.send(RealtimeSignal::HighMemory {
                used_mb,
                limit_mb: self.config.max_memory_usage_mb,
            });
        }
    }

    fn update_bucket_gauge(&self) {
        let open = {
            let buckets = self.buckets.read();
            buckets.values().map(|entries| entries.len()).sum::<usize>()
        };
        self.metrics.open_buckets.set(open as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{
        AgentInteractionPayload, CommandExecutionPayload, SessionAction, UserSessionPayload,
    };
    use crate::storage::{InMemoryStorage, MetricsQuery};
    use chrono::TimeZone;

    fn test_engine() -> (AggregationEngine, Arc<InMemoryStorage>) {
        test_engine_with_config(AggregationConfig::default())
    }

    fn test_engine_with_config(
        config: AggregationConfig,
    ) -> (AggregationEngine, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = MetricsCollector::new(&Config::default()).unwrap();
        let (signals, _) = broadcast::channel(16);
        let engine = AggregationEngine::new(config, storage.clone(), metrics, signals);
        (engine, storage)
    }

    fn command_event(status: CommandStatus, at: DateTime<Utc>) -> Event {
        Event::command_execution(
            "org-a",
            "user-u",
            CommandExecutionPayload {
                command: "test".to_string(),
                status,
                execution_time_ms: 100,
                exit_code: None,
            },
        )
        .with_timestamp(at)
    }

    #[test]
    fn test_window_math() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 10, 7, 33).unwrap();

        let start = window_start(ts, 5);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 14, 10, 5, 0).unwrap());
        let end = window_end(ts, 5);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 14, 10, 10, 0).unwrap());

        // Half-open containment and exact length for a spread of inputs.
        for window in [1u32, 5, 15, 60] {
            let start = window_start(ts, window);
            let end = window_end(ts, window);
            assert!(start <= ts && ts < end);
            assert_eq!(end - start, Duration::minutes(window as i64));
        }

        assert_eq!(
            window_start(ts, 60),
            Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_ingest_rejects_missing_fields() {
        let (engine, _) = test_engine();

        let mut event = command_event(CommandStatus::Success, Utc::now());
        event.user_id = None;
        assert!(matches!(
            engine.ingest(&event),
            Err(RealtimeError::Validation { .. })
        ));

        let unroutable = Event::new("custom_ping", "org-a", TelemetryPayload::Custom(
            serde_json::json!({}),
        ))
        .with_user("user-u");
        assert!(matches!(
            engine.ingest(&unroutable),
            Err(RealtimeError::Validation { .. })
        ));

        // Neither reached the dead-letter list: these are synchronous
        // rejections, not folding failures.
        assert_eq!(engine.get_stats().dead_letter_size, 0);
    }

    #[tokio::test]
    async fn test_command_rollup() {
        let (engine, storage) = test_engine();
        let base = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();

        for i in 0..10 {
            let status = if i < 2 {
                CommandStatus::Error
            } else {
                CommandStatus::Success
            };
            engine
                .ingest(&command_event(status, base + Duration::seconds(i)))
                .unwrap();
        }

        // All events landed in one 1-minute window; flush well past the lag.
        let cutoff = base + Duration::hours(2);
        let rows = engine.flush_before(cutoff).await.unwrap();
        assert!(rows >= 1);

        let stored = storage
            .query_metrics(&MetricsQuery {
                window_minutes: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        let row = &stored[0];
        assert_eq!(row.command_count, 10);
        assert_eq!(row.error_count, 2);
        assert!((row.error_rate - 0.2).abs() < f64::EPSILON);
        assert!((row.commands_per_hour - 600.0).abs() < f64::EPSILON);
        assert!((row.avg_execution_time_ms - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_flush_is_idempotent_by_construction() {
        let (engine, storage) = test_engine();
        let base = Utc::now() - Duration::hours(3);

        engine
            .ingest(&command_event(CommandStatus::Success, base))
            .unwrap();

        let cutoff = Utc::now() - Duration::seconds(60);
        let first = engine.flush_before(cutoff).await.unwrap();
        assert!(first > 0);
        let calls_after_first = storage.metric_write_calls();

        // A second pass with no new events writes nothing.
        let second = engine.flush_before(cutoff).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(storage.metric_write_calls(), calls_after_first);
        assert_eq!(engine.get_stats().open_buckets, 0);
    }

    #[tokio::test]
    async fn test_flush_lag_retains_recent_windows() {
        let (engine, _) = test_engine();
        let now = Utc::now();

        // Window just closed; still inside the safety lag.
        engine
            .ingest(&command_event(
                CommandStatus::Success,
                now - Duration::seconds(61),
            ))
            .unwrap();

        let rows = engine
            .flush_before(now - Duration::seconds(3600))
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert!(engine.get_stats().open_buckets > 0);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_buckets() {
        let (engine, storage) = test_engine();
        let base = Utc::now() - Duration::hours(3);

        engine
            .ingest(&command_event(CommandStatus::Success, base))
            .unwrap();
        let open_before = engine.get_stats().open_buckets;

        storage.set_fail_writes(true);
        let result = engine.flush_before(Utc::now() - Duration::seconds(60)).await;
        assert!(result.is_err());
        assert_eq!(engine.get_stats().open_buckets, open_before);

        // Next tick succeeds and drains them.
        storage.set_fail_writes(false);
        engine
            .flush_before(Utc::now() - Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(engine.get_stats().open_buckets, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_windows() {
        let (engine, storage) = test_engine();

        // Event in the current, still-open window.
        engine
            .ingest(&command_event(CommandStatus::Success, Utc::now()))
            .unwrap();

        engine.shutdown().await;
        assert_eq!(engine.get_stats().open_buckets, 0);
        assert!(storage.metric_row_count() > 0);

        // Intake is off after shutdown.
        assert!(engine
            .ingest(&command_event(CommandStatus::Success, Utc::now()))
            .is_err());
    }

    #[test]
    fn test_mismatched_payload_goes_to_dead_letter() {
        let (engine, _) = test_engine();

        let mut event = command_event(CommandStatus::Success, Utc::now());
        event.payload = TelemetryPayload::Custom(serde_json::json!({"raw": true}));

        assert!(engine.ingest(&event).is_err());
        let stats = engine.get_stats();
        assert_eq!(stats.dead_letter_size, 1);
        assert_eq!(stats.ingest_failures, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_retry_drops_after_max_retries() {
        let (engine, _) = test_engine_with_config(AggregationConfig {
            retry_delay_ms: 0,
            max_retries: 2,
            ..Default::default()
        });

        let mut event = command_event(CommandStatus::Success, Utc::now());
        event.payload = TelemetryPayload::Custom(serde_json::json!({}));
        let _ = engine.ingest(&event);

        // First retry fails and requeues, second drops permanently.
        engine.run_retry_tick().await;
        assert_eq!(engine.get_stats().dead_letter_size, 1);

        engine.run_retry_tick().await;
        let stats = engine.get_stats();
        assert_eq!(stats.dead_letter_size, 0);
        assert_eq!(stats.dead_letter_dropped, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_retry_can_succeed() {
        // An event whose folding initially failed will succeed on retry if
        // the payload was transiently malformed; emulate by swapping the
        // entry's event before the retry tick.
        let (engine, _) = test_engine_with_config(AggregationConfig {
            retry_delay_ms: 0,
            ..Default::default()
        });

        let mut broken = command_event(CommandStatus::Success, Utc::now());
        broken.payload = TelemetryPayload::Custom(serde_json::json!({}));
        let _ = engine.ingest(&broken);

        {
            let mut dead_letter = engine.dead_letter.lock();
            let entry = dead_letter.front_mut().unwrap();
            entry.event = command_event(CommandStatus::Success, Utc::now());
        }

        engine.run_retry_tick().await;
        let stats = engine.get_stats();
        assert_eq!(stats.dead_letter_size, 0);
        assert_eq!(stats.dead_letter_dropped, 0);
        assert!(engine.get_stats().open_buckets > 0);
    }

    #[test]
    fn test_dead_letter_capacity_bound() {
        let (engine, _) = test_engine_with_config(AggregationConfig {
            dead_letter_capacity: 2,
            ..Default::default()
        });

        for _ in 0..4 {
            let mut event = command_event(CommandStatus::Success, Utc::now());
            event.payload = TelemetryPayload::Custom(serde_json::json!({}));
            let _ = engine.ingest(&event);
        }

        let stats = engine.get_stats();
        assert_eq!(stats.dead_letter_size, 2);
        assert_eq!(stats.dead_letter_dropped, 2);
    }

    #[test]
    fn test_get_current_aggregations_scoping() {
        let (engine, _) = test_engine();
        let now = Utc::now();

        engine
            .ingest(&command_event(CommandStatus::Success, now))
            .unwrap();
        engine
            .ingest(
                &Event::agent_interaction(
                    "org-b",
                    "user-v",
                    AgentInteractionPayload {
                        agent_name: "planner".to_string(),
                        action: "prompt".to_string(),
                        duration_ms: None,
                    },
                )
                .with_timestamp(now),
            )
            .unwrap();

        let all = engine.get_current_aggregations(None);
        // One bucket per configured window per (org, user).
        assert_eq!(all.len(), 8);

        let org_a = engine.get_current_aggregations(Some("org-a"));
        assert_eq!(org_a.len(), 4);
        assert!(org_a.iter().all(|row| row.organization_id == "org-a"));
    }

    #[test]
    fn test_session_and_productivity_folding() {
        let (engine, _) = test_engine();
        let now = Utc::now();

        engine
            .ingest(
                &Event::user_session(
                    "org-a",
                    "user-u",
                    UserSessionPayload {
                        session_id: "s-1".to_string(),
                        action: SessionAction::Started,
                        duration_ms: None,
                    },
                )
                .with_timestamp(now),
            )
            .unwrap();
        engine
            .ingest(&Event::productivity_metric("org-a", "user-u", 80.0).with_timestamp(now))
            .unwrap();
        engine
            .ingest(&Event::productivity_metric("org-a", "user-u", 60.0).with_timestamp(now))
            .unwrap();

        let rows = engine.get_current_aggregations(Some("org-a"));
        let one_minute = rows.iter().find(|row| row.window_minutes == 1).unwrap();
        assert_eq!(one_minute.session_count, 1);
        assert_eq!(one_minute.avg_productivity_score, Some(70.0));
    }
}
