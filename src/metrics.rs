//! # Metrics Collection Module
//!
//! Prometheus metrics for the realtime core service. One collector instance
//! is shared by the bus, the aggregation engine, and the queue; the
//! aggregation engine's memory watchdog also reads process residency
//! through it.

use std::sync::Arc;

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::info;

use crate::config::Config;
use crate::error::Result;

/// Metrics collector for the realtime core service
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Event bus metrics
    pub events_published_total: IntCounter,
    pub events_delivered_total: IntCounter,
    pub batches_delivered_total: IntCounter,
    pub replays_served_total: IntCounter,
    pub transport_failures_total: IntCounter,
    pub dropped_deliveries_total: IntCounter,
    pub active_subscriptions: IntGauge,
    pub dispatch_duration_seconds: Histogram,

    // Aggregation metrics
    pub telemetry_ingested_total: IntCounter,
    pub ingest_failures_total: IntCounter,
    pub open_buckets: IntGauge,
    pub buckets_flushed_total: IntCounter,
    pub metric_rows_written_total: IntCounter,
    pub dead_letter_size: IntGauge,
    pub dead_letter_dropped_total: IntCounter,
    pub flush_duration_seconds: Histogram,

    // Queue metrics
    pub queue_enqueued_total: IntCounter,
    pub queue_processed_total: IntCounter,
    pub queue_failed_marks_total: IntCounter,
    pub queue_dropped_total: IntCounter,
    pub queue_size: IntGauge,
    pub queue_persist_duration_seconds: Histogram,

    // System metrics
    pub memory_usage_bytes: Gauge,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    ///
    /// When `monitoring.metrics_enabled` is false, metrics are still usable
    /// but nothing is registered, so `export` renders empty output.
    pub fn new(config: &Config) -> Result<Self> {
        info!("Initializing Metrics Collector");

        let registry = Registry::new();
        let namespace = config.monitoring.namespace.clone();
        let enabled = config.monitoring.metrics_enabled;

        let register = |collector: Box<dyn prometheus::core::Collector>| -> Result<()> {
            if enabled {
                registry.register(collector)?;
            }
            Ok(())
        };

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace.clone()))?;
            register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(namespace.clone()))?;
            register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let histogram =
                Histogram::with_opts(HistogramOpts::new(name, help).namespace(namespace.clone()))?;
            register(Box::new(histogram.clone()))?;
            Ok(histogram)
        };

        let events_published_total = counter(
            "events_published_total",
            "Total number of events accepted by the bus",
        )?;
        let events_delivered_total = counter(
            "events_delivered_total",
            "Total number of events handed to consumer connections",
        )?;
        let batches_delivered_total = counter(
            "batches_delivered_total",
            "Total number of batches flushed to connections",
        )?;
        let replays_served_total = counter(
            "replays_served_total",
            "Total number of replay batches served from history",
        )?;
        let transport_failures_total = counter(
            "transport_failures_total",
            "Total number of transport publish failures absorbed",
        )?;
        let dropped_deliveries_total = counter(
            "dropped_deliveries_total",
            "Total number of deliveries dropped on full consumer channels",
        )?;
        let active_subscriptions = gauge("active_subscriptions", "Number of live subscriptions")?;
        let dispatch_duration_seconds = histogram(
            "dispatch_duration_seconds",
            "Time spent matching and routing one event",
        )?;

        let telemetry_ingested_total = counter(
            "telemetry_ingested_total",
            "Total number of telemetry events folded into buckets",
        )?;
        let ingest_failures_total = counter(
            "ingest_failures_total",
            "Total number of failed ingest calls",
        )?;
        let open_buckets = gauge("open_buckets", "Open aggregation buckets")?;
        let buckets_flushed_total = counter(
            "buckets_flushed_total",
            "Total number of buckets flushed to storage",
        )?;
        let metric_rows_written_total = counter(
            "metric_rows_written_total",
            "Total number of metric rows written",
        )?;
        let dead_letter_size = gauge("dead_letter_size", "Events parked in the dead-letter list")?;
        let dead_letter_dropped_total = counter(
            "dead_letter_dropped_total",
            "Total number of dead-letter events dropped permanently",
        )?;
        let flush_duration_seconds = histogram(
            "flush_duration_seconds",
            "Time spent in one aggregation flush pass",
        )?;

        let queue_enqueued_total = counter(
            "queue_enqueued_total",
            "Total number of items accepted by the durable queue",
        )?;
        let queue_processed_total = counter(
            "queue_processed_total",
            "Total number of queue items completed",
        )?;
        let queue_failed_marks_total = counter(
            "queue_failed_marks_total",
            "Total number of failure marks recorded on queue items",
        )?;
        let queue_dropped_total = counter(
            "queue_dropped_total",
            "Total number of queue items dropped by expiry or reclamation",
        )?;
        let queue_size = gauge("queue_size", "Items currently in the durable queue")?;
        let queue_persist_duration_seconds = histogram(
            "queue_persist_duration_seconds",
            "Time spent persisting one queue snapshot",
        )?;

        let memory_usage_bytes = Gauge::with_opts(
            Opts::new("memory_usage_bytes", "Sampled resident memory")
                .namespace(namespace.clone()),
        )?;
        register(Box::new(memory_usage_bytes.clone()))?;

        #[cfg(target_os = "linux")]
        if enabled {
            registry.register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))?;
        }

        Ok(Self {
            registry: Arc::new(registry),
            events_published_total,
            events_delivered_total,
            batches_delivered_total,
            replays_served_total,
            transport_failures_total,
            dropped_deliveries_total,
            active_subscriptions,
            dispatch_duration_seconds,
            telemetry_ingested_total,
            ingest_failures_total,
            open_buckets,
            buckets_flushed_total,
            metric_rows_written_total,
            dead_letter_size,
            dead_letter_dropped_total,
            flush_duration_seconds,
            queue_enqueued_total,
            queue_processed_total,
            queue_failed_marks_total,
            queue_dropped_total,
            queue_size,
            queue_persist_duration_seconds,
            memory_usage_bytes,
        })
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::RealtimeError::internal(format!("metrics encoding: {}", e)))
    }

    /// Current process resident memory, when the platform exposes it.
    ///
    /// Backed by the prometheus process collector; returns `None` on
    /// platforms without one and records the sample on the memory gauge
    /// otherwise.
    pub fn resident_memory_bytes(&self) -> Option<u64> {
        let families = self.registry.gather();
        let bytes = families
            .iter()
            .find(|family| family.get_name() == "process_resident_memory_bytes")
            .and_then(|family| family.get_metric().first().map(|m| m.get_gauge().get_value()))
            .map(|value| value as u64);

        if let Some(bytes) = bytes {
            self.memory_usage_bytes.set(bytes as f64);
        }
        bytes
    }
}
