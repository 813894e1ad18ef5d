//! # Realtime Core Service
//!
//! The real-time event distribution and metrics-aggregation core of the
//! Pulse monitoring platform:
//! - Organization-scoped pub/sub event bus with filtering, batching, and
//!   history replay
//! - Streaming aggregation of telemetry events into fixed time-window
//!   buckets with periodic flush and dead-letter retry
//! - Durable, priority-ordered sync queue with exponential-backoff retry
//!
//! Persistence, the pub/sub transport, and authorization are external
//! collaborators behind the `storage`, `transport`, and `access` seams;
//! in-memory implementations are provided for tests and single-process
//! deployments.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

pub mod access;
pub mod aggregation;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export main types and traits
pub use access::{AccessControl, PermissiveAccess, StaticAccess};
pub use aggregation::AggregationEngine;
pub use bus::EventBus;
pub use config::Config;
pub use error::{RealtimeError, Result};
pub use events::{Event, EventMetadata, EventPriority, TelemetryPayload};
pub use metrics::MetricsCollector;
pub use queue::{QueuePriority, SyncQueue};
pub use storage::{InMemoryStorage, MetricsStore, QueueStore};
pub use transport::{InMemoryTransport, PubSubTransport};
pub use types::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "realtime-core-service";

/// Capacity of the observer signal channel
const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// Main realtime core facade wiring the three components together
pub struct RealtimeCore {
    config: Config,
    metrics: MetricsCollector,
    signals: broadcast::Sender<RealtimeSignal>,
    bus: EventBus,
    aggregation: AggregationEngine,
    queue: SyncQueue,
}

impl RealtimeCore {
    /// Create a new realtime core over the given collaborators
    pub fn new(
        config: Config,
        transport: Arc<dyn PubSubTransport>,
        access: Arc<dyn AccessControl>,
        metrics_store: Arc<dyn MetricsStore>,
        queue_store: Arc<dyn QueueStore>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = MetricsCollector::new(&config)?;
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);

        let bus = EventBus::new(
            config.bus.clone(),
            transport,
            access,
            metrics.clone(),
            signals.clone(),
        );
        let aggregation = AggregationEngine::new(
            config.aggregation.clone(),
            metrics_store,
            metrics.clone(),
            signals.clone(),
        );
        let queue = SyncQueue::new(
            config.queue.clone(),
            queue_store,
            metrics.clone(),
            signals.clone(),
        );

        Ok(Self {
            config,
            metrics,
            signals,
            bus,
            aggregation,
            queue,
        })
    }

    /// Create a core wired entirely to in-process collaborators
    pub fn in_memory(config: Config) -> Result<Self> {
        let storage = Arc::new(InMemoryStorage::new());
        Self::new(
            config,
            InMemoryTransport::new(1024),
            Arc::new(PermissiveAccess),
            storage.clone(),
            storage,
        )
    }

    /// Start all components: queue reload first, then the tickers
    pub async fn start(&self) -> Result<()> {
        info!("Starting {} v{}", SERVICE_NAME, VERSION);

        self.queue.load().await?;
        self.queue.start().await?;
        self.aggregation.start().await?;
        self.bus.start().await?;

        info!("{} started", SERVICE_NAME);
        Ok(())
    }

    /// Stop all components: intake first, then flush/persist, then timers
    pub async fn stop(&self) {
        info!("Stopping {}", SERVICE_NAME);

        self.bus.shutdown().await;
        self.aggregation.shutdown().await;
        self.queue.shutdown().await;

        info!("{} stopped", SERVICE_NAME);
    }

    /// Subscribe to observer signals
    pub fn signals(&self) -> broadcast::Receiver<RealtimeSignal> {
        self.signals.subscribe()
    }

    /// The event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The aggregation engine
    pub fn aggregation(&self) -> &AggregationEngine {
        &self.aggregation
    }

    /// The durable sync queue
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// The shared metrics collector
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Aggregate service health across all components
    pub fn health(&self) -> serde_json::Value {
        let components = vec![
            self.bus.health_check(),
            self.aggregation.health_check(),
            self.queue.health_check(),
        ];

        let overall = components
            .iter()
            .map(|component| component.status)
            .fold(HealthStatus::Healthy, |acc, status| match (acc, status) {
                (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => {
                    HealthStatus::Unhealthy
                }
                (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => {
                    HealthStatus::Degraded
                }
                (HealthStatus::Unknown, _) | (_, HealthStatus::Unknown) => HealthStatus::Unknown,
                _ => HealthStatus::Healthy,
            });

        serde_json::json!({
            "service": SERVICE_NAME,
            "version": VERSION,
            "status": overall,
            "components": components,
        })
    }
}
