//! # Event Bus Module
//!
//! Organization-scoped publish/subscribe with filter matching, batching,
//! and history replay. Producers publish fire-and-forget; dispatch runs
//! once per event received off the transport (self-published events
//! included), matches live subscriptions, and hands deliveries to bounded
//! per-connection channels so a slow consumer never stalls the producers.
//!
//! Reliability for business-critical delivery is layered on top via the
//! durable queue, not built into the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::access::AccessControl;
use crate::config::EventBusConfig;
use crate::error::{RealtimeError, Result};
use crate::events::Event;
use crate::history::EventHistory;
use crate::metrics::MetricsCollector;
use crate::transport::{organization_wildcard, typed_channel, PubSubTransport, TransportMessage};
use crate::types::{
    BusStats, ComponentHealth, EventBatch, HealthStatus, RealtimeSignal, Subscription,
    SubscriptionFilter, SubscriptionSpec,
};

struct ConnectionHandle {
    sender: mpsc::Sender<EventBatch>,
    opened_at: DateTime<Utc>,
}

struct PendingBatch {
    events: Vec<Event>,
    opened_at: Instant,
}

/// Pending batches are keyed per (connection, organization) so a connection
/// subscribed across organizations never receives a mixed batch.
type PendingKey = (String, String);

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    batches: AtomicU64,
    replays: AtomicU64,
    transport_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Organization-scoped pub/sub event bus
#[derive(Clone)]
pub struct EventBus {
    config: Arc<EventBusConfig>,
    transport: Arc<dyn PubSubTransport>,
    access: Arc<dyn AccessControl>,
    history: Arc<EventHistory>,
    subscriptions: Arc<DashMap<Uuid, Subscription>>,
    connections: Arc<DashMap<String, ConnectionHandle>>,
    pending: Arc<Mutex<HashMap<PendingKey, PendingBatch>>>,
    counters: Arc<BusCounters>,
    accepting: Arc<AtomicBool>,
    metrics: MetricsCollector,
    signals: broadcast::Sender<RealtimeSignal>,
    shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
    cleanup_guard: Arc<tokio::sync::Mutex<()>>,
}

impl EventBus {
    /// Create a new bus over the given transport and authorization check
    pub fn new(
        config: EventBusConfig,
        transport: Arc<dyn PubSubTransport>,
        access: Arc<dyn AccessControl>,
        metrics: MetricsCollector,
        signals: broadcast::Sender<RealtimeSignal>,
    ) -> Self {
        let history = Arc::new(EventHistory::new(&config));
        Self {
            config: Arc::new(config),
            transport,
            access,
            history,
            subscriptions: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(BusCounters::default()),
            accepting: Arc::new(AtomicBool::new(true)),
            metrics,
            signals,
            shutdown_tx: Arc::new(Mutex::new(None)),
            cleanup_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Start the dispatch loop, batch flusher, and cleanup ticker
    pub async fn start(&self) -> Result<()> {
        info!("Starting Event Bus");

        let (shutdown_tx, _) = broadcast::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx.clone());

        // One transport subscription covers every organization; filter
        // matching is re-checked per event during dispatch.
        let mut transport_rx = self.transport.subscribe("events:*").await?;
        let bus = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = transport_rx.recv() => match message {
                        Some(message) => bus.handle_transport_message(message),
                        None => {
                            debug!("Transport subscription closed, dispatch loop ending");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        debug!("Dispatch loop received shutdown signal");
                        break;
                    }
                }
            }
        });

        let bus = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let flush_every = StdDuration::from_millis((self.config.batch_interval_ms / 4).max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bus.flush_pending(false),
                    _ = shutdown_rx.recv() => {
                        debug!("Batch flusher received shutdown signal");
                        break;
                    }
                }
            }
        });

        let bus = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let cleanup_every = StdDuration::from_secs(self.config.cleanup_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bus.run_cleanup_tick().await,
                    _ = shutdown_rx.recv() => {
                        debug!("Bus cleanup ticker received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop intake, flush pending batches, and cancel all tickers
    pub async fn shutdown(&self) {
        info!("Stopping Event Bus");
        self.accepting.store(false, Ordering::SeqCst);

        self.flush_pending(true);

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Register a consumer connection and obtain its delivery channel.
    ///
    /// Re-registering an id replaces the previous channel; its receiver
    /// observes a close.
    pub fn register_connection(&self, connection_id: &str) -> mpsc::Receiver<EventBatch> {
        let (sender, receiver) = mpsc::channel(self.config.connection_buffer);
        self.connections.insert(
            connection_id.to_string(),
            ConnectionHandle {
                sender,
                opened_at: Utc::now(),
            },
        );
        debug!("Registered connection {}", connection_id);
        receiver
    }

    /// Drop a consumer connection and everything attached to it
    pub fn unregister_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        self.pending
            .lock()
            .retain(|(conn, _), _| conn.as_str() != connection_id);

        let stale: Vec<Uuid> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| entry.id)
            .collect();
        for id in &stale {
            self.subscriptions.remove(id);
        }
        if !stale.is_empty() {
            debug!(
                "Removed {} subscriptions for connection {}",
                stale.len(),
                connection_id
            );
        }
        self.metrics
            .active_subscriptions
            .set(self.subscriptions.len() as i64);
    }

    /// Accept one event onto the bus.
    ///
    /// The call succeeds once the event is archived and handed to the
    /// transport; transport failures are absorbed into metrics and logs.
    pub async fn publish(&self, event: Event) -> Result<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RealtimeError::internal("event bus is shut down"));
        }
        if event.organization_id.is_empty() {
            return Err(RealtimeError::validation_field(
                "organization_id is required",
                "organization_id",
            ));
        }
        if event.event_type.is_empty() {
            return Err(RealtimeError::validation_field(
                "event_type is required",
                "event_type",
            ));
        }

        let event_id = event.id;

        // Archive before the transport sees the event so a publish failure
        // cannot lose a replay-eligible event.
        if event.metadata.replay {
            self.history.append(&event);
        }

        let channel = typed_channel(&event.organization_id, &event.event_type);
        let payload = Bytes::from(serde_json::to_vec(&event)?);
        match self.transport.publish(&channel, payload).await {
            Ok(()) => {}
            Err(e) => {
                self.counters
                    .transport_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics.transport_failures_total.inc();
                warn!("Transport publish on {} failed: {}", channel, e);
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.metrics.events_published_total.inc();
        let _ = self.signals.send(RealtimeSignal::EventPublished {
            event_id,
            organization_id: event.organization_id.clone(),
            event_type: event.event_type.clone(),
        });

        Ok(event_id)
    }

    /// Publish a batch of events, capturing per-event outcomes
    pub async fn publish_batch(&self, events: Vec<Event>) -> Vec<Result<Uuid>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.publish(event).await);
        }
        outcomes
    }

    /// Create a subscription for the caller.
    ///
    /// Fails with `PermissionDenied` when the authorization collaborator
    /// rejects the organization. A filter carrying a time range or user id
    /// triggers an immediate history replay to the connection.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<Uuid> {
        spec.validate()
            .map_err(|e| RealtimeError::validation(e.to_string()))?;

        if !self
            .access
            .may_access(&spec.user_id, &spec.organization_id)
            .await?
        {
            return Err(RealtimeError::permission_denied(
                spec.user_id.clone(),
                spec.organization_id.clone(),
            ));
        }

        // Channel derivation is an optimization hint for sharded
        // transports; matching is still re-checked per event.
        let mut channels = vec![organization_wildcard(&spec.organization_id)];
        if let Some(types) = &spec.filters.event_types {
            for event_type in types {
                channels.push(typed_channel(&spec.organization_id, event_type));
            }
        }

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            organization_id: spec.organization_id.clone(),
            user_id: spec.user_id.clone(),
            user_role: spec.user_role,
            connection_id: spec.connection_id.clone(),
            filters: spec.filters.clone(),
            channels,
            subscribed_at: now,
            last_activity: now,
            acknowledged: Default::default(),
        };
        let subscription_id = subscription.id;

        self.subscriptions.insert(subscription_id, subscription);
        self.metrics
            .active_subscriptions
            .set(self.subscriptions.len() as i64);
        debug!(
            "Subscription {} created for user {} on {}",
            subscription_id, spec.user_id, spec.organization_id
        );

        if spec.filters.wants_replay() {
            let events = self.history.query(
                &spec.organization_id,
                &spec.filters,
                self.config.default_replay_limit,
            );
            if !events.is_empty() {
                let batch = EventBatch::replay(spec.organization_id.clone(), events);
                self.send_to_connection(&spec.connection_id, batch);
                self.counters.replays.fetch_add(1, Ordering::Relaxed);
                self.metrics.replays_served_total.inc();
            }
        }

        Ok(subscription_id)
    }

    /// Remove a subscription. Removing an unknown id is a logged no-op.
    pub fn unsubscribe(&self, subscription_id: Uuid) {
        match self.subscriptions.remove(&subscription_id) {
            Some(_) => {
                debug!("Subscription {} removed", subscription_id);
                self.metrics
                    .active_subscriptions
                    .set(self.subscriptions.len() as i64);
            }
            None => debug!("Unsubscribe for unknown subscription {}", subscription_id),
        }
    }

    /// Record consumer acknowledgements and refresh subscription activity
    pub fn acknowledge(&self, subscription_id: Uuid, event_ids: &[Uuid]) -> Result<usize> {
        match self.subscriptions.get_mut(&subscription_id) {
            Some(mut subscription) => {
                let before = subscription.acknowledged.len();
                subscription.acknowledged.extend(event_ids.iter().copied());
                subscription.touch();
                Ok(subscription.acknowledged.len() - before)
            }
            None => {
                debug!("Acknowledge for unknown subscription {}", subscription_id);
                Ok(0)
            }
        }
    }

    /// Read history for an organization, newest first.
    ///
    /// The same filter predicate as live dispatch applies; results are
    /// truncated to `limit`.
    pub async fn get_history(
        &self,
        organization_id: &str,
        requested_by: &str,
        filter: &SubscriptionFilter,
        limit: usize,
    ) -> Result<Vec<Event>> {
        if !self.access.may_access(requested_by, organization_id).await? {
            return Err(RealtimeError::permission_denied(
                requested_by.to_string(),
                organization_id.to_string(),
            ));
        }

        let events = self.history.query(organization_id, filter, limit);
        self.counters.replays.fetch_add(1, Ordering::Relaxed);
        self.metrics.replays_served_total.inc();
        Ok(events)
    }

    /// Bus statistics snapshot
    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.counters.published.load(Ordering::Relaxed),
            events_delivered: self.counters.delivered.load(Ordering::Relaxed),
            batches_delivered: self.counters.batches.load(Ordering::Relaxed),
            replays_served: self.counters.replays.load(Ordering::Relaxed),
            transport_failures: self.counters.transport_failures.load(Ordering::Relaxed),
            dropped_deliveries: self.counters.dropped.load(Ordering::Relaxed),
            active_subscriptions: self.subscriptions.len() as u64,
            active_connections: self.connections.len() as u64,
            history_size: self.history.total_len() as u64,
        }
    }

    /// Perform a health check
    pub fn health_check(&self) -> ComponentHealth {
        let started = Instant::now();
        let stats = self.stats();

        let status = if self.accepting.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        ComponentHealth {
            component: "event_bus".to_string(),
            status,
            last_check: Utc::now(),
            response_time_ms: started.elapsed().as_millis() as u64,
            details: HashMap::from([
                (
                    "active_subscriptions".to_string(),
                    stats.active_subscriptions.to_string(),
                ),
                (
                    "active_connections".to_string(),
                    stats.active_connections.to_string(),
                ),
                ("history_size".to_string(), stats.history_size.to_string()),
            ]),
        }
    }

    fn handle_transport_message(&self, message: TransportMessage) {
        match serde_json::from_slice::<Event>(&message.payload) {
            Ok(event) => self.dispatch(event),
            Err(e) => warn!(
                "Discarding undecodable message on {}: {}",
                message.channel, e
            ),
        }
    }

    /// Match one event against live subscriptions and route it.
    ///
    /// Batchable, non-critical events are coalesced per connection and
    /// flushed at `batch_size` or after the batch interval; everything else
    /// is delivered immediately.
    fn dispatch(&self, event: Event) {
        let started = Instant::now();

        // Connections with at least one matching subscription; one
        // delivery per connection regardless of how many match.
        let mut targets: Vec<String> = Vec::new();
        for entry in self.subscriptions.iter() {
            if entry.organization_id != event.organization_id {
                continue;
            }
            if !entry.filters.matches(&event) {
                continue;
            }
            if let Some(permissions) = &event.permissions {
                if !permissions.allows(&entry.user_id, entry.user_role) {
                    continue;
                }
            }
            if !targets.contains(&entry.connection_id) {
                targets.push(entry.connection_id.clone());
            }
        }

        if targets.is_empty() {
            self.metrics
                .dispatch_duration_seconds
                .observe(started.elapsed().as_secs_f64());
            return;
        }

        if event.is_immediate() {
            for connection_id in targets {
                let batch = EventBatch::live(event.organization_id.clone(), vec![event.clone()]);
                self.send_to_connection(&connection_id, batch);
            }
        } else {
            let mut full_batches: Vec<(PendingKey, PendingBatch)> = Vec::new();
            {
                let mut pending = self.pending.lock();
                for connection_id in targets {
                    let key = (connection_id, event.organization_id.clone());
                    let is_full = {
                        let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
                            events: Vec::new(),
                            opened_at: Instant::now(),
                        });
                        batch.events.push(event.clone());
                        batch.events.len() >= self.config.batch_size
                    };
                    if is_full {
                        if let Some(batch) = pending.remove(&key) {
                            full_batches.push((key, batch));
                        }
                    }
                }
            }
            for ((connection_id, organization_id), batch) in full_batches {
                self.send_to_connection(
                    &connection_id,
                    EventBatch::live(organization_id, batch.events),
                );
            }
        }

        self.metrics
            .dispatch_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    /// Flush pending batches older than the batch interval, or all of them
    fn flush_pending(&self, force: bool) {
        let interval = StdDuration::from_millis(self.config.batch_interval_ms);
        let due: Vec<(PendingKey, PendingBatch)> = {
            let mut pending = self.pending.lock();
            let due_keys: Vec<PendingKey> = pending
                .iter()
                .filter(|(_, batch)| force || batch.opened_at.elapsed() >= interval)
                .map(|(key, _)| key.clone())
                .collect();
            due_keys
                .into_iter()
                .filter_map(|key| pending.remove(&key).map(|batch| (key, batch)))
                .collect()
        };

        for ((connection_id, organization_id), batch) in due {
            self.send_to_connection(
                &connection_id,
                EventBatch::live(organization_id, batch.events),
            );
        }
    }

    fn send_to_connection(&self, connection_id: &str, batch: EventBatch) {
        let event_count = batch.events.len() as u64;
        let Some(handle) = self.connections.get(connection_id) else {
            debug!(
                "No connection {} registered, dropping {} events",
                connection_id, event_count
            );
            self.counters.dropped.fetch_add(event_count, Ordering::Relaxed);
            self.metrics.dropped_deliveries_total.inc_by(event_count);
            return;
        };

        match handle.sender.try_send(batch) {
            Ok(()) => {
                self.counters
                    .delivered
                    .fetch_add(event_count, Ordering::Relaxed);
                self.counters.batches.fetch_add(1, Ordering::Relaxed);
                self.metrics.events_delivered_total.inc_by(event_count);
                self.metrics.batches_delivered_total.inc();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Connection {} is slow, dropping a batch of {} events",
                    connection_id, event_count
                );
                self.counters.dropped.fetch_add(event_count, Ordering::Relaxed);
                self.metrics.dropped_deliveries_total.inc_by(event_count);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(handle);
                self.connections.remove(connection_id);
                self.counters.dropped.fetch_add(event_count, Ordering::Relaxed);
                self.metrics.dropped_deliveries_total.inc_by(event_count);
                debug!("Connection {} closed, handle removed", connection_id);
            }
        }
    }

    async fn run_cleanup_tick(&self) {
        let Ok(_guard) = self.cleanup_guard.try_lock() else {
            return;
        };

        let now = Utc::now();
        self.history.sweep(now);

        let idle: Vec<Uuid> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.is_idle(now, self.config.subscription_idle_timeout_seconds))
            .map(|entry| entry.id)
            .collect();
        for id in &idle {
            self.subscriptions.remove(id);
        }
        if !idle.is_empty() {
            info!("Swept {} idle subscriptions", idle.len());
            self.metrics
                .active_subscriptions
                .set(self.subscriptions.len() as i64);
        }

        let closed: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.sender.is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        for connection_id in closed {
            self.unregister_connection(&connection_id);
        }
    }
}
