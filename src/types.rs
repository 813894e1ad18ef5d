//! # Realtime Core Types
//!
//! Core types, enums, and data structures shared across the event bus,
//! aggregation engine, and durable queue.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::events::{Event, EventPriority};

/// Subtype attached to batches served from history replay
pub const REPLAY_SUBTYPE: &str = "event_replay";

/// User roles within an organization, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

/// Filter fields applied to live dispatch and history replay.
///
/// All present fields must match; absent fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Event types to accept
    pub event_types: Option<Vec<String>>,

    /// Event subtypes to accept
    pub subtypes: Option<Vec<String>>,

    /// Priorities to accept
    pub priorities: Option<Vec<EventPriority>>,

    /// Inclusive lower bound on event timestamp
    pub from: Option<DateTime<Utc>>,

    /// Inclusive upper bound on event timestamp
    pub to: Option<DateTime<Utc>>,

    /// Only events relating to this user
    pub user_id: Option<String>,
}

impl SubscriptionFilter {
    /// Check whether an event passes the filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(subtypes) = &self.subtypes {
            match &event.subtype {
                Some(subtype) => {
                    if !subtypes.iter().any(|s| s == subtype) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(priorities) = &self.priorities {
            if !priorities.contains(&event.metadata.priority) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.metadata.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.metadata.timestamp > to {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            match &event.user_id {
                Some(event_user) => {
                    if event_user != user_id {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// Whether subscribing with this filter triggers an immediate replay
    pub fn wants_replay(&self) -> bool {
        self.from.is_some() || self.to.is_some() || self.user_id.is_some()
    }
}

/// Caller-supplied subscription request
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Organization the caller wants events for
    #[validate(length(min = 1))]
    pub organization_id: String,

    /// Subscribing user
    #[validate(length(min = 1))]
    pub user_id: String,

    /// Subscribing user's role, used for row-level permission checks
    pub user_role: UserRole,

    /// Connection the deliveries go to
    #[validate(length(min = 1))]
    pub connection_id: String,

    /// Event filters
    #[serde(default)]
    pub filters: SubscriptionFilter,
}

/// One live consumer interest, owned exclusively by the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier
    pub id: Uuid,

    /// Organization scope
    pub organization_id: String,

    /// Subscribing user
    pub user_id: String,

    /// Subscribing user's role
    pub user_role: UserRole,

    /// Delivery connection
    pub connection_id: String,

    /// Event filters
    pub filters: SubscriptionFilter,

    /// Transport channels derived from the filters
    pub channels: Vec<String>,

    /// Creation timestamp
    pub subscribed_at: DateTime<Utc>,

    /// Last caller interaction, used by the idle sweep
    pub last_activity: DateTime<Utc>,

    /// Event ids the consumer has acknowledged
    pub acknowledged: HashSet<Uuid>,
}

impl Subscription {
    /// Whether the subscription has been idle longer than `timeout_seconds`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout_seconds: u64) -> bool {
        (now - self.last_activity).num_seconds() > timeout_seconds as i64
    }

    /// Refresh the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// A batch of events delivered to one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    /// Batch identifier
    pub id: Uuid,

    /// Organization the events belong to
    pub organization_id: String,

    /// Batch subtype, `event_replay` for history replays
    pub subtype: Option<String>,

    /// Events in delivery order
    pub events: Vec<Event>,

    /// Batch creation timestamp
    pub created_at: DateTime<Utc>,
}

impl EventBatch {
    /// Create a batch of live events
    pub fn live(organization_id: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            subtype: None,
            events,
            created_at: Utc::now(),
        }
    }

    /// Create a synthetic replay batch
    pub fn replay(organization_id: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            subtype: Some(REPLAY_SUBTYPE.to_string()),
            events,
            created_at: Utc::now(),
        }
    }
}

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Component health information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub component: String,

    /// Health status
    pub status: HealthStatus,

    /// Last check timestamp
    pub last_check: DateTime<Utc>,

    /// Response time in milliseconds
    pub response_time_ms: u64,

    /// Additional health details
    pub details: HashMap<String, String>,
}

/// Event bus statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Events accepted by `publish`
    pub events_published: u64,

    /// Events handed to consumer connections
    pub events_delivered: u64,

    /// Batches flushed to connections
    pub batches_delivered: u64,

    /// Replay batches served
    pub replays_served: u64,

    /// Transport publish failures absorbed
    pub transport_failures: u64,

    /// Deliveries dropped because a consumer channel was full
    pub dropped_deliveries: u64,

    /// Live subscriptions
    pub active_subscriptions: u64,

    /// Registered consumer connections
    pub active_connections: u64,

    /// Events currently held in history
    pub history_size: u64,
}

/// Aggregation engine statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStats {
    /// Events folded successfully
    pub events_ingested: u64,

    /// Ingest calls that failed
    pub ingest_failures: u64,

    /// Open buckets across all window sizes
    pub open_buckets: u64,

    /// Buckets flushed to storage
    pub buckets_flushed: u64,

    /// Metric rows written
    pub rows_written: u64,

    /// Events currently parked in the dead-letter list
    pub dead_letter_size: u64,

    /// Dead-letter retries attempted
    pub dead_letter_retries: u64,

    /// Dead-letter events dropped permanently
    pub dead_letter_dropped: u64,
}

/// Queue item status breakdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusCounts {
    /// Due now or overdue
    pub pending: u64,

    /// Scheduled for a future retry
    pub scheduled: u64,

    /// Permanently failed, awaiting explicit cleanup
    pub failed: u64,
}

/// Durable queue statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items currently in the queue
    pub total_items: u64,

    /// Breakdown by processing status
    pub by_status: QueueStatusCounts,

    /// Breakdown by priority class
    pub by_priority: HashMap<String, u64>,

    /// Breakdown by item type
    pub by_type: HashMap<String, u64>,

    /// Items accepted since startup
    pub enqueued_total: u64,

    /// Items completed since startup
    pub processed_total: u64,

    /// Failure marks recorded since startup
    pub failed_marks_total: u64,

    /// Items dropped by expiry or space reclamation since startup
    pub dropped_total: u64,

    /// Creation timestamp of the oldest queued item
    pub oldest_item_at: Option<DateTime<Utc>>,
}

/// Signals emitted for observers over a broadcast channel.
///
/// Dispatch pushes these onto a bounded channel; lagging observers miss
/// signals rather than blocking the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealtimeSignal {
    /// An event was accepted by the bus
    EventPublished {
        event_id: Uuid,
        organization_id: String,
        event_type: String,
    },

    /// Process memory crossed the high-watermark; callers should pause
    /// submission or force a flush
    HighMemory { used_mb: u64, limit_mb: u64 },

    /// A dead-lettered event exhausted its retries and was dropped
    DeadLetterDropped { event_id: Uuid, error: String },

    /// A queue item exhausted its retries and was marked permanently failed
    QueueItemExhausted {
        item_id: Uuid,
        item_type: String,
        error: String,
    },
}
