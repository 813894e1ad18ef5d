//! # Event Structures and Definitions
//!
//! This module defines the core Event structure and telemetry payload types
//! for the realtime core service. Events are the immutable unit of the bus:
//! created by a producer call, optionally archived into bounded
//! per-organization history, and never mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::UserRole;

/// Well-known event type identifiers routed by the aggregation engine
pub mod event_types {
    pub const COMMAND_EXECUTION: &str = "command_execution";
    pub const AGENT_INTERACTION: &str = "agent_interaction";
    pub const USER_SESSION: &str = "user_session";
    pub const PRODUCTIVITY_METRIC: &str = "productivity_metric";
}

/// Event priority levels for delivery ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Background events, always batchable
    Low,
    /// Default priority for standard telemetry
    Medium,
    /// Important operational events
    High,
    /// Delivered immediately, never batched
    Critical,
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Medium
    }
}

/// Core event structure distributed by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,

    /// Event type identifier (e.g. `command_execution`)
    pub event_type: String,

    /// Optional event subtype for finer-grained filtering
    pub subtype: Option<String>,

    /// Owning organization
    pub organization_id: String,

    /// User the event relates to, if any
    pub user_id: Option<String>,

    /// Telemetry payload, deserialized only by the folding function that
    /// understands this event type
    pub payload: TelemetryPayload,

    /// Optional row-level delivery allow-list
    pub permissions: Option<EventPermissions>,

    /// Delivery metadata
    pub metadata: EventMetadata,
}

/// Event delivery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Delivery priority
    pub priority: EventPriority,

    /// Time-to-live in seconds; bounds history retention
    pub ttl_seconds: u64,

    /// Whether the event is archived for history replay
    pub replay: bool,

    /// Whether the event may be coalesced into a timed batch
    pub batchable: bool,

    /// Whether consumers are expected to acknowledge the event
    pub requires_ack: bool,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            priority: EventPriority::Medium,
            ttl_seconds: 3600,
            replay: true,
            batchable: true,
            requires_ack: false,
        }
    }
}

/// Row-level delivery permissions carried by an event.
///
/// Subscriptions failing the check are silently skipped at dispatch time;
/// this is filtering, not an access error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPermissions {
    /// Minimum role required to receive the event
    pub min_role: Option<UserRole>,

    /// Explicit role allow-list
    pub roles: Option<Vec<UserRole>>,

    /// Explicit user allow-list
    pub users: Option<Vec<String>>,
}

impl EventPermissions {
    /// Check whether a subscriber passes the allow-list
    pub fn allows(&self, user_id: &str, role: UserRole) -> bool {
        if let Some(min_role) = self.min_role {
            if role < min_role {
                return false;
            }
        }
        if let Some(roles) = &self.roles {
            if !roles.contains(&role) {
                return false;
            }
        }
        if let Some(users) = &self.users {
            if !users.iter().any(|u| u == user_id) {
                return false;
            }
        }
        true
    }
}

/// Telemetry payload variants understood by the aggregation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TelemetryPayload {
    /// A command executed by a user
    CommandExecution(CommandExecutionPayload),

    /// One interaction with an agent
    AgentInteraction(AgentInteractionPayload),

    /// A user session lifecycle event
    UserSession(UserSessionPayload),

    /// A sampled productivity score
    ProductivityMetric(ProductivityMetricPayload),

    /// Opaque payload for event types the engine does not fold
    Custom(serde_json::Value),
}

/// Command execution telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecutionPayload {
    /// Command name
    pub command: String,

    /// Execution outcome
    pub status: CommandStatus,

    /// Wall-clock execution time in milliseconds
    pub execution_time_ms: u64,

    /// Process exit code, when applicable
    pub exit_code: Option<i32>,
}

/// Command execution outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

/// Agent interaction telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInteractionPayload {
    /// Agent name
    pub agent_name: String,

    /// Interaction kind (e.g. `prompt`, `completion`)
    pub action: String,

    /// Interaction duration in milliseconds, when measured
    pub duration_ms: Option<u64>,
}

/// User session telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSessionPayload {
    /// Session identifier
    pub session_id: String,

    /// Session lifecycle action
    pub action: SessionAction,

    /// Session duration in milliseconds, present on `Ended`
    pub duration_ms: Option<u64>,
}

/// Session lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Started,
    Heartbeat,
    Ended,
}

/// Sampled productivity score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductivityMetricPayload {
    /// Score in the 0.0..=100.0 range
    pub score: f64,
}

impl Event {
    /// Create a new event with default metadata
    pub fn new(
        event_type: impl Into<String>,
        organization_id: impl Into<String>,
        payload: TelemetryPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            subtype: None,
            organization_id: organization_id.into(),
            user_id: None,
            payload,
            permissions: None,
            metadata: EventMetadata::default(),
        }
    }

    /// Create a command execution event
    pub fn command_execution(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        payload: CommandExecutionPayload,
    ) -> Self {
        Self::new(
            event_types::COMMAND_EXECUTION,
            organization_id,
            TelemetryPayload::CommandExecution(payload),
        )
        .with_user(user_id)
    }

    /// Create an agent interaction event
    pub fn agent_interaction(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        payload: AgentInteractionPayload,
    ) -> Self {
        Self::new(
            event_types::AGENT_INTERACTION,
            organization_id,
            TelemetryPayload::AgentInteraction(payload),
        )
        .with_user(user_id)
    }

    /// Create a user session event
    pub fn user_session(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        payload: UserSessionPayload,
    ) -> Self {
        Self::new(
            event_types::USER_SESSION,
            organization_id,
            TelemetryPayload::UserSession(payload),
        )
        .with_user(user_id)
    }

    /// Create a productivity metric event
    pub fn productivity_metric(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        score: f64,
    ) -> Self {
        Self::new(
            event_types::PRODUCTIVITY_METRIC,
            organization_id,
            TelemetryPayload::ProductivityMetric(ProductivityMetricPayload { score }),
        )
        .with_user(user_id)
    }

    /// Set the related user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the event subtype
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Set the delivery priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Set the event timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    /// Set the time-to-live
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.metadata.ttl_seconds = ttl_seconds;
        self
    }

    /// Mark the event as non-replayable
    pub fn without_replay(mut self) -> Self {
        self.metadata.replay = false;
        self
    }

    /// Mark the event as non-batchable
    pub fn without_batching(mut self) -> Self {
        self.metadata.batchable = false;
        self
    }

    /// Attach row-level delivery permissions
    pub fn with_permissions(mut self, permissions: EventPermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Get event age in seconds
    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.metadata.timestamp).num_seconds()
    }

    /// Check if the event has outlived `min(max_history_age, ttl)`
    pub fn is_expired(&self, now: DateTime<Utc>, max_history_age_seconds: u64) -> bool {
        let horizon = max_history_age_seconds.min(self.metadata.ttl_seconds);
        let age = (now - self.metadata.timestamp).num_seconds();
        age > horizon as i64
    }

    /// Whether the event must bypass batching
    pub fn is_immediate(&self) -> bool {
        !self.metadata.batchable || self.metadata.priority == EventPriority::Critical
    }
}
