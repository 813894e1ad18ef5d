//! # Event History Module
//!
//! Bounded per-organization event history backing replay. Two read paths
//! sit in front of the archive: a capped recent-events snapshot per
//! organization, and a short-TTL cache of repeated identical queries.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::EventBusConfig;
use crate::events::Event;
use crate::types::SubscriptionFilter;

struct CachedQuery {
    events: Vec<Event>,
    cached_at: DateTime<Utc>,
}

/// Bounded per-organization event archive with replay caches
pub struct EventHistory {
    capacity: usize,
    replay_cache_size: usize,
    cache_ttl_seconds: u64,
    max_age_seconds: u64,
    per_org: RwLock<HashMap<String, VecDeque<Event>>>,
    recent: RwLock<HashMap<String, VecDeque<Event>>>,
    query_cache: RwLock<HashMap<String, CachedQuery>>,
}

impl EventHistory {
    pub fn new(config: &EventBusConfig) -> Self {
        Self {
            capacity: config.history_capacity,
            replay_cache_size: config.replay_cache_size,
            cache_ttl_seconds: config.replay_cache_ttl_seconds,
            max_age_seconds: config.max_history_age_seconds,
            per_org: RwLock::new(HashMap::new()),
            recent: RwLock::new(HashMap::new()),
            query_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Append a replay-eligible event, evicting FIFO beyond capacity
    pub fn append(&self, event: &Event) {
        {
            let mut per_org = self.per_org.write();
            let entries = per_org
                .entry(event.organization_id.clone())
                .or_insert_with(VecDeque::new);
            entries.push_back(event.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        let mut recent = self.recent.write();
        let snapshot = recent
            .entry(event.organization_id.clone())
            .or_insert_with(VecDeque::new);
        snapshot.push_back(event.clone());
        while snapshot.len() > self.replay_cache_size {
            snapshot.pop_front();
        }
    }

    /// Query history with the live dispatch filter predicate, newest first
    pub fn query(
        &self,
        organization_id: &str,
        filter: &SubscriptionFilter,
        limit: usize,
    ) -> Vec<Event> {
        let cache_key = format!(
            "{}:{}:{}",
            organization_id,
            serde_json::to_string(filter).unwrap_or_default(),
            limit
        );

        let now = Utc::now();
        {
            let cache = self.query_cache.read();
            if let Some(cached) = cache.get(&cache_key) {
                if (now - cached.cached_at).num_seconds() < self.cache_ttl_seconds as i64 {
                    return cached.events.clone();
                }
            }
        }

        let mut events: Vec<Event> = {
            let per_org = self.per_org.read();
            per_org
                .get(organization_id)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|event| filter.matches(event))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        events.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
        events.truncate(limit);

        let mut cache = self.query_cache.write();
        cache.retain(|_, cached| {
            (now - cached.cached_at).num_seconds() < self.cache_ttl_seconds as i64
        });
        cache.insert(
            cache_key,
            CachedQuery {
                events: events.clone(),
                cached_at: now,
            },
        );

        events
    }

    /// Most recent events for an organization, oldest first
    pub fn recent_snapshot(&self, organization_id: &str) -> Vec<Event> {
        self.recent
            .read()
            .get(organization_id)
            .map(|snapshot| snapshot.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Expire entries older than `min(max_history_age, ttl)`
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;

        {
            let mut per_org = self.per_org.write();
            for entries in per_org.values_mut() {
                let before = entries.len();
                entries.retain(|event| !event.is_expired(now, self.max_age_seconds));
                removed += before - entries.len();
            }
            per_org.retain(|_, entries| !entries.is_empty());
        }

        {
            let mut recent = self.recent.write();
            for snapshot in recent.values_mut() {
                snapshot.retain(|event| !event.is_expired(now, self.max_age_seconds));
            }
            recent.retain(|_, snapshot| !snapshot.is_empty());
        }

        if removed > 0 {
            debug!("History sweep removed {} expired events", removed);
            self.query_cache.write().clear();
        }

        removed
    }

    /// Events held for one organization
    pub fn len(&self, organization_id: &str) -> usize {
        self.per_org
            .read()
            .get(organization_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Events held across all organizations
    pub fn total_len(&self) -> usize {
        self.per_org.read().values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CommandExecutionPayload, CommandStatus};
    use chrono::Duration;

    fn config_with_capacity(capacity: usize) -> EventBusConfig {
        EventBusConfig {
            history_capacity: capacity,
            ..Default::default()
        }
    }

    fn event_at(org: &str, ts: DateTime<Utc>) -> Event {
        Event::command_execution(
            org,
            "user-1",
            CommandExecutionPayload {
                command: "ls".to_string(),
                status: CommandStatus::Success,
                execution_time_ms: 5,
                exit_code: Some(0),
            },
        )
        .with_timestamp(ts)
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let history = EventHistory::new(&config_with_capacity(3));
        let base = Utc::now();

        let first = event_at("org-1", base);
        history.append(&first);
        for i in 1..4 {
            history.append(&event_at("org-1", base + Duration::seconds(i)));
        }

        assert_eq!(history.len("org-1"), 3);
        let events = history.query("org-1", &SubscriptionFilter::default(), 10);
        assert!(events.iter().all(|e| e.id != first.id));
    }

    #[test]
    fn test_query_returns_timestamp_descending() {
        let history = EventHistory::new(&config_with_capacity(10));
        let base = Utc::now() - Duration::minutes(10);

        let e1 = event_at("org-1", base + Duration::seconds(10));
        let e2 = event_at("org-1", base + Duration::seconds(20));
        let e3 = event_at("org-1", base + Duration::seconds(5));
        history.append(&e1);
        history.append(&e2);
        history.append(&e3);

        let events = history.query("org-1", &SubscriptionFilter::default(), 10);
        let ids: Vec<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![e2.id, e1.id, e3.id]);
    }

    #[test]
    fn test_query_respects_limit_and_org_scope() {
        let history = EventHistory::new(&config_with_capacity(10));
        let base = Utc::now();

        for i in 0..5 {
            history.append(&event_at("org-1", base + Duration::seconds(i)));
        }
        history.append(&event_at("org-2", base));

        assert_eq!(history.query("org-1", &SubscriptionFilter::default(), 2).len(), 2);
        assert_eq!(history.query("org-2", &SubscriptionFilter::default(), 10).len(), 1);
        assert!(history.query("org-3", &SubscriptionFilter::default(), 10).is_empty());
    }

    #[test]
    fn test_sweep_honors_ttl_over_max_age() {
        let history = EventHistory::new(&config_with_capacity(10));
        let now = Utc::now();

        // Expired by its own short ttl despite a long history age.
        let short_ttl = event_at("org-1", now - Duration::seconds(120)).with_ttl(60);
        // Fresh event.
        let fresh = event_at("org-1", now);
        history.append(&short_ttl);
        history.append(&fresh);

        let removed = history.sweep(now);
        assert_eq!(removed, 1);
        assert_eq!(history.len("org-1"), 1);

        let events = history.query("org-1", &SubscriptionFilter::default(), 10);
        assert_eq!(events[0].id, fresh.id);
    }

    #[test]
    fn test_recent_snapshot_is_bounded() {
        let mut config = config_with_capacity(1000);
        config.replay_cache_size = 2;
        let history = EventHistory::new(&config);
        let base = Utc::now();

        for i in 0..5 {
            history.append(&event_at("org-1", base + Duration::seconds(i)));
        }

        assert_eq!(history.recent_snapshot("org-1").len(), 2);
        assert_eq!(history.len("org-1"), 5);
    }

    #[test]
    fn test_repeated_query_served_from_cache() {
        let history = EventHistory::new(&config_with_capacity(10));
        let base = Utc::now();
        history.append(&event_at("org-1", base));

        let filter = SubscriptionFilter::default();
        let first = history.query("org-1", &filter, 10);

        // A new event lands, but the cached result is still served within
        // the ttl window.
        history.append(&event_at("org-1", base + Duration::seconds(1)));
        let second = history.query("org-1", &filter, 10);
        assert_eq!(first.len(), second.len());
    }
}
