//! # Pub/Sub Transport Module
//!
//! The generic publish/subscribe transport is an external collaborator of
//! the realtime core; this module defines the seam and the channel naming
//! scheme, plus an in-process implementation used by tests and
//! single-process deployments.
//!
//! Channel naming: `events:{organization_id}:{event_type}` for typed
//! channels, `events:{organization_id}:*` for the organization wildcard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Typed channel name for one organization and event type
pub fn typed_channel(organization_id: &str, event_type: &str) -> String {
    format!("events:{}:{}", organization_id, event_type)
}

/// Wildcard channel pattern covering all of an organization's events
pub fn organization_wildcard(organization_id: &str) -> String {
    format!("events:{}:*", organization_id)
}

/// Check if a channel matches a subscription pattern.
///
/// Patterns support a single trailing `*` segment; anything else is an
/// exact match.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// One message received off the transport
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Channel the message was published on
    pub channel: String,

    /// Serialized payload
    pub payload: Bytes,
}

/// External publish/subscribe transport collaborator.
///
/// Publish failures are absorbed by callers into metrics and logs; the
/// transport itself makes no delivery guarantees beyond best effort.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish a payload on a channel
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to all channels matching a pattern
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<TransportMessage>>;
}

struct SubscriberEntry {
    pattern: String,
    sender: mpsc::Sender<TransportMessage>,
}

/// In-process transport backed by bounded mpsc channels.
///
/// Slow subscribers lose messages rather than blocking publishers.
pub struct InMemoryTransport {
    subscribers: RwLock<Vec<SubscriberEntry>>,
    buffer: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryTransport {
    /// Create a transport with the given per-subscriber buffer
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Messages published since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages dropped on full subscriber buffers since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn prune_closed(&self) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|entry| !entry.sender.is_closed());
    }
}

#[async_trait]
impl PubSubTransport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        // Copy matching senders out so the lock is not held while sending.
        let targets: Vec<mpsc::Sender<TransportMessage>> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter(|entry| channel_matches(&entry.pattern, channel))
                .map(|entry| entry.sender.clone())
                .collect()
        };

        self.published.fetch_add(1, Ordering::Relaxed);

        let mut saw_closed = false;
        for sender in targets {
            let message = TransportMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            match sender.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping transport message on {}: subscriber full", channel);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    saw_closed = true;
                }
            }
        }

        if saw_closed {
            self.prune_closed();
        }

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<TransportMessage>> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        debug!("New transport subscription for pattern {}", pattern);
        self.subscribers.write().push(SubscriberEntry {
            pattern: pattern.to_string(),
            sender,
        });
        Ok(receiver)
    }
}
