//! Per-topic routing state

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::registry::ConnectionId;

/// Subscriber set and publish counters of one topic
#[derive(Debug)]
pub struct TopicSlot {
    topic: Arc<str>,
    subscribers: HashSet<ConnectionId>,
    created_at: Instant,
    first_published_at: Option<Instant>,
    published: u64,
    last_sequence: u64,
}

impl TopicSlot {
    pub(crate) fn new(topic: Arc<str>) -> Self {
        Self {
            topic,
            subscribers: HashSet::new(),
            created_at: Instant::now(),
            first_published_at: None,
            published: 0,
            last_sequence: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn topic_arc(&self) -> &Arc<str> {
        &self.topic
    }

    /// Connection ids currently subscribed
    pub fn subscribers(&self) -> &HashSet<ConnectionId> {
        &self.subscribers
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_subscribed(&self, id: ConnectionId) -> bool {
        self.subscribers.contains(&id)
    }

    /// Total envelopes published on this topic
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Sequence number of the last published envelope (0 if none)
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Average publishes per second since the first publish
    pub fn publish_rate(&self) -> f64 {
        let Some(first) = self.first_published_at else {
            return 0.0;
        };
        let secs = first.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.published as f64 / secs
        } else {
            0.0
        }
    }

    pub(crate) fn insert(&mut self, id: ConnectionId) -> bool {
        self.subscribers.insert(id)
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> bool {
        self.subscribers.remove(&id)
    }

    pub(crate) fn record_publish(&mut self, sequence: u64) {
        if self.first_published_at.is_none() {
            self.first_published_at = Some(Instant::now());
        }
        self.published += 1;
        self.last_sequence = sequence;
    }
}
