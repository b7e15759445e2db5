//! Statistics for relay connections and topics

use serde::Serialize;

use crate::registry::{ConnectionId, ConnectionState};

/// Per-connection counters
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Connection id
    pub id: ConnectionId,
    /// Remote address (None for in-process connections)
    pub peer_addr: Option<String>,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Subscribed topics
    pub topics: Vec<String>,
    /// Envelopes accepted into the outbound queue
    pub enqueued: u64,
    /// Frames written to the transport
    pub sent: u64,
    /// Envelopes shed by back-pressure
    pub dropped: u64,
    /// Envelopes currently queued
    pub queue_depth: usize,
    /// Queue capacity
    pub queue_limit: usize,
    /// Seconds since the connection was registered
    pub connected_secs: u64,
}

/// Per-topic counters
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    /// Topic name
    pub topic: String,
    /// Current subscriber count
    pub subscribers: usize,
    /// Envelopes published
    pub published: u64,
    /// Average publishes per second since the first publish
    pub publish_rate: f64,
    /// Last assigned sequence number
    pub last_sequence: u64,
    /// Envelopes retained in the history ring
    pub history_len: usize,
}

/// Relay-wide snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    /// Seconds since the relay was created
    pub uptime_secs: u64,
    /// Live connections
    pub connections: Vec<ConnectionStats>,
    /// Known topics
    pub topics: Vec<TopicStats>,
}

impl RelayStats {
    /// Total envelopes published across all topics
    pub fn total_published(&self) -> u64 {
        self.topics.iter().map(|t| t.published).sum()
    }

    /// Total envelopes shed across all connections
    pub fn total_dropped(&self) -> u64 {
        self.connections.iter().map(|c| c.dropped).sum()
    }

    /// Total frames written across all connections
    pub fn total_sent(&self) -> u64 {
        self.connections.iter().map(|c| c.sent).sum()
    }

    /// Counters for one topic
    pub fn topic(&self, name: &str) -> Option<&TopicStats> {
        self.topics.iter().find(|t| t.topic == name)
    }

    /// Counters for one connection
    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionStats> {
        self.connections.iter().find(|c| c.id == id)
    }
}
