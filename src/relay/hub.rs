//! Relay core

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::config::RelayConfig;
use crate::broadcast::Broadcaster;
use crate::error::Result;
use crate::history::HistoryBuffer;
use crate::ingest::{validate_topic, AcceptAll, AdapterError, Envelope, IngestAdapter, PayloadValidator};
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound, RegistryError};
use crate::router::TopicRouter;
use crate::stats::{RelayStats, TopicStats};

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub topic: String,
    pub sequence: u64,
    /// Subscribers whose queue accepted the envelope
    pub delivered: usize,
    /// Subscribers that shed it
    pub dropped: usize,
}

/// Result of a subscribe request
#[derive(Debug, Clone)]
pub struct Subscribed {
    /// False when the connection was already subscribed
    pub created: bool,
    /// Last sequence published on the topic at the moment of subscription
    pub last_sequence: u64,
    /// Recent envelopes to send before any live frame, oldest first
    pub snapshot: Vec<Arc<Envelope>>,
}

/// Message relay
///
/// Composes the ingest adapter, topic router, connection registry, history
/// buffer and broadcaster. All operations are synchronous and never await;
/// transports drive them from their own tasks.
pub struct Relay {
    config: RelayConfig,
    router: Arc<TopicRouter>,
    registry: Arc<ConnectionRegistry>,
    history: Arc<HistoryBuffer>,
    broadcaster: Broadcaster,
    started_at: Instant,
}

impl Relay {
    /// Create a relay accepting any well-formed JSON payload
    pub fn new(config: RelayConfig) -> Self {
        Self::with_validator(config, Arc::new(AcceptAll))
    }

    /// Create a relay with a custom payload validator
    pub fn with_validator(config: RelayConfig, validator: Arc<dyn PayloadValidator>) -> Self {
        let router = Arc::new(TopicRouter::new(config.max_topics));
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&router), &config));
        let history = Arc::new(HistoryBuffer::new(config.history_capacity));
        let adapter = IngestAdapter::with_validator(config.payload_max_bytes, validator);
        let broadcaster = Broadcaster::new(
            adapter,
            Arc::clone(&router),
            Arc::clone(&registry),
            Arc::clone(&history),
        );

        Self {
            config,
            router,
            registry,
            history,
            broadcaster,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn history(&self) -> &Arc<HistoryBuffer> {
        &self.history
    }

    /// Publish a raw producer message on `topic`
    pub fn publish(&self, topic: &str, raw: &[u8]) -> Result<PublishReceipt> {
        let (envelope, report) = self.broadcaster.publish_raw(topic, raw)?;

        Ok(PublishReceipt {
            topic: envelope.topic().to_string(),
            sequence: report.sequence,
            delivered: report.delivered,
            dropped: report.dropped,
        })
    }

    /// Serialize `value` and publish it on `topic`
    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<PublishReceipt> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| AdapterError::InvalidPayload(e.to_string()))?;
        self.publish(topic, &raw)
    }

    /// Register a new connection in the `Connecting` state
    pub fn register(&self, peer_addr: Option<SocketAddr>) -> Outbound {
        self.registry.register(peer_addr)
    }

    /// Register an in-process consumer that the idle sweep leaves alone
    pub fn register_local(&self) -> Outbound {
        self.registry.register_local()
    }

    /// Mark a connection as accepted
    pub fn open(&self, id: ConnectionId) -> Result<()> {
        self.registry.open(id)?;
        Ok(())
    }

    /// Subscribe a connection, optionally with a history snapshot
    ///
    /// The snapshot is read and the subscription recorded inside the topic's
    /// critical section, so the snapshot ends exactly where live delivery
    /// starts. `snapshot` is capped at `RelayConfig::snapshot_limit`.
    /// Subscribing again to a topic is a no-op and returns no snapshot.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        topic: &str,
        snapshot: Option<usize>,
    ) -> Result<Subscribed> {
        validate_topic(topic)?;
        let entry = self.registry.get(id)?;
        let max = snapshot.map(|n| n.min(self.config.snapshot_limit()));

        let subscribed = self.router.with_slot(topic, |slot| {
            let created = self.registry.attach(slot, &entry)?;
            let snapshot = match max {
                Some(n) if created && n > 0 => self.history.snapshot(topic, n),
                _ => Vec::new(),
            };

            Ok::<_, RegistryError>(Subscribed {
                created,
                last_sequence: slot.last_sequence(),
                snapshot,
            })
        })??;

        Ok(subscribed)
    }

    /// Remove a subscription; `Ok(false)` if there was none
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Result<bool> {
        Ok(self.registry.unsubscribe(id, topic)?)
    }

    /// Roll back a subscription whose reply never reached the client
    ///
    /// Envelopes it already queued are discarded from `outbound`, so the
    /// client sees no frames for a subscription it was told failed.
    pub fn withdraw(&self, outbound: &mut Outbound, topic: &str) -> Result<bool> {
        match self.registry.unsubscribe_at(outbound.id(), topic)? {
            Some(cutoff) => {
                outbound.discard_through(topic, cutoff);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close a connection and drop all of its subscriptions
    pub fn deregister(&self, id: ConnectionId) -> bool {
        self.registry.deregister(id)
    }

    /// Recent envelopes on `topic`, oldest first
    pub fn snapshot(&self, topic: &str, max_count: usize) -> Vec<Arc<Envelope>> {
        self.history
            .snapshot(topic, max_count.min(self.config.snapshot_limit()))
    }

    /// Counters for every connection and topic
    pub fn stats(&self) -> RelayStats {
        let mut topics = Vec::with_capacity(self.router.topic_count());
        self.router.for_each_slot(|slot| {
            topics.push(TopicStats {
                topic: slot.topic().to_string(),
                subscribers: slot.subscriber_count(),
                published: slot.published(),
                publish_rate: slot.publish_rate(),
                last_sequence: slot.last_sequence(),
                history_len: self.history.len(slot.topic()),
            });
        });
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));

        RelayStats {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connections: self.registry.stats(),
            topics,
        }
    }

    /// Start the periodic registry sweep
    pub fn spawn_sweep_task(&self) -> tokio::task::JoinHandle<()> {
        self.registry.spawn_sweep_task(self.config.sweep_interval)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
