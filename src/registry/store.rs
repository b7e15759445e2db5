//! Connection registry implementation

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::connection::{ConnectionEntry, ConnectionId, ConnectionState, Outbound, Subscription};
use super::error::RegistryError;
use crate::ingest::Envelope;
use crate::relay::RelayConfig;
use crate::router::{TopicRouter, TopicSlot};
use crate::stats::ConnectionStats;

/// Registry of live connections
///
/// Thread-safe via a read-mostly `RwLock` over the connection map. The map
/// lock is never held while a topic slot is being acquired, so the lock order
/// is always topic slot → connection map / subscription set.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
    router: Arc<TopicRouter>,
    next_id: AtomicU64,
    queue_depth_limit: usize,
    drain_grace_period: Duration,
    idle_timeout: Duration,
}

impl ConnectionRegistry {
    /// Create a registry maintaining the reverse index of `router`
    pub fn new(router: Arc<TopicRouter>, config: &RelayConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            router,
            next_id: AtomicU64::new(1),
            queue_depth_limit: config.queue_depth_limit,
            drain_grace_period: config.drain_grace_period,
            idle_timeout: config.idle_timeout,
        }
    }

    /// Register a new connection in the `Connecting` state
    ///
    /// Returns the receiving half of its outbound queue.
    pub fn register(&self, peer_addr: Option<SocketAddr>) -> Outbound {
        self.insert(peer_addr, false)
    }

    /// Register an in-process consumer
    ///
    /// Local connections have no socket to keep alive, so the sweep never
    /// closes them for inactivity. They are still evicted when they stay
    /// `Draining` past the grace period.
    pub fn register_local(&self) -> Outbound {
        self.insert(None, true)
    }

    fn insert(&self, peer_addr: Option<SocketAddr>, local: bool) -> Outbound {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (entry, outbound) =
            ConnectionEntry::new(id, peer_addr, local, self.queue_depth_limit);

        self.connections.write().insert(id, entry);

        tracing::debug!(
            connection_id = id,
            peer = ?peer_addr,
            local,
            queue_limit = self.queue_depth_limit,
            "Connection registered"
        );

        outbound
    }

    /// Move a connection from `Connecting` to `Open`
    pub fn open(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let entry = self.get(id)?;

        if entry.transition(ConnectionState::Connecting, ConnectionState::Open) {
            tracing::debug!(connection_id = id, "Connection open");
            return Ok(());
        }

        if entry.state().is_live() {
            Ok(())
        } else {
            Err(RegistryError::NotOpen(id))
        }
    }

    /// Look up a connection
    pub fn get(&self, id: ConnectionId) -> Result<Arc<ConnectionEntry>, RegistryError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Subscribe a connection to a topic
    ///
    /// Idempotent: returns `Ok(false)` if the subscription already existed.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let entry = self.get(id)?;
        self.router
            .with_slot(topic, |slot| self.attach(slot, &entry))?
    }

    /// Remove a connection's subscription to a topic
    ///
    /// Returns `Ok(false)` if the connection was not subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        Ok(self.unsubscribe_at(id, topic)?.is_some())
    }

    /// Remove a subscription and report where its live delivery ended
    ///
    /// Returns the topic's last sequence, read in the same critical section
    /// as the removal, or `None` if there was no subscription. Every envelope
    /// queued for this subscription has a sequence at or below it.
    pub fn unsubscribe_at(
        &self,
        id: ConnectionId,
        topic: &str,
    ) -> Result<Option<u64>, RegistryError> {
        let entry = self.get(id)?;
        let cutoff = self
            .router
            .with_existing_slot(topic, |slot| {
                self.detach(slot, &entry).then(|| slot.last_sequence())
            })
            .flatten();

        if let Some(last_sequence) = cutoff {
            tracing::debug!(connection_id = id, topic = %topic, last_sequence, "Unsubscribed");
        }

        Ok(cutoff)
    }

    /// Close a connection and release everything it owns
    ///
    /// Marks the connection `Closed`, removes its subscriptions from both
    /// indices, stops its transmit loop and purges the entry. Calling it again
    /// for the same id is a no-op that returns `false`.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let Some(entry) = self.connections.write().remove(&id) else {
            return false;
        };

        // Closing under the subscription lock stops concurrent `attach` calls
        // from adding topics we would miss below.
        let topics: Vec<Arc<str>> = {
            let subscriptions = entry.subscriptions.lock();
            entry.set_state(ConnectionState::Closed);
            subscriptions.keys().cloned().collect()
        };

        for topic in &topics {
            self.router
                .with_existing_slot(topic, |slot| self.detach(slot, &entry));
        }

        entry.signal_shutdown();

        tracing::info!(
            connection_id = id,
            topics = topics.len(),
            sent = entry.sent(),
            dropped = entry.dropped(),
            "Connection closed"
        );

        true
    }

    /// Queue an envelope for one connection
    ///
    /// `Ok(false)` means the envelope was dropped (queue full or connection closed).
    pub fn enqueue(
        &self,
        id: ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<bool, RegistryError> {
        let entry = self.get(id)?;
        Ok(entry.enqueue(envelope))
    }

    /// Queue an envelope for many connections under a single map read lock
    pub(crate) fn enqueue_each<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
        envelope: &Arc<Envelope>,
        mut on_result: impl FnMut(ConnectionId, Result<bool, RegistryError>),
    ) {
        let connections = self.connections.read();
        for &id in ids {
            let result = connections
                .get(&id)
                .map(|entry| entry.enqueue(Arc::clone(envelope)))
                .ok_or(RegistryError::NotFound(id));
            on_result(id, result);
        }
    }

    /// Add a subscription inside the topic's critical section
    pub(crate) fn attach(
        &self,
        slot: &mut TopicSlot,
        entry: &ConnectionEntry,
    ) -> Result<bool, RegistryError> {
        let mut subscriptions = entry.subscriptions.lock();

        if !entry.state().is_live() {
            return Err(RegistryError::NotOpen(entry.id()));
        }
        if subscriptions.contains_key(slot.topic()) {
            return Ok(false);
        }

        let topic = Arc::clone(slot.topic_arc());
        subscriptions.insert(
            Arc::clone(&topic),
            Subscription {
                topic,
                created_at: Instant::now(),
            },
        );
        slot.insert(entry.id());

        tracing::debug!(
            connection_id = entry.id(),
            topic = %slot.topic(),
            subscribers = slot.subscriber_count(),
            "Subscribed"
        );

        Ok(true)
    }

    /// Remove a subscription inside the topic's critical section
    fn detach(&self, slot: &mut TopicSlot, entry: &ConnectionEntry) -> bool {
        let mut subscriptions = entry.subscriptions.lock();
        let in_registry = subscriptions.remove(slot.topic()).is_some();
        let in_router = slot.remove(entry.id());
        in_registry || in_router
    }

    /// Close connections that overstayed `Draining` or went idle
    ///
    /// Returns the ids that were closed.
    pub fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        let entries: Vec<Arc<ConnectionEntry>> =
            self.connections.read().values().cloned().collect();

        let mut closed = Vec::new();
        for entry in entries {
            let reason = match entry.state() {
                ConnectionState::Closed => Some("transport closed"),
                ConnectionState::Draining if self.drain_expired(&entry, now) => {
                    Some("drain grace period elapsed")
                }
                _ if !entry.is_local() && entry.idle_for(now) >= self.idle_timeout => {
                    Some("idle timeout")
                }
                _ => None,
            };

            if let Some(reason) = reason {
                tracing::info!(
                    connection_id = entry.id(),
                    reason = reason,
                    queue_depth = entry.queue_depth(),
                    dropped = entry.dropped(),
                    "Evicting connection"
                );
                if self.deregister(entry.id()) {
                    closed.push(entry.id());
                }
            }
        }

        closed
    }

    fn drain_expired(&self, entry: &ConnectionEntry, now: Instant) -> bool {
        entry
            .draining_since()
            .is_some_and(|since| now.saturating_duration_since(since) >= self.drain_grace_period)
    }

    /// Spawn the periodic sweep
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_sweep_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep(Instant::now());
            }
        })
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Counters for one connection
    pub fn connection_stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        self.get(id).ok().map(|entry| entry.stats())
    }

    /// Counters for every connection, ordered by id
    pub fn stats(&self) -> Vec<ConnectionStats> {
        let entries: Vec<Arc<ConnectionEntry>> =
            self.connections.read().values().cloned().collect();
        let mut stats: Vec<ConnectionStats> = entries.iter().map(|e| e.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Check that the router's index and the registry's reverse index agree
    ///
    /// Meant for quiescent states (tests, diagnostics); concurrent subscribes
    /// may be observed half-way through a topic's critical section.
    pub fn verify_index_consistency(&self) -> Result<(), String> {
        let mut forward: BTreeSet<(String, ConnectionId)> = BTreeSet::new();
        self.router.for_each_slot(|slot| {
            for &id in slot.subscribers() {
                forward.insert((slot.topic().to_string(), id));
            }
        });

        let entries: Vec<Arc<ConnectionEntry>> =
            self.connections.read().values().cloned().collect();
        let mut reverse: BTreeSet<(String, ConnectionId)> = BTreeSet::new();
        for entry in &entries {
            for topic in entry.subscriptions.lock().keys() {
                reverse.insert((topic.to_string(), entry.id()));
            }
        }

        if let Some((topic, id)) = forward.difference(&reverse).next() {
            return Err(format!(
                "router lists connection {} on '{}' but the registry does not",
                id, topic
            ));
        }
        if let Some((topic, id)) = reverse.difference(&forward).next() {
            return Err(format!(
                "registry lists connection {} on '{}' but the router does not",
                id, topic
            ));
        }

        Ok(())
    }

    /// Ids of all registered connections
    pub fn ids(&self) -> HashSet<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }
}
