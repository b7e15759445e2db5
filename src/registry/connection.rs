//! Per-connection delivery state

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::ingest::Envelope;
use crate::stats::ConnectionStats;

/// Unique connection identifier, assigned by the registry
pub type ConnectionId = u64;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, waiting for the authentication hook
    Connecting,
    /// Receiving live fan-out
    Open,
    /// Outbound queue overflowed; shedding until it drains
    Draining,
    /// Terminal
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Open => 1,
            ConnectionState::Draining => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the connection may subscribe and receive fan-out
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Draining)
    }
}

/// A topic subscription held by one connection
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: Arc<str>,
    pub created_at: Instant,
}

/// Registry-side view of a connection
///
/// The outbound queue is a bounded mpsc channel: the broadcaster is the only
/// producer (via [`ConnectionEntry::enqueue`]) and the connection's transmit
/// loop, holding the matching [`Outbound`], is the only consumer.
pub struct ConnectionEntry {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    /// In-process consumer with no socket; exempt from the idle sweep
    local: bool,
    created_at: Instant,
    state: AtomicU8,
    draining_since: Mutex<Option<Instant>>,
    tx: mpsc::Sender<Arc<Envelope>>,
    queue_limit: usize,
    pub(super) subscriptions: Mutex<HashMap<Arc<str>, Subscription>>,
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    /// Milliseconds after `created_at` of the last successful write
    last_write_ms: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ConnectionEntry {
    pub(super) fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        local: bool,
        queue_limit: usize,
    ) -> (Arc<Self>, Outbound) {
        let queue_limit = queue_limit.max(1);
        let (tx, rx) = mpsc::channel(queue_limit);
        let (shutdown, _) = watch::channel(false);

        let entry = Arc::new(Self {
            id,
            peer_addr,
            local,
            created_at: Instant::now(),
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            draining_since: Mutex::new(None),
            tx,
            queue_limit,
            subscriptions: Mutex::new(HashMap::new()),
            enqueued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            shutdown,
        });

        let outbound = Outbound {
            entry: Arc::clone(&entry),
            rx,
            discard: HashMap::new(),
        };

        (entry, outbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether this is an in-process consumer rather than a socket
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Envelopes currently waiting in the outbound queue
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// Envelopes accepted into the outbound queue
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Frames successfully written to the transport
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Envelopes shed because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection entered `Draining`, if it is draining
    pub fn draining_since(&self) -> Option<Instant> {
        *self.draining_since.lock()
    }

    /// Time of the last successful write (creation time if none yet)
    pub fn last_write(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_write_ms.load(Ordering::Relaxed))
    }

    /// Time since the last successful write
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_write())
    }

    /// Subscribed topic names, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .lock()
            .keys()
            .map(|t| t.to_string())
            .collect();
        topics.sort();
        topics
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains_key(topic)
    }

    /// Snapshot of this connection's counters
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            peer_addr: self.peer_addr.map(|a| a.to_string()),
            state: self.state(),
            topics: self.topics(),
            enqueued: self.enqueued(),
            sent: self.sent(),
            dropped: self.dropped(),
            queue_depth: self.queue_depth(),
            queue_limit: self.queue_limit,
            connected_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Push an envelope onto the outbound queue without waiting
    ///
    /// Returns `false` when the envelope was not queued: the connection is
    /// closed, or the queue is full and the newest envelope (this one) is shed.
    pub(crate) fn enqueue(&self, envelope: Arc<Envelope>) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }

        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(envelope)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(
                    connection_id = self.id,
                    topic = %envelope.topic(),
                    sequence = envelope.sequence(),
                    dropped = dropped,
                    "Outbound queue full, envelope shed"
                );
                self.enter_draining();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.set_state(ConnectionState::Closed);
                false
            }
        }
    }

    pub(super) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(super) fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(super) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn enter_draining(&self) {
        if self.transition(ConnectionState::Open, ConnectionState::Draining) {
            *self.draining_since.lock() = Some(Instant::now());
            tracing::debug!(
                connection_id = self.id,
                queue_limit = self.queue_limit,
                dropped = self.dropped(),
                "Connection draining"
            );
        }
    }

    /// Leave `Draining` once the queue is back to half the limit
    fn on_dequeued(&self) {
        if self.state() != ConnectionState::Draining {
            return;
        }
        if self.queue_depth() <= self.queue_limit / 2
            && self.transition(ConnectionState::Draining, ConnectionState::Open)
        {
            *self.draining_since.lock() = None;
            tracing::debug!(
                connection_id = self.id,
                dropped = self.dropped(),
                "Connection recovered from draining"
            );
        }
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_write_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local", &self.local)
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .field("queue_limit", &self.queue_limit)
            .finish()
    }
}

/// Receiving half of a connection's outbound queue
///
/// Owned by the connection's transmit loop.
pub struct Outbound {
    entry: Arc<ConnectionEntry>,
    rx: mpsc::Receiver<Arc<Envelope>>,
    /// Per-topic sequence at or below which queued envelopes are skipped
    discard: HashMap<Arc<str>, u64>,
}

impl Outbound {
    pub fn id(&self) -> ConnectionId {
        self.entry.id
    }

    pub fn entry(&self) -> &Arc<ConnectionEntry> {
        &self.entry
    }

    /// Wait for the next queued envelope
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            let envelope = self.rx.recv().await?;
            self.entry.on_dequeued();
            if !self.is_discarded(&envelope) {
                return Some(envelope);
            }
        }
    }

    /// Take the next queued envelope if one is ready
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            let envelope = self.rx.try_recv().ok()?;
            self.entry.on_dequeued();
            if !self.is_discarded(&envelope) {
                return Some(envelope);
            }
        }
    }

    /// Skip envelopes on `topic` still queued up to and including `sequence`
    ///
    /// Used after a subscription is withdrawn before its reply reached the
    /// client. The cutoff lifts on the first later envelope for the topic.
    pub fn discard_through(&mut self, topic: &str, sequence: u64) {
        self.discard.insert(Arc::from(topic), sequence);
    }

    fn is_discarded(&mut self, envelope: &Envelope) -> bool {
        if self.discard.is_empty() {
            return false;
        }
        match self.discard.get(envelope.topic()) {
            Some(&cutoff) if envelope.sequence() <= cutoff => {
                tracing::trace!(
                    connection_id = self.entry.id,
                    topic = %envelope.topic(),
                    sequence = envelope.sequence(),
                    "Discarding frame of withdrawn subscription"
                );
                true
            }
            Some(_) => {
                self.discard.remove(envelope.topic());
                false
            }
            None => false,
        }
    }

    /// Record a successful frame write
    pub fn record_write(&self) {
        self.entry.record_write();
    }

    /// Record transport activity that is not a delivery (e.g. a keepalive ping)
    pub fn mark_active(&self) {
        self.entry.touch();
    }

    /// Signal that resolves when the registry closes this connection
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.entry.shutdown.subscribe(),
        }
    }
}

/// Resolves once the registry has deregistered the connection
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        // A dropped sender means the entry is gone, which is also a shutdown
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestAdapter;

    fn envelope(adapter: &IngestAdapter) -> Arc<Envelope> {
        Arc::new(adapter.ingest("depth", b"1").unwrap())
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Draining,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert!(ConnectionState::Draining.is_live());
        assert!(!ConnectionState::Connecting.is_live());
    }

    #[test]
    fn test_enqueue_until_full() {
        let adapter = IngestAdapter::new(64);
        let (entry, mut outbound) = ConnectionEntry::new(1, None, false, 2);
        entry.set_state(ConnectionState::Open);

        assert!(entry.enqueue(envelope(&adapter)));
        assert!(entry.enqueue(envelope(&adapter)));
        assert_eq!(entry.queue_depth(), 2);

        // Third is shed
        assert!(!entry.enqueue(envelope(&adapter)));
        assert_eq!(entry.dropped(), 1);
        assert_eq!(entry.state(), ConnectionState::Draining);
        assert!(entry.draining_since().is_some());

        // Draining to half the limit recovers
        let first = outbound.try_recv().unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(entry.state(), ConnectionState::Open);
        assert!(entry.draining_since().is_none());
    }

    #[test]
    fn test_discard_through_skips_withdrawn_frames() {
        let adapter = IngestAdapter::new(64);
        let (entry, mut outbound) = ConnectionEntry::new(1, None, false, 8);
        entry.set_state(ConnectionState::Open);

        for _ in 0..3 {
            entry.enqueue(envelope(&adapter));
        }
        entry.enqueue(Arc::new(adapter.ingest("boat", b"1").unwrap()));
        outbound.discard_through("depth", 2);
        entry.enqueue(envelope(&adapter));

        let received: Vec<(String, u64)> = std::iter::from_fn(|| outbound.try_recv())
            .map(|e| (e.topic().to_string(), e.sequence()))
            .collect();
        assert_eq!(
            received,
            vec![
                ("depth".to_string(), 3),
                ("boat".to_string(), 1),
                ("depth".to_string(), 4),
            ]
        );
        assert_eq!(entry.queue_depth(), 0);
        assert!(outbound.discard.is_empty());
    }

    #[test]
    fn test_enqueue_closed() {
        let adapter = IngestAdapter::new(64);
        let (entry, _outbound) = ConnectionEntry::new(1, None, false, 4);
        entry.set_state(ConnectionState::Closed);

        assert!(!entry.enqueue(envelope(&adapter)));
        assert_eq!(entry.dropped(), 0);
    }

    #[test]
    fn test_enqueue_after_receiver_dropped() {
        let adapter = IngestAdapter::new(64);
        let (entry, outbound) = ConnectionEntry::new(1, None, false, 4);
        entry.set_state(ConnectionState::Open);
        drop(outbound);

        assert!(!entry.enqueue(envelope(&adapter)));
        assert_eq!(entry.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_record_write_updates_idle() {
        let (entry, outbound) = ConnectionEntry::new(1, None, false, 4);
        let later = Instant::now() + Duration::from_secs(10);

        let idle_before = entry.idle_for(later);
        assert!(idle_before >= Duration::from_secs(10));

        std::thread::sleep(Duration::from_millis(5));
        outbound.record_write();

        assert_eq!(entry.sent(), 1);
        assert!(entry.idle_for(later) < idle_before);
    }
}
