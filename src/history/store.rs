//! Per-topic history storage

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::ring::HistoryRing;
use crate::ingest::Envelope;

/// History rings for every topic
///
/// The topic map is read-mostly; each ring has its own mutex so appends on
/// unrelated topics never contend.
pub struct HistoryBuffer {
    capacity: usize,
    rings: RwLock<HashMap<Arc<str>, Arc<Mutex<HistoryRing>>>>,
}

impl HistoryBuffer {
    /// Create a buffer whose rings hold `capacity` envelopes each
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Per-topic ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an envelope to its topic's ring
    pub fn append(&self, envelope: Arc<Envelope>) {
        let ring = self.ring(envelope.topic());
        ring.lock().push(envelope);
    }

    /// Up to `max_count` most recent envelopes for `topic`, oldest first
    ///
    /// Unknown topics yield an empty snapshot without allocating a ring.
    pub fn snapshot(&self, topic: &str, max_count: usize) -> Vec<Arc<Envelope>> {
        let Some(ring) = self.rings.read().get(topic).cloned() else {
            return Vec::new();
        };
        let snapshot = ring.lock().snapshot(max_count);
        snapshot
    }

    /// Number of envelopes retained for `topic`
    pub fn len(&self, topic: &str) -> usize {
        self.rings
            .read()
            .get(topic)
            .map(|ring| ring.lock().len())
            .unwrap_or(0)
    }

    /// Number of topics with a ring
    pub fn topic_count(&self) -> usize {
        self.rings.read().len()
    }

    fn ring(&self, topic: &str) -> Arc<Mutex<HistoryRing>> {
        if let Some(ring) = self.rings.read().get(topic) {
            return Arc::clone(ring);
        }

        let mut rings = self.rings.write();
        Arc::clone(
            rings
                .entry(Arc::from(topic))
                .or_insert_with(|| Arc::new(Mutex::new(HistoryRing::with_capacity(self.capacity)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestAdapter;

    #[test]
    fn test_unknown_topic_empty() {
        let history = HistoryBuffer::new(5);
        assert!(history.snapshot("depth", 10).is_empty());
        assert_eq!(history.len("depth"), 0);
    }

    #[test]
    fn test_rings_created_lazily() {
        let history = HistoryBuffer::new(5);
        assert_eq!(history.topic_count(), 0);

        history.snapshot("depth", 1);
        assert_eq!(history.topic_count(), 0);

        let adapter = IngestAdapter::new(1024);
        history.append(Arc::new(adapter.ingest("depth", b"1").unwrap()));
        assert_eq!(history.topic_count(), 1);
    }

    #[test]
    fn test_topics_isolated() {
        let adapter = IngestAdapter::new(1024);
        let history = HistoryBuffer::new(3);

        for i in 0..4 {
            history.append(Arc::new(adapter.ingest("depth", format!("{}", i).as_bytes()).unwrap()));
        }
        history.append(Arc::new(adapter.ingest("winch", br#""idle""#).unwrap()));

        let depth: Vec<u64> = history
            .snapshot("depth", 10)
            .iter()
            .map(|e| e.sequence())
            .collect();
        assert_eq!(depth, vec![2, 3, 4]);
        assert_eq!(history.len("winch"), 1);
    }
}
