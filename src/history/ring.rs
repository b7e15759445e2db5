//! Fixed-capacity envelope ring

use std::collections::VecDeque;
use std::sync::Arc;

use crate::ingest::Envelope;

/// Ring buffer holding the most recent envelopes of one topic
#[derive(Debug)]
pub struct HistoryRing {
    /// Maximum number of envelopes retained
    capacity: usize,
    /// Retained envelopes, oldest first
    entries: VecDeque<Arc<Envelope>>,
    /// Number of envelopes overwritten so far
    evicted: u64,
}

impl HistoryRing {
    /// Create a ring; a capacity of 0 is raised to 1
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    /// Append an envelope, overwriting the oldest one when full
    pub fn push(&mut self, envelope: Arc<Envelope>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(envelope);
    }

    /// Up to `max_count` most recent envelopes, in ascending sequence order
    pub fn snapshot(&self, max_count: usize) -> Vec<Arc<Envelope>> {
        let skip = self.entries.len().saturating_sub(max_count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of envelopes lost to overwriting
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sequence range currently retained
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        let first = self.entries.front()?.sequence();
        let last = self.entries.back()?.sequence();
        Some((first, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestAdapter;

    fn envelopes(count: usize) -> Vec<Arc<Envelope>> {
        let adapter = IngestAdapter::new(1024);
        (0..count)
            .map(|i| Arc::new(adapter.ingest("depth", i.to_string().as_bytes()).unwrap()))
            .collect()
    }

    fn sequences(entries: &[Arc<Envelope>]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence()).collect()
    }

    #[test]
    fn test_overwrites_oldest() {
        let mut ring = HistoryRing::with_capacity(3);
        for envelope in envelopes(4) {
            ring.push(envelope);
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.evicted(), 1);
        assert_eq!(sequences(&ring.snapshot(10)), vec![2, 3, 4]);
        assert_eq!(ring.sequence_range(), Some((2, 4)));
    }

    #[test]
    fn test_snapshot_limits_to_most_recent() {
        let mut ring = HistoryRing::with_capacity(10);
        for envelope in envelopes(6) {
            ring.push(envelope);
        }

        assert_eq!(sequences(&ring.snapshot(2)), vec![5, 6]);
        assert!(ring.snapshot(0).is_empty());
    }

    #[test]
    fn test_empty_ring() {
        let ring = HistoryRing::with_capacity(5);

        assert!(ring.is_empty());
        assert!(ring.snapshot(5).is_empty());
        assert!(ring.sequence_range().is_none());
    }

    #[test]
    fn test_zero_capacity_raised() {
        let mut ring = HistoryRing::with_capacity(0);
        for envelope in envelopes(2) {
            ring.push(envelope);
        }

        assert_eq!(ring.capacity(), 1);
        assert_eq!(sequences(&ring.snapshot(5)), vec![2]);
    }
}
