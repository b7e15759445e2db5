//! Broadcaster implementation

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::history::HistoryBuffer;
use crate::ingest::{Admitted, Envelope, IngestAdapter};
use crate::registry::ConnectionRegistry;
use crate::router::{TopicRouter, TopicSlot};

/// Outcome of publishing one envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    /// Sequence number assigned to the envelope
    pub sequence: u64,
    /// Subscribers whose queue accepted the envelope
    pub delivered: usize,
    /// Subscribers that shed the envelope (queue full or closing)
    pub dropped: usize,
    /// Subscriber ids that disappeared mid-publish
    pub stale: usize,
}

/// Publishes envelopes to history and to every subscribed connection
pub struct Broadcaster {
    adapter: IngestAdapter,
    router: Arc<TopicRouter>,
    registry: Arc<ConnectionRegistry>,
    history: Arc<HistoryBuffer>,
}

impl Broadcaster {
    pub fn new(
        adapter: IngestAdapter,
        router: Arc<TopicRouter>,
        registry: Arc<ConnectionRegistry>,
        history: Arc<HistoryBuffer>,
    ) -> Self {
        Self {
            adapter,
            router,
            registry,
            history,
        }
    }

    /// The ingest adapter owning the sequence counters
    pub fn adapter(&self) -> &IngestAdapter {
        &self.adapter
    }

    /// Validate a raw producer message and publish it
    pub fn publish_raw(&self, topic: &str, raw: &[u8]) -> Result<(Arc<Envelope>, FanoutReport)> {
        let admitted = self.adapter.admit(topic, raw)?;
        self.publish(admitted)
    }

    /// Sequence, record and fan out an admitted message
    ///
    /// Sequence assignment, the history append and the enqueue to every
    /// subscriber all happen inside the topic's critical section, so each
    /// subscriber sees ascending sequence numbers and a concurrent
    /// snapshot-then-subscribe can neither miss nor repeat an envelope.
    pub fn publish(&self, admitted: Admitted) -> Result<(Arc<Envelope>, FanoutReport)> {
        let topic = Arc::clone(admitted.topic_arc());

        let published = self.router.with_slot(&topic, |slot| {
            let envelope = Arc::new(self.adapter.stamp(admitted)?);
            self.history.append(Arc::clone(&envelope));
            slot.record_publish(envelope.sequence());
            let report = self.deliver(slot, &envelope);
            Ok::<_, crate::ingest::AdapterError>((envelope, report))
        })?;

        let (envelope, report) = published?;

        tracing::trace!(
            topic = %topic,
            sequence = report.sequence,
            delivered = report.delivered,
            dropped = report.dropped,
            "Published"
        );

        Ok((envelope, report))
    }

    fn deliver(&self, slot: &TopicSlot, envelope: &Arc<Envelope>) -> FanoutReport {
        let mut report = FanoutReport {
            sequence: envelope.sequence(),
            ..FanoutReport::default()
        };

        self.registry
            .enqueue_each(slot.subscribers(), envelope, |id, result| match result {
                Ok(true) => report.delivered += 1,
                Ok(false) => report.dropped += 1,
                Err(e) => {
                    // Expected when a disconnect races the publish
                    report.stale += 1;
                    tracing::debug!(connection_id = id, error = %e, "Skipping stale subscriber");
                }
            });

        report
    }
}
