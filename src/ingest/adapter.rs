//! Ingest adapter: validation and sequence stamping

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::value::RawValue;

use super::envelope::{now_millis, Envelope};
use super::error::AdapterError;
use super::validator::{AcceptAll, PayloadValidator};

/// Maximum topic name length in bytes
pub const MAX_TOPIC_LEN: usize = 256;

/// A validated producer message that has not been sequenced yet
#[derive(Debug)]
pub struct Admitted {
    topic: Arc<str>,
    payload: Box<RawValue>,
}

impl Admitted {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn topic_arc(&self) -> &Arc<str> {
        &self.topic
    }

    /// Size of the validated payload in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.get().len()
    }
}

/// Normalizes producer messages into [`Envelope`]s
///
/// Owns the per-topic sequence counters. Counters live only in memory; after
/// a restart every topic starts again at 1, which subscribers observe as a
/// sequence regression.
pub struct IngestAdapter {
    payload_max_bytes: usize,
    validator: Arc<dyn PayloadValidator>,
    counters: RwLock<HashMap<Arc<str>, Arc<AtomicU64>>>,
}

impl IngestAdapter {
    /// Create an adapter that accepts any well-formed JSON payload
    pub fn new(payload_max_bytes: usize) -> Self {
        Self::with_validator(payload_max_bytes, Arc::new(AcceptAll))
    }

    /// Create an adapter with a custom schema check
    pub fn with_validator(payload_max_bytes: usize, validator: Arc<dyn PayloadValidator>) -> Self {
        Self {
            payload_max_bytes,
            validator,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Configured payload size limit in bytes
    pub fn payload_max_bytes(&self) -> usize {
        self.payload_max_bytes
    }

    /// Validate a producer message
    ///
    /// Checks the topic name, the size limit, JSON well-formedness and the
    /// pluggable schema, in that order.
    pub fn admit(&self, topic: &str, raw: &[u8]) -> Result<Admitted, AdapterError> {
        validate_topic(topic)?;

        if raw.len() > self.payload_max_bytes {
            return Err(AdapterError::PayloadTooLarge {
                size: raw.len(),
                limit: self.payload_max_bytes,
            });
        }

        let payload: Box<RawValue> = serde_json::from_slice(raw)
            .map_err(|e| AdapterError::InvalidPayload(format!("malformed JSON: {}", e)))?;

        self.validator
            .validate(topic, &payload)
            .map_err(AdapterError::InvalidPayload)?;

        Ok(Admitted {
            topic: self.topic_handle(topic),
            payload,
        })
    }

    /// Assign the next sequence number and the relay timestamp
    ///
    /// Callers that need a stable per-topic order must serialize calls for the
    /// same topic; the broadcaster does this under the topic's lock.
    pub fn stamp(&self, admitted: Admitted) -> Result<Envelope, AdapterError> {
        let counter = self.counter(&admitted.topic);
        let sequence = counter.fetch_add(1, Ordering::Relaxed) + 1;

        Envelope::new(admitted.topic, sequence, now_millis(), admitted.payload)
            .map_err(|e| AdapterError::InvalidPayload(format!("encoding failed: {}", e)))
    }

    /// Validate and stamp in one step
    pub fn ingest(&self, topic: &str, raw: &[u8]) -> Result<Envelope, AdapterError> {
        let admitted = self.admit(topic, raw)?;
        self.stamp(admitted)
    }

    /// Last sequence number assigned on `topic` (0 if none)
    pub fn last_sequence(&self, topic: &str) -> u64 {
        self.counters
            .read()
            .get(topic)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn counter(&self, topic: &Arc<str>) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(topic) {
            return Arc::clone(counter);
        }

        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(Arc::clone(topic))
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Reuse the interned topic name when the topic has been seen before
    fn topic_handle(&self, topic: &str) -> Arc<str> {
        self.counters
            .read()
            .get_key_value(topic)
            .map(|(key, _)| Arc::clone(key))
            .unwrap_or_else(|| Arc::from(topic))
    }
}

/// Check a topic name against the naming rules
pub fn validate_topic(topic: &str) -> Result<(), AdapterError> {
    if topic.is_empty() {
        return Err(AdapterError::InvalidTopic("topic is empty".into()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(AdapterError::InvalidTopic(format!(
            "topic exceeds {} bytes",
            MAX_TOPIC_LEN
        )));
    }
    if topic.chars().any(char::is_control) {
        return Err(AdapterError::InvalidTopic(
            "topic contains control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RequiredFields;

    #[test]
    fn test_sequence_per_topic() {
        let adapter = IngestAdapter::new(1024);

        let a1 = adapter.ingest("depth", br#"{"d":1}"#).unwrap();
        let a2 = adapter.ingest("depth", br#"{"d":2}"#).unwrap();
        let b1 = adapter.ingest("winch", br#""idle""#).unwrap();
        let a3 = adapter.ingest("depth", br#"{"d":3}"#).unwrap();

        assert_eq!(a1.sequence(), 1);
        assert_eq!(a2.sequence(), 2);
        assert_eq!(a3.sequence(), 3);
        assert_eq!(b1.sequence(), 1);
        assert_eq!(adapter.last_sequence("depth"), 3);
        assert_eq!(adapter.last_sequence("unknown"), 0);
    }

    #[test]
    fn test_timestamp_assigned() {
        let adapter = IngestAdapter::new(1024);
        let before = now_millis();
        let envelope = adapter.ingest("depth", b"1").unwrap();

        assert!(envelope.timestamp() >= before);
    }

    #[test]
    fn test_payload_too_large() {
        let adapter = IngestAdapter::new(8);
        let result = adapter.ingest("depth", br#"{"d":12.345}"#);

        assert_eq!(
            result.unwrap_err(),
            AdapterError::PayloadTooLarge { size: 12, limit: 8 }
        );
        // Rejected messages do not consume a sequence number
        assert_eq!(adapter.last_sequence("depth"), 0);
    }

    #[test]
    fn test_payload_at_limit_accepted() {
        let adapter = IngestAdapter::new(8);
        assert!(adapter.ingest("depth", b"12345678").is_ok());
    }

    #[test]
    fn test_malformed_payload() {
        let adapter = IngestAdapter::new(1024);

        assert!(matches!(
            adapter.ingest("depth", b"{\"d\":"),
            Err(AdapterError::InvalidPayload(_))
        ));
        assert!(matches!(
            adapter.ingest("depth", b"not json"),
            Err(AdapterError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_invalid_topic() {
        let adapter = IngestAdapter::new(1024);

        assert!(matches!(
            adapter.ingest("", b"1"),
            Err(AdapterError::InvalidTopic(_))
        ));
        assert!(matches!(
            adapter.ingest("depth\n", b"1"),
            Err(AdapterError::InvalidTopic(_))
        ));
        let long = "t".repeat(MAX_TOPIC_LEN + 1);
        assert!(matches!(
            adapter.ingest(&long, b"1"),
            Err(AdapterError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_schema_validator() {
        let validator = RequiredFields::new().require("depth", ["sensor1"]);
        let adapter = IngestAdapter::with_validator(1024, Arc::new(validator));

        assert!(adapter.ingest("depth", br#"{"sensor1":120}"#).is_ok());
        assert!(matches!(
            adapter.ingest("depth", br#"{"sensor2":180}"#),
            Err(AdapterError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_topic_interned() {
        let adapter = IngestAdapter::new(1024);
        let first = adapter.ingest("depth", b"1").unwrap();
        let second = adapter.ingest("depth", b"2").unwrap();

        assert!(Arc::ptr_eq(first.topic_arc(), second.topic_arc()));
    }
}
