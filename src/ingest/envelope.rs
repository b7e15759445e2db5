//! Canonical message unit

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use serde_json::value::RawValue;

/// Wire shape of a delivery frame
///
/// Field names are part of the subscriber contract.
#[derive(Serialize)]
struct DeliveryFrame<'a> {
    topic: &'a str,
    sequence: u64,
    timestamp: u64,
    payload: &'a RawValue,
}

/// An immutable, sequenced, timestamped telemetry message
///
/// The JSON delivery frame is encoded once when the envelope is created and
/// stored as `Bytes`, so every subscriber queue and the history buffer share
/// the same allocation.
#[derive(Debug)]
pub struct Envelope {
    topic: Arc<str>,
    sequence: u64,
    timestamp: u64,
    payload: Box<RawValue>,
    frame: Bytes,
}

impl Envelope {
    /// Build an envelope and encode its delivery frame
    pub(crate) fn new(
        topic: Arc<str>,
        sequence: u64,
        timestamp: u64,
        payload: Box<RawValue>,
    ) -> serde_json::Result<Self> {
        let frame = serde_json::to_vec(&DeliveryFrame {
            topic: &topic,
            sequence,
            timestamp,
            payload: &payload,
        })?;

        Ok(Self {
            topic,
            sequence,
            timestamp,
            payload,
            frame: Bytes::from(frame),
        })
    }

    /// Topic this envelope was published on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Shared handle to the topic name
    pub fn topic_arc(&self) -> &Arc<str> {
        &self.topic
    }

    /// Relay-assigned per-topic sequence number (starts at 1)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Relay-assigned admission time in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Raw JSON payload as published
    pub fn payload(&self) -> &RawValue {
        &self.payload
    }

    /// Encoded `{topic, sequence, timestamp, payload}` frame (UTF-8 JSON)
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }
}

/// Current relay clock in milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_field_names() {
        let payload = RawValue::from_string(r#"{"d":12.3}"#.to_string()).unwrap();
        let envelope = Envelope::new(Arc::from("depth"), 4, 1_700_000_000_000, payload).unwrap();

        let frame: serde_json::Value = serde_json::from_slice(envelope.frame()).unwrap();
        let object = frame.as_object().unwrap();

        assert_eq!(object.len(), 4);
        assert_eq!(object["topic"], "depth");
        assert_eq!(object["sequence"], 4);
        assert_eq!(object["timestamp"], 1_700_000_000_000u64);
        assert_eq!(object["payload"]["d"], 12.3);
    }

    #[test]
    fn test_payload_kept_verbatim() {
        let payload = RawValue::from_string(r#"[1, 2, 3]"#.to_string()).unwrap();
        let envelope = Envelope::new(Arc::from("boat"), 1, 0, payload).unwrap();

        assert_eq!(envelope.payload().get(), "[1, 2, 3]");
        assert_eq!(envelope.topic(), "boat");
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in milliseconds
        assert!(now_millis() > 1_577_836_800_000);
    }
}
