//! Request parsing and reply encoding

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Error;
use crate::registry::ConnectionId;
use crate::stats::RelayStats;

/// A parsed client request
#[derive(Debug)]
pub struct ClientRequest {
    /// Correlation id echoed in the reply
    pub id: Option<u64>,
    pub request: Request,
}

#[derive(Debug)]
pub enum Request {
    Publish {
        topic: String,
        payload: Box<RawValue>,
    },
    Subscribe {
        topic: String,
        /// Whether to send recent history first
        snapshot: bool,
        max_snapshot: Option<usize>,
    },
    Unsubscribe {
        topic: String,
    },
    Stats,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Publish { .. } => "publish",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Stats => "stats",
        }
    }
}

/// Wire shape of every request; validated into [`Request`]
#[derive(Deserialize)]
struct RawRequest {
    op: Option<String>,
    id: Option<u64>,
    topic: Option<String>,
    payload: Option<Box<RawValue>>,
    snapshot: Option<bool>,
    max_snapshot: Option<usize>,
}

/// A request that could not be understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadRequest {
    /// Echoed when the frame was JSON enough to carry one
    pub id: Option<u64>,
    pub reason: String,
}

impl BadRequest {
    fn new(id: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }

    pub fn into_reply(self) -> ServerReply {
        ServerReply::Error {
            id: self.id,
            code: "bad_request",
            message: self.reason,
        }
    }
}

impl ClientRequest {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, BadRequest> {
        let raw: RawRequest = serde_json::from_str(text)
            .map_err(|e| BadRequest::new(None, format!("invalid request: {}", e)))?;
        let id = raw.id;

        let topic = |raw_topic: Option<String>| {
            raw_topic.ok_or_else(|| BadRequest::new(id, "missing field 'topic'"))
        };

        let request = match raw.op.as_deref() {
            Some("publish") => Request::Publish {
                topic: topic(raw.topic)?,
                payload: raw
                    .payload
                    .ok_or_else(|| BadRequest::new(id, "missing field 'payload'"))?,
            },
            Some("subscribe") => Request::Subscribe {
                topic: topic(raw.topic)?,
                snapshot: raw.snapshot.unwrap_or(true),
                max_snapshot: raw.max_snapshot,
            },
            Some("unsubscribe") => Request::Unsubscribe {
                topic: topic(raw.topic)?,
            },
            Some("stats") => Request::Stats,
            Some(other) => return Err(BadRequest::new(id, format!("unknown op '{}'", other))),
            None => return Err(BadRequest::new(id, "missing field 'op'")),
        };

        Ok(ClientRequest { id, request })
    }
}

/// Frames sent by the server besides envelope deliveries
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Welcome {
        connection_id: ConnectionId,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        topic: String,
        sequence: u64,
        delivered: usize,
        dropped: usize,
    },
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        topic: String,
        /// Number of history frames that follow
        snapshot: usize,
        last_sequence: u64,
    },
    Unsubscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        topic: String,
        was_subscribed: bool,
    },
    Stats {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        stats: RelayStats,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: &'static str,
        message: String,
    },
}

impl ServerReply {
    pub fn error(id: Option<u64>, err: &Error) -> Self {
        ServerReply::Error {
            id,
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::AdapterError;

    #[test]
    fn test_parse_publish() {
        let req = ClientRequest::parse(
            r#"{"op":"publish","id":4,"topic":"depth","payload":{"sensor1_depth":121.5}}"#,
        )
        .unwrap();

        assert_eq!(req.id, Some(4));
        match req.request {
            Request::Publish { topic, payload } => {
                assert_eq!(topic, "depth");
                assert_eq!(payload.get(), r#"{"sensor1_depth":121.5}"#);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscribe_defaults() {
        let req = ClientRequest::parse(r#"{"op":"subscribe","topic":"winch"}"#).unwrap();

        assert_eq!(req.id, None);
        match req.request {
            Request::Subscribe {
                topic,
                snapshot,
                max_snapshot,
            } => {
                assert_eq!(topic, "winch");
                assert!(snapshot);
                assert_eq!(max_snapshot, None);
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let req =
            ClientRequest::parse(r#"{"op":"subscribe","topic":"winch","snapshot":false}"#).unwrap();
        assert!(matches!(req.request, Request::Subscribe { snapshot: false, .. }));
    }

    #[test]
    fn test_parse_errors_keep_id() {
        let err = ClientRequest::parse(r#"{"op":"publish","id":9,"topic":"depth"}"#).unwrap_err();
        assert_eq!(err.id, Some(9));
        assert!(err.reason.contains("payload"));

        let err = ClientRequest::parse(r#"{"op":"teleport","id":2}"#).unwrap_err();
        assert_eq!(err.id, Some(2));

        let err = ClientRequest::parse("not json").unwrap_err();
        assert_eq!(err.id, None);

        let err = ClientRequest::parse(r#"{"topic":"depth"}"#).unwrap_err();
        assert_eq!(err.reason, "missing field 'op'");
    }

    #[test]
    fn test_encode_replies() {
        let welcome = ServerReply::Welcome { connection_id: 3 }.encode().unwrap();
        assert_eq!(welcome, r#"{"type":"welcome","connection_id":3}"#);

        let ack = ServerReply::Ack {
            id: Some(1),
            topic: "depth".into(),
            sequence: 7,
            delivered: 2,
            dropped: 0,
        }
        .encode()
        .unwrap();
        assert_eq!(
            ack,
            r#"{"type":"ack","id":1,"topic":"depth","sequence":7,"delivered":2,"dropped":0}"#
        );

        let err: Error = AdapterError::PayloadTooLarge { size: 10, limit: 4 }.into();
        let reply = ServerReply::error(None, &err).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "payload_too_large");
        assert!(value.get("id").is_none());
    }
}
