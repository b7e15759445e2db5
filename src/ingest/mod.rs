//! Producer ingest
//!
//! Everything a producer sends passes through the [`IngestAdapter`] before it
//! reaches the router: the topic and payload are validated, the payload is
//! checked against the pluggable [`PayloadValidator`], and the message is
//! stamped with a relay-assigned sequence number and timestamp to become an
//! immutable [`Envelope`].
//!
//! Admission (validation) and stamping are split so the broadcaster can run
//! the expensive JSON parse outside the per-topic critical section and only
//! assign the sequence number while holding it.
//!
//! Two in-process producers feed the same path: the [`MqttBridge`], which
//! republishes messages from an MQTT broker, and the [`TrawlSimulator`].

pub mod adapter;
pub mod bridge;
pub mod envelope;
pub mod error;
pub mod simulator;
pub mod validator;

pub use adapter::{validate_topic, Admitted, IngestAdapter, MAX_TOPIC_LEN};
pub use bridge::{BridgeConfig, MqttBridge, TopicRoute};
pub use envelope::Envelope;
pub use error::AdapterError;
pub use simulator::{TrawlReading, TrawlSimulator, WinchStatus};
pub use validator::{AcceptAll, PayloadValidator, RequiredFields};
