//! Real-time telemetry relay
//!
//! Producers publish JSON telemetry (sensor depths, winch state, boat
//! position) on named topics; the relay stamps each message with a per-topic
//! sequence number and fans it out to every live subscriber over WebSocket.
//!
//! # Architecture
//!
//! ```text
//!   producer ──► IngestAdapter ──► Broadcaster ──┬──► HistoryBuffer (ring per topic)
//!               (validate, stamp)      │          │
//!                                      ▼          │
//!                                 TopicRouter     │
//!                              (topic → conn ids) │
//!                                      │          │
//!                                      ▼          │
//!                             ConnectionRegistry ◄┘ snapshot for late joiners
//!                           (bounded queue per conn)
//!                                      │
//!                                      ▼
//!                           connection task ──► WebSocket
//! ```
//!
//! [`Relay`] composes these parts and is transport independent;
//! [`RelayServer`] binds it to a WebSocket listener. Producers are WebSocket
//! clients, the MQTT bridge ([`ingest::MqttBridge`]) and the built-in trawl
//! simulator.

pub mod broadcast;
pub mod error;
pub mod history;
pub mod ingest;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use ingest::Envelope;
pub use relay::{Relay, RelayConfig};
pub use server::{RelayServer, ServerConfig};
