//! Connection registry
//!
//! The registry tracks every live connection: its lifecycle state, its
//! bounded outbound queue and the topics it is subscribed to. It is the
//! reverse half of the topic index; the forward half (topic → connections)
//! is the [`TopicRouter`](crate::router::TopicRouter), and the registry
//! updates both together inside the topic's critical section.
//!
//! # Back-pressure
//!
//! ```text
//!   Broadcaster ──try_send──► [ bounded mpsc: queue_depth_limit ] ──recv──► connection task ──► socket
//!                   │
//!                   └─ full: drop newest, dropped += 1, Open → Draining
//! ```
//!
//! A connection that stays `Draining` past the grace period, or that has not
//! completed a write within the idle timeout, is closed by the sweep.

pub mod connection;
pub mod error;
pub mod store;

pub use connection::{
    ConnectionEntry, ConnectionId, ConnectionState, Outbound, ShutdownSignal, Subscription,
};
pub use error::RegistryError;
pub use store::ConnectionRegistry;
