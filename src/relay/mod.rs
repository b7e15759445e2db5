//! Transport-independent relay core
//!
//! [`Relay`] owns one instance of every component (registry, router, history,
//! broadcaster). Nothing is global, so several relays can live in one process
//! and tests build their own.

pub mod config;
pub mod hub;

pub use config::RelayConfig;
pub use hub::{PublishReceipt, Relay, Subscribed};
