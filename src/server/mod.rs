//! WebSocket server
//!
//! Binds a [`Relay`](crate::relay::Relay) to a TCP listener. Each accepted
//! socket runs on its own task: WebSocket handshake, `on_connection`
//! authentication, then a loop that serves client requests and writes queued
//! envelopes until the client leaves or the relay closes it.

pub mod config;
mod connection;
pub mod handler;
pub mod listener;

pub use config::ServerConfig;
pub use handler::{AuthResult, DefaultHandler, RelayHandler};
pub use listener::RelayServer;
