//! Handler context
//!
//! Context passed to handler callbacks containing connection information.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::registry::ConnectionId;

/// Context passed to RelayHandler callbacks
///
/// Read-only view of one client connection. Decisions are returned from the
/// handler methods rather than applied through the context.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Registry id of the connection
    pub connection_id: ConnectionId,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// When the WebSocket handshake completed
    pub connected_at: Instant,
}

impl SessionContext {
    /// Create a new context
    pub fn new(connection_id: ConnectionId, peer_addr: SocketAddr) -> Self {
        Self {
            connection_id,
            peer_addr,
            connected_at: Instant::now(),
        }
    }

    /// Time since the handshake completed
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
