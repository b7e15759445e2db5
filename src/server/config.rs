//! Server configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::Result;
use crate::relay::config::parse_var;
use crate::relay::RelayConfig;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Connection timeout (WebSocket handshake must complete within this time)
    pub connection_timeout: Duration,

    /// Subscribe deadline covering authorization, snapshot and its transmission
    pub subscribe_timeout: Duration,

    /// Interval between server pings
    pub keepalive_interval: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Floor for the largest inbound WebSocket message; see [`ServerConfig::frame_limit`]
    pub max_message_size: usize,

    /// Stats log interval (zero disables the summary line)
    pub stats_interval: Duration,

    /// Relay core limits and timers
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_connections: 0, // Unlimited
            connection_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            tcp_nodelay: true, // Important for low latency
            max_message_size: 1024 * 1024,
            stats_interval: Duration::from_secs(30),
            relay: RelayConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Load from `RELAY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup
    ///
    /// Reads `RELAY_BIND`, `RELAY_PORT` and `RELAY_MAX_CONNECTIONS`, plus
    /// everything [`RelayConfig::from_lookup`] reads.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            relay: RelayConfig::from_lookup(&lookup)?,
            ..Self::default()
        };

        if let Some(ip) = parse_var::<IpAddr, _>(&lookup, "RELAY_BIND")? {
            config.bind_addr.set_ip(ip);
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "RELAY_PORT")? {
            config.bind_addr.set_port(port);
        }
        if let Some(max) = parse_var(&lookup, "RELAY_MAX_CONNECTIONS")? {
            config = config.max_connections(max);
        }

        Ok(config)
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set subscribe timeout
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Set keepalive ping interval
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the stats log interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Replace the relay configuration
    pub fn relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Per-write deadline, shared with the idle timeout
    pub fn write_timeout(&self) -> Duration {
        self.relay.idle_timeout
    }

    /// Inbound message cap enforced by the WebSocket transport
    ///
    /// Never below the relay's [`RelayConfig::inbound_frame_limit`], so an
    /// oversized publish gets a `payload_too_large` reply instead of a
    /// closed socket.
    pub fn frame_limit(&self) -> usize {
        self.max_message_size.max(self.relay.inbound_frame_limit())
    }
}
