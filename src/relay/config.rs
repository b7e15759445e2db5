//! Relay core configuration

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default per-connection outbound queue depth
pub const DEFAULT_QUEUE_DEPTH_LIMIT: usize = 1000;

/// Default per-topic history ring size
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Default producer payload limit (64 KiB)
pub const DEFAULT_PAYLOAD_MAX_BYTES: usize = 64 * 1024;

/// Default idle timeout in milliseconds
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Configuration for the transport-independent relay core
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Outbound queue capacity per connection; beyond it the newest envelope is shed
    pub queue_depth_limit: usize,

    /// Envelopes retained per topic for late joiners
    pub history_capacity: usize,

    /// Maximum raw payload size accepted from producers
    pub payload_max_bytes: usize,

    /// Close connections with no successful write for this long
    pub idle_timeout: Duration,

    /// Close connections that stay `Draining` for this long
    pub drain_grace_period: Duration,

    /// How often the registry sweep runs
    pub sweep_interval: Duration,

    /// Cap on distinct topics (0 = unlimited)
    pub max_topics: usize,

    /// Upper bound on envelopes returned by one snapshot request;
    /// `None` follows `history_capacity`
    pub max_snapshot: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_depth_limit: DEFAULT_QUEUE_DEPTH_LIMIT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            payload_max_bytes: DEFAULT_PAYLOAD_MAX_BYTES,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            drain_grace_period: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            max_topics: 10_000,
            max_snapshot: None,
        }
    }
}

impl RelayConfig {
    /// Load overrides from `RELAY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary key lookup
    ///
    /// Recognized keys: `RELAY_QUEUE_DEPTH_LIMIT`, `RELAY_HISTORY_CAPACITY`,
    /// `RELAY_PAYLOAD_MAX_BYTES`, `RELAY_IDLE_TIMEOUT_MS`, `RELAY_MAX_TOPICS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(limit) = parse_var(&lookup, "RELAY_QUEUE_DEPTH_LIMIT")? {
            config = config.queue_depth_limit(limit);
        }
        if let Some(capacity) = parse_var(&lookup, "RELAY_HISTORY_CAPACITY")? {
            config = config.history_capacity(capacity);
        }
        if let Some(max) = parse_var(&lookup, "RELAY_PAYLOAD_MAX_BYTES")? {
            config = config.payload_max_bytes(max);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "RELAY_IDLE_TIMEOUT_MS")? {
            config = config.idle_timeout(Duration::from_millis(ms));
        }
        if let Some(max) = parse_var(&lookup, "RELAY_MAX_TOPICS")? {
            config = config.max_topics(max);
        }

        Ok(config)
    }

    /// Set the per-connection queue depth (minimum 1)
    pub fn queue_depth_limit(mut self, limit: usize) -> Self {
        self.queue_depth_limit = limit.max(1);
        self
    }

    /// Set the per-topic history capacity (minimum 1)
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    /// Set the payload size limit
    pub fn payload_max_bytes(mut self, max: usize) -> Self {
        self.payload_max_bytes = max;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the drain grace period
    pub fn drain_grace_period(mut self, period: Duration) -> Self {
        self.drain_grace_period = period;
        self
    }

    /// Set the sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the topic cap (0 = unlimited)
    pub fn max_topics(mut self, max: usize) -> Self {
        self.max_topics = max;
        self
    }

    /// Pin the snapshot size cap independently of the history capacity
    pub fn max_snapshot(mut self, max: usize) -> Self {
        self.max_snapshot = Some(max);
        self
    }

    /// Effective upper bound on one snapshot
    pub fn snapshot_limit(&self) -> usize {
        self.max_snapshot.unwrap_or(self.history_capacity)
    }

    /// Transport-level cap for one inbound producer message
    ///
    /// Leaves room for a message carrying up to twice the payload limit, so
    /// an oversized payload still reaches the ingest adapter and is rejected
    /// as `payload_too_large` rather than by the transport.
    pub fn inbound_frame_limit(&self) -> usize {
        self.payload_max_bytes
            .saturating_mul(2)
            .saturating_add(FRAME_OVERHEAD)
    }
}

/// Room for the request envelope around a payload
const FRAME_OVERHEAD: usize = 4096;

/// Parse an optional configuration value
pub(crate) fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
