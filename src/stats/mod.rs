//! Observability counters exposed for external polling

pub mod metrics;

pub use metrics::{ConnectionStats, RelayStats, TopicStats};
