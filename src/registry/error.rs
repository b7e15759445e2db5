//! Registry error types

use super::connection::ConnectionId;

/// Error type for registry and router operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Connection id is unknown (never registered or already purged)
    NotFound(ConnectionId),
    /// Connection exists but has not been opened, or is closing
    NotOpen(ConnectionId),
    /// Creating the topic would exceed the configured topic cap
    TopicLimitReached { limit: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "Connection not found: {}", id),
            RegistryError::NotOpen(id) => write!(f, "Connection not open: {}", id),
            RegistryError::TopicLimitReached { limit } => {
                write!(f, "Topic limit reached ({} topics)", limit)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
