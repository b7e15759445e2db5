//! Ingest error types

/// Reasons a producer message is rejected
///
/// All variants are reported back to the producer; nothing is dropped silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Raw payload exceeds the configured size limit
    PayloadTooLarge { size: usize, limit: usize },
    /// Payload is not well-formed JSON or failed schema validation
    InvalidPayload(String),
    /// Topic name is empty, too long or contains control characters
    InvalidTopic(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::PayloadTooLarge { size, limit } => {
                write!(f, "Payload too large: {} bytes (limit {})", size, limit)
            }
            AdapterError::InvalidPayload(reason) => write!(f, "Invalid payload: {}", reason),
            AdapterError::InvalidTopic(reason) => write!(f, "Invalid topic: {}", reason),
        }
    }
}

impl std::error::Error for AdapterError {}
