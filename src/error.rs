//! Crate-level error type

use std::fmt;

use crate::ingest::AdapterError;
use crate::registry::RegistryError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Socket level I/O failure
    Io(std::io::Error),
    /// WebSocket transport failure
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// Producer message rejected by the ingest adapter
    Adapter(AdapterError),
    /// Connection or topic bookkeeping failure
    Registry(RegistryError),
    /// Operation exceeded its deadline
    Timeout(&'static str),
    /// Rejected by the relay handler
    Unauthorized(String),
    /// Malformed client request
    Protocol(String),
    /// Invalid configuration value
    Config(String),
    /// Reply frame could not be encoded
    Encode(String),
}

impl Error {
    /// Stable error code sent to clients in error frames
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::WebSocket(_) => "internal",
            Error::Adapter(AdapterError::PayloadTooLarge { .. }) => "payload_too_large",
            Error::Adapter(AdapterError::InvalidPayload(_)) => "invalid_payload",
            Error::Adapter(AdapterError::InvalidTopic(_)) => "invalid_topic",
            Error::Registry(RegistryError::NotFound(_)) => "not_found",
            Error::Registry(RegistryError::NotOpen(_)) => "not_open",
            Error::Registry(RegistryError::TopicLimitReached { .. }) => "topic_limit",
            Error::Timeout(_) => "timeout",
            Error::Unauthorized(_) => "unauthorized",
            Error::Protocol(_) => "bad_request",
            Error::Config(_) | Error::Encode(_) => "internal",
        }
    }

    /// Whether the error came from the transport and should close the connection
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::WebSocket(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Adapter(e) => write!(f, "{}", e),
            Error::Registry(e) => write!(f, "{}", e),
            Error::Timeout(op) => write!(f, "{} timed out", op),
            Error::Unauthorized(reason) => write!(f, "Unauthorized: {}", reason),
            Error::Protocol(msg) => write!(f, "Bad request: {}", msg),
            Error::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::Encode(msg) => write!(f, "Encoding failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::WebSocket(e) => Some(e),
            Error::Adapter(e) => Some(e),
            Error::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<AdapterError> for Error {
    fn from(e: AdapterError) -> Self {
        Error::Adapter(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err: Error = AdapterError::PayloadTooLarge {
            size: 70_000,
            limit: 65_536,
        }
        .into();
        assert_eq!(err.code(), "payload_too_large");

        let err: Error = RegistryError::NotFound(7).into();
        assert_eq!(err.code(), "not_found");
        assert!(!err.is_transport());

        let err: Error = RegistryError::NotOpen(7).into();
        assert_eq!(err.code(), "not_open");

        let err = Error::Timeout("subscribe");
        assert_eq!(err.code(), "timeout");
        assert_eq!(err.to_string(), "subscribe timed out");
    }

    #[test]
    fn test_io_is_transport() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_transport());
        assert_eq!(err.code(), "internal");
    }
}
