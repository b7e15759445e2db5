//! Relay handler trait
//!
//! Hooks for authentication and per-topic authorization. Every method has a
//! permissive default, so a handler only implements the decisions it cares
//! about.

use std::future::Future;

use crate::session::SessionContext;

/// Result of an authorization hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Allow the operation
    Accept,
    /// Refuse it; the reason is sent to the client
    Reject(String),
}

impl AuthResult {
    pub fn is_accept(&self) -> bool {
        matches!(self, AuthResult::Accept)
    }
}

/// Callbacks invoked by the relay server
///
/// Implementations are shared across all connection tasks.
pub trait RelayHandler: Send + Sync + 'static {
    /// Called once the WebSocket handshake completes
    ///
    /// Returning `false` closes the connection before it is opened.
    fn on_connection(&self, _ctx: &SessionContext) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Called before a client publishes on `topic`
    fn on_publish(
        &self,
        _ctx: &SessionContext,
        _topic: &str,
    ) -> impl Future<Output = AuthResult> + Send {
        async { AuthResult::Accept }
    }

    /// Called before a client subscribes to `topic`
    fn on_subscribe(
        &self,
        _ctx: &SessionContext,
        _topic: &str,
    ) -> impl Future<Output = AuthResult> + Send {
        async { AuthResult::Accept }
    }

    /// Called after the connection has been deregistered
    fn on_disconnect(&self, _ctx: &SessionContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handler that accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl RelayHandler for DefaultHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    impl RelayHandler for ReadOnly {
        async fn on_publish(&self, _ctx: &SessionContext, topic: &str) -> AuthResult {
            AuthResult::Reject(format!("{} is read-only", topic))
        }
    }

    fn ctx() -> SessionContext {
        SessionContext::new(1, "127.0.0.1:5000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_default_handler_accepts() {
        let handler = DefaultHandler;
        let ctx = ctx();

        assert!(handler.on_connection(&ctx).await);
        assert!(handler.on_publish(&ctx, "depth").await.is_accept());
        assert!(handler.on_subscribe(&ctx, "depth").await.is_accept());
    }

    #[tokio::test]
    async fn test_override_single_hook() {
        let handler = ReadOnly;
        let ctx = ctx();

        assert_eq!(
            handler.on_publish(&ctx, "depth").await,
            AuthResult::Reject("depth is read-only".into())
        );
        assert!(handler.on_subscribe(&ctx, "depth").await.is_accept());
    }
}
