//! Relay server listener
//!
//! Handles TCP accept loop and spawns connection tasks.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::relay::Relay;
use crate::server::config::ServerConfig;
use crate::server::connection;
use crate::server::handler::RelayHandler;

/// WebSocket relay server
pub struct RelayServer<H: RelayHandler> {
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    relay: Arc<Relay>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<H: RelayHandler> RelayServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        let relay = Arc::new(Relay::new(config.relay.clone()));
        Self::with_relay(config, handler, relay)
    }

    /// Create a server around an existing relay
    ///
    /// Useful when in-process producers (such as the simulator) publish on the
    /// same relay.
    pub fn with_relay(config: ServerConfig, handler: H, relay: Arc<Relay>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            relay,
            connection_semaphore,
        }
    }

    /// Get a reference to the relay core
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the accept loop fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// On shutdown every open connection is closed.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(addr = %listener.local_addr()?, "Relay server listening");

        let sweep_handle = self.relay.spawn_sweep_task();
        let stats_handle = self.spawn_stats_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        sweep_handle.abort();
        if let Some(handle) = stats_handle {
            handle.abort();
        }
        self.close_all();

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit; the permit lives as long as the connection task
        let permit = match &self.connection_semaphore {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        tracing::debug!(peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let config = Arc::clone(&self.config);
        let handler = Arc::clone(&self.handler);
        let relay = Arc::clone(&self.relay);

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = connection::serve(socket, peer_addr, config, handler, relay).await {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
            }
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }

    fn spawn_stats_task(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.stats_interval;
        if interval.is_zero() {
            return None;
        }

        let relay = Arc::clone(&self.relay);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let stats = relay.stats();
                tracing::info!(
                    uptime_secs = stats.uptime_secs,
                    connections = stats.connections.len(),
                    topics = stats.topics.len(),
                    published = stats.total_published(),
                    sent = stats.total_sent(),
                    dropped = stats.total_dropped(),
                    "Relay stats"
                );
            }
        }))
    }

    fn close_all(&self) {
        let registry = self.relay.registry();
        let mut closed = 0;
        for id in registry.ids() {
            if registry.deregister(id) {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(connections = closed, "Closed connections on shutdown");
        }
    }
}
