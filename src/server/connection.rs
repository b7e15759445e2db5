//! Per-connection WebSocket task
//!
//! Each accepted socket gets one task that owns both halves of the
//! WebSocket. It reads client requests, drains the connection's outbound
//! queue onto the socket and pings the client. Handler hooks are awaited on
//! this task only, so a slow hook never delays another connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::protocol::{ClientRequest, Request, ServerReply};
use crate::registry::{ConnectionId, Outbound};
use crate::relay::Relay;
use crate::server::config::ServerConfig;
use crate::server::handler::{AuthResult, RelayHandler};
use crate::session::SessionContext;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Accept the WebSocket handshake and run the connection to completion
///
/// The connection is deregistered and `on_disconnect` is called on every
/// exit path after registration.
pub(crate) async fn serve<H: RelayHandler>(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    relay: Arc<Relay>,
) -> Result<()> {
    let limit = config.frame_limit();
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(limit))
        .max_frame_size(Some(limit));
    let ws = tokio::time::timeout(
        config.connection_timeout,
        tokio_tungstenite::accept_async_with_config(socket, Some(ws_config)),
    )
    .await
    .map_err(|_| Error::Timeout("WebSocket handshake"))??;

    let outbound = relay.register(Some(peer_addr));
    let connection = Connection {
        ctx: SessionContext::new(outbound.id(), peer_addr),
        config,
        handler,
        relay,
    };

    let result = connection.run(ws, outbound).await;

    connection.relay.deregister(connection.id());
    connection.handler.on_disconnect(&connection.ctx).await;

    result
}

struct Connection<H: RelayHandler> {
    ctx: SessionContext,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    relay: Arc<Relay>,
}

impl<H: RelayHandler> Connection<H> {
    fn id(&self) -> ConnectionId {
        self.ctx.connection_id
    }

    async fn run(&self, ws: WebSocketStream<TcpStream>, mut outbound: Outbound) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        if !self.handler.on_connection(&self.ctx).await {
            tracing::info!(
                connection_id = self.id(),
                peer = %self.ctx.peer_addr,
                "Connection rejected by handler"
            );
            let reply = ServerReply::error(None, &Error::Unauthorized("connection refused".into()));
            self.send_reply(&mut sink, &reply).await?;
            self.write(&mut sink, Message::Close(None)).await?;
            return Ok(());
        }

        self.relay.open(self.id())?;
        self.send_reply(&mut sink, &ServerReply::Welcome { connection_id: self.id() })
            .await?;

        tracing::info!(
            connection_id = self.id(),
            peer = %self.ctx.peer_addr,
            "Connection open"
        );

        let mut shutdown = outbound.shutdown_signal();
        let period = self.config.keepalive_interval.max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(&mut sink, &mut outbound, text.as_str()).await?;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ServerReply::error(
                            None,
                            &Error::Protocol("binary frames are not supported".into()),
                        );
                        self.send_reply(&mut sink, &reply).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                envelope = outbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.write(&mut sink, text_frame(envelope.frame())?).await?;
                    outbound.record_write();
                }
                _ = keepalive.tick() => {
                    self.write(&mut sink, Message::Ping(Bytes::new())).await?;
                    outbound.mark_active();
                }
                _ = shutdown.wait() => {
                    tracing::debug!(
                        connection_id = self.id(),
                        state = ?outbound.entry().state(),
                        "Closed by relay"
                    );
                    // Best effort, the peer may already be gone
                    let _ = self.write(&mut sink, Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_text(
        &self,
        sink: &mut WsSink,
        outbound: &mut Outbound,
        text: &str,
    ) -> Result<()> {
        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(bad) => {
                tracing::debug!(connection_id = self.id(), reason = %bad.reason, "Bad request");
                return self.send_reply(sink, &bad.into_reply()).await;
            }
        };

        let id = request.id;
        tracing::trace!(connection_id = self.id(), op = request.request.op(), "Request");

        let outcome = match request.request {
            Request::Publish { topic, payload } => self.publish(id, &topic, &payload).await,
            Request::Subscribe {
                topic,
                snapshot,
                max_snapshot,
            } => {
                return self
                    .subscribe(sink, outbound, id, topic, snapshot, max_snapshot)
                    .await
            }
            Request::Unsubscribe { topic } => self
                .relay
                .unsubscribe(self.id(), &topic)
                .map(|was_subscribed| ServerReply::Unsubscribed {
                    id,
                    topic,
                    was_subscribed,
                }),
            Request::Stats => Ok(ServerReply::Stats {
                id,
                stats: self.relay.stats(),
            }),
        };

        let reply = outcome.unwrap_or_else(|e| {
            tracing::debug!(connection_id = self.id(), error = %e, "Request failed");
            ServerReply::error(id, &e)
        });
        self.send_reply(sink, &reply).await
    }

    async fn publish(&self, id: Option<u64>, topic: &str, payload: &RawValue) -> Result<ServerReply> {
        if let AuthResult::Reject(reason) = self.handler.on_publish(&self.ctx, topic).await {
            return Err(Error::Unauthorized(reason));
        }

        let receipt = self.relay.publish(topic, payload.get().as_bytes())?;

        Ok(ServerReply::Ack {
            id,
            topic: receipt.topic,
            sequence: receipt.sequence,
            delivered: receipt.delivered,
            dropped: receipt.dropped,
        })
    }

    /// Authorize, subscribe and send the snapshot within `subscribe_timeout`
    ///
    /// The snapshot is written before control returns to the select loop, so
    /// it always precedes live frames. On timeout a subscription created here
    /// is withdrawn along with any live frames it already queued.
    async fn subscribe(
        &self,
        sink: &mut WsSink,
        outbound: &mut Outbound,
        id: Option<u64>,
        topic: String,
        snapshot: bool,
        max_snapshot: Option<usize>,
    ) -> Result<()> {
        let mut created = false;

        let attempt = tokio::time::timeout(self.config.subscribe_timeout, async {
            if let AuthResult::Reject(reason) = self.handler.on_subscribe(&self.ctx, &topic).await {
                return Err(Error::Unauthorized(reason));
            }

            let limit = self.relay.config().snapshot_limit();
            let want = snapshot.then(|| max_snapshot.unwrap_or(limit));
            let subscribed = self.relay.subscribe(self.id(), &topic, want)?;
            created = subscribed.created;

            let reply = ServerReply::Subscribed {
                id,
                topic: topic.clone(),
                snapshot: subscribed.snapshot.len(),
                last_sequence: subscribed.last_sequence,
            };
            self.send_reply(sink, &reply).await?;

            for envelope in &subscribed.snapshot {
                self.write(sink, text_frame(envelope.frame())?).await?;
            }

            Ok(subscribed.snapshot.len())
        })
        .await;

        let err = match attempt {
            Ok(Ok(sent)) => {
                tracing::debug!(connection_id = self.id(), topic = %topic, snapshot = sent, "Subscribe complete");
                return Ok(());
            }
            Ok(Err(e)) if e.is_transport() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => {
                if created {
                    self.relay.withdraw(outbound, &topic)?;
                }
                tracing::warn!(
                    connection_id = self.id(),
                    topic = %topic,
                    rolled_back = created,
                    "Subscribe timed out"
                );
                Error::Timeout("subscribe")
            }
        };

        self.send_reply(sink, &ServerReply::error(id, &err)).await
    }

    async fn send_reply(&self, sink: &mut WsSink, reply: &ServerReply) -> Result<()> {
        self.write(sink, Message::text(reply.encode()?)).await
    }

    /// Write one message within the idle timeout
    async fn write(&self, sink: &mut WsSink, message: Message) -> Result<()> {
        tokio::time::timeout(self.config.write_timeout(), sink.send(message))
            .await
            .map_err(|_| Error::Timeout("write"))??;
        Ok(())
    }
}

/// Wrap a pre-encoded envelope as a text message without copying
fn text_frame(frame: &Bytes) -> Result<Message> {
    let text = Utf8Bytes::try_from(frame.clone()).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(Message::Text(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestAdapter;

    #[test]
    fn test_text_frame_shares_envelope_bytes() {
        let adapter = IngestAdapter::new(1024);
        let envelope = adapter.ingest("depth", br#"{"sensor1_depth":120}"#).unwrap();

        match text_frame(envelope.frame()).unwrap() {
            Message::Text(text) => assert_eq!(text.as_bytes(), envelope.frame().as_ref()),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
