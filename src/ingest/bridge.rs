//! MQTT ingest bridge
//!
//! Subscribes to topic filters on an MQTT broker and republishes each
//! message on the relay, so field sensors that only speak MQTT reach
//! WebSocket subscribers through the same ingest path as any other producer.
//!
//! ```text
//!   broker ──Publish──► EventLoop::poll ──route──► json_payload ──► Relay::publish
//!                                          │
//!                                          └─ no route: logged, skipped
//! ```
//!
//! Messages are taken at QoS 0. The relay keeps its own history, so nothing
//! is gained from broker-side acknowledgements.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::value::RawValue;

use super::adapter::validate_topic;
use super::error::AdapterError;
use crate::error::{Error, Result};
use crate::relay::{PublishReceipt, Relay};

/// Default broker port for `mqtt://` URLs
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Routes used when `RELAY_MQTT_TOPICS` is not set
pub const DEFAULT_MQTT_TOPICS: &str = "wokwi/sensor/temperature=temperature";

/// Maps an MQTT topic filter onto a relay topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    /// MQTT filter, may contain `+` and `#` wildcards
    pub filter: String,
    /// Relay topic for matching messages; `None` keeps the MQTT topic
    pub relay_topic: Option<String>,
}

impl TopicRoute {
    /// Parse `filter` or `filter=relay_topic`
    pub fn parse(spec: &str) -> Result<Self> {
        let (filter, relay_topic) = match spec.split_once('=') {
            Some((filter, topic)) => (filter.trim(), Some(topic.trim())),
            None => (spec.trim(), None),
        };

        if filter.is_empty() {
            return Err(Error::Config(format!("empty MQTT filter in {:?}", spec)));
        }
        if let Some(topic) = relay_topic {
            validate_topic(topic).map_err(|e| Error::Config(format!("{:?}: {}", spec, e)))?;
        }

        Ok(Self {
            filter: filter.to_string(),
            relay_topic: relay_topic.map(str::to_string),
        })
    }

    /// Whether `mqtt_topic` falls under this route's filter
    pub fn matches(&self, mqtt_topic: &str) -> bool {
        let mut levels = mqtt_topic.split('/');
        for part in self.filter.split('/') {
            match part {
                "#" => return true,
                "+" => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                literal => {
                    if levels.next() != Some(literal) {
                        return false;
                    }
                }
            }
        }
        levels.next().is_none()
    }

    /// Relay topic for a message received on `mqtt_topic`
    pub fn relay_topic<'a>(&'a self, mqtt_topic: &'a str) -> &'a str {
        self.relay_topic.as_deref().unwrap_or(mqtt_topic)
    }
}

/// MQTT bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Broker host name or IP
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client identifier presented to the broker
    pub client_id: String,

    /// Subscribed filters, first match wins
    pub routes: Vec<TopicRoute>,

    /// MQTT keepalive
    pub keep_alive: Duration,

    /// Pause before polling again after a connection error
    pub reconnect_delay: Duration,
}

impl BridgeConfig {
    /// Bridge to `host:port` with the default routes
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("trawl-relay-{}", std::process::id()),
            routes: vec![TopicRoute {
                filter: "wokwi/sensor/temperature".into(),
                relay_topic: Some("temperature".into()),
            }],
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Load from `RELAY_MQTT_*` environment variables
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup
    ///
    /// Returns `None` when `RELAY_MQTT_URL` is unset, which disables the
    /// bridge. `RELAY_MQTT_TOPICS` is a comma separated list of
    /// `filter[=relay_topic]`; `RELAY_MQTT_CLIENT_ID` overrides the client id.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(url) = lookup("RELAY_MQTT_URL").filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };

        let (host, port) = parse_broker_url(&url)?;
        let mut config = Self::new(host, port);

        let topics = lookup("RELAY_MQTT_TOPICS")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MQTT_TOPICS.to_string());
        config.routes = topics
            .split(',')
            .filter(|spec| !spec.trim().is_empty())
            .map(TopicRoute::parse)
            .collect::<Result<_>>()?;

        if let Some(id) = lookup("RELAY_MQTT_CLIENT_ID").filter(|v| !v.trim().is_empty()) {
            config.client_id = id.trim().to_string();
        }

        Ok(Some(config))
    }

    /// Replace the routes
    pub fn routes(mut self, routes: Vec<TopicRoute>) -> Self {
        self.routes = routes;
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Relay topic for `mqtt_topic`, if any route matches
    pub fn route<'a>(&'a self, mqtt_topic: &'a str) -> Option<&'a str> {
        self.routes
            .iter()
            .find(|route| route.matches(mqtt_topic))
            .map(|route| route.relay_topic(mqtt_topic))
    }
}

/// Split `mqtt://host[:port]` (or `tcp://`, or a bare `host[:port]`)
fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let trimmed = url.trim();
    let authority = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::Config(format!(
                "RELAY_MQTT_URL={:?}: unsupported scheme {:?}",
                url, scheme
            )))
        }
        None => trimmed,
    };
    let authority = authority.trim_end_matches('/');

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("RELAY_MQTT_URL={:?}: {}", url, e)))?;
            (host, port)
        }
        None => (authority, DEFAULT_MQTT_PORT),
    };

    if host.is_empty() {
        return Err(Error::Config(format!("RELAY_MQTT_URL={:?}: missing host", url)));
    }
    Ok((host.to_string(), port))
}

/// Convert an MQTT payload into JSON for the relay
///
/// Valid JSON (including bare numbers such as `23.5`) passes through
/// untouched. Other UTF-8 text becomes a JSON string. Empty and non-UTF-8
/// payloads yield `None`.
pub fn json_payload(raw: &[u8]) -> Option<Cow<'_, [u8]>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    if serde_json::from_slice::<&RawValue>(raw).is_ok() {
        return Some(Cow::Borrowed(raw));
    }

    let text = std::str::from_utf8(raw).ok()?;
    serde_json::to_vec(text.trim()).ok().map(Cow::Owned)
}

/// Forwards MQTT messages into a relay
pub struct MqttBridge {
    config: BridgeConfig,
    relay: Arc<Relay>,
}

impl MqttBridge {
    pub fn new(config: BridgeConfig, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Publish one MQTT message on the relay
    ///
    /// Returns `Ok(None)` when no route matches `mqtt_topic`.
    pub fn forward(&self, mqtt_topic: &str, raw: &[u8]) -> Result<Option<PublishReceipt>> {
        let Some(topic) = self.config.route(mqtt_topic) else {
            return Ok(None);
        };
        let payload = json_payload(raw).ok_or_else(|| {
            AdapterError::InvalidPayload(format!("{} byte MQTT payload is not text", raw.len()))
        })?;

        self.relay.publish(topic, &payload).map(Some)
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        let limit = self.relay.config().inbound_frame_limit();
        options.set_max_packet_size(limit, limit);
        options
    }

    fn subscribe_all(&self, client: &AsyncClient) {
        for route in &self.config.routes {
            match client.try_subscribe(route.filter.as_str(), QoS::AtMostOnce) {
                Ok(()) => tracing::debug!(filter = %route.filter, "MQTT subscribe queued"),
                Err(e) => tracing::warn!(filter = %route.filter, error = %e, "MQTT subscribe failed"),
            }
        }
    }

    fn handle_publish(&self, mqtt_topic: &str, raw: &[u8]) {
        match self.forward(mqtt_topic, raw) {
            Ok(Some(receipt)) => tracing::trace!(
                mqtt_topic = %mqtt_topic,
                topic = %receipt.topic,
                sequence = receipt.sequence,
                delivered = receipt.delivered,
                "Forwarded MQTT message"
            ),
            Ok(None) => tracing::debug!(mqtt_topic = %mqtt_topic, "No route for MQTT message"),
            Err(e) => tracing::warn!(mqtt_topic = %mqtt_topic, error = %e, "Dropping MQTT message"),
        }
    }

    /// Run the bridge until the task is aborted
    ///
    /// Connection errors are logged and retried after `reconnect_delay`;
    /// filters are subscribed again on every new session.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let capacity = self.config.routes.len().max(10);
            let (client, mut eventloop) = AsyncClient::new(self.options(), capacity);

            tracing::info!(
                broker = %format!("{}:{}", self.config.host, self.config.port),
                client_id = %self.config.client_id,
                routes = self.config.routes.len(),
                "MQTT bridge started"
            );

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tracing::info!(code = ?ack.code, "Connected to MQTT broker");
                        self.subscribe_all(&client);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            retry_ms = self.config.reconnect_delay.as_millis() as u64,
                            "MQTT connection error"
                        );
                        tokio::time::sleep(self.config.reconnect_delay).await;
                    }
                }
            }
        })
    }
}
