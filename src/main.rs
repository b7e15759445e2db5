//! Trawl telemetry relay server
//!
//! Run with: trawl-relay [BIND_ADDR] [--simulate]
//!
//! Examples:
//!   trawl-relay                        # binds to 0.0.0.0:8080 (or RELAY_BIND/RELAY_PORT)
//!   trawl-relay localhost              # binds to 127.0.0.1:8080
//!   trawl-relay 127.0.0.1:9000         # binds to 127.0.0.1:9000
//!   trawl-relay --simulate             # also runs the built-in trawl simulator
//!
//! Set RELAY_MQTT_URL (e.g. mqtt://test.mosquitto.org) to also bridge MQTT
//! sensor topics onto the relay.
//!
//! ## Subscribing
//!
//!   websocat ws://localhost:8080
//!   {"op":"subscribe","topic":"depth"}
//!
//! ## Publishing
//!
//!   {"op":"publish","topic":"winch/command","payload":{"status":"lifting"}}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use trawl_relay::ingest::{BridgeConfig, MqttBridge, TrawlSimulator};
use trawl_relay::server::DefaultHandler;
use trawl_relay::{Relay, RelayServer, ServerConfig};

const SIMULATION_INTERVAL: Duration = Duration::from_secs(2);

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:<port>
/// - "localhost:9000" -> 127.0.0.1:9000
/// - "127.0.0.1" -> 127.0.0.1:<port>
/// - "0.0.0.0:8080" -> 0.0.0.0:8080
fn parse_bind_addr(arg: &str, default_port: u16) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: trawl-relay [BIND_ADDR] [--simulate]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:8080)");
    eprintln!("  --simulate   Publish simulated trawl telemetry every 2s");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RELAY_PORT, RELAY_BIND, RELAY_MAX_CONNECTIONS, RELAY_MAX_TOPICS,");
    eprintln!("  RELAY_QUEUE_DEPTH_LIMIT, RELAY_HISTORY_CAPACITY,");
    eprintln!("  RELAY_PAYLOAD_MAX_BYTES, RELAY_IDLE_TIMEOUT_MS");
    eprintln!("  RELAY_MQTT_URL       MQTT broker to bridge from (disabled if unset)");
    eprintln!("  RELAY_MQTT_TOPICS    filter[=topic],... (default: wokwi/sensor/temperature=temperature)");
    eprintln!("  RELAY_MQTT_CLIENT_ID MQTT client id (default: trawl-relay-<pid>)");
    eprintln!("  RUST_LOG     Log filter (default: trawl_relay=debug)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let simulate = args.iter().any(|a| a == "--simulate");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trawl_relay=debug".parse()?),
        )
        .init();

    let mut config = ServerConfig::from_env()?;
    let bridge_config = BridgeConfig::from_env()?;

    if let Some(addr_str) = args.iter().find(|a| !a.starts_with('-')) {
        match parse_bind_addr(addr_str, config.bind_addr.port()) {
            Ok(addr) => config.bind_addr = addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    let relay = Arc::new(Relay::new(config.relay.clone()));
    let server = RelayServer::with_relay(config, DefaultHandler, Arc::clone(&relay));

    let _simulator =
        simulate.then(|| TrawlSimulator::new().spawn(Arc::clone(&relay), SIMULATION_INTERVAL));
    let _bridge = bridge_config.map(|bridge| MqttBridge::new(bridge, Arc::clone(&relay)).spawn());

    tracing::info!(addr = %server.bind_addr(), simulate, "Starting trawl relay");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    server.run_until(shutdown).await?;

    tracing::info!("Relay stopped");
    Ok(())
}
