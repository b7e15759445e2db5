//! Built-in trawl telemetry producer
//!
//! Generates sensor depth, boat movement and winch readings the way the
//! monitoring dashboard's demo mode does, and publishes them through the
//! relay's normal ingest path. Winch commands arrive on `winch/command`
//! through an in-process relay connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::relay::Relay;

pub const SENSOR1_RANGE: (f64, f64) = (50.0, 200.0);
pub const SENSOR2_RANGE: (f64, f64) = (80.0, 210.0);
pub const SEABED_DEPTH: f64 = 220.0;
pub const MIN_SEABED_DISTANCE: f64 = 5.0;

/// Metres moved per tick while lifting or lowering
pub const WINCH_STEP: f64 = 3.0;

const BOAT_CYCLE: u32 = 20;

pub const DEPTH_TOPIC: &str = "depth";
pub const BOAT_TOPIC: &str = "boat";
pub const WINCH_TOPIC: &str = "winch";
pub const WINCH_COMMAND_TOPIC: &str = "winch/command";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinchStatus {
    #[default]
    Idle,
    Lifting,
    Lowering,
}

impl fmt::Display for WinchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WinchStatus::Idle => write!(f, "idle"),
            WinchStatus::Lifting => write!(f, "lifting"),
            WinchStatus::Lowering => write!(f, "lowering"),
        }
    }
}

/// One simulation tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrawlReading {
    pub sensor1_depth: f64,
    pub sensor2_depth: f64,
    pub seabed_distance: f64,
    pub boat_movement: u32,
    pub winch_status: WinchStatus,
}

/// Accepted command shapes: `{"status":"lifting"}` or `{"operation":"lift"}`
#[derive(Debug, Deserialize)]
struct WinchCommand {
    status: Option<WinchStatus>,
    operation: Option<String>,
}

/// Trawl gear simulation state
pub struct TrawlSimulator {
    rng: StdRng,
    sensor1_depth: f64,
    sensor2_depth: f64,
    seabed_depth: f64,
    boat_movement: u32,
    winch: WinchStatus,
}

impl TrawlSimulator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic simulator for tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            sensor1_depth: 120.0,
            sensor2_depth: 180.0,
            seabed_depth: SEABED_DEPTH,
            boat_movement: 0,
            winch: WinchStatus::Idle,
        }
    }

    pub fn winch(&self) -> WinchStatus {
        self.winch
    }

    pub fn set_winch(&mut self, status: WinchStatus) {
        if self.winch != status {
            tracing::info!(from = %self.winch, to = %status, "Winch status changed");
            self.winch = status;
        }
    }

    /// Apply a `winch/command` payload
    pub fn apply_command(&mut self, payload: &RawValue) -> Result<WinchStatus, String> {
        let command: WinchCommand =
            serde_json::from_str(payload.get()).map_err(|e| e.to_string())?;

        let status = match (command.status, command.operation.as_deref()) {
            (Some(status), _) => status,
            (None, Some("lift")) => WinchStatus::Lifting,
            (None, Some("lower")) => WinchStatus::Lowering,
            (None, Some("stop")) => WinchStatus::Idle,
            (None, Some(other)) => return Err(format!("unknown winch operation '{}'", other)),
            (None, None) => return Err("missing status or operation".into()),
        };

        self.set_winch(status);
        Ok(status)
    }

    /// Current state without advancing
    pub fn reading(&self) -> TrawlReading {
        let deepest = self.sensor1_depth.max(self.sensor2_depth);
        TrawlReading {
            sensor1_depth: self.sensor1_depth,
            sensor2_depth: self.sensor2_depth,
            seabed_distance: (self.seabed_depth - deepest).max(MIN_SEABED_DISTANCE),
            boat_movement: self.boat_movement,
            winch_status: self.winch,
        }
    }

    /// Advance one tick
    pub fn step(&mut self) -> TrawlReading {
        let (d1, d2) = match self.winch {
            WinchStatus::Lifting => (-WINCH_STEP, -WINCH_STEP),
            WinchStatus::Lowering => (WINCH_STEP, WINCH_STEP),
            WinchStatus::Idle => (
                self.rng.gen_range(-WINCH_STEP..WINCH_STEP),
                self.rng.gen_range(-WINCH_STEP..WINCH_STEP),
            ),
        };

        self.sensor1_depth = (self.sensor1_depth + d1).clamp(SENSOR1_RANGE.0, SENSOR1_RANGE.1);
        self.sensor2_depth = (self.sensor2_depth + d2).clamp(SENSOR2_RANGE.0, SENSOR2_RANGE.1);
        self.boat_movement = (self.boat_movement + 1) % BOAT_CYCLE;

        self.reading()
    }

    /// Publish one reading on the depth, boat and winch topics
    pub fn publish(relay: &Relay, reading: &TrawlReading) -> crate::Result<()> {
        relay.publish_json(
            DEPTH_TOPIC,
            &serde_json::json!({
                "sensor1_depth": reading.sensor1_depth,
                "sensor2_depth": reading.sensor2_depth,
                "seabed_distance": reading.seabed_distance,
            }),
        )?;
        relay.publish_json(
            BOAT_TOPIC,
            &serde_json::json!({ "movement": reading.boat_movement }),
        )?;
        relay.publish_json(
            WINCH_TOPIC,
            &serde_json::json!({ "status": reading.winch_status }),
        )?;
        Ok(())
    }

    /// Run the simulation loop on the relay until the relay closes its connection
    pub fn spawn(mut self, relay: Arc<Relay>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut commands = relay.register_local();
            let id = commands.id();

            if let Err(e) = relay
                .open(id)
                .and_then(|_| relay.subscribe(id, WINCH_COMMAND_TOPIC, None))
            {
                tracing::error!(error = %e, "Simulator failed to subscribe to winch commands");
                relay.deregister(id);
                return;
            }

            let mut shutdown = commands.shutdown_signal();
            let mut ticker = tokio::time::interval(interval);

            tracing::info!(connection_id = id, interval_ms = interval.as_millis() as u64, "Trawl simulator started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reading = self.step();
                        if let Err(e) = Self::publish(&relay, &reading) {
                            tracing::warn!(error = %e, "Simulator publish failed");
                        }
                    }
                    envelope = commands.recv() => {
                        let Some(envelope) = envelope else { break };
                        commands.record_write();
                        if let Err(e) = self.apply_command(envelope.payload()) {
                            tracing::warn!(sequence = envelope.sequence(), error = %e, "Ignoring winch command");
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }

            relay.deregister(id);
            tracing::info!(connection_id = id, "Trawl simulator stopped");
        })
    }
}

impl Default for TrawlSimulator {
    fn default() -> Self {
        Self::new()
    }
}
