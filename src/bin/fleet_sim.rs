//! Simulated turtle fleet
//!
//! Spawns N turtles that speak the fleet protocol over UDP: they join,
//! heartbeat, take `task_assign` payloads, report progress, and now and then
//! fail (recoverably or not) or stumble on ore.
//!
//! # Usage
//! ```bash
//! ./fleet-control --no-persist &
//! ./fleet-sim --turtles 5 --control 127.0.0.1:7450 --seed 7
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use rand::prelude::*;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_control::config::defaults;
use fleet_control::transport::{Frame, InterfaceKind, Modem, UdpModem};
use fleet_control::types::{AgentId, Envelope, Position, TaskId, TaskSpec};

const ORES: &[&str] = &["coal", "iron_ore", "gold_ore", "redstone", "diamond"];
/// Goal used for open-ended jobs
const SMART_MINING_BLOCKS: u64 = 120;
const MAX_AREA_BLOCKS: u64 = 400;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "fleet-sim")]
#[command(about = "Simulated mining turtles for exercising fleet-control")]
#[command(version)]
struct Args {
    /// Number of turtles
    #[arg(short, long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..=256))]
    turtles: u32,

    /// Id of the first turtle; the rest count up from it
    #[arg(long, default_value = "1")]
    first_id: AgentId,

    /// Control node address
    #[arg(short, long, default_value = "127.0.0.1:7450")]
    control: SocketAddr,

    /// Protocol identifier
    #[arg(long, default_value = defaults::PROTOCOL)]
    protocol: String,

    /// Seconds between heartbeats
    #[arg(long, default_value = "5")]
    heartbeat_secs: u64,

    /// Milliseconds per unit of work
    #[arg(long, default_value = "1000")]
    work_ms: u64,

    /// Chance that a unit of work ends the task in failure
    #[arg(long, default_value = "0.02")]
    fail_rate: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many seconds (runs until Ctrl+C otherwise)
    #[arg(long)]
    duration_secs: Option<u64>,
}

// ============================================================================
// Turtle model
// ============================================================================

#[derive(Debug)]
struct SimTask {
    id: TaskId,
    /// Items for resource targets, blocks otherwise
    goal: u64,
    counts_items: bool,
    gathered: u64,
    blocks: u64,
}

impl SimTask {
    fn from_assignment(id: TaskId, spec: &TaskSpec) -> Self {
        let (goal, counts_items) = match spec {
            TaskSpec::ResourceTarget { quantity, .. } => (*quantity, true),
            TaskSpec::AreaMining { area } => (area.volume().map_or(MAX_AREA_BLOCKS, |v| v.min(MAX_AREA_BLOCKS)), false),
            TaskSpec::SmartMining { .. } => (SMART_MINING_BLOCKS, false),
        };
        Self {
            id,
            goal: goal.max(1),
            counts_items,
            gathered: 0,
            blocks: 0,
        }
    }

    fn progress(&self) -> u64 {
        if self.counts_items {
            self.gathered
        } else {
            self.blocks
        }
    }
}

struct SimTurtle {
    id: AgentId,
    protocol: String,
    modem: UdpModem,
    rng: StdRng,
    position: Position,
    fuel: u64,
    task: Option<SimTask>,
    fail_rate: f64,
}

impl SimTurtle {
    fn new(id: AgentId, args: &Args, seed: u64) -> Result<Self> {
        let bind: SocketAddr = "127.0.0.1:0".parse()?;
        let modem = UdpModem::bind(format!("turtle-{id}"), InterfaceKind::Wireless, bind, args.control)
            .with_context(|| format!("turtle {id}: failed to bind"))?;
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(id)));
        let position = Position::new(rng.gen_range(-64..64), rng.gen_range(8..64), rng.gen_range(-64..64));
        Ok(Self {
            id,
            protocol: args.protocol.clone(),
            modem,
            rng,
            position,
            fuel: 20_000,
            task: None,
            fail_rate: args.fail_rate.clamp(0.0, 1.0),
        })
    }

    async fn send(&mut self, kind: &str, fields: Value) {
        let mut message = json!({
            "type": kind,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "from_control": false,
        });
        if let (Some(target), Value::Object(extra)) = (message.as_object_mut(), fields) {
            target.extend(extra);
        }
        let frame = Frame {
            protocol: self.protocol.clone(),
            sender: self.id,
            recipient: None,
            message,
        };
        if let Err(e) = self.modem.transmit(&frame).await {
            warn!(turtle = self.id, kind, error = %e, "Send failed");
        }
    }

    fn status(&self) -> &'static str {
        if self.task.is_some() {
            "busy"
        } else {
            "idle"
        }
    }

    async fn heartbeat(&mut self) {
        let fields = json!({
            "status": self.status(),
            "position": self.position,
            "facing": self.rng.gen_range(0..4),
            "fuel_level": self.fuel,
            "fuel_limit": 20_000,
        });
        self.send("heartbeat", fields).await;
    }

    /// One unit of work on the current task, if any.
    async fn work(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        let dug = self.rng.gen_range(3..12);
        task.blocks += dug;
        self.fuel = self.fuel.saturating_sub(dug);
        self.position.y = (self.position.y - 1).max(5);
        if task.counts_items {
            task.gathered = (task.gathered + self.rng.gen_range(0..=3)).min(task.goal);
        }

        if self.rng.gen_bool(self.fail_rate) {
            let recoverable = self.rng.gen_bool(0.7);
            let reason = if recoverable { "inventory full" } else { "fell into lava" };
            info!(turtle = self.id, task_id = task.id, recoverable, reason, "Simulated failure");
            self.send(
                "task_failed",
                json!({"task_id": task.id, "reason": reason, "recoverable": recoverable, "blocks_mined": task.blocks}),
            )
            .await;
            self.heartbeat().await;
            return;
        }

        if self.rng.gen_bool(0.03) {
            let resource = ORES[self.rng.gen_range(0..ORES.len())];
            let quantity = self.rng.gen_range(1..9);
            self.send(
                "resource_found",
                json!({"resource": resource, "position": self.position, "quantity": quantity}),
            )
            .await;
        }

        if task.progress() >= task.goal {
            info!(turtle = self.id, task_id = task.id, blocks = task.blocks, "Simulated completion");
            self.send(
                "task_complete",
                json!({"task_id": task.id, "gathered": task.gathered, "blocks_mined": task.blocks}),
            )
            .await;
            if !task.counts_items && self.rng.gen_bool(0.2) {
                self.send(
                    "area_saturated",
                    json!({"center": self.position, "radius": 6, "saturation": 0.9, "priority": "low"}),
                )
                .await;
            }
            self.heartbeat().await;
            return;
        }

        self.send(
            "task_progress",
            json!({"task_id": task.id, "gathered": task.gathered, "blocks_mined": task.blocks}),
        )
        .await;
        self.task = Some(task);
    }

    async fn on_frame(&mut self, frame: Frame) {
        if frame.protocol != self.protocol || !frame.is_for(self.id) || frame.sender == self.id {
            return;
        }
        let envelope = match Envelope::from_value(frame.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(turtle = self.id, error = %e, "Ignoring malformed message");
                return;
            }
        };
        match envelope.kind.as_str() {
            "task_assign" => {
                let task_id = envelope.fields.get("task_id").and_then(Value::as_u64);
                let spec = envelope
                    .fields
                    .get("task")
                    .cloned()
                    .and_then(|t| serde_json::from_value::<TaskSpec>(t).ok());
                match (task_id, spec) {
                    (Some(id), Some(spec)) => {
                        info!(turtle = self.id, task_id = id, kind = %spec.kind(), "Task accepted");
                        self.task = Some(SimTask::from_assignment(id, &spec));
                    }
                    _ => warn!(turtle = self.id, "Unreadable task_assign"),
                }
            }
            "emergency_stop" => {
                warn!(turtle = self.id, "Emergency stop, dropping task");
                self.task = None;
            }
            "status_request" => {
                let fields = json!({"status": self.status(), "position": self.position, "fuel_level": self.fuel});
                self.send("status_update", fields).await;
            }
            "command" => {
                let command = envelope.fields.get("command").and_then(Value::as_str).unwrap_or("?");
                info!(turtle = self.id, command, "Command received");
            }
            "discover_response" => {
                debug!(turtle = self.id, "Control node found");
            }
            other => debug!(turtle = self.id, kind = other, "Unhandled message"),
        }
    }

    async fn run(mut self, heartbeat_every: Duration, work_every: Duration, cancel: CancellationToken) {
        self.send("discover", json!({})).await;
        self.send("turtle_online", json!({"label": format!("sim-{}", self.id), "position": self.position}))
            .await;
        self.heartbeat().await;

        let mut heartbeat = tokio::time::interval(heartbeat_every);
        let mut work = tokio::time::interval(work_every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = work.tick() => self.work().await,
                received = self.modem.receive() => match received {
                    Ok(frame) => self.on_frame(frame).await,
                    Err(e) => warn!(turtle = self.id, error = %e, "Receive failed"),
                },
            }
        }

        self.send("turtle_offline", json!({"reason": "simulation ended"})).await;
        info!(turtle = self.id, "Turtle signed off");
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    info!(turtles = args.turtles, control = %args.control, seed, "Starting simulated fleet");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, stopping turtles");
        shutdown.cancel();
    });
    if let Some(secs) = args.duration_secs {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            deadline.cancel();
        });
    }

    let heartbeat_every = Duration::from_secs(args.heartbeat_secs.max(1));
    let work_every = Duration::from_millis(args.work_ms.max(10));

    let mut turtles = Vec::new();
    for offset in 0..args.turtles {
        let turtle = SimTurtle::new(args.first_id + offset, &args, seed)?;
        turtles.push(turtle.run(heartbeat_every, work_every, cancel.clone()));
    }
    join_all(turtles).await;

    info!("Simulation finished");
    Ok(())
}
