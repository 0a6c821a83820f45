//! Agent types: AgentStatus, Position, Facing, Telemetry, AgentRecord

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::task::TaskId;

/// Hardware identity of a turtle, assigned outside the control node.
pub type AgentId = u32;

// ============================================================================
// Status
// ============================================================================

/// Control-side view of what an agent is doing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Reachable, but has not reported itself ready for work
    Online,
    /// Reachable and waiting for a task
    Idle,
    /// Holding an assigned task
    Busy,
    /// Not heard from within the heartbeat timeout, or announced departure
    Offline,
    /// Reported a fault; not assignable until it reports otherwise
    Error,
}

impl AgentStatus {
    /// Statuses the liveness sweep watches and the dispatcher will transmit to.
    pub fn is_reachable(self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Idle | AgentStatus::Busy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }

    /// Parse the status strings agents put on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Some(AgentStatus::Online),
            "idle" => Some(AgentStatus::Idle),
            "busy" | "working" | "mining" => Some(AgentStatus::Busy),
            "offline" => Some(AgentStatus::Offline),
            "error" | "fault" => Some(AgentStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Spatial
// ============================================================================

/// Block coordinates in the world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Position {
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// Straight-line distance in blocks.
    #[allow(clippy::cast_precision_loss)]
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x.abs_diff(other.x) as f64;
        let dy = self.y.abs_diff(other.y) as f64;
        let dz = self.z.abs_diff(other.z) as f64;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Cardinal direction a turtle faces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    North,
    East,
    South,
    West,
}

impl Facing {
    /// Turtles report facing either by name or as 0..=3 (north, east, south, west).
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Facing::North),
            1 => Some(Facing::East),
            2 => Some(Facing::South),
            3 => Some(Facing::West),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "north" | "n" => Some(Facing::North),
            "east" | "e" => Some(Facing::East),
            "south" | "s" => Some(Facing::South),
            "west" | "w" => Some(Facing::West),
            _ => None,
        }
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Coarse inventory report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InventorySummary {
    #[serde(default)]
    pub used_slots: u32,
    #[serde(default)]
    pub free_slots: u32,
    /// Item name -> count
    #[serde(default)]
    pub items: BTreeMap<String, u64>,
}

/// Telemetry fields an agent may include in a heartbeat or status update.
///
/// Every field is optional: absent fields leave the recorded value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub status: Option<AgentStatus>,
    pub position: Option<Position>,
    pub facing: Option<Facing>,
    pub fuel_level: Option<u64>,
    pub fuel_limit: Option<u64>,
    pub inventory: Option<InventorySummary>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.position.is_none()
            && self.facing.is_none()
            && self.fuel_level.is_none()
            && self.fuel_limit.is_none()
            && self.inventory.is_none()
    }
}

/// Identity and initial telemetry sent with an explicit join.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinInfo {
    pub label: Option<String>,
    pub telemetry: Telemetry,
}

// ============================================================================
// Agent Record
// ============================================================================

/// A single entry in an agent's fault history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Last-known state of one agent, owned by the fleet registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub label: Option<String>,
    pub status: AgentStatus,
    /// Receipt time of the most recent inbound message
    pub last_contact: DateTime<Utc>,
    /// Set once on first registration
    pub registered_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub position: Option<Position>,
    pub facing: Option<Facing>,
    pub fuel_level: Option<u64>,
    pub fuel_limit: Option<u64>,
    #[serde(default)]
    pub inventory: InventorySummary,
    /// Id of the task this agent is working on, if any
    pub current_task: Option<TaskId>,
    /// Most recent faults, oldest first
    #[serde(default)]
    pub error_history: VecDeque<FaultRecord>,
    #[serde(default)]
    pub total_blocks_mined: u64,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
}

impl AgentRecord {
    pub fn new(id: AgentId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            label: None,
            status: AgentStatus::Online,
            last_contact: now,
            registered_at: now,
            status_changed_at: now,
            position: None,
            facing: None,
            fuel_level: None,
            fuel_limit: None,
            inventory: InventorySummary::default(),
            current_task: None,
            error_history: VecDeque::new(),
            total_blocks_mined: 0,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Copy every telemetry field present in `telemetry`; leave the rest alone.
    ///
    /// `status` is not applied here; the registry owns status transitions.
    pub fn apply_telemetry(&mut self, telemetry: &Telemetry) {
        if let Some(position) = telemetry.position {
            self.position = Some(position);
        }
        if let Some(facing) = telemetry.facing {
            self.facing = Some(facing);
        }
        if let Some(level) = telemetry.fuel_level {
            self.fuel_level = Some(level);
        }
        if let Some(limit) = telemetry.fuel_limit {
            self.fuel_limit = Some(limit);
        }
        if let Some(ref inventory) = telemetry.inventory {
            self.inventory = inventory.clone();
        }
    }

    /// Fuel as a fraction of the limit, when both are known.
    #[allow(clippy::cast_precision_loss)]
    pub fn fuel_fraction(&self) -> Option<f64> {
        match (self.fuel_level, self.fuel_limit) {
            (Some(level), Some(limit)) if limit > 0 => Some(level as f64 / limit as f64),
            _ => None,
        }
    }
}
