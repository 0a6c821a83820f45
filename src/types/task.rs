//! Task types: TaskSpec, Priority, TaskStatus, Task

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::{AgentId, Position};

/// Process-unique, monotonically generated task identifier.
pub type TaskId = u64;

// ============================================================================
// Priority
// ============================================================================

/// Plain integer priority; higher is served first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(25);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(75);
    pub const URGENT: Priority = Priority(100);

    /// Accepts either a named level or an integer string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(Priority::LOW),
            "NORMAL" => Some(Priority::NORMAL),
            "HIGH" => Some(Priority::HIGH),
            "URGENT" => Some(Priority::URGENT),
            other => other.parse().ok().map(Priority),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Work description
// ============================================================================

/// Axis-aligned box of blocks, corners inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Area {
    pub min: Position,
    pub max: Position,
}

impl Area {
    /// Build from any two opposite corners.
    pub fn from_corners(a: Position, b: Position) -> Self {
        Self {
            min: Position::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Position::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Cube of side `2 * radius + 1` around `center`.
    pub fn around(center: Position, radius: u32) -> Self {
        let r = i64::from(radius);
        Self::from_corners(
            Position::new(center.x.saturating_sub(r), center.y.saturating_sub(r), center.z.saturating_sub(r)),
            Position::new(center.x.saturating_add(r), center.y.saturating_add(r), center.z.saturating_add(r)),
        )
    }

    pub fn centroid(&self) -> Position {
        Position::new(
            midpoint(self.min.x, self.max.x),
            midpoint(self.min.y, self.max.y),
            midpoint(self.min.z, self.max.z),
        )
    }

    /// Blocks in the box. `None` when the count does not fit in a u64.
    pub fn volume(&self) -> Option<u64> {
        side(self.min.x, self.max.x)?
            .checked_mul(side(self.min.y, self.max.y)?)?
            .checked_mul(side(self.min.z, self.max.z)?)
    }
}

fn midpoint(a: i64, b: i64) -> i64 {
    i64::try_from((i128::from(a) + i128::from(b)) / 2).unwrap_or(a)
}

fn side(min: i64, max: i64) -> Option<u64> {
    u64::try_from(i128::from(max) - i128::from(min) + 1).ok()
}

/// The three kinds of work the scheduler hands out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ResourceTarget,
    AreaMining,
    SmartMining,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::ResourceTarget => "resource_target",
            TaskKind::AreaMining => "area_mining",
            TaskKind::SmartMining => "smart_mining",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an agent is asked to do; sent verbatim inside `task_assign`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Gather `quantity` of `resource` wherever it can be found
    ResourceTarget { resource: String, quantity: u64 },
    /// Clear every block in `area`
    AreaMining { area: Area },
    /// Follow ore veins around `center` until the area looks exhausted
    SmartMining {
        center: Position,
        radius: u32,
        #[serde(default)]
        target: Option<String>,
    },
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::ResourceTarget { .. } => TaskKind::ResourceTarget,
            TaskSpec::AreaMining { .. } => TaskKind::AreaMining,
            TaskSpec::SmartMining { .. } => TaskKind::SmartMining,
        }
    }

    /// Where the work is, when the task is tied to a place.
    pub fn location(&self) -> Option<Position> {
        match self {
            TaskSpec::ResourceTarget { .. } => None,
            TaskSpec::AreaMining { area } => Some(area.centroid()),
            TaskSpec::SmartMining { center, .. } => Some(*center),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Who created a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum TaskOrigin {
    Operator,
    /// Queued in response to an agent report (e.g. area saturated)
    Agent { agent_id: AgentId },
}

/// Monotonic counter that survives reassignment.
///
/// Agents report absolute values for their own attempt. `carried` holds what
/// earlier attempts achieved; `attempt` is the high-water mark of the current one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProgressCounter {
    pub carried: u64,
    pub attempt: u64,
}

impl ProgressCounter {
    pub fn total(&self) -> u64 {
        self.carried + self.attempt
    }

    /// Raise the current attempt to `reported`, returning the increase.
    ///
    /// A report lower than what was already seen is stale and yields 0.
    pub fn advance(&mut self, reported: u64) -> u64 {
        let delta = reported.saturating_sub(self.attempt);
        self.attempt = self.attempt.max(reported);
        delta
    }

    /// Close the current attempt; the next agent starts counting from zero.
    pub fn rollover(&mut self) {
        self.carried += self.attempt;
        self.attempt = 0;
    }
}

/// Type-specific progress of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskProgress {
    Resource { requested: u64, gathered: ProgressCounter },
    Area { total_blocks: u64 },
    /// `saturation` is the agent's 0.0..=1.0 estimate of how worked-out the area is
    Smart { saturation: f64 },
}

impl TaskProgress {
    pub fn for_spec(spec: &TaskSpec) -> Self {
        match spec {
            TaskSpec::ResourceTarget { quantity, .. } => TaskProgress::Resource {
                requested: *quantity,
                gathered: ProgressCounter::default(),
            },
            TaskSpec::AreaMining { area } => TaskProgress::Area {
                total_blocks: area.volume().unwrap_or(u64::MAX),
            },
            TaskSpec::SmartMining { .. } => TaskProgress::Smart { saturation: 0.0 },
        }
    }
}

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub priority: Priority,
    pub status: TaskStatus,
    pub origin: TaskOrigin,
    /// Present only while `status == Assigned`
    pub assigned_to: Option<AgentId>,
    /// Most recent agent to hold the task; kept after it finishes
    pub last_assigned: Option<AgentId>,
    pub assigned_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub progress: TaskProgress,
    /// Blocks broken on behalf of this task, across attempts
    pub blocks_mined: ProgressCounter,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec, priority: Priority, origin: TaskOrigin, now: DateTime<Utc>) -> Self {
        let progress = TaskProgress::for_spec(&spec);
        Self {
            id,
            spec,
            priority,
            status: TaskStatus::Pending,
            origin,
            assigned_to: None,
            last_assigned: None,
            assigned_time: None,
            created_at: now,
            finished_at: None,
            retry_count: 0,
            progress,
            blocks_mined: ProgressCounter::default(),
            last_error: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind()
    }

    /// Completion estimate in percent, clamped to 0..=100.
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_complete(&self) -> f64 {
        if self.status == TaskStatus::Completed {
            return 100.0;
        }
        let pct = match &self.progress {
            TaskProgress::Resource { requested, gathered } => {
                if *requested == 0 {
                    100.0
                } else {
                    gathered.total() as f64 / *requested as f64 * 100.0
                }
            }
            TaskProgress::Area { total_blocks } => {
                if *total_blocks == 0 {
                    100.0
                } else {
                    self.blocks_mined.total() as f64 / *total_blocks as f64 * 100.0
                }
            }
            TaskProgress::Smart { saturation } => saturation * 100.0,
        };
        pct.clamp(0.0, 100.0)
    }
}
