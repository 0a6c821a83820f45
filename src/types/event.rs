//! Fleet events emitted by the registry and scheduler

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::agent::AgentId;
use super::task::{Priority, TaskId, TaskKind};

/// Something that happened to an agent or task.
///
/// The registry and scheduler buffer these while handling an event; the
/// control loop drains them for logging, persistence and subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    AgentJoined { agent_id: AgentId },
    AgentRejoined { agent_id: AgentId },
    AgentLeft { agent_id: AgentId, reason: String },
    AgentTimedOut { agent_id: AgentId, silent_for_ms: i64 },
    AgentFault { agent_id: AgentId, message: String },
    TaskQueued { task_id: TaskId, kind: TaskKind, priority: Priority },
    TaskAssigned { task_id: TaskId, agent_id: AgentId },
    TaskCompleted { task_id: TaskId, agent_id: AgentId },
    TaskRetrying { task_id: TaskId, retry_count: u32, reason: String },
    TaskFailed { task_id: TaskId, reason: String },
    /// Returned to the backlog because its agent went away
    TaskReleased { task_id: TaskId, agent_id: AgentId },
    TaskCancelled { task_id: TaskId },
    EmergencyStop { failed_tasks: usize },
    SchedulingResumed,
}

impl FleetEvent {
    /// Changes to the agent table worth writing to storage.
    pub fn touches_agent_table(&self) -> bool {
        matches!(
            self,
            FleetEvent::AgentJoined { .. }
                | FleetEvent::AgentRejoined { .. }
                | FleetEvent::AgentLeft { .. }
                | FleetEvent::AgentTimedOut { .. }
        )
    }
}

/// A fleet event with the time it was recorded.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: FleetEvent,
}
