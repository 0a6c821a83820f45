//! Read-only view of the fleet for presentation collaborators.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::context::{ControlContext, Sighting};
use crate::fleet::StatusCounts;
use crate::tasks::ResourceAggregates;
use crate::types::{AgentRecord, Task};

/// Fleet state as of the last handled event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub agents: Vec<AgentRecord>,
    pub counts: StatusCounts,
    /// Service order
    pub backlog: Vec<Task>,
    pub in_flight: Vec<Task>,
    pub archived_completed: usize,
    pub archived_failed: usize,
    pub resources: ResourceAggregates,
    pub sightings: Vec<Sighting>,
    pub scheduling_paused: bool,
}

impl FleetSnapshot {
    pub fn capture(ctx: &ControlContext, now: DateTime<Utc>) -> Self {
        let (archived_completed, archived_failed) = ctx.scheduler.archive().counts();
        Self {
            taken_at: now,
            agents: ctx.registry.all(),
            counts: ctx.registry.status_counts(),
            backlog: ctx.scheduler.backlog().iter().cloned().collect(),
            in_flight: ctx.scheduler.in_flight().cloned().collect(),
            archived_completed,
            archived_failed,
            resources: ctx.scheduler.aggregates().clone(),
            sightings: ctx.sightings().cloned().collect(),
            scheduling_paused: ctx.scheduler.is_paused(),
        }
    }

    pub fn agent(&self, id: crate::types::AgentId) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == id)
    }
}
