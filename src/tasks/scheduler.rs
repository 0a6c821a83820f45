//! Task Scheduler
//!
//! Owns every task until it reaches a terminal state:
//!
//! ```text
//! pending ──assign──► assigned ──complete──► completed
//!    ▲                   │
//!    └──recoverable──────┤ (retry_count < max_retries)
//!       failure or       └──otherwise──► failed
//!       agent lost (no retry charged)
//! ```
//!
//! The registry is passed in to every call that touches agents; the two are
//! peers and neither holds the other.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::aggregate::ResourceAggregates;
use super::archive::TaskArchive;
use super::backlog::Backlog;
use super::progress::{self, ProgressDelta};
use crate::commands::{CommandDispatcher, CommandError};
use crate::config::{defaults, SchedulerConfig};
use crate::fleet::{FleetRegistry, RegistryError};
use crate::types::{
    AgentId, AgentRecord, AgentStatus, CompletionReport, FailureReport, FleetEvent, Priority, ProgressReport, Task,
    TaskId, TaskOrigin, TaskSpec, TaskStatus,
};

/// Reason recorded on tasks failed by an emergency stop.
pub const EMERGENCY_STOP_REASON: &str = "emergency_stop";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {task_id} is {status}")]
    InvalidTransition { task_id: TaskId, status: TaskStatus },

    #[error("agent {0} has no task in flight")]
    NoTaskForAgent(AgentId),

    #[error("agent {agent_id} reported on task {task_id}, which it does not hold")]
    StaleReport { agent_id: AgentId, task_id: TaskId },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("scheduling is paused")]
    Paused,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] CommandError),
}

/// What a failure report led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { retry_count: u32 },
    Failed,
}

pub struct TaskScheduler {
    backlog: Backlog,
    in_flight: BTreeMap<TaskId, Task>,
    archive: TaskArchive,
    aggregates: ResourceAggregates,
    next_id: TaskId,
    max_retries: u32,
    area_distance_threshold: f64,
    archive_max_age: Duration,
    paused: bool,
    events: Vec<FleetEvent>,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            backlog: Backlog::new(),
            in_flight: BTreeMap::new(),
            archive: TaskArchive::new(config.archive_capacity),
            aggregates: ResourceAggregates::new(),
            next_id: 1,
            max_retries: config.max_retries.min(defaults::MAX_RETRIES),
            area_distance_threshold: config.area_distance_threshold,
            archive_max_age: config.archive_max_age(),
            paused: false,
            events: Vec::new(),
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Build a task, queue it and try to assign right away.
    pub fn create_task(
        &mut self,
        spec: TaskSpec,
        priority: Priority,
        origin: TaskOrigin,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> Result<TaskId, SchedulerError> {
        validate_spec(&spec)?;
        let id = self.next_id;
        self.next_id += 1;
        let task = Task::new(id, spec, priority, origin, now);
        Ok(self.queue(task, registry, dispatcher, now))
    }

    /// Insert into the backlog (stable by priority) and run an assignment pass.
    pub fn queue(
        &mut self,
        mut task: Task,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> TaskId {
        let id = task.id;
        self.next_id = self.next_id.max(id + 1);
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.assigned_time = None;

        if let TaskSpec::ResourceTarget { resource, quantity } = &task.spec {
            self.aggregates.add_requested(resource, *quantity);
        }
        info!(task_id = id, kind = %task.kind(), priority = %task.priority, "Task queued");
        self.events.push(FleetEvent::TaskQueued {
            task_id: id,
            kind: task.kind(),
            priority: task.priority,
        });
        self.backlog.insert(task);

        self.assign_pending_tasks(registry, dispatcher, now);
        id
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Match idle agents to the best suitable backlog entry.
    ///
    /// Returns how many tasks were assigned.
    pub fn assign_pending_tasks(
        &mut self,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> usize {
        if self.paused || self.backlog.is_empty() {
            return 0;
        }

        let mut assigned = 0;
        for agent_id in registry.idle_agents() {
            if self.backlog.is_empty() {
                break;
            }
            let Some(agent) = registry.get(agent_id) else {
                continue;
            };
            let threshold = self.area_distance_threshold;
            let Some(task) = self.backlog.take_first(|t| is_suitable(t, agent, threshold)) else {
                continue;
            };
            match self.dispatch_assignment(task, agent_id, registry, dispatcher, now) {
                Ok(()) => assigned += 1,
                Err(e) => warn!(agent_id, error = %e, "Assignment failed, task stays pending"),
            }
        }

        if assigned > 0 {
            debug!(assigned, pending = self.backlog.len(), "Assignment pass");
        }
        assigned
    }

    /// Whether `agent` can take `task` now.
    pub fn find_suitable_task(&self, task: &Task, agent: &AgentRecord) -> bool {
        is_suitable(task, agent, self.area_distance_threshold)
    }

    /// Assign a specific pending task to a specific idle agent.
    pub fn assign_task(
        &mut self,
        task_id: TaskId,
        agent_id: AgentId,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if self.paused {
            return Err(SchedulerError::Paused);
        }
        let Some(task) = self.backlog.remove(task_id) else {
            return Err(self.not_pending(task_id));
        };
        self.dispatch_assignment(task, agent_id, registry, dispatcher, now)
    }

    /// Bind, send, and on send failure roll both sides back.
    fn dispatch_assignment(
        &mut self,
        mut task: Task,
        agent_id: AgentId,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if let Err(e) = registry.mark_assigned(agent_id, task.id, now) {
            self.backlog.restore(task);
            return Err(e.into());
        }

        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(agent_id);
        task.last_assigned = Some(agent_id);
        task.assigned_time = Some(now);

        if let Err(e) = dispatcher.send_task(registry, agent_id, &task) {
            registry.release_task(agent_id, task.id, now);
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.assigned_time = None;
            self.backlog.restore(task);
            return Err(e.into());
        }

        info!(
            task_id = task.id,
            agent_id,
            kind = %task.kind(),
            priority = %task.priority,
            retry_count = task.retry_count,
            "Task assigned"
        );
        self.events.push(FleetEvent::TaskAssigned {
            task_id: task.id,
            agent_id,
        });
        self.in_flight.insert(task.id, task);
        Ok(())
    }

    // ========================================================================
    // Agent reports
    // ========================================================================

    /// Apply a progress report from `agent` to the task it holds.
    pub fn handle_progress(
        &mut self,
        agent: AgentId,
        report: &ProgressReport,
        registry: &mut FleetRegistry,
    ) -> Result<ProgressDelta, SchedulerError> {
        let id = self.resolve(agent, report.task_id)?;
        let task = self.in_flight.get_mut(&id).ok_or(SchedulerError::UnknownTask(id))?;
        let delta = progress::apply_report(task, report);
        credit(&mut self.aggregates, task, delta, agent, registry);
        debug!(
            task_id = id,
            agent_id = agent,
            gathered = delta.gathered,
            blocks = delta.blocks_mined,
            percent = task.percent_complete(),
            "Task progress"
        );
        Ok(delta)
    }

    /// Finish the agent's task, free the agent and reuse it immediately.
    pub fn handle_complete(
        &mut self,
        agent: AgentId,
        report: &CompletionReport,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> Result<TaskId, SchedulerError> {
        let id = self.resolve(agent, report.task_id)?;
        let mut task = self.in_flight.remove(&id).ok_or(SchedulerError::UnknownTask(id))?;

        let delta = progress::apply_report(&mut task, &report.as_progress());
        credit(&mut self.aggregates, &task, delta, agent, registry);

        task.status = TaskStatus::Completed;
        task.assigned_to = None;
        task.finished_at = Some(now);
        registry.release_task(agent, id, now);
        registry.record_outcome(agent, true);

        info!(task_id = id, agent_id = agent, kind = %task.kind(), "Task completed");
        self.events.push(FleetEvent::TaskCompleted { task_id: id, agent_id: agent });
        self.archive.push(task);

        self.assign_pending_tasks(registry, dispatcher, now);
        Ok(id)
    }

    /// Retry a recoverable failure while retries remain, otherwise fail for good.
    pub fn handle_failed(
        &mut self,
        agent: AgentId,
        report: &FailureReport,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, SchedulerError> {
        let id = self.resolve(agent, report.task_id)?;
        let mut task = self.in_flight.remove(&id).ok_or(SchedulerError::UnknownTask(id))?;

        let delta = progress::apply_report(&mut task, &report.as_progress());
        credit(&mut self.aggregates, &task, delta, agent, registry);
        task.last_error = Some(report.reason.clone());
        registry.release_task(agent, id, now);
        registry.record_outcome(agent, false);

        let outcome = if report.recoverable && task.retry_count < self.max_retries {
            task.retry_count += 1;
            let retry_count = task.retry_count;
            warn!(task_id = id, agent_id = agent, retry_count, reason = %report.reason, "Task failed, retrying");
            self.events.push(FleetEvent::TaskRetrying {
                task_id: id,
                retry_count,
                reason: report.reason.clone(),
            });
            self.requeue(task);
            FailureOutcome::Retrying { retry_count }
        } else {
            warn!(
                task_id = id,
                agent_id = agent,
                retry_count = task.retry_count,
                recoverable = report.recoverable,
                reason = %report.reason,
                "Task failed permanently"
            );
            self.events.push(FleetEvent::TaskFailed {
                task_id: id,
                reason: report.reason.clone(),
            });
            self.fail_terminal(task, now);
            FailureOutcome::Failed
        };

        self.assign_pending_tasks(registry, dispatcher, now);
        Ok(outcome)
    }

    /// Return a task whose agent went away to the backlog. Not a retry.
    ///
    /// The caller has already cleared the agent's reference.
    pub fn release_orphan(&mut self, task_id: TaskId, agent: AgentId) -> bool {
        if self.in_flight.get(&task_id).and_then(|t| t.assigned_to) != Some(agent) {
            return false;
        }
        let Some(task) = self.in_flight.remove(&task_id) else {
            return false;
        };
        info!(task_id, agent_id = agent, "Task released back to backlog");
        self.events.push(FleetEvent::TaskReleased { task_id, agent_id: agent });
        self.requeue(task);
        true
    }

    // ========================================================================
    // Operator control
    // ========================================================================

    /// Broadcast a stop, fail everything in flight and pause assignment.
    ///
    /// Local state is reconciled even if the broadcast could not be queued.
    pub fn emergency_stop(
        &mut self,
        reason: &str,
        registry: &mut FleetRegistry,
        dispatcher: &CommandDispatcher,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let broadcast = dispatcher.emergency_stop(reason);
        self.paused = true;

        let in_flight = std::mem::take(&mut self.in_flight);
        let failed = in_flight.len();
        for (id, mut task) in in_flight {
            if let Some(agent) = task.assigned_to {
                registry.halt_task(agent, id, now);
            }
            task.last_error = Some(EMERGENCY_STOP_REASON.to_string());
            self.events.push(FleetEvent::TaskFailed {
                task_id: id,
                reason: EMERGENCY_STOP_REASON.to_string(),
            });
            self.fail_terminal(task, now);
        }

        warn!(failed_tasks = failed, reason, "Emergency stop, scheduling paused");
        self.events.push(FleetEvent::EmergencyStop { failed_tasks: failed });
        broadcast?;
        Ok(failed)
    }

    /// Lift an emergency stop and assign straight away.
    pub fn resume(&mut self, registry: &mut FleetRegistry, dispatcher: &CommandDispatcher, now: DateTime<Utc>) -> usize {
        if !self.paused {
            return 0;
        }
        self.paused = false;
        info!(pending = self.backlog.len(), "Scheduling resumed");
        self.events.push(FleetEvent::SchedulingResumed);
        self.assign_pending_tasks(registry, dispatcher, now)
    }

    /// Withdraw a task that has not been assigned yet.
    pub fn cancel_pending(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let Some(mut task) = self.backlog.remove(task_id) else {
            return Err(self.not_pending(task_id));
        };
        if let TaskSpec::ResourceTarget { resource, quantity } = &task.spec {
            let outstanding = match &task.progress {
                crate::types::TaskProgress::Resource { gathered, .. } => quantity.saturating_sub(gathered.total()),
                _ => *quantity,
            };
            self.aggregates.withdraw_requested(resource, outstanding);
        }
        task.last_error = Some("cancelled".to_string());
        info!(task_id, "Task cancelled");
        self.events.push(FleetEvent::TaskCancelled { task_id });
        self.fail_terminal(task, now);
        Ok(())
    }

    /// Purge archived tasks older than the configured age.
    pub fn cleanup_archive(&mut self, now: DateTime<Utc>) -> usize {
        let purged = self.archive.purge_finished_before(now - self.archive_max_age);
        if purged > 0 {
            info!(purged, remaining = self.archive.len(), "Archive cleanup");
        }
        purged
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.in_flight
            .get(&id)
            .or_else(|| self.backlog.get(id))
            .or_else(|| self.archive.get(id))
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Task> {
        self.in_flight.values()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Task currently held by `agent`, if any.
    pub fn in_flight_for(&self, agent: AgentId) -> Option<&Task> {
        self.in_flight.values().find(|t| t.assigned_to == Some(agent))
    }

    pub fn archive(&self) -> &TaskArchive {
        &self.archive
    }

    pub fn aggregates(&self) -> &ResourceAggregates {
        &self.aggregates
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn drain_events(&mut self) -> Vec<FleetEvent> {
        std::mem::take(&mut self.events)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn resolve(&self, agent: AgentId, claimed: Option<TaskId>) -> Result<TaskId, SchedulerError> {
        let held = self
            .in_flight_for(agent)
            .map(|t| t.id)
            .ok_or(SchedulerError::NoTaskForAgent(agent))?;
        match claimed {
            Some(task_id) if task_id != held => Err(SchedulerError::StaleReport { agent_id: agent, task_id }),
            _ => Ok(held),
        }
    }

    fn not_pending(&self, task_id: TaskId) -> SchedulerError {
        match self.task(task_id) {
            Some(task) => SchedulerError::InvalidTransition {
                task_id,
                status: task.status,
            },
            None => SchedulerError::UnknownTask(task_id),
        }
    }

    fn requeue(&mut self, mut task: Task) {
        progress::rollover(&mut task);
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.assigned_time = None;
        self.backlog.insert(task);
    }

    fn fail_terminal(&mut self, mut task: Task, now: DateTime<Utc>) {
        task.status = TaskStatus::Failed;
        task.assigned_to = None;
        task.finished_at = Some(now);
        self.archive.push(task);
    }
}

fn validate_spec(spec: &TaskSpec) -> Result<(), SchedulerError> {
    match spec {
        TaskSpec::ResourceTarget { resource, quantity } => {
            if resource.trim().is_empty() {
                return Err(SchedulerError::InvalidTask("resource name is empty".to_string()));
            }
            if *quantity == 0 {
                return Err(SchedulerError::InvalidTask("quantity must be at least 1".to_string()));
            }
        }
        TaskSpec::AreaMining { area } if area.volume().is_none() => {
            return Err(SchedulerError::InvalidTask(format!("area {}..{} is too large", area.min, area.max)));
        }
        TaskSpec::SmartMining { radius, .. } if *radius == 0 => {
            return Err(SchedulerError::InvalidTask("radius must be at least 1".to_string()));
        }
        _ => {}
    }
    Ok(())
}

fn is_suitable(task: &Task, agent: &AgentRecord, area_distance_threshold: f64) -> bool {
    if agent.status != AgentStatus::Idle || agent.current_task.is_some() {
        return false;
    }
    match &task.spec {
        TaskSpec::AreaMining { area } => agent
            .position
            .is_some_and(|pos| pos.distance_to(&area.centroid()) <= area_distance_threshold),
        TaskSpec::ResourceTarget { .. } | TaskSpec::SmartMining { .. } => true,
    }
}

fn credit(
    aggregates: &mut ResourceAggregates,
    task: &Task,
    delta: ProgressDelta,
    agent: AgentId,
    registry: &mut FleetRegistry,
) {
    if let TaskSpec::ResourceTarget { resource, .. } = &task.spec {
        aggregates.add_gathered(resource, delta.gathered);
    }
    if delta.blocks_mined > 0 {
        registry.add_blocks_mined(agent, delta.blocks_mined);
    }
}
