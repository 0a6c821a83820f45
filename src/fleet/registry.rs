//! Fleet Registry - the authoritative agent table
//!
//! Every mutation takes the current time explicitly so the control loop (and
//! tests) decide what "now" is. Transitions are buffered as `FleetEvent`s and
//! collected with [`FleetRegistry::drain_events`].
//!
//! Status rules:
//! - `busy` exactly when the agent holds a task reference; only
//!   `mark_assigned` sets it and only the release paths clear it
//! - agents are never removed, only marked `offline`
//! - going offline (timeout or explicit) hands any held task back to the caller

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::types::{
    AgentId, AgentRecord, AgentStatus, FaultRecord, FleetEvent, JoinInfo, StatusReport, TaskId, Telemetry,
};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("agent {agent_id} is {status}, not idle")]
    NotAssignable { agent_id: AgentId, status: AgentStatus },

    #[error("agent {agent_id} already holds task {task_id}")]
    AlreadyBusy { agent_id: AgentId, task_id: TaskId },
}

/// Result of an explicit join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// The id was already known
    pub rejoined: bool,
    /// Task the agent held before re-registering; the agent has dropped it
    pub orphaned_task: Option<TaskId>,
}

/// One agent marked offline by a liveness sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTimeout {
    pub agent_id: AgentId,
    pub silent_for: Duration,
    pub orphaned_task: Option<TaskId>,
}

/// Agent counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub online: usize,
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
    pub error: usize,
    pub total: usize,
}

const ERROR_STATUS_FAULT: &str = "agent reported error status";

pub struct FleetRegistry {
    agents: BTreeMap<AgentId, AgentRecord>,
    heartbeat_timeout: Duration,
    error_history_capacity: usize,
    events: Vec<FleetEvent>,
}

impl FleetRegistry {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            agents: BTreeMap::new(),
            heartbeat_timeout: config.heartbeat_timeout(),
            error_history_capacity: config.error_history_capacity.max(1),
            events: Vec::new(),
        }
    }

    /// Seed the table from persisted records.
    ///
    /// Reachability does not survive a restart: every record comes back
    /// `offline` with no task.
    pub fn restore(&mut self, records: Vec<AgentRecord>, now: DateTime<Utc>) {
        let count = records.len();
        for mut record in records {
            record.status = AgentStatus::Offline;
            record.status_changed_at = now;
            record.current_task = None;
            self.agents.insert(record.id, record);
        }
        info!(agents = count, "Agent table restored, all agents offline");
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Explicit join. Idempotent: a known id keeps `registered_at` and its
    /// cumulative statistics.
    pub fn register(&mut self, id: AgentId, join: &JoinInfo, now: DateTime<Utc>) -> Registration {
        let rejoined = self.agents.contains_key(&id);
        let record = self.agents.entry(id).or_insert_with(|| AgentRecord::new(id, now));

        let orphaned_task = record.current_task.take();
        if let Some(label) = &join.label {
            record.label = Some(label.clone());
        }
        record.apply_telemetry(&join.telemetry);
        record.last_contact = now;
        set_status(record, AgentStatus::Online, now);

        if rejoined {
            info!(agent_id = id, orphaned_task = ?orphaned_task, "Agent re-registered");
            self.events.push(FleetEvent::AgentRejoined { agent_id: id });
        } else {
            info!(agent_id = id, label = ?join.label, "Agent registered");
            self.events.push(FleetEvent::AgentJoined { agent_id: id });
        }

        Registration {
            rejoined,
            orphaned_task,
        }
    }

    /// Explicit leave. The record stays; the held task, if any, is returned.
    pub fn unregister(&mut self, id: AgentId, reason: &str, now: DateTime<Utc>) -> Option<TaskId> {
        let Some(record) = self.agents.get_mut(&id) else {
            debug!(agent_id = id, "Offline notice from unknown agent ignored");
            return None;
        };
        record.last_contact = now;
        let orphaned = record.current_task.take();
        set_status(record, AgentStatus::Offline, now);
        info!(agent_id = id, reason, orphaned_task = ?orphaned, "Agent went offline");
        self.events.push(FleetEvent::AgentLeft {
            agent_id: id,
            reason: reason.to_string(),
        });
        orphaned
    }

    /// Record contact from `id`, registering it on first sight.
    ///
    /// An agent that was offline comes back `online`.
    pub fn touch(&mut self, id: AgentId, now: DateTime<Utc>) -> &mut AgentRecord {
        let events = &mut self.events;
        let record = self.agents.entry(id).or_insert_with(|| {
            info!(agent_id = id, "Unknown agent seen, registering implicitly");
            events.push(FleetEvent::AgentJoined { agent_id: id });
            AgentRecord::new(id, now)
        });
        record.last_contact = now;
        if record.status == AgentStatus::Offline {
            set_status(record, AgentStatus::Online, now);
            info!(agent_id = id, "Offline agent back in contact");
            events.push(FleetEvent::AgentRejoined { agent_id: id });
        }
        record
    }

    /// Refresh contact time for a known agent only. Returns false for strangers.
    pub fn touch_known(&mut self, id: AgentId, now: DateTime<Utc>) -> bool {
        if self.agents.contains_key(&id) {
            self.touch(id, now);
            true
        } else {
            false
        }
    }

    // ========================================================================
    // Telemetry
    // ========================================================================

    /// Apply a heartbeat. Fields absent from `telemetry` keep their values.
    pub fn update_heartbeat(&mut self, id: AgentId, telemetry: &Telemetry, now: DateTime<Utc>) {
        let capacity = self.error_history_capacity;
        let record = self.touch(id, now);
        record.apply_telemetry(telemetry);
        let reported_error = telemetry
            .status
            .is_some_and(|status| apply_reported_status(record, status, now));
        if reported_error {
            push_fault(record, ERROR_STATUS_FAULT, now, capacity);
            warn!(agent_id = id, "Agent heartbeat reports error status");
            self.events.push(FleetEvent::AgentFault {
                agent_id: id,
                message: ERROR_STATUS_FAULT.to_string(),
            });
        }
    }

    /// Apply a `status_update`: telemetry, optional status, optional fault text.
    pub fn apply_status_update(&mut self, id: AgentId, report: &StatusReport, now: DateTime<Utc>) {
        let capacity = self.error_history_capacity;
        let record = self.touch(id, now);
        record.apply_telemetry(&report.telemetry);

        let reported_error = report
            .telemetry
            .status
            .is_some_and(|status| apply_reported_status(record, status, now));

        let message = match (&report.error, reported_error) {
            (Some(text), _) => Some(text.clone()),
            (None, true) => Some(ERROR_STATUS_FAULT.to_string()),
            (None, false) => None,
        };
        if let Some(message) = message {
            push_fault(record, &message, now, capacity);
            warn!(agent_id = id, fault = %message, "Agent fault reported");
            self.events.push(FleetEvent::AgentFault { agent_id: id, message });
        }
    }

    /// Append a fault to the agent's bounded history.
    pub fn record_fault(&mut self, id: AgentId, message: &str, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let capacity = self.error_history_capacity;
        let record = self.agents.get_mut(&id).ok_or(RegistryError::UnknownAgent(id))?;
        push_fault(record, message, now, capacity);
        self.events.push(FleetEvent::AgentFault {
            agent_id: id,
            message: message.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Mark every reachable agent silent for longer than the timeout offline.
    ///
    /// An agent exactly at the timeout is left alone until the next sweep.
    pub fn check_liveness(&mut self, now: DateTime<Utc>) -> Vec<LivenessTimeout> {
        let mut timed_out = Vec::new();
        for record in self.agents.values_mut() {
            if !record.status.is_reachable() {
                continue;
            }
            let silent_for = now.signed_duration_since(record.last_contact);
            if silent_for <= self.heartbeat_timeout {
                continue;
            }
            let orphaned_task = record.current_task.take();
            set_status(record, AgentStatus::Offline, now);
            warn!(
                agent_id = record.id,
                silent_ms = silent_for.num_milliseconds(),
                orphaned_task = ?orphaned_task,
                "Agent heartbeat timed out"
            );
            self.events.push(FleetEvent::AgentTimedOut {
                agent_id: record.id,
                silent_for_ms: silent_for.num_milliseconds(),
            });
            timed_out.push(LivenessTimeout {
                agent_id: record.id,
                silent_for,
                orphaned_task,
            });
        }
        timed_out
    }

    // ========================================================================
    // Task references
    // ========================================================================

    /// Bind `task_id` to an idle agent, making it busy.
    pub fn mark_assigned(&mut self, id: AgentId, task_id: TaskId, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let record = self.agents.get_mut(&id).ok_or(RegistryError::UnknownAgent(id))?;
        if let Some(held) = record.current_task {
            return Err(RegistryError::AlreadyBusy { agent_id: id, task_id: held });
        }
        if record.status != AgentStatus::Idle {
            return Err(RegistryError::NotAssignable {
                agent_id: id,
                status: record.status,
            });
        }
        record.current_task = Some(task_id);
        set_status(record, AgentStatus::Busy, now);
        Ok(())
    }

    /// Drop the agent's reference to `task_id`; a busy agent becomes idle.
    ///
    /// Returns false if the agent did not hold that task.
    pub fn release_task(&mut self, id: AgentId, task_id: TaskId, now: DateTime<Utc>) -> bool {
        self.clear_task(id, task_id, AgentStatus::Idle, now)
    }

    /// Like `release_task` but the agent lands in `online`, so nothing is
    /// assigned to it until it reports idle again.
    pub fn halt_task(&mut self, id: AgentId, task_id: TaskId, now: DateTime<Utc>) -> bool {
        self.clear_task(id, task_id, AgentStatus::Online, now)
    }

    fn clear_task(&mut self, id: AgentId, task_id: TaskId, next: AgentStatus, now: DateTime<Utc>) -> bool {
        let Some(record) = self.agents.get_mut(&id) else {
            return false;
        };
        if record.current_task != Some(task_id) {
            return false;
        }
        record.current_task = None;
        if record.status == AgentStatus::Busy {
            set_status(record, next, now);
        }
        true
    }

    /// Credit blocks mined to the agent's lifetime total.
    pub fn add_blocks_mined(&mut self, id: AgentId, blocks: u64) {
        if let Some(record) = self.agents.get_mut(&id) {
            record.total_blocks_mined += blocks;
        }
    }

    /// Count a finished task against the agent.
    pub fn record_outcome(&mut self, id: AgentId, completed: bool) {
        if let Some(record) = self.agents.get_mut(&id) {
            if completed {
                record.tasks_completed += 1;
            } else {
                record.tasks_failed += 1;
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, id: AgentId) -> Option<&AgentRecord> {
        self.agents.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// Snapshot of every agent, by id.
    pub fn all(&self) -> Vec<AgentRecord> {
        self.agents.values().cloned().collect()
    }

    /// Snapshot of reachable agents.
    pub fn online(&self) -> Vec<AgentRecord> {
        self.agents.values().filter(|a| a.status.is_reachable()).cloned().collect()
    }

    /// Ids of agents ready for work, ascending.
    pub fn idle_agents(&self) -> Vec<AgentId> {
        self.agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.current_task.is_none())
            .map(|a| a.id)
            .collect()
    }

    pub fn reachable_ids(&self) -> Vec<AgentId> {
        self.agents.values().filter(|a| a.status.is_reachable()).map(|a| a.id).collect()
    }

    pub fn is_reachable(&self, id: AgentId) -> bool {
        self.agents.get(&id).is_some_and(|a| a.status.is_reachable())
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for agent in self.agents.values() {
            match agent.status {
                AgentStatus::Online => counts.online += 1,
                AgentStatus::Idle => counts.idle += 1,
                AgentStatus::Busy => counts.busy += 1,
                AgentStatus::Offline => counts.offline += 1,
                AgentStatus::Error => counts.error += 1,
            }
            counts.total += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn drain_events(&mut self) -> Vec<FleetEvent> {
        std::mem::take(&mut self.events)
    }
}

fn set_status(record: &mut AgentRecord, status: AgentStatus, now: DateTime<Utc>) {
    if record.status != status {
        debug!(agent_id = record.id, from = %record.status, to = %status, "Agent status change");
        record.status = status;
        record.status_changed_at = now;
    }
}

/// Fold an agent-reported status into the record.
///
/// The task reference wins: an agent holding a task stays busy whatever it
/// says. Returns true when the agent reported `error`.
fn apply_reported_status(record: &mut AgentRecord, reported: AgentStatus, now: DateTime<Utc>) -> bool {
    let is_error = reported == AgentStatus::Error;
    if record.current_task.is_some() {
        return is_error;
    }
    let next = match reported {
        AgentStatus::Idle => AgentStatus::Idle,
        AgentStatus::Online | AgentStatus::Busy => AgentStatus::Online,
        AgentStatus::Error => AgentStatus::Error,
        AgentStatus::Offline => {
            debug!(agent_id = record.id, "Ignoring self-reported offline status");
            return false;
        }
    };
    set_status(record, next, now);
    is_error
}

fn push_fault(record: &mut AgentRecord, message: &str, now: DateTime<Utc>, capacity: usize) {
    while record.error_history.len() >= capacity {
        record.error_history.pop_front();
    }
    record.error_history.push_back(FaultRecord {
        at: now,
        message: message.to_string(),
    });
}
