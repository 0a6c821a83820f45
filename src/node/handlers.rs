//! Inbound message handlers
//!
//! One handler per inbound message type, installed on the control bus at
//! startup. Handlers run to completion against the shared context; an `Err`
//! is logged by the bus with the message type and never stops the loop.

use thiserror::Error;
use tracing::{debug, info};

use super::context::{ControlContext, Sighting};
use crate::fleet::RegistryError;
use crate::tasks::{FailureOutcome, SchedulerError};
use crate::transport::{MessageBus, TransportError};
use crate::types::{
    AgentId, AgentStatus, Area, Inbound, InboundMessage, MessageKind, Priority, SaturationReport, TaskOrigin,
    TaskSpec,
};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("discover reply not sent: {0}")]
    Transport(#[from] TransportError),
}

pub type ControlBus = MessageBus<ControlContext, HandlerError>;

/// Register the standard handler for every inbound message type.
pub fn install(bus: &mut ControlBus) {
    bus.register(MessageKind::TurtleOnline, "registry.join", on_turtle_online);
    bus.register(MessageKind::TurtleOffline, "registry.leave", on_turtle_offline);
    bus.register(MessageKind::Heartbeat, "registry.heartbeat", on_heartbeat);
    bus.register(MessageKind::StatusUpdate, "registry.status", on_status_update);
    bus.register(MessageKind::TaskProgress, "scheduler.progress", on_task_progress);
    bus.register(MessageKind::TaskComplete, "scheduler.complete", on_task_complete);
    bus.register(MessageKind::TaskFailed, "scheduler.failed", on_task_failed);
    bus.register(MessageKind::AreaSaturated, "scheduler.saturated", on_area_saturated);
    bus.register(MessageKind::ResourceFound, "fleet.sighting", on_resource_found);
    bus.register(MessageKind::Discover, "transport.discover", on_discover);
}

/// A control bus with the standard handlers installed.
pub fn standard_bus() -> ControlBus {
    let mut bus = ControlBus::new();
    install(&mut bus);
    bus
}

fn on_turtle_online(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::TurtleOnline(join) = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    let registration = ctx.registry.register(msg.sender, join, now);
    if let Some(task_id) = registration.orphaned_task {
        ctx.scheduler.release_orphan(task_id, msg.sender);
    }
    Ok(())
}

fn on_turtle_offline(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::TurtleOffline { reason } = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    let reason = reason.as_deref().unwrap_or("agent signed off");
    if let Some(task_id) = ctx.registry.unregister(msg.sender, reason, now) {
        ctx.scheduler.release_orphan(task_id, msg.sender);
        ctx.assign_pending();
    }
    Ok(())
}

fn on_heartbeat(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::Heartbeat(telemetry) = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    ctx.registry.update_heartbeat(msg.sender, telemetry, now);
    assign_if_idle(ctx, msg.sender);
    Ok(())
}

fn on_status_update(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::StatusUpdate(report) = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    ctx.registry.apply_status_update(msg.sender, report, now);
    assign_if_idle(ctx, msg.sender);
    Ok(())
}

fn on_task_progress(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::TaskProgress(report) = &msg.message else {
        return Ok(());
    };
    let result = ctx.scheduler.handle_progress(msg.sender, report, &mut ctx.registry);
    tolerate_stale(msg.sender, result.map(|_| ()))
}

fn on_task_complete(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::TaskComplete(report) = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    let result = ctx
        .scheduler
        .handle_complete(msg.sender, report, &mut ctx.registry, &ctx.dispatcher, now);
    tolerate_stale(msg.sender, result.map(|_| ()))
}

fn on_task_failed(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::TaskFailed(report) = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    let result = ctx
        .scheduler
        .handle_failed(msg.sender, report, &mut ctx.registry, &ctx.dispatcher, now);
    if let Ok(FailureOutcome::Failed) = result {
        ctx.registry
            .record_fault(msg.sender, &format!("task failed: {}", report.reason), now)?;
    }
    tolerate_stale(msg.sender, result.map(|_| ()))
}

fn on_area_saturated(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::AreaSaturated(report) = &msg.message else {
        return Ok(());
    };
    let now = ctx.now();
    let spec = smart_mining_for(report);
    let priority = report.priority.unwrap_or(Priority::NORMAL);
    let task_id = ctx.scheduler.create_task(
        spec,
        priority,
        TaskOrigin::Agent { agent_id: msg.sender },
        &mut ctx.registry,
        &ctx.dispatcher,
        now,
    )?;
    info!(
        agent_id = msg.sender,
        task_id,
        priority = %priority,
        saturation = ?report.saturation,
        "Area saturated, smart mining queued"
    );
    Ok(())
}

fn on_resource_found(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    let InboundMessage::ResourceFound(found) = &msg.message else {
        return Ok(());
    };
    debug!(agent_id = msg.sender, resource = %found.resource, position = ?found.position, "Resource sighted");
    let sighting = Sighting {
        agent_id: msg.sender,
        resource: found.resource.clone(),
        position: found.position,
        quantity: found.quantity,
        at: ctx.now(),
    };
    ctx.record_sighting(sighting);
    Ok(())
}

fn on_discover(ctx: &mut ControlContext, msg: &Inbound) -> Result<(), HandlerError> {
    if ctx.dispatcher.transport().answer_discover(msg.sender)? {
        debug!(agent_id = msg.sender, "Answered discover");
    }
    Ok(())
}

/// Eager assignment for an agent that just reported itself idle.
fn assign_if_idle(ctx: &mut ControlContext, agent: AgentId) {
    let idle = ctx
        .registry
        .get(agent)
        .is_some_and(|a| a.status == AgentStatus::Idle && a.current_task.is_none());
    if idle && !ctx.scheduler.backlog().is_empty() {
        ctx.assign_pending();
    }
}

/// Late or duplicate task reports are expected on a lossy radio.
fn tolerate_stale(agent: AgentId, result: Result<(), SchedulerError>) -> Result<(), HandlerError> {
    match result {
        Err(SchedulerError::NoTaskForAgent(_)) => {
            debug!(agent_id = agent, "Task report from agent without a task, ignored");
            Ok(())
        }
        Err(SchedulerError::StaleReport { task_id, .. }) => {
            debug!(agent_id = agent, task_id, "Stale task report ignored");
            Ok(())
        }
        other => other.map_err(HandlerError::from),
    }
}

/// Smart mining job covering the saturated area.
fn smart_mining_for(report: &SaturationReport) -> TaskSpec {
    let Area { min, max } = report.area;
    let extent = max.x.abs_diff(min.x).max(max.y.abs_diff(min.y)).max(max.z.abs_diff(min.z));
    let half_extent = extent.saturating_add(1) / 2;
    TaskSpec::SmartMining {
        center: report.area.centroid(),
        radius: u32::try_from(half_extent.max(1)).unwrap_or(u32::MAX),
        target: report.target.clone(),
    }
}
