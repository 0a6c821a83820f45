//! Operator actions
//!
//! Operators drive the node with one JSON object per line, tagged by
//! `action`:
//!
//! ```text
//! {"action":"queue_task","task":{"type":"resource_target","resource":"diamond","quantity":64},"priority":"high"}
//! {"action":"cancel_task","task_id":7}
//! {"action":"emergency_stop","reason":"creeper"}
//! {"action":"resume"}
//! {"action":"command","agent_id":3,"command":"goto","params":{"x":10,"y":64,"z":-4}}
//! {"action":"broadcast","command":"return_home"}
//! {"action":"status_request","agent_id":3}
//! {"action":"save"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ControlContext;
use crate::commands::CommandError;
use crate::storage::StorageError;
use crate::tasks::SchedulerError;
use crate::types::{AgentId, Priority, TaskId, TaskOrigin, TaskSpec};

const DEFAULT_STOP_REASON: &str = "operator";

/// Priority as an operator types it: a number or a level name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PriorityInput {
    Value(i32),
    Level(String),
}

impl PriorityInput {
    fn resolve(&self) -> Result<Priority, OperatorError> {
        match self {
            PriorityInput::Value(v) => Ok(Priority(*v)),
            PriorityInput::Level(name) => {
                Priority::parse(name).ok_or_else(|| OperatorError::InvalidPriority(name.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperatorCommand {
    QueueTask {
        task: TaskSpec,
        #[serde(default)]
        priority: Option<PriorityInput>,
    },
    CancelTask {
        task_id: TaskId,
    },
    EmergencyStop {
        #[serde(default)]
        reason: Option<String>,
    },
    Resume,
    Command {
        agent_id: AgentId,
        command: String,
        #[serde(default)]
        params: Value,
    },
    Broadcast {
        command: String,
        #[serde(default)]
        params: Value,
    },
    StatusRequest {
        #[serde(default)]
        agent_id: Option<AgentId>,
    },
    Save,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self, OperatorError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperatorCommand::QueueTask { .. } => "queue_task",
            OperatorCommand::CancelTask { .. } => "cancel_task",
            OperatorCommand::EmergencyStop { .. } => "emergency_stop",
            OperatorCommand::Resume => "resume",
            OperatorCommand::Command { .. } => "command",
            OperatorCommand::Broadcast { .. } => "broadcast",
            OperatorCommand::StatusRequest { .. } => "status_request",
            OperatorCommand::Save => "save",
        }
    }
}

/// What an operator action achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OperatorOutcome {
    TaskQueued { task_id: TaskId },
    TaskCancelled { task_id: TaskId },
    Stopped { failed_tasks: usize },
    Resumed { assigned: usize },
    CommandSent { agent_id: AgentId },
    Broadcast { sent: usize },
    StatusRequested,
    Saved { agents: usize },
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("malformed operator command: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown priority '{0}'")]
    InvalidPriority(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("save failed: {0}")]
    Storage(#[from] StorageError),

    #[error("persistence is disabled")]
    NoStore,

    #[error("control loop stopped")]
    Closed,
}

/// An operator action on its way to the control loop, with an optional
/// channel for the result.
#[derive(Debug)]
pub struct OperatorRequest {
    pub command: OperatorCommand,
    pub reply: Option<oneshot::Sender<Result<OperatorOutcome, OperatorError>>>,
}

impl OperatorRequest {
    pub fn fire_and_forget(command: OperatorCommand) -> Self {
        Self { command, reply: None }
    }

    pub fn with_reply(command: OperatorCommand) -> (Self, oneshot::Receiver<Result<OperatorOutcome, OperatorError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Sending side for operator actions.
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    tx: mpsc::Sender<OperatorRequest>,
}

impl OperatorHandle {
    pub fn new(tx: mpsc::Sender<OperatorRequest>) -> Self {
        Self { tx }
    }

    /// Submit and wait for the loop to answer.
    pub async fn submit(&self, command: OperatorCommand) -> Result<OperatorOutcome, OperatorError> {
        let (request, reply) = OperatorRequest::with_reply(command);
        self.tx.send(request).await.map_err(|_| OperatorError::Closed)?;
        reply.await.map_err(|_| OperatorError::Closed)?
    }
}

/// Apply every action except `save`, which needs the store and is handled by
/// the loop itself.
pub fn execute(ctx: &mut ControlContext, command: OperatorCommand) -> Result<OperatorOutcome, OperatorError> {
    let now = ctx.now();
    match command {
        OperatorCommand::QueueTask { task, priority } => {
            let priority = priority.as_ref().map_or(Ok(Priority::NORMAL), PriorityInput::resolve)?;
            let task_id = ctx.scheduler.create_task(
                task,
                priority,
                TaskOrigin::Operator,
                &mut ctx.registry,
                &ctx.dispatcher,
                now,
            )?;
            Ok(OperatorOutcome::TaskQueued { task_id })
        }
        OperatorCommand::CancelTask { task_id } => {
            ctx.scheduler.cancel_pending(task_id, now)?;
            Ok(OperatorOutcome::TaskCancelled { task_id })
        }
        OperatorCommand::EmergencyStop { reason } => {
            let reason = reason.as_deref().unwrap_or(DEFAULT_STOP_REASON);
            let failed_tasks = ctx
                .scheduler
                .emergency_stop(reason, &mut ctx.registry, &ctx.dispatcher, now)?;
            Ok(OperatorOutcome::Stopped { failed_tasks })
        }
        OperatorCommand::Resume => {
            let assigned = ctx.scheduler.resume(&mut ctx.registry, &ctx.dispatcher, now);
            Ok(OperatorOutcome::Resumed { assigned })
        }
        OperatorCommand::Command {
            agent_id,
            command,
            params,
        } => {
            ctx.dispatcher.execute(&ctx.registry, agent_id, &command, params)?;
            Ok(OperatorOutcome::CommandSent { agent_id })
        }
        OperatorCommand::Broadcast { command, params } => {
            let sent = ctx.dispatcher.broadcast(&ctx.registry, &command, params)?;
            Ok(OperatorOutcome::Broadcast { sent })
        }
        OperatorCommand::StatusRequest { agent_id } => {
            ctx.dispatcher.status_request(&ctx.registry, agent_id)?;
            Ok(OperatorOutcome::StatusRequested)
        }
        OperatorCommand::Save => Err(OperatorError::NoStore),
    }
}

/// Forward operator lines from `reader` until EOF or cancellation.
///
/// Malformed lines are logged and skipped.
pub async fn read_operator_lines<R>(
    reader: R,
    tx: mpsc::Sender<OperatorRequest>,
    cancel: CancellationToken,
) -> Result<(), std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("Operator input closed");
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match OperatorCommand::parse(line) {
            Ok(command) => {
                debug!(action = command.name(), "Operator command read");
                if tx.send(OperatorRequest::fire_and_forget(command)).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!(error = %e, "Ignoring operator line"),
        }
    }
}
