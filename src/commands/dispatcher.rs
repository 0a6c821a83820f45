//! Command Dispatcher
//!
//! Validates commands against the catalog and hands them to the transport.
//! Nothing is transmitted unless validation and the reachability check pass.
//! "Sent" means queued on the transport; agents never acknowledge.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::catalog::CommandCatalog;
use super::validation::{validate_parameters, ParamError};
use crate::fleet::FleetRegistry;
use crate::transport::{TransportError, TransportHandle};
use crate::types::{AgentId, OutboundMessage, Task};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid parameters for '{command}': {source}")]
    InvalidParameters {
        command: String,
        #[source]
        source: ParamError,
    },

    #[error("agent {0} is not reachable")]
    AgentUnreachable(AgentId),

    #[error("transport rejected message: {0}")]
    Transport(#[from] TransportError),
}

pub struct CommandDispatcher {
    catalog: CommandCatalog,
    transport: TransportHandle,
}

impl CommandDispatcher {
    pub fn new(catalog: CommandCatalog, transport: TransportHandle) -> Self {
        Self { catalog, transport }
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut TransportHandle {
        &mut self.transport
    }

    fn validated(&self, command: &str, params: &Value) -> Result<(), CommandError> {
        let spec = self
            .catalog
            .get(command)
            .ok_or_else(|| CommandError::UnknownCommand(command.to_string()))?;
        validate_parameters(&spec.params, params).map_err(|source| CommandError::InvalidParameters {
            command: command.to_string(),
            source,
        })
    }

    /// Validate and send a named command to one reachable agent.
    pub fn execute(
        &self,
        registry: &FleetRegistry,
        agent: AgentId,
        command: &str,
        params: Value,
    ) -> Result<(), CommandError> {
        self.validated(command, &params)?;
        if !registry.is_reachable(agent) {
            return Err(CommandError::AgentUnreachable(agent));
        }
        self.transport.send(
            agent,
            OutboundMessage::Command {
                command: command.to_string(),
                data: params,
            },
        )?;
        info!(agent_id = agent, command, "Command sent");
        Ok(())
    }

    /// Validate once, then send to every reachable agent.
    ///
    /// Returns how many sends the transport accepted.
    pub fn broadcast(&self, registry: &FleetRegistry, command: &str, data: Value) -> Result<usize, CommandError> {
        self.validated(command, &data)?;

        let mut sent = 0;
        for agent in registry.reachable_ids() {
            let message = OutboundMessage::Command {
                command: command.to_string(),
                data: data.clone(),
            };
            match self.transport.send(agent, message) {
                Ok(()) => sent += 1,
                Err(e) => warn!(agent_id = agent, command, error = %e, "Broadcast send failed"),
            }
        }
        info!(command, sent, "Command broadcast");
        Ok(sent)
    }

    /// Send a task's type-specific payload to its agent.
    pub fn send_task(&self, registry: &FleetRegistry, agent: AgentId, task: &Task) -> Result<(), CommandError> {
        if !registry.is_reachable(agent) {
            return Err(CommandError::AgentUnreachable(agent));
        }
        self.transport.send(
            agent,
            OutboundMessage::TaskAssign {
                task_id: task.id,
                priority: task.priority,
                retry_count: task.retry_count,
                task: task.spec.clone(),
            },
        )?;
        debug!(agent_id = agent, task_id = task.id, kind = %task.kind(), "Task payload sent");
        Ok(())
    }

    /// Broadcast `emergency_stop` on the radio.
    pub fn emergency_stop(&self, reason: &str) -> Result<(), CommandError> {
        self.transport.broadcast(OutboundMessage::EmergencyStop {
            reason: reason.to_string(),
        })?;
        warn!(reason, "Emergency stop broadcast");
        Ok(())
    }

    /// Ask one agent, or everyone in range, for a fresh status report.
    pub fn status_request(&self, registry: &FleetRegistry, agent: Option<AgentId>) -> Result<(), CommandError> {
        match agent {
            Some(id) => {
                if !registry.is_reachable(id) {
                    return Err(CommandError::AgentUnreachable(id));
                }
                self.transport.send(id, OutboundMessage::StatusRequest)?;
            }
            None => self.transport.broadcast(OutboundMessage::StatusRequest)?,
        }
        Ok(())
    }
}
