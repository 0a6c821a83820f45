//! fleet-control: coordination node for a fleet of mining turtles
//!
//! ## Architecture
//!
//! - **Transport**: one radio interface, JSON frames, typed handler bus
//! - **Fleet Registry**: agent table, telemetry and liveness
//! - **Command Dispatcher**: catalog-validated commands and task payloads
//! - **Task Scheduler**: priority backlog, assignment, retries, emergency stop
//! - **Control loop**: single task that owns all of the above

pub mod commands;
pub mod config;
pub mod fleet;
pub mod node;
pub mod storage;
pub mod tasks;
pub mod transport;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, ControlConfig};

// Re-export the main components
pub use commands::{CommandCatalog, CommandDispatcher, CommandError};
pub use fleet::{FleetRegistry, RegistryError};
pub use node::{ControlLoop, FleetSnapshot, OperatorCommand, OperatorHandle};
pub use storage::{AgentStore, InMemoryAgentStore, SledAgentStore, StorageError};
pub use tasks::{SchedulerError, TaskScheduler};
pub use transport::{Transport, TransportError, TransportHandle};

// Re-export commonly used types
pub use types::{
    AgentId, AgentRecord, AgentStatus, FleetEvent, Priority, StampedEvent, Task, TaskId, TaskSpec, TaskStatus,
};
