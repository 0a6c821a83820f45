//! Shared data structures for fleet coordination
//!
//! - `agent`: agent records, status and telemetry
//! - `task`: task specs, priorities, progress and lifecycle
//! - `message`: wire envelope, inbound/outbound message model
//! - `event`: fleet events published by the registry and scheduler

mod agent;
mod task;
mod message;
mod event;

pub use agent::*;
pub use task::*;
pub use message::*;
pub use event::*;
