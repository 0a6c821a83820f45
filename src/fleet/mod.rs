//! Fleet Registry
//!
//! Owns the agent table: membership, telemetry, liveness and the agent side
//! of task assignment. Constructed once by the control loop and mutated only
//! from it.

pub mod registry;

pub use registry::{FleetRegistry, LivenessTimeout, Registration, RegistryError, StatusCounts};
