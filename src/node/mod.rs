//! The control node: shared context, inbound handlers, operator actions,
//! snapshots and the loop that ties them together.

pub mod context;
pub mod control_loop;
pub mod handlers;
pub mod operator;
pub mod snapshot;

pub use context::{ControlContext, Sighting};
pub use control_loop::{ControlLoop, LoopStats};
pub use handlers::{install, standard_bus, ControlBus, HandlerError};
pub use operator::{
    read_operator_lines, OperatorCommand, OperatorError, OperatorHandle, OperatorOutcome, OperatorRequest,
    PriorityInput,
};
pub use snapshot::FleetSnapshot;
