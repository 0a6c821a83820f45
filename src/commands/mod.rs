//! Command Dispatcher
//!
//! - `catalog`: named commands and their parameter schemas
//! - `validation`: schema checks, first mismatch wins
//! - `dispatcher`: validated sends, broadcasts, task payloads, emergency stop

pub mod catalog;
pub mod dispatcher;
pub mod validation;

pub use catalog::{CommandCatalog, CommandSpec, ParamKind, ParamSpec};
pub use dispatcher::{CommandDispatcher, CommandError};
pub use validation::{validate_parameters, ParamError};
