//! Control Node Configuration
//!
//! Every timing, retry and transport value the node uses, loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `FLEET_CONFIG` environment variable (path to TOML file)
//! 2. `fleet_config.toml` in the current working directory
//! 3. Built-in defaults (`defaults.rs`)
//!
//! The loaded `ControlConfig` is handed to the control loop at startup;
//! subsystems receive only the section they need.

mod control_config;
pub mod defaults;
pub mod validation;

pub use control_config::*;
