//! Command catalog
//!
//! Each command names its parameters and the kind each must have. Schemas
//! are ordered; validation reports the first mismatch in declared order.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Value kinds a command parameter may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Number,
    String,
    Boolean,
    /// JSON object or array
    Table,
}

impl ParamKind {
    /// Kind of a JSON value; `None` for null.
    pub fn of(value: &Value) -> Option<ParamKind> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ParamKind::Boolean),
            Value::Number(_) => Some(ParamKind::Number),
            Value::String(_) => Some(ParamKind::String),
            Value::Array(_) | Value::Object(_) => Some(ParamKind::Table),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamKind::Number => "number",
            ParamKind::String => "string",
            ParamKind::Boolean => "boolean",
            ParamKind::Table => "table",
        }
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl CommandSpec {
    pub fn new(name: &'static str, description: &'static str, params: &[(&'static str, ParamKind)]) -> Self {
        Self {
            name,
            description,
            params: params.iter().map(|&(name, kind)| ParamSpec { name, kind }).collect(),
        }
    }
}

/// Named commands the control node may send.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    commands: BTreeMap<&'static str, CommandSpec>,
}

impl CommandCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Commands every turtle understands.
    pub fn standard() -> Self {
        use ParamKind::{Boolean, Number, String, Table};

        let mut catalog = Self::empty();
        for spec in [
            CommandSpec::new("goto", "Travel to a coordinate", &[("x", Number), ("y", Number), ("z", Number)]),
            CommandSpec::new("return_home", "Travel to the home position", &[]),
            CommandSpec::new("set_home", "Set the home position", &[("x", Number), ("y", Number), ("z", Number)]),
            CommandSpec::new("refuel", "Refuel from inventory", &[]),
            CommandSpec::new("deposit", "Empty inventory into the home chest", &[]),
            CommandSpec::new("dig", "Dig one block", &[("direction", String)]),
            CommandSpec::new("turn", "Turn in place", &[("direction", String)]),
            CommandSpec::new("set_label", "Set the computer label", &[("label", String)]),
            CommandSpec::new("toggle_auto_refuel", "Enable or disable automatic refuelling", &[("enabled", Boolean)]),
            CommandSpec::new("configure", "Replace agent settings", &[("settings", Table)]),
            CommandSpec::new("stop", "Abandon the current action", &[]),
            CommandSpec::new("shutdown", "Power off", &[]),
            CommandSpec::new("reboot", "Restart the agent program", &[]),
        ] {
            catalog.insert(spec);
        }
        catalog
    }

    /// Add or replace a command.
    pub fn insert(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
