//! Parameter validation against a command schema
//!
//! Presence and kind only. No coercion: `"5"` is a string, not a number.

use serde_json::Value;
use thiserror::Error;

use super::catalog::{ParamKind, ParamSpec};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamError {
    #[error("parameters must be a keyed table, got {found}")]
    NotATable { found: &'static str },

    #[error("missing parameter '{name}' (expected {expected})")]
    Missing { name: &'static str, expected: ParamKind },

    #[error("parameter '{name}' must be a {expected}, got {found}")]
    WrongKind {
        name: &'static str,
        expected: ParamKind,
        found: ParamKind,
    },
}

/// Check every schema entry in declared order; stop at the first mismatch.
///
/// `args` may be `null` for commands without parameters. Keys not in the
/// schema are passed through untouched.
pub fn validate_parameters(schema: &[ParamSpec], args: &Value) -> Result<(), ParamError> {
    let empty = serde_json::Map::new();
    let map = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        Value::Array(_) => return Err(ParamError::NotATable { found: "array" }),
        other => {
            return Err(ParamError::NotATable {
                found: ParamKind::of(other).map_or("null", ParamKind::as_str),
            })
        }
    };

    for param in schema {
        let Some(found) = map.get(param.name).and_then(ParamKind::of) else {
            return Err(ParamError::Missing {
                name: param.name,
                expected: param.kind,
            });
        };
        if found != param.kind {
            return Err(ParamError::WrongKind {
                name: param.name,
                expected: param.kind,
                found,
            });
        }
    }
    Ok(())
}
