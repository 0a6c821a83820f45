//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Unknown keys are found by parsing into `toml::Value` first and walking the
//! key tree against the known field names. They only produce warnings, so a
//! typo never prevents startup. Range errors do.

use std::collections::HashSet;
use std::net::SocketAddr;

use super::ControlConfig;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ", did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path for `ControlConfig`.
///
/// Entries of `[[transport.interfaces]]` are flattened onto the array path,
/// so `transport.interfaces.kind` covers every interface.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [node]
        "node",
        "node.id",
        "node.hostname",
        "node.protocol",
        "node.service",
        // [transport]
        "transport",
        "transport.interfaces",
        "transport.interfaces.name",
        "transport.interfaces.kind",
        "transport.interfaces.bind",
        "transport.interfaces.broadcast",
        // [fleet]
        "fleet",
        "fleet.liveness_interval_secs",
        "fleet.heartbeat_timeout_ms",
        "fleet.error_history_capacity",
        // [scheduler]
        "scheduler",
        "scheduler.tick_interval_secs",
        "scheduler.max_retries",
        "scheduler.area_distance_threshold",
        "scheduler.archive_capacity",
        "scheduler.archive_max_age_secs",
        "scheduler.cleanup_interval_secs",
        // [storage]
        "storage",
        "storage.enabled",
        "storage.data_dir",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// A table `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`. Tables
/// inside arrays are walked under the array's own path.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            match v {
                toml::Value::Table(_) => keys.extend(walk_toml_keys(v, &path)),
                toml::Value::Array(items) => {
                    for item in items.iter().filter(|i| i.is_table()) {
                        for nested in walk_toml_keys(item, &path) {
                            if !keys.contains(&nested) {
                                keys.push(nested);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(), // serde reports the parse error
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Values that would make the node misbehave. Any entry prevents startup.
pub fn validate_ranges(config: &ControlConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.node.protocol.trim().is_empty() {
        errors.push("node.protocol must not be empty".to_string());
    }
    if config.node.service.trim().is_empty() {
        errors.push("node.service must not be empty".to_string());
    }

    if config.transport.interfaces.is_empty() {
        errors.push("transport.interfaces must list at least one interface".to_string());
    }
    for iface in &config.transport.interfaces {
        if iface.bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "transport.interfaces.{}: bind = '{}' is not a socket address",
                iface.name, iface.bind
            ));
        }
        if iface.broadcast.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "transport.interfaces.{}: broadcast = '{}' is not a socket address",
                iface.name, iface.broadcast
            ));
        }
    }

    let f = &config.fleet;
    if f.liveness_interval_secs == 0 {
        errors.push("fleet.liveness_interval_secs must be > 0".to_string());
    }
    if f.heartbeat_timeout_ms <= f.liveness_interval_secs.saturating_mul(1000) {
        errors.push(format!(
            "fleet.heartbeat_timeout_ms = {} must exceed the liveness interval ({} s)",
            f.heartbeat_timeout_ms, f.liveness_interval_secs
        ));
    }
    if f.error_history_capacity == 0 {
        errors.push("fleet.error_history_capacity must be > 0".to_string());
    }

    let s = &config.scheduler;
    if s.tick_interval_secs == 0 {
        errors.push("scheduler.tick_interval_secs must be > 0".to_string());
    }
    if s.max_retries > super::defaults::MAX_RETRIES {
        errors.push(format!(
            "scheduler.max_retries = {} exceeds the ceiling of {}",
            s.max_retries,
            super::defaults::MAX_RETRIES
        ));
    }
    if !s.area_distance_threshold.is_finite() || s.area_distance_threshold <= 0.0 {
        errors.push(format!(
            "scheduler.area_distance_threshold = {} must be a positive number",
            s.area_distance_threshold
        ));
    }
    if s.archive_capacity == 0 {
        errors.push("scheduler.archive_capacity must be > 0".to_string());
    }
    if s.cleanup_interval_secs == 0 {
        errors.push("scheduler.cleanup_interval_secs must be > 0".to_string());
    }

    errors
}

// ============================================================================
// Tests
// ============================================================================
