//! Control node configuration - every tunable as a TOML value
//!
//! Each section implements `Default` with the values in `defaults.rs`, so a
//! missing file, section or key behaves exactly like the built-in setup.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use crate::transport::InterfaceKind;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "FLEET_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "fleet_config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a control node.
///
/// Load with `ControlConfig::load()` which searches:
/// 1. `$FLEET_CONFIG`
/// 2. `./fleet_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ControlConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl ControlConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded control config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded control config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate TOML text. Unknown keys are logged, not rejected.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Control config saved");
        Ok(())
    }

    /// Check cross-field consistency and ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = super::validation::validate_ranges(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// [node]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Radio id used as the sender of control frames
    #[serde(default = "default_node_id")]
    pub id: u32,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Protocol identifier; frames carrying anything else are ignored
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Service name agents use to discover the node
    #[serde(default = "default_service")]
    pub service: String,
}

fn default_node_id() -> u32 {
    defaults::CONTROL_NODE_ID
}
fn default_hostname() -> String {
    defaults::HOSTNAME.to_string()
}
fn default_protocol() -> String {
    defaults::PROTOCOL.to_string()
}
fn default_service() -> String {
    defaults::SERVICE_NAME.to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            hostname: default_hostname(),
            protocol: default_protocol(),
            service: default_service(),
        }
    }
}

// ============================================================================
// [transport]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Candidate radio interfaces; one is selected at startup by preference
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<InterfaceConfig>,
}

/// One candidate radio interface, realised as a UDP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    #[serde(default = "default_interface_name")]
    pub name: String,

    pub kind: InterfaceKind,

    /// Local address to bind
    pub bind: String,

    /// Destination for broadcasts and for agents whose address is not yet known
    pub broadcast: String,
}

impl InterfaceConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::Validation(vec![format!("transport.interfaces.{}: invalid bind address '{}'", self.name, self.bind)]))
    }

    pub fn broadcast_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.broadcast.parse().map_err(|_| {
            ConfigError::Validation(vec![format!(
                "transport.interfaces.{}: invalid broadcast address '{}'",
                self.name, self.broadcast
            )])
        })
    }
}

fn default_interface_name() -> String {
    "radio".to_string()
}

fn default_interfaces() -> Vec<InterfaceConfig> {
    vec![InterfaceConfig {
        name: "wireless0".to_string(),
        kind: InterfaceKind::Wireless,
        bind: format!("0.0.0.0:{}", defaults::CONTROL_PORT),
        broadcast: format!("255.255.255.255:{}", defaults::AGENT_PORT),
    }]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
        }
    }
}

// ============================================================================
// [fleet]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_error_history")]
    pub error_history_capacity: usize,
}

fn default_liveness_interval() -> u64 {
    defaults::LIVENESS_INTERVAL_SECS
}
fn default_heartbeat_timeout() -> u64 {
    defaults::HEARTBEAT_TIMEOUT_MS
}
fn default_error_history() -> usize {
    defaults::ERROR_HISTORY_CAPACITY
}

impl FleetConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.heartbeat_timeout_ms).unwrap_or(i64::MAX))
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: default_liveness_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            error_history_capacity: default_error_history(),
        }
    }
}

// ============================================================================
// [scheduler]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick")]
    pub tick_interval_secs: u64,

    /// Retries allowed after recoverable failures (at most 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Blocks between an agent and an area_mining centroid
    #[serde(default = "default_area_distance")]
    pub area_distance_threshold: f64,

    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,

    #[serde(default = "default_archive_max_age")]
    pub archive_max_age_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_tick() -> u64 {
    defaults::SCHEDULER_TICK_SECS
}
fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}
fn default_area_distance() -> f64 {
    defaults::AREA_DISTANCE_THRESHOLD
}
fn default_archive_capacity() -> usize {
    defaults::ARCHIVE_CAPACITY
}
fn default_archive_max_age() -> u64 {
    defaults::ARCHIVE_MAX_AGE_SECS
}
fn default_cleanup_interval() -> u64 {
    defaults::ARCHIVE_CLEANUP_INTERVAL_SECS
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn archive_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.archive_max_age_secs).unwrap_or(i64::MAX))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick(),
            max_retries: default_max_retries(),
            area_distance_threshold: default_area_distance(),
            archive_capacity: default_archive_capacity(),
            archive_max_age_secs: default_archive_max_age(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

// ============================================================================
// [storage]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_true() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}

impl StorageConfig {
    pub fn agent_db_path(&self) -> PathBuf {
        self.data_dir.join(defaults::AGENT_DB_NAME)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            data_dir: default_data_dir(),
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Tests
// ============================================================================
