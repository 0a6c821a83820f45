//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery. Every value here can be
//! overridden from `fleet_config.toml` unless noted otherwise.

// ============================================================================
// Node identity
// ============================================================================

/// Protocol identifier stamped on every frame; frames with any other
/// protocol are dropped before they reach a handler.
pub const PROTOCOL: &str = "turtle_fleet";

/// Service name agents look up to find the control node.
pub const SERVICE_NAME: &str = "mining_control";

/// Hostname advertised alongside the service.
pub const HOSTNAME: &str = "fleet-control";

/// Radio id the control node uses as frame sender.
pub const CONTROL_NODE_ID: u32 = 0;

/// Capability flags returned in `discover_response`.
pub const CAPABILITIES: &[&str] = &[
    "task_assignment",
    "resource_targets",
    "area_mining",
    "smart_mining",
    "emergency_stop",
];

// ============================================================================
// Transport
// ============================================================================

/// Port the control node listens on.
pub const CONTROL_PORT: u16 = 7450;

/// Port agents listen on for broadcasts.
pub const AGENT_PORT: u16 = 7451;

/// Largest datagram the UDP modem will read.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

// ============================================================================
// Fleet registry
// ============================================================================

/// Interval between liveness sweeps (seconds).
pub const LIVENESS_INTERVAL_SECS: u64 = 5;

/// Silence after which a reachable agent is marked offline (milliseconds).
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Fault records kept per agent (oldest evicted first).
pub const ERROR_HISTORY_CAPACITY: usize = 10;

/// Resource sightings kept for operator display.
pub const RESOURCE_SIGHTINGS_CAPACITY: usize = 100;

/// Fleet events kept in the in-memory log.
pub const EVENT_LOG_CAPACITY: usize = 500;

/// Minimum gap between snapshots for steps that emit no fleet event
/// (milliseconds). Event-bearing steps publish at once.
pub const SNAPSHOT_MIN_INTERVAL_MS: u64 = 250;

// ============================================================================
// Task scheduler
// ============================================================================

/// Timer-driven assignment pass interval (seconds).
pub const SCHEDULER_TICK_SECS: u64 = 10;

/// Hard ceiling on retries after recoverable failures.
pub const MAX_RETRIES: u32 = 3;

/// Maximum distance (blocks) between an idle agent and an area_mining
/// centroid for the agent to be considered.
pub const AREA_DISTANCE_THRESHOLD: f64 = 200.0;

/// Terminal tasks kept in the archive.
pub const ARCHIVE_CAPACITY: usize = 500;

/// Age after which archived tasks are purged (seconds). 86 400 = 1 day.
pub const ARCHIVE_MAX_AGE_SECS: u64 = 86_400;

/// Interval between archive cleanups (seconds).
pub const ARCHIVE_CLEANUP_INTERVAL_SECS: u64 = 300;

// ============================================================================
// Storage
// ============================================================================

/// Default data directory.
pub const DATA_DIR: &str = "./data";

/// Agent table database name inside the data directory.
pub const AGENT_DB_NAME: &str = "agents.db";
