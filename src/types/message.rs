//! Wire message model
//!
//! Every payload on the radio is an envelope:
//! `{ "type": ..., "timestamp": <ms>, "from_control": <bool>, ...fields }`.
//!
//! Inbound envelopes are parsed leniently: a field with the wrong shape is
//! dropped (and logged at debug) instead of failing the whole message, so a
//! half-broken heartbeat still refreshes whatever it got right.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::agent::{AgentId, AgentStatus, Facing, InventorySummary, JoinInfo, Position, Telemetry};
use super::task::{Area, Priority, TaskId, TaskSpec};

// ============================================================================
// Message kinds
// ============================================================================

/// Declared message types, inbound and outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    TurtleOnline,
    TurtleOffline,
    Heartbeat,
    StatusUpdate,
    TaskProgress,
    TaskComplete,
    TaskFailed,
    AreaSaturated,
    ResourceFound,
    Discover,
    DiscoverResponse,
    Command,
    TaskAssign,
    EmergencyStop,
    StatusRequest,
}

impl MessageKind {
    pub const INBOUND: [MessageKind; 10] = [
        MessageKind::TurtleOnline,
        MessageKind::TurtleOffline,
        MessageKind::Heartbeat,
        MessageKind::StatusUpdate,
        MessageKind::TaskProgress,
        MessageKind::TaskComplete,
        MessageKind::TaskFailed,
        MessageKind::AreaSaturated,
        MessageKind::ResourceFound,
        MessageKind::Discover,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::TurtleOnline => "turtle_online",
            MessageKind::TurtleOffline => "turtle_offline",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::TaskProgress => "task_progress",
            MessageKind::TaskComplete => "task_complete",
            MessageKind::TaskFailed => "task_failed",
            MessageKind::AreaSaturated => "area_saturated",
            MessageKind::ResourceFound => "resource_found",
            MessageKind::Discover => "discover",
            MessageKind::DiscoverResponse => "discover_response",
            MessageKind::Command => "command",
            MessageKind::TaskAssign => "task_assign",
            MessageKind::EmergencyStop => "emergency_stop",
            MessageKind::StatusRequest => "status_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "turtle_online" => MessageKind::TurtleOnline,
            "turtle_offline" => MessageKind::TurtleOffline,
            "heartbeat" => MessageKind::Heartbeat,
            "status_update" => MessageKind::StatusUpdate,
            "task_progress" => MessageKind::TaskProgress,
            "task_complete" => MessageKind::TaskComplete,
            "task_failed" => MessageKind::TaskFailed,
            "area_saturated" => MessageKind::AreaSaturated,
            "resource_found" => MessageKind::ResourceFound,
            "discover" => MessageKind::Discover,
            "discover_response" => MessageKind::DiscoverResponse,
            "command" => MessageKind::Command,
            "task_assign" => MessageKind::TaskAssign,
            "emergency_stop" => MessageKind::EmergencyStop,
            "status_request" => MessageKind::StatusRequest,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("message type '{0}' is not accepted by the control node")]
    NotInbound(MessageKind),

    #[error("{kind} message is missing required field '{field}'")]
    MissingField { kind: MessageKind, field: &'static str },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Envelope
// ============================================================================

/// A decoded but not yet interpreted message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    /// Sender clock, milliseconds
    pub timestamp: i64,
    pub from_control: bool,
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match fields.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(ProtocolError::MissingType),
        };
        let timestamp = fields
            .remove("timestamp")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(0);
        let from_control = fields
            .remove("from_control")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Self {
            kind,
            timestamp,
            from_control,
            fields,
        })
    }

    pub fn into_value(self) -> Value {
        let mut fields = self.fields;
        fields.insert("type".to_string(), Value::String(self.kind));
        fields.insert("timestamp".to_string(), Value::from(self.timestamp));
        fields.insert("from_control".to_string(), Value::Bool(self.from_control));
        Value::Object(fields)
    }
}

// ============================================================================
// Lenient field access
// ============================================================================

/// Field reader that drops values of the wrong shape instead of failing.
struct Fields<'a> {
    kind: MessageKind,
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn new(kind: MessageKind, map: &'a Map<String, Value>) -> Self {
        Self { kind, map }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn rejected(&self, key: &str, value: &Value) {
        debug!(kind = %self.kind, field = key, value = %value, "Ignoring malformed field");
    }

    fn u64(&self, key: &str) -> Option<u64> {
        let value = self.get(key)?;
        let parsed = value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0 && f.is_finite()).map(|f| f as u64))
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()));
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn i64(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        let parsed = value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()));
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn f64(&self, key: &str) -> Option<f64> {
        let value = self.get(key)?;
        let parsed = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|f: &f64| f.is_finite());
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn string(&self, key: &str) -> Option<String> {
        let value = self.get(key)?;
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => {
                self.rejected(key, value);
                None
            }
        }
    }

    fn bool(&self, key: &str) -> Option<bool> {
        let value = self.get(key)?;
        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            _ => None,
        };
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn position(&self, key: &str) -> Option<Position> {
        let value = self.get(key)?;
        let parsed = parse_position(value);
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn facing(&self, key: &str) -> Option<Facing> {
        let value = self.get(key)?;
        let parsed = match value {
            Value::String(s) => Facing::parse(s),
            Value::Number(n) => n.as_i64().and_then(Facing::from_index),
            _ => None,
        };
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn status(&self, key: &str) -> Option<AgentStatus> {
        let value = self.get(key)?;
        let parsed = value.as_str().and_then(AgentStatus::parse);
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn inventory(&self, key: &str) -> Option<InventorySummary> {
        let value = self.get(key)?;
        match serde_json::from_value::<InventorySummary>(value.clone()) {
            Ok(inv) => Some(inv),
            Err(_) => {
                self.rejected(key, value);
                None
            }
        }
    }

    fn area(&self, key: &str) -> Option<Area> {
        let value = self.get(key)?;
        let parsed = value.as_object().and_then(|obj| {
            let a = obj.get("min").or_else(|| obj.get("from")).and_then(parse_position)?;
            let b = obj.get("max").or_else(|| obj.get("to")).and_then(parse_position)?;
            Some(Area::from_corners(a, b))
        });
        if parsed.is_none() {
            self.rejected(key, value);
        }
        parsed
    }

    fn telemetry(&self) -> Telemetry {
        Telemetry {
            status: self.status("status"),
            position: self.position("position"),
            facing: self.facing("facing"),
            fuel_level: self.u64("fuel_level"),
            fuel_limit: self.u64("fuel_limit"),
            inventory: self.inventory("inventory"),
        }
    }
}

/// Positions arrive as `{x, y, z}` objects or `[x, y, z]` arrays.
fn parse_position(value: &Value) -> Option<Position> {
    let coord = |v: &Value| v.as_i64().or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64));
    match value {
        Value::Object(obj) => Some(Position::new(
            coord(obj.get("x")?)?,
            coord(obj.get("y")?)?,
            coord(obj.get("z")?)?,
        )),
        Value::Array(items) if items.len() == 3 => Some(Position::new(
            coord(&items[0])?,
            coord(&items[1])?,
            coord(&items[2])?,
        )),
        _ => None,
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub telemetry: Telemetry,
    /// Fault text, if the agent is reporting one
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressReport {
    pub task_id: Option<TaskId>,
    /// Resource quantity gathered in the current attempt (absolute)
    pub gathered: Option<u64>,
    /// Blocks mined in the current attempt (absolute)
    pub blocks_mined: Option<u64>,
    pub saturation: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionReport {
    pub task_id: Option<TaskId>,
    pub gathered: Option<u64>,
    pub blocks_mined: Option<u64>,
    pub summary: Option<String>,
}

impl CompletionReport {
    /// Final figures double as a last progress report.
    pub fn as_progress(&self) -> ProgressReport {
        ProgressReport {
            task_id: self.task_id,
            gathered: self.gathered,
            blocks_mined: self.blocks_mined,
            saturation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub task_id: Option<TaskId>,
    pub reason: String,
    /// The agent judged the task safe to retry
    pub recoverable: bool,
    pub blocks_mined: Option<u64>,
}

impl FailureReport {
    pub fn as_progress(&self) -> ProgressReport {
        ProgressReport {
            task_id: self.task_id,
            gathered: None,
            blocks_mined: self.blocks_mined,
            saturation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaturationReport {
    pub area: Area,
    pub saturation: Option<f64>,
    pub priority: Option<Priority>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSighting {
    pub resource: String,
    pub position: Option<Position>,
    pub quantity: Option<u64>,
}

/// An inbound message with its payload interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    TurtleOnline(JoinInfo),
    TurtleOffline { reason: Option<String> },
    Heartbeat(Telemetry),
    StatusUpdate(StatusReport),
    TaskProgress(ProgressReport),
    TaskComplete(CompletionReport),
    TaskFailed(FailureReport),
    AreaSaturated(SaturationReport),
    ResourceFound(ResourceSighting),
    Discover,
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::TurtleOnline(_) => MessageKind::TurtleOnline,
            InboundMessage::TurtleOffline { .. } => MessageKind::TurtleOffline,
            InboundMessage::Heartbeat(_) => MessageKind::Heartbeat,
            InboundMessage::StatusUpdate(_) => MessageKind::StatusUpdate,
            InboundMessage::TaskProgress(_) => MessageKind::TaskProgress,
            InboundMessage::TaskComplete(_) => MessageKind::TaskComplete,
            InboundMessage::TaskFailed(_) => MessageKind::TaskFailed,
            InboundMessage::AreaSaturated(_) => MessageKind::AreaSaturated,
            InboundMessage::ResourceFound(_) => MessageKind::ResourceFound,
            InboundMessage::Discover => MessageKind::Discover,
        }
    }

    /// Interpret an envelope's fields according to its declared type.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = MessageKind::parse(&envelope.kind)
            .ok_or_else(|| ProtocolError::UnknownType(envelope.kind.clone()))?;
        let f = Fields::new(kind, &envelope.fields);

        let message = match kind {
            MessageKind::TurtleOnline => InboundMessage::TurtleOnline(JoinInfo {
                label: f.string("label").or_else(|| f.string("name")),
                telemetry: f.telemetry(),
            }),
            MessageKind::TurtleOffline => InboundMessage::TurtleOffline {
                reason: f.string("reason"),
            },
            MessageKind::Heartbeat => InboundMessage::Heartbeat(f.telemetry()),
            MessageKind::StatusUpdate => InboundMessage::StatusUpdate(StatusReport {
                telemetry: f.telemetry(),
                error: f.string("error"),
            }),
            MessageKind::TaskProgress => InboundMessage::TaskProgress(ProgressReport {
                task_id: f.u64("task_id"),
                gathered: f.u64("gathered"),
                blocks_mined: f.u64("blocks_mined"),
                saturation: f.f64("saturation"),
            }),
            MessageKind::TaskComplete => InboundMessage::TaskComplete(CompletionReport {
                task_id: f.u64("task_id"),
                gathered: f.u64("gathered"),
                blocks_mined: f.u64("blocks_mined"),
                summary: f.string("summary"),
            }),
            MessageKind::TaskFailed => InboundMessage::TaskFailed(FailureReport {
                task_id: f.u64("task_id"),
                reason: f
                    .string("reason")
                    .or_else(|| f.string("error"))
                    .unwrap_or_else(|| "unspecified".to_string()),
                recoverable: f.bool("recoverable").unwrap_or(false),
                blocks_mined: f.u64("blocks_mined"),
            }),
            MessageKind::AreaSaturated => {
                let area = f
                    .area("area")
                    .or_else(|| {
                        let center = f.position("center").or_else(|| f.position("position"))?;
                        let radius = f.u64("radius").map_or(8, |r| u32::try_from(r).unwrap_or(u32::MAX));
                        Some(Area::around(center, radius))
                    })
                    .ok_or(ProtocolError::MissingField { kind, field: "area" })?;
                InboundMessage::AreaSaturated(SaturationReport {
                    area,
                    saturation: f.f64("saturation"),
                    priority: f
                        .i64("priority")
                        .and_then(|p| i32::try_from(p).ok())
                        .map(Priority)
                        .or_else(|| f.string("priority").and_then(|s| Priority::parse(&s))),
                    target: f.string("target"),
                })
            }
            MessageKind::ResourceFound => InboundMessage::ResourceFound(ResourceSighting {
                resource: f
                    .string("resource")
                    .ok_or(ProtocolError::MissingField { kind, field: "resource" })?,
                position: f.position("position"),
                quantity: f.u64("quantity"),
            }),
            MessageKind::Discover => InboundMessage::Discover,
            other => return Err(ProtocolError::NotInbound(other)),
        };
        Ok(message)
    }
}

/// An interpreted message together with who sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub sender: AgentId,
    /// Sender clock, milliseconds
    pub sent_at: i64,
    pub message: InboundMessage,
}

// ============================================================================
// Outbound
// ============================================================================

/// Messages the control node produces.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A named command from the catalog
    Command { command: String, data: Value },
    TaskAssign {
        task_id: TaskId,
        priority: Priority,
        retry_count: u32,
        task: TaskSpec,
    },
    EmergencyStop { reason: String },
    StatusRequest,
    DiscoverResponse {
        node_id: AgentId,
        hostname: String,
        service: String,
        capabilities: Vec<String>,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundMessage::Command { .. } => MessageKind::Command,
            OutboundMessage::TaskAssign { .. } => MessageKind::TaskAssign,
            OutboundMessage::EmergencyStop { .. } => MessageKind::EmergencyStop,
            OutboundMessage::StatusRequest => MessageKind::StatusRequest,
            OutboundMessage::DiscoverResponse { .. } => MessageKind::DiscoverResponse,
        }
    }

    /// Stamp with the send time and the control-origin marker.
    pub fn into_envelope(self, timestamp_ms: i64) -> Result<Envelope, ProtocolError> {
        let value = serde_json::to_value(&self)?;
        let mut envelope = Envelope::from_value(value)?;
        envelope.timestamp = timestamp_ms;
        envelope.from_control = true;
        Ok(envelope)
    }
}
