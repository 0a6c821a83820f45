//! Radio frame codec
//!
//! One frame per datagram: `{ "protocol", "sender", "recipient"?, "message" }`.
//! `message` carries the envelope from `types::message`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AgentId;

/// What travels over the radio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub protocol: String,
    pub sender: AgentId,
    /// Unicast target, absent for broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<AgentId>,
    pub message: Value,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Whether this frame is meant for `node` (unicast to it, or broadcast).
    pub fn is_for(&self, node: AgentId) -> bool {
        self.recipient.map_or(true, |r| r == node)
    }
}
