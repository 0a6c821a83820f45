//! Radio transport
//!
//! - `frame`: datagram codec
//! - `modem`: interface kinds, UDP and loopback modems
//! - `bus`: typed handler registry with per-handler fault isolation
//! - `driver`: the task that owns the modem, plus the clonable send handle
//!
//! `open_configured` picks exactly one interface, preferring ender, then
//! wireless, then wired.

pub mod bus;
pub mod driver;
pub mod frame;
pub mod modem;

pub use bus::{DispatchReport, MessageBus};
pub use driver::{ServiceAdvert, Transport, TransportHandle};
pub use frame::Frame;
pub use modem::{InterfaceKind, LoopbackModem, LoopbackPeer, Modem, UdpModem};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{InterfaceConfig, TransportConfig};
use crate::types::ProtocolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no usable radio interface found")]
    NoInterfaceFound,

    #[error("transport is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(ProtocolError::Json(e))
    }
}

/// Order candidates by preference. Ties keep their listed order.
pub fn rank_interfaces(candidates: &[InterfaceConfig]) -> Vec<&InterfaceConfig> {
    let mut ranked: Vec<&InterfaceConfig> = candidates.iter().collect();
    ranked.sort_by_key(|c| c.kind.preference_rank());
    ranked
}

/// Open the best configured interface that can actually be bound.
pub fn open_configured(config: &TransportConfig) -> Result<Box<dyn Modem>, TransportError> {
    for candidate in rank_interfaces(&config.interfaces) {
        let addrs = candidate
            .bind_addr()
            .and_then(|bind| Ok((bind, candidate.broadcast_addr()?)));
        let (bind, broadcast) = match addrs {
            Ok(pair) => pair,
            Err(e) => {
                warn!(interface = %candidate.name, error = %e, "Skipping interface");
                continue;
            }
        };
        match UdpModem::bind(candidate.name.clone(), candidate.kind, bind, broadcast) {
            Ok(modem) => {
                info!(interface = %candidate.name, kind = %candidate.kind, "Radio interface opened");
                return Ok(Box::new(modem));
            }
            Err(e) => {
                warn!(interface = %candidate.name, kind = %candidate.kind, error = %e, "Interface unavailable");
            }
        }
    }
    Err(TransportError::NoInterfaceFound)
}

/// Pick the most preferred of already-open modems.
pub fn select_modem(candidates: Vec<Box<dyn Modem>>) -> Result<Box<dyn Modem>, TransportError> {
    candidates
        .into_iter()
        .min_by_key(|m| m.kind().preference_rank())
        .ok_or(TransportError::NoInterfaceFound)
}
