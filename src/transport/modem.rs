//! Radio interfaces
//!
//! A `Modem` moves whole frames. `UdpModem` is the real radio: a broadcast
//! UDP socket with an address book learned from inbound traffic.
//! `LoopbackModem` is an in-memory pair used by tests and embedding code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::frame::Frame;
use super::TransportError;
use crate::config::defaults;
use crate::types::AgentId;

/// Interface classes, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// Unlimited range, cross-dimension
    Ender,
    Wireless,
    Wired,
}

impl InterfaceKind {
    /// Lower is better.
    pub fn preference_rank(self) -> u8 {
        match self {
            InterfaceKind::Ender => 0,
            InterfaceKind::Wireless => 1,
            InterfaceKind::Wired => 2,
        }
    }
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterfaceKind::Ender => "ender",
            InterfaceKind::Wireless => "wireless",
            InterfaceKind::Wired => "wired",
        };
        f.write_str(s)
    }
}

/// A radio interface that sends and receives whole frames.
///
/// `receive` must be cancel-safe: the transport driver polls it inside
/// `select!` alongside its outbox.
#[async_trait]
pub trait Modem: Send + 'static {
    fn kind(&self) -> InterfaceKind;

    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Send a frame. Unicast if `frame.recipient` is set, otherwise broadcast.
    async fn transmit(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Wait for the next decodable frame.
    async fn receive(&mut self) -> Result<Frame, TransportError>;
}

// ============================================================================
// UDP
// ============================================================================

/// Broadcast-capable UDP socket standing in for a radio interface.
pub struct UdpModem {
    name: String,
    kind: InterfaceKind,
    socket: UdpSocket,
    broadcast: SocketAddr,
    /// Last source address seen for each agent
    peers: HashMap<AgentId, SocketAddr>,
    buf: Vec<u8>,
}

impl UdpModem {
    /// Bind `bind` with broadcast enabled. Must be called inside a tokio runtime.
    pub fn bind(
        name: impl Into<String>,
        kind: InterfaceKind,
        bind: SocketAddr,
        broadcast: SocketAddr,
    ) -> Result<Self, TransportError> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(bind),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&bind.into())?;
        let socket = UdpSocket::from_std(socket.into())?;

        let name = name.into();
        info!(interface = %name, kind = %kind, bind = %bind, broadcast = %broadcast, "UDP modem bound");
        Ok(Self {
            name,
            kind,
            socket,
            broadcast,
            peers: HashMap::new(),
            buf: vec![0; defaults::MAX_FRAME_BYTES],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of agents with a known return address.
    pub fn known_peers(&self) -> usize {
        self.peers.len()
    }
}

#[async_trait]
impl Modem for UdpModem {
    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        let target = frame
            .recipient
            .and_then(|id| self.peers.get(&id).copied())
            .unwrap_or(self.broadcast);
        self.socket.send_to(&bytes, target).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame, TransportError> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.buf).await?;
            match Frame::decode(&self.buf[..len]) {
                Ok(frame) => {
                    self.peers.insert(frame.sender, from);
                    return Ok(frame);
                }
                Err(e) => {
                    debug!(from = %from, len, error = %e, "Dropping undecodable datagram");
                }
            }
        }
    }
}

// ============================================================================
// Loopback
// ============================================================================

/// In-memory modem; the other end is a [`LoopbackPeer`].
pub struct LoopbackModem {
    name: String,
    kind: InterfaceKind,
    to_peer: mpsc::UnboundedSender<Frame>,
    from_peer: mpsc::UnboundedReceiver<Frame>,
}

/// The far side of a [`LoopbackModem`], playing the part of the agents.
pub struct LoopbackPeer {
    protocol: String,
    to_modem: mpsc::UnboundedSender<Frame>,
    from_modem: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackModem {
    pub fn pair(kind: InterfaceKind, protocol: impl Into<String>) -> (LoopbackModem, LoopbackPeer) {
        let (to_peer, from_modem) = mpsc::unbounded_channel();
        let (to_modem, from_peer) = mpsc::unbounded_channel();
        (
            LoopbackModem {
                name: format!("loopback-{kind}"),
                kind,
                to_peer,
                from_peer,
            },
            LoopbackPeer {
                protocol: protocol.into(),
                to_modem,
                from_modem,
            },
        )
    }
}

#[async_trait]
impl Modem for LoopbackModem {
    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.to_peer.send(frame.clone()).map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Frame, TransportError> {
        self.from_peer.recv().await.ok_or(TransportError::Closed)
    }
}

impl LoopbackPeer {
    /// Deliver a raw frame to the modem.
    pub fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.to_modem.send(frame).map_err(|_| TransportError::Closed)
    }

    /// Deliver `message` as if broadcast by `agent`.
    pub fn send_from(&self, agent: AgentId, message: Value) -> Result<(), TransportError> {
        self.send_frame(Frame {
            protocol: self.protocol.clone(),
            sender: agent,
            recipient: None,
            message,
        })
    }

    /// Next frame the modem transmitted.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_modem.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_modem.try_recv().ok()
    }

    /// Everything transmitted so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_modem.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
