//! Transport driver
//!
//! `Transport` owns the modem and runs as its own task: it drains the
//! outbox onto the radio and turns inbound frames into `Inbound` messages
//! for the control loop. `TransportHandle` is the cheap, clonable send side.
//!
//! A send is successful once the frame is queued for the modem. Nothing on
//! the channel confirms delivery.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frame::Frame;
use super::modem::Modem;
use super::TransportError;
use crate::config::{defaults, NodeConfig};
use crate::types::{AgentId, Envelope, Inbound, InboundMessage, OutboundMessage};

/// What the control node answers `discover` with.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAdvert {
    pub service: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
}

/// Owns the modem. Consumed by [`Transport::run`].
pub struct Transport {
    modem: Box<dyn Modem>,
    protocol: String,
    node_id: AgentId,
    outbox: mpsc::UnboundedReceiver<Frame>,
}

/// Send side of the transport.
#[derive(Clone)]
pub struct TransportHandle {
    protocol: String,
    node_id: AgentId,
    outbox: mpsc::UnboundedSender<Frame>,
    advert: Option<ServiceAdvert>,
}

impl Transport {
    pub fn new(modem: Box<dyn Modem>, node: &NodeConfig) -> (Transport, TransportHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Transport {
            modem,
            protocol: node.protocol.clone(),
            node_id: node.id,
            outbox: rx,
        };
        let handle = TransportHandle {
            protocol: node.protocol.clone(),
            node_id: node.id,
            outbox: tx,
            advert: None,
        };
        (transport, handle)
    }

    /// Move frames between the radio and the control loop until cancelled,
    /// until every handle is dropped, or until the modem closes.
    pub async fn run(
        mut self,
        inbound: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        info!(interface = self.modem.name(), kind = %self.modem.kind(), protocol = %self.protocol, "Transport running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Best effort: flush whatever was queued before shutdown
                    while let Ok(frame) = self.outbox.try_recv() {
                        if let Err(e) = self.modem.transmit(&frame).await {
                            warn!(error = %e, "Dropping queued frame at shutdown");
                        }
                    }
                    info!("Transport stopped");
                    return Ok(());
                }
                queued = self.outbox.recv() => {
                    let Some(frame) = queued else {
                        info!("All transport handles dropped, stopping");
                        return Ok(());
                    };
                    if let Err(e) = self.modem.transmit(&frame).await {
                        warn!(recipient = ?frame.recipient, error = %e, "Transmit failed");
                    }
                }
                received = self.modem.receive() => {
                    match received {
                        Ok(frame) => {
                            if let Some(msg) = self.accept(frame) {
                                if inbound.send(msg).await.is_err() {
                                    info!("Control loop gone, transport stopping");
                                    return Ok(());
                                }
                            }
                        }
                        Err(TransportError::Closed) => {
                            warn!(interface = self.modem.name(), "Radio interface closed");
                            return Err(TransportError::Closed);
                        }
                        Err(e) => warn!(error = %e, "Receive failed"),
                    }
                }
            }
        }
    }

    /// Filter and decode one frame. Anything not addressed to this node in
    /// its protocol is dropped without a trace above `trace` level.
    fn accept(&self, frame: Frame) -> Option<Inbound> {
        if frame.protocol != self.protocol {
            trace!(protocol = %frame.protocol, "Ignoring foreign protocol");
            return None;
        }
        if frame.sender == self.node_id || !frame.is_for(self.node_id) {
            return None;
        }

        let envelope = match Envelope::from_value(frame.message) {
            Ok(env) => env,
            Err(e) => {
                debug!(sender = frame.sender, error = %e, "Dropping malformed envelope");
                return None;
            }
        };
        if envelope.from_control {
            trace!(sender = frame.sender, "Ignoring control-origin message");
            return None;
        }

        match InboundMessage::from_envelope(&envelope) {
            Ok(message) => {
                debug!(sender = frame.sender, kind = %message.kind(), "Inbound message");
                Some(Inbound {
                    sender: frame.sender,
                    sent_at: envelope.timestamp,
                    message,
                })
            }
            Err(e) => {
                debug!(sender = frame.sender, kind = %envelope.kind, error = %e, "Dropping message");
                None
            }
        }
    }
}

impl TransportHandle {
    pub fn node_id(&self) -> AgentId {
        self.node_id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Queue a unicast message for `agent`.
    pub fn send(&self, agent: AgentId, message: OutboundMessage) -> Result<(), TransportError> {
        let kind = message.kind();
        let frame = self.stamp(message, Some(agent))?;
        self.outbox.send(frame).map_err(|_| TransportError::Closed)?;
        debug!(agent_id = agent, kind = %kind, "Queued message");
        Ok(())
    }

    /// Queue a message for every agent in range.
    pub fn broadcast(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let kind = message.kind();
        let frame = self.stamp(message, None)?;
        self.outbox.send(frame).map_err(|_| TransportError::Closed)?;
        debug!(kind = %kind, "Queued broadcast");
        Ok(())
    }

    /// Register the node under `service` and announce it once.
    pub fn advertise(&mut self, service: &str, hostname: &str) -> Result<(), TransportError> {
        let advert = ServiceAdvert {
            service: service.to_string(),
            hostname: hostname.to_string(),
            capabilities: defaults::CAPABILITIES.iter().map(|c| (*c).to_string()).collect(),
        };
        let announcement = self.discover_response(&advert);
        self.advert = Some(advert);
        self.broadcast(announcement)?;
        info!(service, hostname, "Control node advertised");
        Ok(())
    }

    pub fn advertisement(&self) -> Option<&ServiceAdvert> {
        self.advert.as_ref()
    }

    /// Answer a `discover` from `agent`. Unadvertised nodes stay silent.
    pub fn answer_discover(&self, agent: AgentId) -> Result<bool, TransportError> {
        let Some(advert) = self.advert.as_ref() else {
            return Ok(false);
        };
        self.send(agent, self.discover_response(advert))?;
        Ok(true)
    }

    fn discover_response(&self, advert: &ServiceAdvert) -> OutboundMessage {
        OutboundMessage::DiscoverResponse {
            node_id: self.node_id,
            hostname: advert.hostname.clone(),
            service: advert.service.clone(),
            capabilities: advert.capabilities.clone(),
        }
    }

    fn stamp(&self, message: OutboundMessage, recipient: Option<AgentId>) -> Result<Frame, TransportError> {
        let envelope = message.into_envelope(Utc::now().timestamp_millis())?;
        Ok(Frame {
            protocol: self.protocol.clone(),
            sender: self.node_id,
            recipient,
            message: envelope.into_value(),
        })
    }
}
