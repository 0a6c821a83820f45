//! Shared harness: a control loop wired to an in-memory radio.
//!
//! Tests drive the loop's handlers directly with explicit timestamps and read
//! what the node transmitted from the loopback peer.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_control::commands::{CommandCatalog, CommandDispatcher};
use fleet_control::config::{defaults, ControlConfig};
use fleet_control::node::{ControlLoop, OperatorCommand, OperatorError, OperatorOutcome, OperatorRequest, PriorityInput};
use fleet_control::transport::{Frame, InterfaceKind, LoopbackModem, LoopbackPeer, Transport};
use fleet_control::types::{AgentId, Envelope, Inbound, InboundMessage, TaskId, TaskSpec};

pub struct TestNode {
    pub control: ControlLoop,
    pub peer: LoopbackPeer,
    pub t0: DateTime<Utc>,
    cancel: CancellationToken,
}

impl TestNode {
    /// Must be called from inside a tokio runtime.
    pub fn start() -> Self {
        Self::with_config(&ControlConfig::default())
    }

    pub fn with_config(config: &ControlConfig) -> Self {
        let (modem, peer) = LoopbackModem::pair(InterfaceKind::Wireless, defaults::PROTOCOL);
        let (transport, mut handle) = Transport::new(Box::new(modem), &config.node);
        handle
            .advertise(&config.node.service, &config.node.hostname)
            .unwrap();

        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        tokio::spawn(transport.run(inbound_tx, cancel.clone()));

        let (_operator_tx, operator_rx) = mpsc::channel(16);
        let dispatcher = CommandDispatcher::new(CommandCatalog::standard(), handle);
        Self {
            control: ControlLoop::new(config, dispatcher, inbound_rx, operator_rx),
            peer,
            t0: Utc::now(),
            cancel,
        }
    }

    pub fn at(&self, secs: i64) -> DateTime<Utc> {
        self.t0 + Duration::seconds(secs)
    }

    /// Hand a JSON envelope from `sender` to the loop at `t0 + secs`.
    pub fn deliver(&mut self, sender: AgentId, message: Value, secs: i64) {
        let envelope = Envelope::from_value(message).unwrap();
        let inbound = Inbound {
            sender,
            sent_at: envelope.timestamp,
            message: InboundMessage::from_envelope(&envelope).unwrap(),
        };
        let now = self.at(secs);
        self.control.handle_inbound(&inbound, now);
    }

    pub fn operator(&mut self, command: OperatorCommand, secs: i64) -> Result<OperatorOutcome, OperatorError> {
        let (request, mut reply) = OperatorRequest::with_reply(command);
        let now = self.at(secs);
        self.control.handle_operator(request, now);
        reply.try_recv().unwrap()
    }

    pub fn queue(&mut self, task: TaskSpec, priority: i32, secs: i64) -> TaskId {
        let command = OperatorCommand::QueueTask {
            task,
            priority: Some(PriorityInput::Value(priority)),
        };
        match self.operator(command, secs).unwrap() {
            OperatorOutcome::TaskQueued { task_id } => task_id,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    /// Frames transmitted since the last call, in order.
    pub async fn sent(&mut self) -> Vec<SentMessage> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(StdDuration::from_millis(50), self.peer.recv()).await {
            out.push(SentMessage::from_frame(frame));
        }
        out
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A transmitted frame with its envelope unpacked.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipient: Option<AgentId>,
    pub kind: String,
    pub from_control: bool,
    pub fields: serde_json::Map<String, Value>,
}

impl SentMessage {
    fn from_frame(frame: Frame) -> Self {
        let envelope = Envelope::from_value(frame.message).unwrap();
        Self {
            recipient: frame.recipient,
            kind: envelope.kind,
            from_control: envelope.from_control,
            fields: envelope.fields,
        }
    }

    pub fn u64(&self, field: &str) -> Option<u64> {
        self.fields.get(field).and_then(Value::as_u64)
    }
}

pub fn resource(name: &str, quantity: u64) -> TaskSpec {
    TaskSpec::ResourceTarget {
        resource: name.to_string(),
        quantity,
    }
}
