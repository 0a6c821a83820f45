//! End-to-end: the control loop and transport running as tasks, agents
//! speaking over a loopback radio, operators submitting through the handle,
//! and the agent table landing in sled.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleet_control::commands::{CommandCatalog, CommandDispatcher};
use fleet_control::config::{defaults, ControlConfig};
use fleet_control::node::{
    read_operator_lines, ControlLoop, FleetSnapshot, LoopStats, OperatorCommand, OperatorHandle, OperatorOutcome,
    PriorityInput,
};
use fleet_control::storage::{AgentStore, SledAgentStore};
use fleet_control::transport::{InterfaceKind, LoopbackModem, LoopbackPeer, Transport};
use fleet_control::types::{AgentId, AgentStatus, Envelope, FleetEvent, StampedEvent, TaskSpec};

const WAIT: Duration = Duration::from_secs(5);

struct RunningNode {
    peer: LoopbackPeer,
    operator: OperatorHandle,
    operator_tx: mpsc::Sender<fleet_control::node::OperatorRequest>,
    snapshots: watch::Receiver<FleetSnapshot>,
    events: tokio::sync::broadcast::Receiver<StampedEvent>,
    control: JoinHandle<LoopStats>,
    cancel: CancellationToken,
}

fn start(store: Option<SledAgentStore>) -> RunningNode {
    let config = ControlConfig::default();
    let (modem, peer) = LoopbackModem::pair(InterfaceKind::Ender, defaults::PROTOCOL);
    let (transport, mut handle) = Transport::new(Box::new(modem), &config.node);
    handle.advertise(&config.node.service, &config.node.hostname).unwrap();

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (operator_tx, operator_rx) = mpsc::channel(16);
    let dispatcher = CommandDispatcher::new(CommandCatalog::standard(), handle);
    let mut control = ControlLoop::new(&config, dispatcher, inbound_rx, operator_rx);
    if let Some(store) = store {
        control = control.with_store(Box::new(store)).unwrap();
    }
    let snapshots = control.snapshots();
    let events = control.subscribe();

    let cancel = CancellationToken::new();
    tokio::spawn(transport.run(inbound_tx, cancel.clone()));
    let control = tokio::spawn(control.run(cancel.clone()));

    RunningNode {
        peer,
        operator: OperatorHandle::new(operator_tx.clone()),
        operator_tx,
        snapshots,
        events,
        control,
        cancel,
    }
}

fn message(kind: &str, fields: Value) -> Value {
    let mut message = json!({"type": kind, "timestamp": 0, "from_control": false});
    if let (Some(target), Value::Object(extra)) = (message.as_object_mut(), fields) {
        target.extend(extra);
    }
    message
}

impl RunningNode {
    fn send(&self, agent: AgentId, kind: &str, fields: Value) {
        self.peer.send_from(agent, message(kind, fields)).unwrap();
    }

    /// Skip frames until one of `kind` arrives.
    async fn expect_frame(&mut self, kind: &str) -> (Option<AgentId>, Envelope) {
        loop {
            let frame = tokio::time::timeout(WAIT, self.peer.recv())
                .await
                .unwrap_or_else(|_| panic!("no '{kind}' frame"))
                .unwrap();
            let envelope = Envelope::from_value(frame.message).unwrap();
            if envelope.kind == kind {
                return (frame.recipient, envelope);
            }
        }
    }

    async fn wait_until<F>(&mut self, what: &str, condition: F) -> FleetSnapshot
    where
        F: FnMut(&FleetSnapshot) -> bool,
    {
        let snapshot = tokio::time::timeout(WAIT, self.snapshots.wait_for(condition))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .unwrap();
        snapshot.clone()
    }

    fn drain_events(&mut self) -> Vec<FleetEvent> {
        let mut events = Vec::new();
        while let Ok(stamped) = self.events.try_recv() {
            events.push(stamped.event);
        }
        events
    }

    async fn stop(self) -> LoopStats {
        self.cancel.cancel();
        tokio::time::timeout(WAIT, self.control).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn resource_job_runs_from_queue_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join(defaults::AGENT_DB_NAME);
    let mut node = start(Some(SledAgentStore::open(&db_path).unwrap()));

    let (recipient, _) = node.expect_frame("discover_response").await;
    assert_eq!(recipient, None);

    node.send(1, "discover", json!({}));
    let (recipient, answer) = node.expect_frame("discover_response").await;
    assert_eq!(recipient, Some(1));
    assert!(answer.from_control);

    node.send(1, "turtle_online", json!({"label": "digger"}));
    node.send(1, "heartbeat", json!({"status": "idle", "fuel_level": 4000}));
    node.wait_until("agent idle", |s| s.counts.idle == 1).await;

    let queued = node
        .operator
        .submit(OperatorCommand::QueueTask {
            task: TaskSpec::ResourceTarget {
                resource: "diamond".to_string(),
                quantity: 64,
            },
            priority: Some(PriorityInput::Level("high".to_string())),
        })
        .await;
    let task_id = match tokio_test::assert_ok!(queued) {
        OperatorOutcome::TaskQueued { task_id } => task_id,
        other => panic!("unexpected outcome {other:?}"),
    };

    let (recipient, assign) = node.expect_frame("task_assign").await;
    assert_eq!(recipient, Some(1));
    assert_eq!(assign.fields["task_id"], task_id);
    assert_eq!(assign.fields["priority"], 75);

    node.send(1, "task_progress", json!({"task_id": task_id, "gathered": 32, "blocks_mined": 200}));
    let snapshot = node
        .wait_until("half the diamonds", |s| {
            s.resources.get("diamond").is_some_and(|t| t.total_gathered == 32)
        })
        .await;
    assert_eq!(snapshot.in_flight.len(), 1);
    assert_eq!(snapshot.agent(1).map(|a| a.status), Some(AgentStatus::Busy));

    node.send(1, "task_complete", json!({"task_id": task_id, "gathered": 64, "blocks_mined": 410}));
    let snapshot = node.wait_until("completion", |s| s.archived_completed == 1).await;
    assert!(snapshot.in_flight.is_empty());
    assert_eq!(snapshot.agent(1).map(|a| a.tasks_completed), Some(1));

    let events = node.drain_events();
    assert!(events.contains(&FleetEvent::TaskAssigned { task_id, agent_id: 1 }));
    assert!(events.contains(&FleetEvent::TaskCompleted { task_id, agent_id: 1 }));

    let saved = node.operator.submit(OperatorCommand::Save).await;
    assert_eq!(tokio_test::assert_ok!(saved), OperatorOutcome::Saved { agents: 1 });

    let stats = node.stop().await;
    assert!(stats.messages >= 5);
    assert_eq!(stats.handler_failures, 0);

    // The loop has dropped its store; reopen and check what survived
    let store = SledAgentStore::open(&db_path).unwrap();
    let records = store.load().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].label.as_deref(), Some("digger"));
    assert_eq!(records[0].tasks_completed, 1);
    assert_eq!(records[0].total_blocks_mined, 410);
}

#[tokio::test]
async fn restart_restores_agents_offline() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join(defaults::AGENT_DB_NAME);

    let mut node = start(Some(SledAgentStore::open(&db_path).unwrap()));
    node.send(4, "turtle_online", json!({"label": "four"}));
    node.send(5, "heartbeat", json!({"status": "idle"}));
    node.wait_until("two agents", |s| s.agents.len() == 2).await;
    node.stop().await;

    let mut node = start(Some(SledAgentStore::open(&db_path).unwrap()));
    let snapshot = node.wait_until("restored table", |s| s.agents.len() == 2).await;
    assert_eq!(snapshot.counts.offline, 2);
    assert_eq!(snapshot.agent(4).and_then(|a| a.label.clone()).as_deref(), Some("four"));

    // Contact brings a restored agent back
    node.send(4, "heartbeat", json!({"status": "idle"}));
    node.wait_until("agent 4 idle", |s| s.counts.idle == 1).await;
    node.stop().await;
}

#[tokio::test]
async fn operator_lines_feed_the_running_loop() {
    let mut node = start(None);
    node.send(2, "heartbeat", json!({"status": "idle", "position": [0, 12, 0]}));
    node.wait_until("agent idle", |s| s.counts.idle == 1).await;

    let script = concat!(
        "# morning shift\n",
        "{\"action\":\"queue_task\",\"task\":{\"type\":\"smart_mining\",\"center\":{\"x\":0,\"y\":12,\"z\":0},\"radius\":6},\"priority\":\"urgent\"}\n",
        "not an action\n",
        "{\"action\":\"queue_task\",\"task\":{\"type\":\"resource_target\",\"resource\":\"coal\",\"quantity\":64}}\n",
    );
    tokio_test::assert_ok!(
        read_operator_lines(script.as_bytes(), node.operator_tx.clone(), CancellationToken::new()).await
    );

    let (recipient, assign) = node.expect_frame("task_assign").await;
    assert_eq!(recipient, Some(2));
    assert_eq!(assign.fields["task"]["type"], "smart_mining");

    let snapshot = node.wait_until("coal queued", |s| s.backlog.len() == 1).await;
    assert_eq!(snapshot.backlog[0].kind().as_str(), "resource_target");

    node.operator
        .submit(OperatorCommand::EmergencyStop { reason: None })
        .await
        .unwrap();
    let (recipient, stop) = node.expect_frame("emergency_stop").await;
    assert_eq!(recipient, None);
    assert_eq!(stop.fields["reason"], "operator");
    let snapshot = node.wait_until("paused", |s| s.scheduling_paused).await;
    assert_eq!(snapshot.archived_failed, 1);
    assert_eq!(snapshot.backlog.len(), 1);

    let stats = node.stop().await;
    assert_eq!(stats.operator_actions, 3);
}

#[tokio::test]
async fn foreign_and_control_frames_are_ignored() {
    let mut node = start(None);
    node.expect_frame("discover_response").await;

    // Another protocol on the same radio
    node.peer
        .send_frame(fleet_control::transport::Frame {
            protocol: "someone_else".to_string(),
            sender: 8,
            recipient: None,
            message: message("turtle_online", json!({})),
        })
        .unwrap();
    // A control-origin echo
    node.peer
        .send_from(9, json!({"type": "heartbeat", "from_control": true, "status": "idle"}))
        .unwrap();
    // Garbage
    node.peer.send_from(10, json!(["not", "an", "envelope"])).unwrap();
    // The real thing
    node.send(11, "turtle_online", json!({}));

    let snapshot = node.wait_until("agent 11", |s| s.agent(11).is_some()).await;
    assert_eq!(snapshot.agents.len(), 1);
    let stats = node.stop().await;
    assert_eq!(stats.messages, 1);
}
