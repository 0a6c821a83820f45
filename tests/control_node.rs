//! Control node scenarios
//!
//! Each test drives a `ControlLoop` through its handlers with explicit
//! timestamps and checks both the fleet state and the frames that went out
//! on the (loopback) radio.

mod common;

use serde_json::{json, Value};

use common::{resource, SentMessage, TestNode};
use fleet_control::commands::CommandError;
use fleet_control::node::{OperatorCommand, OperatorError, OperatorOutcome};
use fleet_control::tasks::EMERGENCY_STOP_REASON;
use fleet_control::types::{AgentId, AgentStatus, FleetEvent, TaskId, TaskOrigin, TaskSpec, TaskStatus};

fn idle() -> Value {
    json!({"type": "heartbeat", "status": "idle"})
}

fn assignments(sent: &[SentMessage]) -> Vec<&SentMessage> {
    sent.iter().filter(|m| m.kind == "task_assign").collect()
}

fn held_task(node: &TestNode, agent: AgentId) -> Option<TaskId> {
    node.control.context().scheduler.in_flight_for(agent).map(|t| t.id)
}

fn logged(node: &TestNode) -> Vec<FleetEvent> {
    node.control.event_log().map(|e| e.event.clone()).collect()
}

/// A busy agent holds exactly one task, that task names it, and nobody else
/// is busy.
fn assert_busy_invariant(node: &TestNode) {
    let ctx = node.control.context();
    for agent in ctx.registry.iter() {
        assert_eq!(
            agent.status == AgentStatus::Busy,
            agent.current_task.is_some(),
            "agent {} is {} holding {:?}",
            agent.id,
            agent.status.as_str(),
            agent.current_task
        );
        if let Some(task_id) = agent.current_task {
            let task = ctx.scheduler.task(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Assigned);
            assert_eq!(task.assigned_to, Some(agent.id));
        }
    }
    for task in ctx.scheduler.in_flight() {
        let holder = task.assigned_to.unwrap();
        assert_eq!(ctx.registry.get(holder).unwrap().current_task, Some(task.id));
    }
}

// ============================================================================
// Assignment order
// ============================================================================

#[tokio::test]
async fn idle_agents_take_tasks_in_priority_order() {
    let mut node = TestNode::start();
    node.sent().await;

    let ids: Vec<TaskId> = [5, 8, 5, 10]
        .iter()
        .map(|p| node.queue(resource("iron_ore", 16), *p, 0))
        .collect();
    assert_eq!(node.control.context().scheduler.backlog().len(), 4);

    for agent in 1..=4 {
        node.deliver(agent, idle(), 1);
    }

    let held: Vec<Option<TaskId>> = (1..=4).map(|a| held_task(&node, a)).collect();
    assert_eq!(held, vec![Some(ids[3]), Some(ids[1]), Some(ids[0]), Some(ids[2])]);

    let sent = node.sent().await;
    let assigned = assignments(&sent);
    let recipients: Vec<Option<AgentId>> = assigned.iter().map(|m| m.recipient).collect();
    let priorities: Vec<Option<i64>> = assigned.iter().map(|m| m.fields["priority"].as_i64()).collect();
    assert_eq!(recipients, vec![Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(priorities, vec![Some(10), Some(8), Some(5), Some(5)]);
    assert!(assigned.iter().all(|m| m.from_control));
    assert_busy_invariant(&node);
}

#[tokio::test]
async fn queueing_with_idle_agent_assigns_immediately() {
    let mut node = TestNode::start();
    node.deliver(1, idle(), 0);
    node.sent().await;

    let task = node.queue(resource("coal", 32), 50, 1);

    assert_eq!(held_task(&node, 1), Some(task));
    let sent = node.sent().await;
    let assigned = assignments(&sent);
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].u64("task_id"), Some(task));
    assert_eq!(assigned[0].fields["task"]["type"], "resource_target");
    assert_eq!(assigned[0].fields["task"]["resource"], "coal");
}

#[tokio::test]
async fn distant_area_job_waits_for_a_closer_agent() {
    let mut node = TestNode::start();
    node.deliver(1, json!({"type": "heartbeat", "status": "idle", "position": [1000, 64, 1000]}), 0);

    let area = json!({
        "type": "area_mining",
        "area": {"min": {"x": 0, "y": 10, "z": 0}, "max": {"x": 15, "y": 20, "z": 15}}
    });
    let spec: TaskSpec = serde_json::from_value(area).unwrap();
    let far = node.queue(spec, 90, 1);
    let near = node.queue(resource("gold_ore", 4), 10, 1);

    // The high priority area job is skipped, the resource job is not
    assert_eq!(held_task(&node, 1), Some(near));
    assert_eq!(
        node.control.context().scheduler.task(far).unwrap().status,
        TaskStatus::Pending
    );

    node.deliver(2, json!({"type": "heartbeat", "status": "idle", "position": [8, 15, 8]}), 2);
    assert_eq!(held_task(&node, 2), Some(far));
}

// ============================================================================
// Failures and retries
// ============================================================================

#[tokio::test]
async fn recoverable_failures_stop_after_three_retries() {
    let mut node = TestNode::start();
    let task = node.queue(resource("coal", 8), 50, 0);
    node.deliver(1, idle(), 1);
    node.sent().await;

    for attempt in 1..=4 {
        let failed = json!({
            "type": "task_failed",
            "task_id": task,
            "reason": "inventory full",
            "recoverable": true,
        });
        node.deliver(1, failed, 1 + attempt);
    }

    let ctx = node.control.context();
    let finished = ctx.scheduler.task(task).unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 3);
    assert_eq!(finished.last_error.as_deref(), Some("inventory full"));

    let agent = ctx.registry.get(1).unwrap();
    assert_eq!(agent.tasks_failed, 4);
    assert_eq!(agent.current_task, None);
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(agent
        .error_history
        .back()
        .is_some_and(|f| f.message == "task failed: inventory full"));

    // Three reassignments, each carrying its retry count
    let sent = node.sent().await;
    let retries: Vec<Option<u64>> = assignments(&sent).iter().map(|m| m.u64("retry_count")).collect();
    assert_eq!(retries, vec![Some(1), Some(2), Some(3)]);

    let events = logged(&node);
    let retrying = events
        .iter()
        .filter(|e| matches!(e, FleetEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retrying, 3);
    assert!(events.contains(&FleetEvent::TaskFailed {
        task_id: task,
        reason: "inventory full".to_string()
    }));
    assert_eq!(node.control.stats().handler_failures, 0);
}

#[tokio::test]
async fn unrecoverable_failure_is_final() {
    let mut node = TestNode::start();
    let task = node.queue(resource("redstone", 12), 50, 0);
    node.deliver(1, idle(), 1);
    node.deliver(
        1,
        json!({"type": "task_failed", "task_id": task, "reason": "fell into lava", "recoverable": false}),
        2,
    );

    let finished = node.control.context().scheduler.task(task).unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 0);
    assert_eq!(node.control.context().scheduler.archive().counts(), (0, 1));
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn silent_agent_times_out_and_its_task_returns() {
    let mut node = TestNode::start();
    node.deliver(1, idle(), 0);
    let task = node.queue(resource("iron_ore", 20), 50, 0);
    assert_eq!(held_task(&node, 1), Some(task));

    // Exactly at the timeout nothing happens
    assert_eq!(node.control.sweep_liveness(node.at(30)), 0);
    assert_eq!(node.control.context().registry.get(1).unwrap().status, AgentStatus::Busy);

    assert_eq!(node.control.sweep_liveness(node.at(31)), 1);
    let ctx = node.control.context();
    let agent = ctx.registry.get(1).unwrap();
    assert_eq!(agent.status, AgentStatus::Offline);
    assert_eq!(agent.current_task, None);

    let released = ctx.scheduler.task(task).unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.retry_count, 0);
    assert_eq!(released.assigned_to, None);

    let events = logged(&node);
    assert!(events
        .iter()
        .any(|e| matches!(e, FleetEvent::AgentTimedOut { agent_id: 1, .. })));
    assert!(events.contains(&FleetEvent::TaskReleased { task_id: task, agent_id: 1 }));

    // Another agent picks it up
    node.deliver(2, idle(), 32);
    assert_eq!(held_task(&node, 2), Some(task));
    assert_busy_invariant(&node);
}

#[tokio::test]
async fn any_message_counts_as_contact() {
    let mut node = TestNode::start();
    node.deliver(1, json!({"type": "turtle_online", "label": "alpha"}), 0);
    node.deliver(1, json!({"type": "resource_found", "resource": "diamond", "quantity": 2}), 25);

    assert_eq!(node.control.sweep_liveness(node.at(50)), 0);
    assert_eq!(node.control.sweep_liveness(node.at(56)), 1);
}

#[tokio::test]
async fn offline_agent_comes_back_with_heartbeat() {
    let mut node = TestNode::start();
    node.deliver(3, idle(), 0);
    node.control.sweep_liveness(node.at(40));
    assert_eq!(node.control.context().registry.get(3).unwrap().status, AgentStatus::Offline);

    node.deliver(3, idle(), 41);
    assert_eq!(node.control.context().registry.get(3).unwrap().status, AgentStatus::Idle);
    assert!(logged(&node).contains(&FleetEvent::AgentRejoined { agent_id: 3 }));
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn partial_heartbeat_keeps_other_fields() {
    let mut node = TestNode::start();
    node.deliver(
        4,
        json!({
            "type": "heartbeat",
            "status": "idle",
            "position": {"x": 10, "y": 64, "z": -3},
            "facing": "north",
            "fuel_level": 900,
            "fuel_limit": 20000
        }),
        0,
    );
    node.deliver(4, json!({"type": "heartbeat", "fuel_level": 850}), 5);

    let agent = node.control.context().registry.get(4).unwrap();
    assert_eq!(agent.fuel_level, Some(850));
    assert_eq!(agent.fuel_limit, Some(20_000));
    assert_eq!(agent.position.map(|p| (p.x, p.y, p.z)), Some((10, 64, -3)));
    assert!(agent.facing.is_some());
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.last_contact, node.at(5));
}

#[tokio::test]
async fn re_registration_is_idempotent() {
    let mut node = TestNode::start();
    node.deliver(5, json!({"type": "turtle_online", "label": "miner-5"}), 0);
    node.deliver(5, idle(), 1);
    let task = node.queue(resource("coal", 4), 50, 1);
    node.deliver(5, json!({"type": "task_complete", "task_id": task, "gathered": 4, "blocks_mined": 40}), 2);

    node.deliver(5, json!({"type": "turtle_online"}), 10);

    let ctx = node.control.context();
    assert_eq!(ctx.registry.len(), 1);
    let agent = ctx.registry.get(5).unwrap();
    assert_eq!(agent.registered_at, node.at(0));
    assert_eq!(agent.last_contact, node.at(10));
    assert_eq!(agent.label.as_deref(), Some("miner-5"));
    assert_eq!(agent.status, AgentStatus::Online);
    assert_eq!(agent.tasks_completed, 1);
    assert_eq!(agent.total_blocks_mined, 40);

    let joins: Vec<FleetEvent> = logged(&node)
        .into_iter()
        .filter(|e| matches!(e, FleetEvent::AgentJoined { .. } | FleetEvent::AgentRejoined { .. }))
        .collect();
    assert_eq!(
        joins,
        vec![FleetEvent::AgentJoined { agent_id: 5 }, FleetEvent::AgentRejoined { agent_id: 5 }]
    );
}

#[tokio::test]
async fn turtle_offline_releases_task_without_retry() {
    let mut node = TestNode::start();
    node.deliver(1, idle(), 0);
    let task = node.queue(resource("iron_ore", 64), 50, 0);

    node.deliver(1, json!({"type": "turtle_offline", "reason": "chunk unloaded"}), 3);

    let ctx = node.control.context();
    assert_eq!(ctx.registry.get(1).unwrap().status, AgentStatus::Offline);
    let released = ctx.scheduler.task(task).unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.retry_count, 0);
    assert!(logged(&node).contains(&FleetEvent::AgentLeft {
        agent_id: 1,
        reason: "chunk unloaded".to_string()
    }));
}

// ============================================================================
// Progress and aggregates
// ============================================================================

#[tokio::test]
async fn diamond_progress_accumulates_across_reports() {
    let mut node = TestNode::start();
    let task = node.queue(resource("diamond", 64), 75, 0);
    node.deliver(1, idle(), 1);
    assert_eq!(held_task(&node, 1), Some(task));

    node.deliver(1, json!({"type": "task_progress", "task_id": task, "gathered": 10, "blocks_mined": 120}), 2);
    node.deliver(1, json!({"type": "task_progress", "task_id": task, "gathered": 32, "blocks_mined": 300}), 3);

    let ctx = node.control.context();
    let totals = ctx.scheduler.aggregates().get("diamond").unwrap();
    assert_eq!(totals.total_requested, 64);
    assert_eq!(totals.total_gathered, 32);
    assert!((totals.percent() - 50.0).abs() < f64::EPSILON);
    assert!((ctx.scheduler.task(task).unwrap().percent_complete() - 50.0).abs() < f64::EPSILON);
    assert_eq!(ctx.registry.get(1).unwrap().total_blocks_mined, 300);

    node.deliver(1, json!({"type": "task_complete", "task_id": task, "gathered": 64, "blocks_mined": 610}), 4);

    let ctx = node.control.context();
    let done = ctx.scheduler.task(task).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.finished_at, Some(node.at(4)));
    assert_eq!(ctx.scheduler.aggregates().get("diamond").unwrap().total_gathered, 64);
    let agent = ctx.registry.get(1).unwrap();
    assert_eq!(agent.total_blocks_mined, 610);
    assert_eq!(agent.tasks_completed, 1);
    assert_eq!(agent.status, AgentStatus::Idle);
}

#[tokio::test]
async fn completion_frees_agent_for_next_task() {
    let mut node = TestNode::start();
    node.deliver(1, idle(), 0);
    let first = node.queue(resource("coal", 8), 60, 0);
    let second = node.queue(resource("coal", 8), 40, 0);
    assert_eq!(held_task(&node, 1), Some(first));

    node.deliver(1, json!({"type": "task_complete", "task_id": first, "gathered": 8}), 5);
    assert_eq!(held_task(&node, 1), Some(second));
    assert_busy_invariant(&node);
}

#[tokio::test]
async fn stale_reports_are_tolerated() {
    let mut node = TestNode::start();
    node.deliver(1, idle(), 0);
    let task = node.queue(resource("coal", 8), 50, 0);

    node.deliver(1, json!({"type": "task_complete", "task_id": 999, "gathered": 8}), 1);
    node.deliver(2, json!({"type": "task_progress", "task_id": task, "gathered": 3}), 1);
    node.deliver(7, json!({"type": "task_failed", "reason": "no task"}), 1);

    assert_eq!(held_task(&node, 1), Some(task));
    assert_eq!(node.control.context().scheduler.aggregates().get("coal").unwrap().total_gathered, 0);
    assert_eq!(node.control.stats().handler_failures, 0);
}

#[tokio::test]
async fn saturated_area_queues_smart_mining() {
    let mut node = TestNode::start();
    node.deliver(
        6,
        json!({"type": "area_saturated", "center": {"x": 100, "y": 30, "z": -50}, "radius": 5, "priority": "high"}),
        0,
    );

    let ctx = node.control.context();
    let task = ctx.scheduler.backlog().iter().next().unwrap();
    assert_eq!(task.priority, fleet_control::Priority::HIGH);
    assert_eq!(task.origin, TaskOrigin::Agent { agent_id: 6 });
    match &task.spec {
        TaskSpec::SmartMining { center, radius, .. } => {
            assert_eq!((center.x, center.y, center.z), (100, 30, -50));
            assert!(*radius >= 5);
        }
        other => panic!("unexpected spec {other:?}"),
    }
}

#[tokio::test]
async fn out_of_world_coordinates_are_survivable() {
    let mut node = TestNode::start();
    node.deliver(
        1,
        json!({"type": "heartbeat", "status": "idle", "position": {"x": -1e30, "y": 64, "z": 1e30}}),
        0,
    );
    assert_eq!(
        node.control.context().registry.get(1).unwrap().position.map(|p| p.x),
        Some(i64::MIN)
    );

    let area = json!({
        "type": "area_mining",
        "area": {"min": {"x": 1000, "y": 10, "z": 1000}, "max": {"x": 1010, "y": 20, "z": 1010}}
    });
    let spec: TaskSpec = serde_json::from_value(area).unwrap();
    let near_origin = node.queue(spec, 50, 1);
    node.control.scheduler_tick(node.at(2));
    assert_eq!(
        node.control.context().scheduler.task(near_origin).unwrap().status,
        TaskStatus::Pending
    );

    node.deliver(
        2,
        json!({"type": "area_saturated", "center": {"x": 9.2e18, "y": -9.2e18, "z": 0}, "radius": 4_000_000_000_u64}),
        3,
    );
    // Smart mining has no distance check, so the far agent takes it
    let smart = held_task(&node, 1).unwrap();
    assert!(matches!(
        node.control.context().scheduler.task(smart).unwrap().spec,
        TaskSpec::SmartMining { .. }
    ));

    let huge = json!({
        "type": "area_mining",
        "area": {"min": {"x": -2_000_000, "y": -2_000_000, "z": -2_000_000}, "max": {"x": 2_000_000, "y": 2_000_000, "z": 2_000_000}}
    });
    let rejected = node.operator(
        OperatorCommand::QueueTask {
            task: serde_json::from_value(huge).unwrap(),
            priority: None,
        },
        4,
    );
    assert!(matches!(rejected, Err(OperatorError::Scheduler(_))));
    assert_eq!(node.control.context().scheduler.backlog().ids(), vec![near_origin]);
    assert_busy_invariant(&node);
    assert_eq!(node.control.stats().handler_failures, 0);
}

// ============================================================================
// Emergency stop
// ============================================================================

#[tokio::test]
async fn emergency_stop_fails_in_flight_and_pauses() {
    let mut node = TestNode::start();
    for agent in 1..=3 {
        node.deliver(agent, idle(), 0);
    }
    let running: Vec<TaskId> = (0..3).map(|_| node.queue(resource("iron_ore", 16), 50, 1)).collect();
    let waiting = node.queue(resource("coal", 16), 50, 1);
    assert_eq!(node.control.context().scheduler.in_flight_count(), 3);
    node.sent().await;

    let outcome = node
        .operator(
            OperatorCommand::EmergencyStop {
                reason: Some("creeper".to_string()),
            },
            2,
        )
        .unwrap();
    assert_eq!(outcome, OperatorOutcome::Stopped { failed_tasks: 3 });

    let sent = node.sent().await;
    let stop = sent.iter().find(|m| m.kind == "emergency_stop").unwrap();
    assert_eq!(stop.recipient, None);
    assert_eq!(stop.fields["reason"], "creeper");

    let ctx = node.control.context();
    assert!(ctx.scheduler.is_paused());
    for id in &running {
        let task = ctx.scheduler.task(*id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some(EMERGENCY_STOP_REASON));
    }
    for agent in 1..=3 {
        let record = ctx.registry.get(agent).unwrap();
        assert_eq!(record.status, AgentStatus::Online);
        assert_eq!(record.current_task, None);
    }
    assert_eq!(ctx.scheduler.task(waiting).unwrap().status, TaskStatus::Pending);

    // Paused: an idle report does not pick anything up
    node.deliver(1, idle(), 3);
    assert_eq!(held_task(&node, 1), None);

    let resumed = node.operator(OperatorCommand::Resume, 4).unwrap();
    assert_eq!(resumed, OperatorOutcome::Resumed { assigned: 1 });
    assert_eq!(held_task(&node, 1), Some(waiting));
    assert_busy_invariant(&node);
}

// ============================================================================
// Operator actions
// ============================================================================

#[tokio::test]
async fn cancel_withdraws_pending_task() {
    let mut node = TestNode::start();
    let task = node.queue(resource("gold_ore", 30), 50, 0);

    let outcome = node.operator(OperatorCommand::CancelTask { task_id: task }, 1).unwrap();
    assert_eq!(outcome, OperatorOutcome::TaskCancelled { task_id: task });

    let ctx = node.control.context();
    assert!(ctx.scheduler.backlog().is_empty());
    assert_eq!(ctx.scheduler.aggregates().get("gold_ore").unwrap().total_requested, 0);
    assert!(matches!(
        node.operator(OperatorCommand::CancelTask { task_id: task }, 2),
        Err(OperatorError::Scheduler(_))
    ));
}

#[tokio::test]
async fn invalid_commands_never_reach_the_radio() {
    let mut node = TestNode::start();
    node.deliver(1, idle(), 0);
    node.sent().await;

    let unknown = node.operator(
        OperatorCommand::Command {
            agent_id: 1,
            command: "self_destruct".to_string(),
            params: Value::Null,
        },
        1,
    );
    assert!(matches!(unknown, Err(OperatorError::Command(CommandError::UnknownCommand(_)))));

    let bad_params = node.operator(
        OperatorCommand::Command {
            agent_id: 1,
            command: "goto".to_string(),
            params: json!({"x": "far", "y": 64, "z": 0}),
        },
        1,
    );
    assert!(matches!(
        bad_params,
        Err(OperatorError::Command(CommandError::InvalidParameters { .. }))
    ));
    assert!(node.sent().await.is_empty());

    let sent = node
        .operator(
            OperatorCommand::Command {
                agent_id: 1,
                command: "goto".to_string(),
                params: json!({"x": 10, "y": 64, "z": 0}),
            },
            2,
        )
        .unwrap();
    assert_eq!(sent, OperatorOutcome::CommandSent { agent_id: 1 });
    let frames = node.sent().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, "command");
    assert_eq!(frames[0].recipient, Some(1));
    assert_eq!(frames[0].fields["command"], "goto");
}

#[tokio::test]
async fn broadcast_reaches_every_reachable_agent() {
    let mut node = TestNode::start();
    for agent in [1, 2, 3] {
        node.deliver(agent, idle(), 0);
    }
    node.control.sweep_liveness(node.at(5));
    node.deliver(3, json!({"type": "turtle_offline"}), 6);
    node.sent().await;

    let outcome = node
        .operator(
            OperatorCommand::Broadcast {
                command: "return_home".to_string(),
                params: Value::Null,
            },
            7,
        )
        .unwrap();
    assert_eq!(outcome, OperatorOutcome::Broadcast { sent: 2 });
    let recipients: Vec<Option<AgentId>> = node.sent().await.iter().map(|m| m.recipient).collect();
    assert_eq!(recipients, vec![Some(1), Some(2)]);
}

#[tokio::test]
async fn discover_is_answered_once_advertised() {
    let mut node = TestNode::start();
    let announced = node.sent().await;
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].kind, "discover_response");
    assert_eq!(announced[0].recipient, None);

    node.deliver(9, json!({"type": "discover"}), 0);

    let sent = node.sent().await;
    assert_eq!(sent.len(), 1);
    let answer = &sent[0];
    assert_eq!(answer.kind, "discover_response");
    assert_eq!(answer.recipient, Some(9));
    assert_eq!(answer.fields["service"], "mining_control");
    assert_eq!(answer.fields["hostname"], "fleet-control");
    assert!(answer.fields["capabilities"].as_array().is_some_and(|c| !c.is_empty()));
}

#[tokio::test]
async fn busy_invariant_holds_through_mixed_traffic() {
    let mut node = TestNode::start();
    for agent in 1..=3 {
        node.deliver(agent, idle(), 0);
    }
    let tasks: Vec<TaskId> = (0..5).map(|i| node.queue(resource("coal", 8), 50 + i, 0)).collect();
    assert_busy_invariant(&node);

    let first = held_task(&node, 1).unwrap();
    node.deliver(1, json!({"type": "task_complete", "task_id": first, "gathered": 8}), 1);
    assert_busy_invariant(&node);

    let second = held_task(&node, 2).unwrap();
    node.deliver(2, json!({"type": "task_failed", "task_id": second, "reason": "stuck"}), 2);
    assert_busy_invariant(&node);

    node.deliver(3, json!({"type": "turtle_offline"}), 3);
    assert_busy_invariant(&node);

    node.deliver(2, json!({"type": "status_update", "status": "idle"}), 4);
    node.control.sweep_liveness(node.at(40));
    assert_busy_invariant(&node);

    let ctx = node.control.context();
    let accounted = ctx.scheduler.backlog().len() + ctx.scheduler.in_flight_count() + ctx.scheduler.archive().len();
    assert_eq!(accounted, tasks.len());
}
