//! The control loop
//!
//! A single task owns all fleet state and wakes for one thing at a time:
//!
//! ```text
//! inbound message ──► bus handlers ─┐
//! operator action ──► execute ──────┤
//! liveness timer  ──► sweep ────────┼──► settle: drain events, log,
//! scheduler timer ──► assign pass ──┤           publish, persist, snapshot
//! cleanup timer   ──► purge archive ┘
//! ```
//!
//! Nothing is awaited while state is being changed, so handlers never
//! interleave.
//!
//! Snapshots go out right after any step that emitted a fleet event or ran
//! an operator action. Quieter steps (heartbeats, progress) mark the
//! snapshot stale; it is republished at most every
//! `SNAPSHOT_MIN_INTERVAL_MS`.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ControlContext;
use super::handlers::{standard_bus, ControlBus};
use super::operator::{self, OperatorCommand, OperatorError, OperatorOutcome, OperatorRequest};
use super::snapshot::FleetSnapshot;
use crate::commands::CommandDispatcher;
use crate::config::{defaults, ControlConfig};
use crate::storage::{AgentStore, StorageError};
use crate::types::{Inbound, InboundMessage, StampedEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub messages: u64,
    pub handler_failures: u64,
    pub operator_actions: u64,
    pub timeouts: u64,
    pub events: u64,
}

pub struct ControlLoop {
    ctx: ControlContext,
    bus: ControlBus,
    store: Option<Box<dyn AgentStore>>,
    inbound: mpsc::Receiver<Inbound>,
    operator: mpsc::Receiver<OperatorRequest>,
    events_tx: broadcast::Sender<StampedEvent>,
    snapshot_tx: watch::Sender<FleetSnapshot>,
    event_log: VecDeque<StampedEvent>,
    liveness_interval: Duration,
    tick_interval: Duration,
    cleanup_interval: Duration,
    last_snapshot: Option<DateTime<Utc>>,
    snapshot_stale: bool,
    stats: LoopStats,
}

impl ControlLoop {
    pub fn new(
        config: &ControlConfig,
        dispatcher: CommandDispatcher,
        inbound: mpsc::Receiver<Inbound>,
        operator: mpsc::Receiver<OperatorRequest>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(FleetSnapshot::default());
        Self {
            ctx: ControlContext::new(config, dispatcher),
            bus: standard_bus(),
            store: None,
            inbound,
            operator,
            events_tx,
            snapshot_tx,
            event_log: VecDeque::new(),
            liveness_interval: config.fleet.liveness_interval(),
            tick_interval: config.scheduler.tick_interval(),
            cleanup_interval: config.scheduler.cleanup_interval(),
            last_snapshot: None,
            snapshot_stale: true,
            stats: LoopStats::default(),
        }
    }

    /// Attach a store and seed the registry from it. Restored agents are offline.
    pub fn with_store(mut self, store: Box<dyn AgentStore>) -> Result<Self, StorageError> {
        let records = store.load()?;
        info!(backend = store.backend_name(), agents = records.len(), "Loaded agent table");
        self.ctx.registry.restore(records, Utc::now());
        self.store = Some(store);
        Ok(self)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StampedEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshots(&self) -> watch::Receiver<FleetSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ControlContext {
        &mut self.ctx
    }

    /// Most recent events, oldest first.
    pub fn event_log(&self) -> impl Iterator<Item = &StampedEvent> {
        self.event_log.iter()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    pub fn handle_inbound(&mut self, inbound: &Inbound, now: DateTime<Utc>) {
        self.ctx.set_now(now);
        self.stats.messages += 1;

        // Join and leave manage contact themselves
        if !matches!(
            inbound.message,
            InboundMessage::TurtleOnline(_) | InboundMessage::TurtleOffline { .. }
        ) {
            self.ctx.registry.touch_known(inbound.sender, now);
        }

        let report = self.bus.dispatch(&mut self.ctx, inbound);
        self.stats.handler_failures += report.failed as u64;
        self.settle(now);
    }

    pub fn handle_operator(&mut self, request: OperatorRequest, now: DateTime<Utc>) {
        self.ctx.set_now(now);
        self.stats.operator_actions += 1;
        let action = request.command.name();

        let result = match request.command {
            OperatorCommand::Save => self
                .persist_durable()
                .map_err(OperatorError::from)
                .and_then(|saved| saved.ok_or(OperatorError::NoStore))
                .map(|agents| OperatorOutcome::Saved { agents }),
            command => operator::execute(&mut self.ctx, command),
        };
        match &result {
            Ok(outcome) => info!(action, outcome = ?outcome, "Operator action done"),
            Err(e) => warn!(action, error = %e, "Operator action rejected"),
        }
        self.settle(now);
        self.publish_snapshot(now);

        if let Some(reply) = request.reply {
            // Requester may have given up waiting
            let _ = reply.send(result);
        }
    }

    /// Mark silent agents offline and put their tasks back in the backlog.
    pub fn sweep_liveness(&mut self, now: DateTime<Utc>) -> usize {
        self.ctx.set_now(now);
        let timeouts = self.ctx.registry.check_liveness(now);
        for timeout in &timeouts {
            if let Some(task_id) = timeout.orphaned_task {
                self.ctx.scheduler.release_orphan(task_id, timeout.agent_id);
            }
        }
        if timeouts.iter().any(|t| t.orphaned_task.is_some()) {
            self.ctx.assign_pending();
        }
        self.stats.timeouts += timeouts.len() as u64;
        self.settle(now);
        timeouts.len()
    }

    /// Periodic assignment pass.
    pub fn scheduler_tick(&mut self, now: DateTime<Utc>) -> usize {
        self.ctx.set_now(now);
        let assigned = self.ctx.assign_pending();
        self.settle(now);
        assigned
    }

    pub fn cleanup_archive(&mut self, now: DateTime<Utc>) -> usize {
        self.ctx.set_now(now);
        let purged = self.ctx.scheduler.cleanup_archive(now);
        self.settle(now);
        purged
    }

    /// Write the agent table. `None` when no store is attached.
    pub fn persist(&mut self) -> Result<Option<usize>, StorageError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(None);
        };
        let records = self.ctx.registry.all();
        store.save(&records)?;
        debug!(agents = records.len(), backend = store.backend_name(), "Agent table persisted");
        Ok(Some(records.len()))
    }

    /// Write the agent table and wait for it to reach disk.
    pub fn persist_durable(&mut self) -> Result<Option<usize>, StorageError> {
        let saved = self.persist()?;
        if let Some(store) = self.store.as_ref() {
            store.flush()?;
        }
        Ok(saved)
    }

    /// Publish what the last step changed.
    fn settle(&mut self, now: DateTime<Utc>) {
        let mut events = self.ctx.registry.drain_events();
        events.extend(self.ctx.scheduler.drain_events());

        let notable = !events.is_empty();
        let mut save = false;
        for event in events {
            save |= event.touches_agent_table();
            let stamped = StampedEvent { at: now, event };
            if self.event_log.len() >= defaults::EVENT_LOG_CAPACITY {
                self.event_log.pop_front();
            }
            self.event_log.push_back(stamped.clone());
            // No subscribers is fine
            let _ = self.events_tx.send(stamped);
            self.stats.events += 1;
        }

        if save {
            if let Err(e) = self.persist() {
                warn!(error = %e, "Failed to persist agent table");
            }
        }
        self.snapshot_stale = true;
        if notable || self.snapshot_due(now) {
            self.publish_snapshot(now);
        }
    }

    fn snapshot_due(&self, now: DateTime<Utc>) -> bool {
        let gap = chrono::Duration::milliseconds(i64::try_from(defaults::SNAPSHOT_MIN_INTERVAL_MS).unwrap_or(i64::MAX));
        self.last_snapshot.map_or(true, |at| now - at >= gap)
    }

    fn publish_snapshot(&mut self, now: DateTime<Utc>) {
        if !self.snapshot_stale {
            return;
        }
        self.snapshot_tx.send_replace(FleetSnapshot::capture(&self.ctx, now));
        self.last_snapshot = Some(now);
        self.snapshot_stale = false;
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Serve until cancelled or until the transport goes away, then save.
    pub async fn run(mut self, cancel: CancellationToken) -> LoopStats {
        let mut liveness = ticker(self.liveness_interval);
        let mut tick = ticker(self.tick_interval);
        let mut cleanup = ticker(self.cleanup_interval);
        let mut snapshots = ticker(Duration::from_millis(defaults::SNAPSHOT_MIN_INTERVAL_MS));
        let mut operator_open = true;

        self.settle(Utc::now());
        info!(
            agents = self.ctx.registry.len(),
            liveness_secs = self.liveness_interval.as_secs(),
            tick_secs = self.tick_interval.as_secs(),
            "Control loop running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Control loop received shutdown signal");
                    break;
                }
                received = self.inbound.recv() => {
                    let Some(inbound) = received else {
                        warn!("Transport closed, control loop stopping");
                        break;
                    };
                    self.handle_inbound(&inbound, Utc::now());
                }
                request = self.operator.recv(), if operator_open => {
                    match request {
                        Some(request) => self.handle_operator(request, Utc::now()),
                        None => {
                            debug!("Operator channel closed");
                            operator_open = false;
                        }
                    }
                }
                _ = liveness.tick() => {
                    self.sweep_liveness(Utc::now());
                }
                _ = tick.tick() => {
                    self.scheduler_tick(Utc::now());
                }
                _ = cleanup.tick() => {
                    self.cleanup_archive(Utc::now());
                }
                _ = snapshots.tick() => {
                    self.publish_snapshot(Utc::now());
                }
            }
        }

        match self.persist_durable() {
            Ok(Some(agents)) => info!(agents, "Agent table saved at shutdown"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to save agent table at shutdown"),
        }
        info!(
            messages = self.stats.messages,
            handler_failures = self.stats.handler_failures,
            operator_actions = self.stats.operator_actions,
            timeouts = self.stats.timeouts,
            "Control loop stopped"
        );
        self.stats
    }
}

/// Interval whose first tick is one period from now.
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandCatalog;
    use crate::storage::InMemoryAgentStore;
    use crate::transport::{InterfaceKind, LoopbackModem, LoopbackPeer, Transport};
    use crate::types::{AgentStatus, FleetEvent, JoinInfo, Telemetry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SharedStore(Arc<InMemoryAgentStore>);

    impl AgentStore for SharedStore {
        fn save(&self, records: &[crate::types::AgentRecord]) -> Result<(), StorageError> {
            self.0.save(records)
        }
        fn load(&self) -> Result<Vec<crate::types::AgentRecord>, StorageError> {
            self.0.load()
        }
        fn backend_name(&self) -> &'static str {
            "shared"
        }
    }

    /// Counts flushes on top of an in-memory store.
    struct FlushCounter {
        inner: Arc<InMemoryAgentStore>,
        flushes: Arc<AtomicUsize>,
    }

    impl AgentStore for FlushCounter {
        fn save(&self, records: &[crate::types::AgentRecord]) -> Result<(), StorageError> {
            self.inner.save(records)
        }
        fn load(&self) -> Result<Vec<crate::types::AgentRecord>, StorageError> {
            self.inner.load()
        }
        fn flush(&self) -> Result<(), StorageError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "counting"
        }
    }

    fn control_loop() -> (ControlLoop, LoopbackPeer, CancellationToken) {
        let config = ControlConfig::default();
        let (modem, peer) = LoopbackModem::pair(InterfaceKind::Wireless, defaults::PROTOCOL);
        let (transport, handle) = Transport::new(Box::new(modem), &config.node);
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(transport.run(tx, cancel.clone()));
        let (_op_tx, op_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel(8);
        let dispatcher = CommandDispatcher::new(CommandCatalog::standard(), handle);
        (ControlLoop::new(&config, dispatcher, in_rx, op_rx), peer, cancel)
    }

    fn join(sender: u32) -> Inbound {
        Inbound {
            sender,
            sent_at: 0,
            message: InboundMessage::TurtleOnline(JoinInfo::default()),
        }
    }

    #[tokio::test]
    async fn test_join_persists_and_publishes() {
        let (control, _peer, cancel) = control_loop();
        let store = Arc::new(InMemoryAgentStore::new());
        let mut control = control.with_store(Box::new(SharedStore(Arc::clone(&store)))).unwrap();
        let mut events = control.subscribe();
        let snapshots = control.snapshots();

        control.handle_inbound(&join(7), Utc::now());

        assert_eq!(store.len(), 1);
        assert_eq!(events.try_recv().unwrap().event, FleetEvent::AgentJoined { agent_id: 7 });
        assert_eq!(snapshots.borrow().counts.online, 1);
        assert_eq!(control.event_log().count(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_membership_saves_skip_flush() {
        let (control, _peer, cancel) = control_loop();
        let inner = Arc::new(InMemoryAgentStore::new());
        let flushes = Arc::new(AtomicUsize::new(0));
        let store = FlushCounter {
            inner: Arc::clone(&inner),
            flushes: Arc::clone(&flushes),
        };
        let mut control = control.with_store(Box::new(store)).unwrap();

        control.handle_inbound(&join(1), Utc::now());
        control.handle_inbound(&join(2), Utc::now());
        assert_eq!(inner.len(), 2);
        assert_eq!(flushes.load(Ordering::SeqCst), 0);

        let (request, reply) = OperatorRequest::with_reply(OperatorCommand::Save);
        control.handle_operator(request, Utc::now());
        assert!(matches!(reply.await.unwrap(), Ok(OperatorOutcome::Saved { agents: 2 })));
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        let loop_cancel = CancellationToken::new();
        let handle = tokio::spawn(control.run(loop_cancel.clone()));
        loop_cancel.cancel();
        handle.await.unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_quiet_steps_rate_limit_snapshots() {
        let (mut control, _peer, cancel) = control_loop();
        let snapshots = control.snapshots();
        let t0 = Utc::now();
        let fuel = |level: u64| Inbound {
            sender: 1,
            sent_at: 0,
            message: InboundMessage::Heartbeat(Telemetry {
                fuel_level: Some(level),
                ..Telemetry::default()
            }),
        };

        control.handle_inbound(&join(1), t0);
        assert_eq!(snapshots.borrow().counts.online, 1);

        // Too soon after the last snapshot: state moves, snapshot does not
        control.handle_inbound(&fuel(500), t0 + chrono::Duration::milliseconds(100));
        assert_eq!(control.context().registry.get(1).unwrap().fuel_level, Some(500));
        assert_eq!(snapshots.borrow().agent(1).and_then(|a| a.fuel_level), None);

        control.handle_inbound(&fuel(480), t0 + chrono::Duration::milliseconds(300));
        assert_eq!(snapshots.borrow().agent(1).and_then(|a| a.fuel_level), Some(480));

        // Operator actions always publish
        let (request, _reply) = OperatorRequest::with_reply(OperatorCommand::Resume);
        control.handle_inbound(&fuel(470), t0 + chrono::Duration::milliseconds(310));
        control.handle_operator(request, t0 + chrono::Duration::milliseconds(320));
        assert_eq!(snapshots.borrow().agent(1).and_then(|a| a.fuel_level), Some(470));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_restored_agents_come_back_offline() {
        let store = Arc::new(InMemoryAgentStore::new());
        let mut record = crate::types::AgentRecord::new(3, Utc::now());
        record.status = AgentStatus::Busy;
        record.current_task = Some(12);
        record.total_blocks_mined = 900;
        store.save(&[record]).unwrap();

        let (control, _peer, cancel) = control_loop();
        let control = control.with_store(Box::new(SharedStore(store))).unwrap();
        let agent = control.context().registry.get(3).unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert_eq!(agent.current_task, None);
        assert_eq!(agent.total_blocks_mined, 900);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_message_refreshes_contact_of_known_agent() {
        let (mut control, _peer, cancel) = control_loop();
        let t0 = Utc::now();
        control.handle_inbound(&join(1), t0);
        let later = t0 + chrono::Duration::seconds(20);
        let progress = Inbound {
            sender: 1,
            sent_at: 0,
            message: InboundMessage::TaskProgress(crate::types::ProgressReport::default()),
        };
        control.handle_inbound(&progress, later);
        assert_eq!(control.context().registry.get(1).unwrap().last_contact, later);

        // 25 s after the progress report: still within the timeout
        assert_eq!(control.sweep_liveness(later + chrono::Duration::seconds(25)), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_save_without_store_is_rejected() {
        let (mut control, _peer, cancel) = control_loop();
        let (request, reply) = OperatorRequest::with_reply(OperatorCommand::Save);
        control.handle_operator(request, Utc::now());
        assert!(matches!(reply.await.unwrap(), Err(OperatorError::NoStore)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_heartbeat_from_stranger_registers_it() {
        let (mut control, _peer, cancel) = control_loop();
        let heartbeat = Inbound {
            sender: 42,
            sent_at: 0,
            message: InboundMessage::Heartbeat(Telemetry {
                fuel_level: Some(80),
                ..Telemetry::default()
            }),
        };
        control.handle_inbound(&heartbeat, Utc::now());
        let agent = control.context().registry.get(42).unwrap();
        assert_eq!(agent.fuel_level, Some(80));
        assert_eq!(control.stats().messages, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_saves() {
        let (control, _peer, cancel) = control_loop();
        let store = Arc::new(InMemoryAgentStore::new());
        let mut control = control.with_store(Box::new(SharedStore(Arc::clone(&store)))).unwrap();
        control.ctx.registry.register(5, &JoinInfo::default(), Utc::now());

        let loop_cancel = CancellationToken::new();
        let handle = tokio::spawn(control.run(loop_cancel.clone()));
        loop_cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.len(), 1);
        cancel.cancel();
    }
}
