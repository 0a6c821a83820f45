//! State shared by every inbound handler and operator action.
//!
//! Owned by the control loop and lent out one event at a time, so nothing
//! in here needs a lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::commands::CommandDispatcher;
use crate::config::{defaults, ControlConfig};
use crate::fleet::FleetRegistry;
use crate::tasks::TaskScheduler;
use crate::types::{AgentId, Position};

/// A resource an agent noticed but was not asked to gather.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Sighting {
    pub agent_id: AgentId,
    pub resource: String,
    pub position: Option<Position>,
    pub quantity: Option<u64>,
    pub at: DateTime<Utc>,
}

pub struct ControlContext {
    pub registry: FleetRegistry,
    pub scheduler: TaskScheduler,
    pub dispatcher: CommandDispatcher,
    sightings: VecDeque<Sighting>,
    /// Receipt time of the event being handled
    now: DateTime<Utc>,
}

impl ControlContext {
    pub fn new(config: &ControlConfig, dispatcher: CommandDispatcher) -> Self {
        Self {
            registry: FleetRegistry::new(&config.fleet),
            scheduler: TaskScheduler::new(&config.scheduler),
            dispatcher,
            sightings: VecDeque::new(),
            now: Utc::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn set_now(&mut self, now: DateTime<Utc>) {
        self.now = now;
    }

    /// Record a sighting, dropping the oldest once full.
    pub fn record_sighting(&mut self, sighting: Sighting) {
        if self.sightings.len() >= defaults::RESOURCE_SIGHTINGS_CAPACITY {
            self.sightings.pop_front();
        }
        self.sightings.push_back(sighting);
    }

    /// Oldest first.
    pub fn sightings(&self) -> impl Iterator<Item = &Sighting> {
        self.sightings.iter()
    }

    /// Run an assignment pass at the current event time.
    pub fn assign_pending(&mut self) -> usize {
        let now = self.now;
        self.scheduler
            .assign_pending_tasks(&mut self.registry, &self.dispatcher, now)
    }
}
