//! Fleet-wide resource totals
//!
//! Updated only by increments: requested grows when a target is queued,
//! gathered grows by the deltas progress reports produce. Never recomputed.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTotals {
    pub total_requested: u64,
    pub total_gathered: u64,
}

impl ResourceTotals {
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total_requested == 0 {
            return 0.0;
        }
        (self.total_gathered as f64 / self.total_requested as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceAggregates {
    totals: BTreeMap<String, ResourceTotals>,
}

impl ResourceAggregates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_requested(&mut self, resource: &str, quantity: u64) {
        self.totals.entry(resource.to_string()).or_default().total_requested += quantity;
    }

    /// Take back what a cancelled target had asked for and not received.
    pub fn withdraw_requested(&mut self, resource: &str, quantity: u64) {
        if let Some(t) = self.totals.get_mut(resource) {
            t.total_requested = t.total_requested.saturating_sub(quantity);
        }
    }

    pub fn add_gathered(&mut self, resource: &str, delta: u64) {
        if delta > 0 {
            self.totals.entry(resource.to_string()).or_default().total_gathered += delta;
        }
    }

    pub fn get(&self, resource: &str) -> Option<ResourceTotals> {
        self.totals.get(resource).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResourceTotals)> {
        self.totals.iter().map(|(k, v)| (k.as_str(), v))
    }
}
