//! Progress bookkeeping
//!
//! Agents report absolute figures for their current attempt. Reports can
//! arrive late or out of order, so only increases count and callers get the
//! increase back as a delta for the aggregates.

use crate::types::{ProgressReport, Task, TaskProgress};

/// What a single report added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub gathered: u64,
    pub blocks_mined: u64,
}

impl ProgressDelta {
    pub fn is_empty(&self) -> bool {
        self.gathered == 0 && self.blocks_mined == 0
    }
}

/// Fold `report` into the task's progress.
pub fn apply_report(task: &mut Task, report: &ProgressReport) -> ProgressDelta {
    let mut delta = ProgressDelta::default();

    if let Some(blocks) = report.blocks_mined {
        delta.blocks_mined = task.blocks_mined.advance(blocks);
    }

    match &mut task.progress {
        TaskProgress::Resource { gathered, .. } => {
            if let Some(reported) = report.gathered {
                delta.gathered = gathered.advance(reported);
            }
        }
        TaskProgress::Area { .. } => {}
        TaskProgress::Smart { saturation } => {
            if let Some(s) = report.saturation {
                *saturation = s.clamp(0.0, 1.0);
            }
        }
    }

    delta
}

/// Close the current attempt before the task goes back to the backlog.
pub fn rollover(task: &mut Task) {
    task.blocks_mined.rollover();
    if let TaskProgress::Resource { gathered, .. } = &mut task.progress {
        gathered.rollover();
    }
}
