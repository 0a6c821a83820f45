//! Archive of finished tasks
//!
//! Bounded (oldest evicted first) and purged by age.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::types::{Task, TaskId, TaskStatus};

#[derive(Debug)]
pub struct TaskArchive {
    entries: VecDeque<Task>,
    capacity: usize,
}

impl TaskArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Store a terminal task. Returns the evicted task, if any.
    pub fn push(&mut self, task: Task) -> Option<Task> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(task);
        evicted
    }

    /// Drop tasks that finished before `cutoff`. Returns how many went.
    pub fn purge_finished_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|t| t.finished_at.map_or(true, |finished| finished >= cutoff));
        before - self.entries.len()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.entries.iter().find(|t| t.id == id)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter()
    }

    /// (completed, failed)
    pub fn counts(&self) -> (usize, usize) {
        self.entries.iter().fold((0, 0), |(c, f), t| match t.status {
            TaskStatus::Completed => (c + 1, f),
            TaskStatus::Failed => (c, f + 1),
            _ => (c, f),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
