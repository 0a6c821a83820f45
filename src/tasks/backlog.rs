//! Priority backlog
//!
//! Kept sorted by descending priority at insertion time. Equal priorities
//! stay in arrival order; nothing is ever re-sorted.

use std::collections::VecDeque;

use crate::types::{Task, TaskId};

#[derive(Debug, Default)]
pub struct Backlog {
    entries: VecDeque<Task>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert behind every task of equal or higher priority.
    pub fn insert(&mut self, task: Task) {
        let at = self
            .entries
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, task);
    }

    /// Put a task back ahead of its equal-priority peers, where it was taken from.
    pub fn restore(&mut self, task: Task) {
        let at = self
            .entries
            .iter()
            .position(|t| t.priority <= task.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, task);
    }

    /// Remove and return the first (highest-priority) task matching `pred`.
    pub fn take_first<F>(&mut self, pred: F) -> Option<Task>
    where
        F: FnMut(&Task) -> bool,
    {
        let at = self.entries.iter().position(pred)?;
        self.entries.remove(at)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let at = self.entries.iter().position(|t| t.id == id)?;
        self.entries.remove(at)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.entries.iter().find(|t| t.id == id)
    }

    /// Tasks in service order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|t| t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, TaskOrigin, TaskSpec};
    use chrono::Utc;

    fn task(id: TaskId, priority: i32) -> Task {
        let spec = TaskSpec::ResourceTarget {
            resource: "coal".to_string(),
            quantity: 1,
        };
        Task::new(id, spec, Priority(priority), TaskOrigin::Operator, Utc::now())
    }

    #[test]
    fn test_priority_then_arrival() {
        let mut backlog = Backlog::new();
        for (id, p) in [(1, 5), (2, 8), (3, 5), (4, 10)] {
            backlog.insert(task(id, p));
        }
        assert_eq!(backlog.ids(), vec![4, 2, 1, 3]);
    }

    #[test]
    fn test_take_first_matching() {
        let mut backlog = Backlog::new();
        backlog.insert(task(1, 10));
        backlog.insert(task(2, 5));
        backlog.insert(task(3, 5));
        let taken = backlog.take_first(|t| t.id != 1).unwrap();
        assert_eq!(taken.id, 2);
        assert_eq!(backlog.ids(), vec![1, 3]);
        assert!(backlog.take_first(|_| false).is_none());
    }

    #[test]
    fn test_restore_goes_ahead_of_peers() {
        let mut backlog = Backlog::new();
        backlog.insert(task(1, 5));
        backlog.insert(task(2, 5));
        let first = backlog.take_first(|_| true).unwrap();
        backlog.restore(first);
        assert_eq!(backlog.ids(), vec![1, 2]);
    }

    #[test]
    fn test_requeue_goes_behind_peers() {
        let mut backlog = Backlog::new();
        backlog.insert(task(1, 5));
        backlog.insert(task(2, 9));
        backlog.insert(task(3, 5));
        let one = backlog.remove(1).unwrap();
        backlog.insert(one);
        assert_eq!(backlog.ids(), vec![2, 3, 1]);
    }
}
