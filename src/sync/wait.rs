//! # Wait Lists
//!
//! Tasks blocked on a primitive, ordered by effective priority (highest
//! first) and, within a priority, by arrival. Arrival numbers come from a
//! kernel-wide counter so the order never depends on scheduler traversal.

use alloc::vec::Vec;

use crate::task::{Priority, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    task: TaskId,
    priority: Priority,
    seq: u64,
}

impl Waiter {
    /// Whether `self` is served before `other`.
    fn precedes(&self, other: &Waiter) -> bool {
        self.priority > other.priority || (self.priority == other.priority && self.seq < other.seq)
    }
}

#[derive(Debug, Default)]
pub struct WaitList {
    entries: Vec<Waiter>,
}

impl WaitList {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, task: TaskId, priority: Priority, seq: u64) {
        let waiter = Waiter { task, priority, seq };
        let pos = self
            .entries
            .iter()
            .position(|w| waiter.precedes(w))
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, waiter);
    }

    pub fn remove(&mut self, task: TaskId) -> bool {
        match self.entries.iter().position(|w| w.task == task) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take the waiter to be served next.
    pub fn pop(&mut self) -> Option<TaskId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).task)
        }
    }

    pub fn peek(&self) -> Option<TaskId> {
        self.entries.first().map(|w| w.task)
    }

    /// Priority of the waiter served next.
    pub fn top_priority(&self) -> Option<Priority> {
        self.entries.first().map(|w| w.priority)
    }

    /// Move `task` to the position its new priority demands, keeping its
    /// original arrival number.
    pub fn reprioritize(&mut self, task: TaskId, priority: Priority) -> bool {
        match self.entries.iter().position(|w| w.task == task) {
            Some(pos) => {
                let mut waiter = self.entries.remove(pos);
                waiter.priority = priority;
                self.insert(waiter.task, waiter.priority, waiter.seq);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.entries.iter().any(|w| w.task == task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.entries.iter().map(|w| w.task)
    }
}
