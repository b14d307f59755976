//! # Ready Queues
//!
//! One FIFO per priority level plus a bitmap of non-empty levels. The
//! running task of each core is not kept here; it is re-inserted when it
//! stops running while still ready.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::MAX_PRIORITIES;
use crate::task::{Priority, TaskId};

pub struct ReadyQueues {
    levels: Vec<VecDeque<TaskId>>,
    /// Bit `n` set when level `n` is non-empty.
    occupied: u32,
}

impl ReadyQueues {
    pub fn new() -> Self {
        let mut levels = Vec::with_capacity(MAX_PRIORITIES);
        levels.resize_with(MAX_PRIORITIES, VecDeque::new);
        Self { levels, occupied: 0 }
    }

    /// Append to the tail of its level (arrival or round-robin rotation).
    pub fn push_back(&mut self, id: TaskId, priority: Priority) {
        self.levels[priority.level()].push_back(id);
        self.occupied |= 1 << priority.level();
    }

    /// Insert at the head of its level (a preempted task resumes first).
    pub fn push_front(&mut self, id: TaskId, priority: Priority) {
        self.levels[priority.level()].push_front(id);
        self.occupied |= 1 << priority.level();
    }

    /// Remove `id` from `priority`'s level. Returns whether it was there.
    pub fn remove(&mut self, id: TaskId, priority: Priority) -> bool {
        let level = &mut self.levels[priority.level()];
        let found = match level.iter().position(|&t| t == id) {
            Some(pos) => {
                level.remove(pos);
                true
            }
            None => false,
        };
        if level.is_empty() {
            self.occupied &= !(1 << priority.level());
        }
        found
    }

    /// Highest-priority task accepted by `eligible`, earliest first within a
    /// level. The task is not removed.
    pub fn best(&self, mut eligible: impl FnMut(TaskId) -> bool) -> Option<(Priority, TaskId)> {
        let mut bits = self.occupied;
        while bits != 0 {
            let level = 31 - bits.leading_zeros() as usize;
            if let Some(&id) = self.levels[level].iter().find(|&&t| eligible(t)) {
                return Some((Priority(level as u8), id));
            }
            bits &= !(1 << level);
        }
        None
    }

    /// Highest occupied priority level.
    pub fn highest_priority(&self) -> Option<Priority> {
        if self.occupied == 0 {
            None
        } else {
            Some(Priority((31 - self.occupied.leading_zeros()) as u8))
        }
    }

    pub fn contains(&self, id: TaskId, priority: Priority) -> bool {
        self.levels[priority.level()].contains(&id)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<TaskId> {
        let mut map: SlotMap<TaskId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_picks_highest_level_first() {
        let t = ids(3);
        let mut rq = ReadyQueues::new();
        rq.push_back(t[0], Priority(1));
        rq.push_back(t[1], Priority(5));
        rq.push_back(t[2], Priority(3));

        assert_eq!(rq.best(|_| true), Some((Priority(5), t[1])));
        assert_eq!(rq.highest_priority(), Some(Priority(5)));
        assert_eq!(rq.len(), 3);
    }

    #[test]
    fn test_fifo_within_level_and_front_insert() {
        let t = ids(3);
        let mut rq = ReadyQueues::new();
        rq.push_back(t[0], Priority(2));
        rq.push_back(t[1], Priority(2));
        assert_eq!(rq.best(|_| true), Some((Priority(2), t[0])));

        rq.push_front(t[2], Priority(2));
        assert_eq!(rq.best(|_| true), Some((Priority(2), t[2])));
    }

    #[test]
    fn test_eligibility_filter_skips_to_lower_levels() {
        let t = ids(2);
        let mut rq = ReadyQueues::new();
        rq.push_back(t[0], Priority(4));
        rq.push_back(t[1], Priority(1));

        assert_eq!(rq.best(|id| id != t[0]), Some((Priority(1), t[1])));
        assert_eq!(rq.best(|_| false), None);
    }

    #[test]
    fn test_remove_clears_bitmap() {
        let t = ids(1);
        let mut rq = ReadyQueues::new();
        rq.push_back(t[0], Priority(7));
        assert!(rq.remove(t[0], Priority(7)));
        assert!(!rq.remove(t[0], Priority(7)));
        assert!(rq.is_empty());
        assert_eq!(rq.highest_priority(), None);
    }
}
