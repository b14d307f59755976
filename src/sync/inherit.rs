//! # Priority Inheritance
//!
//! Pure functions over the mutex wait-graph. The kernel feeds them the
//! holder's base priority and the top waiter priority of every mutex the
//! holder owns; they never touch scheduler state, so restoration can be
//! checked in isolation.

use crate::task::Priority;

/// Effective priority of a task holding mutexes: its base priority or the
/// most urgent waiter on any mutex it holds, whichever is higher.
pub fn effective_priority<I>(base: Priority, top_waiters: I) -> Priority
where
    I: IntoIterator<Item = Option<Priority>>,
{
    top_waiters.into_iter().flatten().fold(base, Priority::max)
}

/// Kind of priority change a holder goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// Raised above the base priority for the first time.
    Boost,
    /// Already boosted, raised further (nested inheritance).
    Raise,
    /// Lowered, still above base because another waiter justifies it.
    Lower,
    /// Back to the base priority.
    Restore,
}

pub fn classify(base: Priority, old: Priority, new: Priority) -> Transition {
    use core::cmp::Ordering::*;
    match new.cmp(&old) {
        Equal => Transition::Unchanged,
        Greater if old == base => Transition::Boost,
        Greater => Transition::Raise,
        Less if new == base => Transition::Restore,
        Less => Transition::Lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_waiters_means_base() {
        assert_eq!(effective_priority(Priority(2), [None::<Priority>; 0]), Priority(2));
        assert_eq!(effective_priority(Priority(2), [None, None]), Priority(2));
    }

    #[test]
    fn test_inherits_most_urgent_waiter() {
        let p = effective_priority(Priority(1), [Some(Priority(3)), None, Some(Priority(5))]);
        assert_eq!(p, Priority(5));
    }

    #[test]
    fn test_lower_waiters_never_reduce_below_base() {
        assert_eq!(effective_priority(Priority(4), [Some(Priority(2))]), Priority(4));
    }

    #[test]
    fn test_restoration_after_release_of_one_of_two_mutexes() {
        // holds A (waiter P5) and B (waiter P3), releases A
        let before = effective_priority(Priority(1), [Some(Priority(5)), Some(Priority(3))]);
        let after = effective_priority(Priority(1), [Some(Priority(3))]);
        assert_eq!(before, Priority(5));
        assert_eq!(after, Priority(3));
        assert_eq!(classify(Priority(1), before, after), Transition::Lower);
        assert_eq!(classify(Priority(1), after, Priority(1)), Transition::Restore);
    }

    #[test]
    fn test_classify_boosts() {
        assert_eq!(classify(Priority(1), Priority(1), Priority(3)), Transition::Boost);
        assert_eq!(classify(Priority(1), Priority(3), Priority(4)), Transition::Raise);
        assert_eq!(classify(Priority(1), Priority(3), Priority(3)), Transition::Unchanged);
    }
}
