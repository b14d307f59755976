//! # Scheduler
//!
//! Fixed-priority preemptive scheduling across one or two cores.
//!
//! ## Scheduling Rules
//!
//! 1. **Selection**: each core runs the highest effective-priority Ready
//!    task its affinity allows; ties go to the task that became ready first
//! 2. **Preemption**: a task becoming ready with a strictly higher priority
//!    than a core's running task displaces it immediately; the displaced
//!    task goes back to the *front* of its level
//! 3. **Time slicing**: at slice expiry the running task rotates to the
//!    *back* of its level if an equal-priority peer is ready
//! 4. **Deferral**: while a core's scheduler is suspended (critical
//!    section) switches on that core are recorded and applied on exit
//!
//! At each tick:
//! 1. **Advance clock**: expire delays and timed-out waits
//! 2. **Time slice**: charge the running task of every core
//! 3. **Preemption check**: reselect on every core
//!
//! Priority changes made by inheritance are applied here too, because a
//! changed priority moves a task inside whichever structure holds it.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::arch::Port;
use crate::config::MAX_INHERITANCE_DEPTH;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::ready::ReadyQueues;
use crate::sync::inherit::{self, Transition};
use crate::task::{CoreId, Priority, TaskId, TaskState, WaitObject, WakeOutcome};
use crate::time::{Tick, Timeout};

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// Per-core dispatch state.
#[derive(Debug, Default, Clone)]
pub struct CoreState {
    /// Task most recently dispatched on this core. It may have left the
    /// Running state since; the next reselection replaces it.
    pub current: Option<TaskId>,
    pub idle: Option<TaskId>,
    /// Critical section nesting; switching is deferred while non-zero.
    pub suspended: u32,
    /// A switch was requested while suspended.
    pub yield_pending: bool,
}

pub struct Scheduler {
    pub ready: ReadyQueues,
    /// Tasks with a wake-up deadline, ordered by deadline.
    pub delayed: BTreeSet<(Tick, TaskId)>,
    pub cores: Vec<CoreState>,
    pub started: bool,
}

impl Scheduler {
    pub fn new(cores: usize) -> Self {
        let mut states = Vec::with_capacity(cores);
        states.resize_with(cores, CoreState::default);
        Self {
            ready: ReadyQueues::new(),
            delayed: BTreeSet::new(),
            cores: states,
            started: false,
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Task Running on `core`, for calls made in task context.
    pub(crate) fn running_task(&self, core: CoreId) -> Result<TaskId> {
        if core.index() >= self.config.cores {
            return Err(KernelError::InvalidArgument);
        }
        self.current(core).ok_or(KernelError::InvalidState)
    }

    /// Effective priority of the task Running on `core`.
    fn running_priority(&self, core: CoreId) -> Option<Priority> {
        self.current(core)
            .and_then(|id| self.tasks.get(id))
            .map(|t| t.effective_priority)
    }

    fn pick(&self, core: CoreId) -> Option<(Priority, TaskId)> {
        let tasks = &self.tasks;
        self.sched
            .ready
            .best(|id| tasks.get(id).is_some_and(|t| t.can_run_on_core(core)))
    }

    /// Put a task into its ready level.
    fn enqueue(&mut self, id: TaskId, front: bool) {
        let tcb = &mut self.tasks[id];
        tcb.state = TaskState::Ready;
        tcb.running_on = None;
        if front {
            self.sched.ready.push_front(id, tcb.effective_priority);
        } else {
            self.sched.ready.push_back(id, tcb.effective_priority);
        }
    }

    fn dispatch(&mut self, core: CoreId, next: TaskId) {
        let prev = self.sched.cores[core.index()].current;
        let tcb = &mut self.tasks[next];
        self.sched.ready.remove(next, tcb.effective_priority);
        tcb.state = TaskState::Running;
        tcb.running_on = Some(core);
        tcb.stats.dispatches += 1;
        tcb.reset_slice();
        log::trace!("core {}: switch to '{}' at {}", core.0, tcb.name, tcb.effective_priority);

        self.sched.cores[core.index()].current = Some(next);
        self.stats.context_switches += 1;
        let prev = prev.filter(|p| self.tasks.contains_key(*p));
        self.port.request_switch(core, prev, next);
    }

    /// Reselect the task for `core`, preempting the running one if a
    /// strictly higher priority task is ready.
    pub(crate) fn reschedule(&mut self, core: CoreId) {
        if !self.sched.started || core.index() >= self.config.cores {
            return;
        }
        let state = &mut self.sched.cores[core.index()];
        if state.suspended > 0 {
            state.yield_pending = true;
            return;
        }
        let current = self.current(core);
        match (current, self.pick(core)) {
            (Some(cur), Some((prio, next))) => {
                if prio > self.tasks[cur].effective_priority {
                    self.enqueue(cur, true);
                    self.dispatch(core, next);
                    // the displaced task may still outrank another core
                    self.offer_elsewhere(cur, core);
                }
            }
            (None, Some((_, next))) => self.dispatch(core, next),
            (Some(_), None) => {}
            (None, None) => {
                self.sched.cores[core.index()].current = None;
                log::error!("core {}: nothing to run", core.0);
            }
        }
    }

    /// Let another core pick up a task that just lost its core.
    fn offer_elsewhere(&mut self, id: TaskId, except: CoreId) {
        let prio = self.tasks[id].effective_priority;
        let affinity = self.tasks[id].affinity;
        for c in 0..self.config.cores {
            let core = CoreId(c as u8);
            if core == except || !affinity.allows(core) {
                continue;
            }
            if self.running_priority(core).map_or(true, |p| prio > p) {
                self.reschedule(core);
                return;
            }
        }
    }

    /// Rotate the running task of `core` behind its equal-priority peers.
    pub(crate) fn yield_core(&mut self, core: CoreId) {
        let state = &mut self.sched.cores[core.index()];
        if state.suspended > 0 {
            state.yield_pending = true;
            return;
        }
        let Some(cur) = self.current(core) else {
            return self.reschedule(core);
        };
        self.tasks[cur].reset_slice();
        if let Some((prio, next)) = self.pick(core) {
            if prio >= self.tasks[cur].effective_priority {
                self.enqueue(cur, false);
                self.dispatch(core, next);
            }
        }
    }

    /// Check whether ready task `id` should run right away.
    ///
    /// The task goes to the allowed core it outranks whose running priority
    /// is lowest, `local` winning ties. Returns true when that core is
    /// `local`; the caller switches it itself (immediately in task context,
    /// at interrupt exit in interrupt context). Any other core is
    /// rescheduled here.
    pub(crate) fn preemption_check(&mut self, id: TaskId, local: Option<CoreId>) -> bool {
        if !self.sched.started {
            return false;
        }
        let Some(tcb) = self.tasks.get(id) else {
            return false;
        };
        if tcb.state != TaskState::Ready {
            return false;
        }
        let prio = tcb.effective_priority;
        let affinity = tcb.affinity;

        // the outranked core running the lowest priority; ties go to `local`
        let mut target: Option<(Option<Priority>, CoreId)> = None;
        for c in 0..self.config.cores {
            let core = CoreId(c as u8);
            if !affinity.allows(core) {
                continue;
            }
            let running = self.running_priority(core);
            if running.is_some_and(|p| prio <= p) {
                continue;
            }
            let better = match target {
                None => true,
                Some((lowest, _)) => running < lowest || (running == lowest && Some(core) == local),
            };
            if better {
                target = Some((running, core));
            }
        }
        match target {
            Some((_, core)) if Some(core) == local => true,
            Some((_, core)) => {
                self.reschedule(core);
                false
            }
            None => false,
        }
    }

    /// Move a blocked or suspended task to Ready, recording how its wait
    /// ended. See [`Kernel::preemption_check`] for the return value.
    pub(crate) fn make_ready(
        &mut self,
        id: TaskId,
        outcome: Option<WakeOutcome>,
        local: Option<CoreId>,
    ) -> bool {
        let Some(tcb) = self.tasks.get_mut(id) else {
            return false;
        };
        if let Some(at) = tcb.wait.wake_at.take() {
            self.sched.delayed.remove(&(at, id));
        }
        tcb.wait.clear();
        if outcome.is_some() {
            tcb.wait.outcome = outcome;
        }
        self.enqueue(id, false);
        self.preemption_check(id, local)
    }

    /// Park the task running on `core` on `object` for at most `timeout`.
    /// The caller adds it to the object's wait list and reschedules.
    pub(crate) fn block_current(
        &mut self,
        core: CoreId,
        object: WaitObject,
        timeout: Timeout,
    ) -> Result<TaskId> {
        let id = self.running_task(core)?;
        if self.sched.cores[core.index()].suspended > 0 {
            log::error!("core {}: blocking call inside a critical section", core.0);
            return Err(KernelError::InvalidState);
        }
        let deadline = timeout.deadline(self.clock.now());
        let tcb = &mut self.tasks[id];
        tcb.state = TaskState::Blocked;
        tcb.running_on = None;
        tcb.wait.object = Some(object);
        tcb.wait.wake_at = deadline;
        tcb.wait.outcome = None;
        if let Some(at) = deadline {
            self.sched.delayed.insert((at, id));
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance time by one tick. Called from the tick interrupt.
    pub fn tick(&mut self) {
        let now = self.clock.advance();
        self.stats.ticks += 1;
        if !self.sched.started {
            return;
        }

        while let Some(&(at, id)) = self.sched.delayed.first() {
            if at > now {
                break;
            }
            self.sched.delayed.remove(&(at, id));
            self.expire_wait(id);
        }

        for c in 0..self.config.cores {
            self.charge_slice(CoreId(c as u8));
        }
        for c in 0..self.config.cores {
            self.reschedule(CoreId(c as u8));
        }
        self.settle();
    }

    fn expire_wait(&mut self, id: TaskId) {
        let Some(tcb) = self.tasks.get_mut(id) else {
            return;
        };
        if tcb.state != TaskState::Blocked {
            return;
        }
        tcb.wait.wake_at = None;
        let outcome = match tcb.wait.object.take() {
            None | Some(WaitObject::Delay) => WakeOutcome::Granted,
            // the timer service waits with a timeout as a matter of course
            Some(object) if tcb.system => {
                self.detach_waiter(id, object);
                WakeOutcome::TimedOut
            }
            Some(object) => {
                tcb.stats.timeouts += 1;
                log::warn!("'{}' timed out waiting on {:?}", tcb.name, object);
                self.stats.timeouts += 1;
                self.detach_waiter(id, object);
                WakeOutcome::TimedOut
            }
        };
        self.make_ready(id, Some(outcome), None);
    }

    fn charge_slice(&mut self, core: CoreId) {
        let Some(cur) = self.current(core) else {
            return;
        };
        let tcb = &mut self.tasks[cur];
        tcb.stats.run_ticks += 1;
        tcb.ticks_remaining = tcb.ticks_remaining.saturating_sub(1);
        if tcb.ticks_remaining == 0 {
            self.yield_core(core);
        }
    }

    // -----------------------------------------------------------------------
    // Priority changes
    // -----------------------------------------------------------------------

    /// Recompute a task's effective priority from its base priority and the
    /// waiters on every mutex it holds, and apply the result.
    pub(crate) fn refresh_priority(&mut self, id: TaskId, depth: usize) {
        let Some(tcb) = self.tasks.get(id) else {
            return;
        };
        let mutexes = &self.mutexes;
        let target = inherit::effective_priority(
            tcb.base_priority,
            tcb.held_mutexes
                .iter()
                .map(|m| mutexes.get(*m).and_then(|mcb| mcb.waiters.top_priority())),
        );
        self.set_effective_priority(id, target, depth);
    }

    fn set_effective_priority(&mut self, id: TaskId, new: Priority, depth: usize) {
        let tcb = &mut self.tasks[id];
        let old = tcb.effective_priority;
        let transition = inherit::classify(tcb.base_priority, old, new);
        if transition == Transition::Unchanged {
            return;
        }
        tcb.effective_priority = new;
        match transition {
            Transition::Boost => {
                tcb.stats.boosts += 1;
                self.stats.inheritance_activations += 1;
                log::debug!("'{}' inherits {} (base {})", tcb.name, new, tcb.base_priority);
            }
            Transition::Restore => log::debug!("'{}' restored to {}", tcb.name, new),
            _ => log::trace!("'{}' priority {} -> {}", tcb.name, old, new),
        }

        match tcb.state {
            TaskState::Ready => {
                self.sched.ready.remove(id, old);
                self.sched.ready.push_back(id, new);
                if new > old {
                    self.preemption_check(id, None);
                }
            }
            TaskState::Running => {
                if let Some(core) = tcb.running_on.filter(|_| new < old) {
                    self.reschedule(core);
                }
            }
            TaskState::Blocked => {
                if let Some(object) = tcb.wait.object {
                    self.reposition_waiter(id, object, new, depth);
                }
            }
            TaskState::Suspended | TaskState::Terminated => {}
        }
    }

    /// Re-sort a blocked task inside its wait list. A mutex waiter's new
    /// priority flows on to that mutex's holder.
    fn reposition_waiter(&mut self, id: TaskId, object: WaitObject, prio: Priority, depth: usize) {
        match object {
            WaitObject::Delay => {}
            WaitObject::Mutex(m) => {
                let Some(mcb) = self.mutexes.get_mut(m) else {
                    return;
                };
                mcb.waiters.reprioritize(id, prio);
                let holder = mcb.holder;
                match holder {
                    Some(h) if depth < MAX_INHERITANCE_DEPTH => self.refresh_priority(h, depth + 1),
                    Some(_) => log::warn!("priority inheritance chain longer than {}", MAX_INHERITANCE_DEPTH),
                    None => {}
                }
            }
            WaitObject::Semaphore(s) => {
                if let Some(scb) = self.semaphores.get_mut(s) {
                    scb.waiters.reprioritize(id, prio);
                }
            }
            WaitObject::QueueReceive(q) => {
                if let Some(qcb) = self.queues.get_mut(q) {
                    qcb.receivers.reprioritize(id, prio);
                }
            }
            WaitObject::QueueSend(q) => {
                if let Some(qcb) = self.queues.get_mut(q) {
                    qcb.senders.reprioritize(id, prio);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::config::KernelConfig;
    use crate::task::TaskConfig;

    fn kernel(cores: usize) -> Kernel<SimPort> {
        Kernel::new(KernelConfig::default().with_cores(cores), SimPort::new()).unwrap()
    }

    #[test]
    fn test_idle_runs_when_nothing_else_is_ready() {
        let mut k = kernel(1);
        k.start();
        let idle = k.idle_task(CoreId::CORE0).unwrap();
        assert_eq!(k.current(CoreId::CORE0), Some(idle));
    }

    #[test]
    fn test_higher_priority_spawn_preempts() {
        let mut k = kernel(1);
        k.start();
        let low = k.spawn_fn(TaskConfig::new("low", 2), || {}).unwrap();
        assert_eq!(k.current(CoreId::CORE0), Some(low));
        let high = k.spawn_fn(TaskConfig::new("high", 5), || {}).unwrap();
        assert_eq!(k.current(CoreId::CORE0), Some(high));
        // preempted task resumes first among its level
        assert_eq!(k.sched.ready.best(|_| true), Some((Priority(2), low)));
    }

    #[test]
    fn test_time_slice_rotation() {
        let mut k = kernel(1);
        let a = k.spawn_fn(TaskConfig::new("a", 3), || {}).unwrap();
        let b = k.spawn_fn(TaskConfig::new("b", 3), || {}).unwrap();
        k.start();
        assert_eq!(k.current(CoreId::CORE0), Some(a));
        k.tick();
        assert_eq!(k.current(CoreId::CORE0), Some(b));
        k.tick();
        assert_eq!(k.current(CoreId::CORE0), Some(a));
    }

    #[test]
    fn test_slice_expiry_without_peer_keeps_running() {
        let mut k = kernel(1);
        let a = k.spawn_fn(TaskConfig::new("a", 3), || {}).unwrap();
        k.start();
        for _ in 0..5 {
            k.tick();
        }
        assert_eq!(k.current(CoreId::CORE0), Some(a));
        assert_eq!(k.task_info(a).unwrap().stats.run_ticks, 5);
    }

    #[test]
    fn test_pinned_tasks_stay_on_their_core() {
        let mut k = kernel(2);
        let a = k.spawn_fn(TaskConfig::new("a", 4).pinned(CoreId::CORE1), || {}).unwrap();
        let b = k.spawn_fn(TaskConfig::new("b", 4).pinned(CoreId::CORE1), || {}).unwrap();
        k.start();
        for _ in 0..6 {
            k.tick();
            for id in [a, b] {
                assert_ne!(k.task_info(id).unwrap().running_on, Some(CoreId::CORE0));
            }
        }
    }

    #[test]
    fn test_unpinned_task_uses_free_core() {
        let mut k = kernel(2);
        k.start();
        let a = k.spawn_fn(TaskConfig::new("a", 4), || {}).unwrap();
        let b = k.spawn_fn(TaskConfig::new("b", 4), || {}).unwrap();
        let on_a = k.task_info(a).unwrap().running_on;
        let on_b = k.task_info(b).unwrap().running_on;
        assert!(on_a.is_some() && on_b.is_some());
        assert_ne!(on_a, on_b);
    }

    #[test]
    fn test_delay_wakes_after_exact_ticks() {
        let mut k = kernel(1);
        let t = k.spawn_fn(TaskConfig::new("t", 3), || {}).unwrap();
        k.start();
        assert!(k.task(CoreId::CORE0).delay(3).unwrap().is_blocked());
        assert_eq!(k.task_state(t).unwrap(), TaskState::Blocked);
        k.tick();
        k.tick();
        assert_eq!(k.task_state(t).unwrap(), TaskState::Blocked);
        k.tick();
        assert_eq!(k.current(CoreId::CORE0), Some(t));
        assert_eq!(k.task(CoreId::CORE0).finish_wait(), Ok(()));
    }

    #[test]
    fn test_suspended_scheduler_defers_switch() {
        let mut k = kernel(1);
        let low = k.spawn_fn(TaskConfig::new("low", 2), || {}).unwrap();
        k.start();
        k.sched.cores[0].suspended = 1;
        let high = k.spawn_fn(TaskConfig::new("high", 6), || {}).unwrap();
        assert_eq!(k.current(CoreId::CORE0), Some(low));
        assert!(k.sched.cores[0].yield_pending);

        k.sched.cores[0].suspended = 0;
        k.reschedule(CoreId::CORE0);
        assert_eq!(k.current(CoreId::CORE0), Some(high));
    }
}
