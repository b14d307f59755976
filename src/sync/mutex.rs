//! # Mutex
//!
//! Ownership-tracking lock with priority inheritance. While a task waits,
//! the holder runs at the waiter's priority so no medium-priority task can
//! stretch the wait:
//!
//! ```text
//!   Low (P1) locks M
//!   High (P3) blocks on M   ──►  Low runs at P3
//!   Medium (P2) ready       ──►  cannot preempt Low
//!   Low unlocks M           ──►  Low back to P1, High owns M and runs
//! ```
//!
//! Locking a mutex the caller already holds is not detected: the caller
//! waits on itself until its timeout expires.

use crate::arch::Port;
use crate::config::OBJECT_OVERHEAD;
use crate::error::{KernelError, Result};
use crate::kernel::{Kernel, TaskContext, Wait};
use crate::sync::{MutexId, WaitList};
use crate::task::{CoreId, TaskId, WaitObject, WakeOutcome};
use crate::time::Timeout;

#[derive(Debug, Default)]
pub struct MutexControlBlock {
    pub holder: Option<TaskId>,
    pub waiters: WaitList,
}

/// Snapshot of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexInfo {
    pub holder: Option<TaskId>,
    pub waiters: usize,
}

impl<P: Port> Kernel<P> {
    pub fn mutex_create(&mut self) -> Result<MutexId> {
        self.heap.reserve(OBJECT_OVERHEAD)?;
        Ok(self.mutexes.insert(MutexControlBlock::default()))
    }

    /// Destroy an unheld mutex nobody waits on.
    pub fn mutex_destroy(&mut self, id: MutexId) -> Result<()> {
        let mcb = self.mutexes.get(id).ok_or(KernelError::InvalidState)?;
        if mcb.holder.is_some() || !mcb.waiters.is_empty() {
            log::error!("mutex {:?} destroyed while in use", id);
            return Err(KernelError::InvalidState);
        }
        self.mutexes.remove(id);
        self.heap.release(OBJECT_OVERHEAD);
        Ok(())
    }

    pub fn mutex_info(&self, id: MutexId) -> Result<MutexInfo> {
        let mcb = self.mutexes.get(id).ok_or(KernelError::InvalidState)?;
        Ok(MutexInfo {
            holder: mcb.holder,
            waiters: mcb.waiters.len(),
        })
    }

    pub fn mutex_holder(&self, id: MutexId) -> Result<Option<TaskId>> {
        Ok(self.mutex_info(id)?.holder)
    }

    /// Pass `id` to its best waiter, or mark it free.
    fn hand_over(&mut self, id: MutexId, local: Option<CoreId>) {
        let Some(mcb) = self.mutexes.get_mut(id) else {
            return;
        };
        let next = mcb.waiters.pop();
        mcb.holder = next;
        if let Some(next) = next {
            self.tasks[next].held_mutexes.push(id);
            self.make_ready(next, Some(WakeOutcome::Granted), local);
            // remaining waiters now push on the new holder
            self.refresh_priority(next, 0);
        }
    }

    /// Release a mutex held by a task that is being deleted.
    pub(crate) fn force_release(&mut self, id: MutexId, from: TaskId) {
        log::warn!("mutex {:?} released by deletion of its holder {:?}", id, from);
        self.hand_over(id, None);
    }
}

impl<'k, P: Port> TaskContext<'k, P> {
    /// Lock `mutex`, waiting at most `timeout`. A lower-priority holder
    /// inherits the caller's priority while the caller waits.
    pub fn mutex_lock(&mut self, mutex: MutexId, timeout: Timeout) -> Result<Wait<()>> {
        let id = self.kernel.running_task(self.core)?;
        let mcb = self.kernel.mutexes.get_mut(mutex).ok_or(KernelError::InvalidState)?;
        let holder = match mcb.holder {
            None => {
                mcb.holder = Some(id);
                self.kernel.tasks[id].held_mutexes.push(mutex);
                return Ok(Wait::Ready(()));
            }
            Some(_) if timeout.is_no_wait() => return Err(KernelError::WouldBlock),
            Some(holder) => holder,
        };

        let prio = self.kernel.tasks[id].effective_priority;
        self.kernel
            .block_current(self.core, WaitObject::Mutex(mutex), timeout)?;
        let seq = self.kernel.next_seq();
        self.kernel.mutexes[mutex].waiters.insert(id, prio, seq);
        self.kernel.refresh_priority(holder, 0);
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(Wait::Blocked)
    }

    /// Lock without waiting; `Err(WouldBlock)` when held.
    pub fn mutex_try_lock(&mut self, mutex: MutexId) -> Result<()> {
        self.mutex_lock(mutex, Timeout::NO_WAIT).map(|_| ())
    }

    /// Release `mutex`. Ownership passes straight to the best waiter and
    /// the caller drops back to the priority its remaining mutexes justify.
    pub fn mutex_unlock(&mut self, mutex: MutexId) -> Result<()> {
        let id = self.kernel.running_task(self.core)?;
        let mcb = self.kernel.mutexes.get(mutex).ok_or(KernelError::InvalidState)?;
        if mcb.holder != Some(id) {
            log::warn!("'{}' unlocking a mutex it does not hold", self.kernel.tasks[id].name);
            return Err(KernelError::NotOwner);
        }
        self.kernel.tasks[id].held_mutexes.retain(|m| *m != mutex);
        self.kernel.hand_over(mutex, Some(self.core));
        self.kernel.refresh_priority(id, 0);
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::config::KernelConfig;
    use crate::task::{Priority, TaskConfig, TaskState};

    const C0: CoreId = CoreId::CORE0;

    fn kernel() -> Kernel<SimPort> {
        Kernel::new(KernelConfig::default().with_cores(1), SimPort::new()).unwrap()
    }

    #[test]
    fn test_uncontended_lock_and_unlock() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let t = k.spawn_fn(TaskConfig::new("t", 2), || {}).unwrap();
        k.start();

        assert_eq!(k.task(C0).mutex_lock(m, Timeout::FOREVER), Ok(Wait::Ready(())));
        assert_eq!(k.mutex_holder(m), Ok(Some(t)));
        assert_eq!(k.mutex_destroy(m), Err(KernelError::InvalidState));
        k.task(C0).mutex_unlock(m).unwrap();
        assert_eq!(k.mutex_holder(m), Ok(None));
        k.mutex_destroy(m).unwrap();
        assert_eq!(k.mutex_info(m), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_unlock_by_non_owner() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        k.spawn_fn(TaskConfig::new("t", 2), || {}).unwrap();
        k.start();
        assert_eq!(k.task(C0).mutex_unlock(m), Err(KernelError::NotOwner));
    }

    #[test]
    fn test_inheritance_and_restore() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let low = k.spawn_fn(TaskConfig::new("low", 1), || {}).unwrap();
        k.start();
        k.task(C0).mutex_lock(m, Timeout::FOREVER).unwrap();

        let high = k.spawn_fn(TaskConfig::new("high", 3), || {}).unwrap();
        assert_eq!(k.current(C0), Some(high));
        assert!(k.task(C0).mutex_lock(m, Timeout::FOREVER).unwrap().is_blocked());

        let info = k.task_info(low).unwrap();
        assert_eq!(info.effective_priority, Priority(3));
        assert_eq!(k.current(C0), Some(low));
        assert_eq!(k.inversion_hazards(), 1);
        assert_eq!(k.stats().inheritance_activations, 1);

        k.task(C0).mutex_unlock(m).unwrap();
        assert_eq!(k.task_info(low).unwrap().effective_priority, Priority(1));
        assert_eq!(k.current(C0), Some(high));
        assert_eq!(k.mutex_holder(m), Ok(Some(high)));
        assert_eq!(k.task(C0).finish_wait(), Ok(()));
        assert_eq!(k.inversion_hazards(), 0);
    }

    #[test]
    fn test_try_lock_when_held() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        k.spawn_fn(TaskConfig::new("a", 2), || {}).unwrap();
        k.start();
        k.task(C0).mutex_lock(m, Timeout::FOREVER).unwrap();
        k.spawn_fn(TaskConfig::new("b", 4), || {}).unwrap();
        assert_eq!(k.task(C0).mutex_try_lock(m), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_timed_out_waiter_drops_boost() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let low = k.spawn_fn(TaskConfig::new("low", 1), || {}).unwrap();
        k.start();
        k.task(C0).mutex_lock(m, Timeout::FOREVER).unwrap();
        let high = k.spawn_fn(TaskConfig::new("high", 5), || {}).unwrap();
        assert!(k.task(C0).mutex_lock(m, Timeout::ticks(2)).unwrap().is_blocked());
        assert_eq!(k.task_info(low).unwrap().effective_priority, Priority(5));

        k.tick();
        k.tick();
        assert_eq!(k.current(C0), Some(high));
        assert_eq!(k.task(C0).finish_wait(), Err(KernelError::Timeout));
        assert_eq!(k.task_info(low).unwrap().effective_priority, Priority(1));
        assert_eq!(k.mutex_info(m).unwrap().waiters, 0);
    }

    #[test]
    fn test_delete_holder_passes_mutex_on() {
        let mut k = kernel();
        let m = k.mutex_create().unwrap();
        let low = k.spawn_fn(TaskConfig::new("low", 1), || {}).unwrap();
        k.start();
        k.task(C0).mutex_lock(m, Timeout::FOREVER).unwrap();
        let high = k.spawn_fn(TaskConfig::new("high", 3), || {}).unwrap();
        assert!(k.task(C0).mutex_lock(m, Timeout::FOREVER).unwrap().is_blocked());

        k.delete(low).unwrap();
        assert_eq!(k.mutex_holder(m), Ok(Some(high)));
        assert_eq!(k.task_state(high), Ok(TaskState::Running));
        assert_eq!(k.delete(low), Err(KernelError::InvalidState));
    }
}
