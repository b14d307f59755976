//! # Semaphores
//!
//! Counting semaphores without ownership. Any task or interrupt may give,
//! any task may take. A binary semaphore is a counting semaphore with a
//! maximum of one. There is no priority inheritance here; use a mutex to
//! guard a resource.

use crate::arch::Port;
use crate::config::OBJECT_OVERHEAD;
use crate::error::{KernelError, Result};
use crate::isr::IsrContext;
use crate::kernel::{Kernel, TaskContext, Wait};
use crate::sync::{SemaphoreId, WaitList};
use crate::task::{CoreId, WaitObject, WakeOutcome};
use crate::time::Timeout;

#[derive(Debug)]
pub struct SemaphoreControlBlock {
    pub count: u32,
    pub max: u32,
    pub waiters: WaitList,
}

impl<P: Port> Kernel<P> {
    /// Counting semaphore holding `initial` of at most `max` tokens.
    pub fn semaphore_create_counting(&mut self, max: u32, initial: u32) -> Result<SemaphoreId> {
        if max == 0 || initial > max {
            return Err(KernelError::InvalidArgument);
        }
        self.heap.reserve(OBJECT_OVERHEAD)?;
        Ok(self.semaphores.insert(SemaphoreControlBlock {
            count: initial,
            max,
            waiters: WaitList::new(),
        }))
    }

    /// Binary semaphore, created empty.
    pub fn semaphore_create_binary(&mut self) -> Result<SemaphoreId> {
        self.semaphore_create_counting(1, 0)
    }

    pub fn semaphore_destroy(&mut self, id: SemaphoreId) -> Result<()> {
        let scb = self.semaphores.get(id).ok_or(KernelError::InvalidState)?;
        if !scb.waiters.is_empty() {
            log::error!("semaphore {:?} destroyed with {} waiter(s)", id, scb.waiters.len());
            return Err(KernelError::InvalidState);
        }
        self.semaphores.remove(id);
        self.heap.release(OBJECT_OVERHEAD);
        Ok(())
    }

    /// Tokens currently available.
    pub fn semaphore_count(&self, id: SemaphoreId) -> Result<u32> {
        Ok(self.semaphores.get(id).ok_or(KernelError::InvalidState)?.count)
    }

    /// Hand a token to the best waiter or add it to the count. Giving at
    /// the maximum is accepted and changes nothing.
    fn give_semaphore(&mut self, id: SemaphoreId, local: Option<CoreId>) -> Result<bool> {
        let scb = self.semaphores.get_mut(id).ok_or(KernelError::InvalidState)?;
        match scb.waiters.pop() {
            Some(waiter) => Ok(self.make_ready(waiter, Some(WakeOutcome::Granted), local)),
            None => {
                if scb.count < scb.max {
                    scb.count += 1;
                }
                Ok(false)
            }
        }
    }

    fn try_take_semaphore(&mut self, id: SemaphoreId) -> Result<bool> {
        let scb = self.semaphores.get_mut(id).ok_or(KernelError::InvalidState)?;
        if scb.count > 0 {
            scb.count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl<'k, P: Port> TaskContext<'k, P> {
    /// Take a token, waiting at most `timeout` for one.
    pub fn semaphore_take(&mut self, sem: SemaphoreId, timeout: Timeout) -> Result<Wait<()>> {
        let id = self.kernel.running_task(self.core)?;
        if self.kernel.try_take_semaphore(sem)? {
            return Ok(Wait::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        let prio = self.kernel.tasks[id].effective_priority;
        self.kernel
            .block_current(self.core, WaitObject::Semaphore(sem), timeout)?;
        let seq = self.kernel.next_seq();
        self.kernel.semaphores[sem].waiters.insert(id, prio, seq);
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(Wait::Blocked)
    }

    pub fn semaphore_give(&mut self, sem: SemaphoreId) -> Result<()> {
        self.kernel.give_semaphore(sem, Some(self.core))?;
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(())
    }
}

impl<'k, P: Port> IsrContext<'k, P> {
    /// Give from an interrupt handler. `woken` is set when a task that
    /// outranks this core's running task was released; pass it to
    /// [`IsrContext::yield_from_isr`] at the end of the handler.
    pub fn semaphore_give_from_isr(&mut self, sem: SemaphoreId, woken: &mut bool) -> Result<()> {
        if self.kernel.give_semaphore(sem, Some(self.core))? {
            *woken = true;
        }
        Ok(())
    }

    /// Take without waiting; `Err(WouldBlock)` when no token is available.
    /// Taking never releases a task, so `_woken` is left untouched.
    pub fn semaphore_take_from_isr(&mut self, sem: SemaphoreId, _woken: &mut bool) -> Result<()> {
        if self.kernel.try_take_semaphore(sem)? {
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }
}
