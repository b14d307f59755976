//! # Firmware Task API
//!
//! Blocking wrappers used by task code on the Cortex-M4 port. Each call
//! runs one kernel operation on [`KERNEL`]; when the operation parks the
//! task, PendSV fires as soon as the critical section ends and the task
//! resumes here once it is woken, then collects its outcome.
//!
//! ```text
//!   task code ──► rt::mutex_lock(m, t)
//!                   │ KERNEL.with(.. mutex_lock ..) ─► Wait::Blocked
//!                   │ ── PendSV: switched out ──
//!                   │ ── woken, switched back in ──
//!                   └ KERNEL.with(.. finish_wait ..) ─► Ok / Timeout
//! ```

use crate::arch::cortex_m4::{CortexM4Port, KERNEL};
use crate::error::{KernelError, Result};
use crate::kernel::{TaskContext, Wait};
use crate::sync::{MutexId, QueueId, QueueItem, SemaphoreId};
use crate::task::{CoreId, TaskConfig, TaskId};
use crate::time::{Tick, Timeout};
use crate::timer::TimerId;

const CORE: CoreId = CoreId::CORE0;

fn with_task<R>(f: impl FnOnce(&mut TaskContext<'_, CortexM4Port>) -> Result<R>) -> Result<R> {
    KERNEL
        .with(|k| f(&mut k.task(CORE)))
        .unwrap_or(Err(KernelError::InvalidState))
}

/// Run `op`; if it blocked, wait to be switched back in and `finish`.
fn block_on<T>(
    op: impl FnOnce(&mut TaskContext<'_, CortexM4Port>) -> Result<Wait<T>>,
    finish: impl FnOnce(&mut TaskContext<'_, CortexM4Port>) -> Result<T>,
) -> Result<T> {
    match with_task(op)? {
        Wait::Ready(v) => Ok(v),
        Wait::Blocked => {
            // PendSV is taken here, before the next instruction
            cortex_m::asm::isb();
            with_task(finish)
        }
    }
}

pub fn current() -> Result<TaskId> {
    with_task(|t| t.id())
}

pub fn tick_count() -> Tick {
    KERNEL.with(|k| k.tick_count()).unwrap_or(0)
}

pub fn spawn(config: TaskConfig, entry: impl FnOnce() + Send + 'static) -> Result<TaskId> {
    KERNEL
        .with(|k| k.spawn_fn(config, entry))
        .unwrap_or(Err(KernelError::InvalidState))
}

pub fn delay(ticks: u32) -> Result<()> {
    block_on(|t| t.delay(ticks), |t| t.finish_wait())
}

pub fn delay_until(last_wake: &mut Tick, period: u32) -> Result<()> {
    block_on(|t| t.delay_until(last_wake, period), |t| t.finish_wait())
}

pub fn yield_now() -> Result<()> {
    with_task(|t| t.yield_now())
}

/// Delete the calling task. Does not return on success.
pub fn delete_self() -> Result<()> {
    with_task(|t| t.delete_self())
}

pub fn mutex_lock(mutex: MutexId, timeout: Timeout) -> Result<()> {
    block_on(|t| t.mutex_lock(mutex, timeout), |t| t.finish_wait())
}

pub fn mutex_unlock(mutex: MutexId) -> Result<()> {
    with_task(|t| t.mutex_unlock(mutex))
}

pub fn semaphore_take(sem: SemaphoreId, timeout: Timeout) -> Result<()> {
    block_on(|t| t.semaphore_take(sem, timeout), |t| t.finish_wait())
}

pub fn semaphore_give(sem: SemaphoreId) -> Result<()> {
    with_task(|t| t.semaphore_give(sem))
}

pub fn queue_send<T: QueueItem>(queue: QueueId, item: &T, timeout: Timeout) -> Result<()> {
    block_on(|t| t.queue_send(queue, item, timeout), |t| t.finish_wait())
}

pub fn queue_receive<T: QueueItem>(queue: QueueId, timeout: Timeout) -> Result<T> {
    block_on(|t| t.queue_receive(queue, timeout), |t| t.finish_receive())
}

pub fn timer_start(timer: TimerId, timeout: Timeout) -> Result<()> {
    block_on(|t| t.timer_start(timer, timeout), |t| t.finish_wait())
}

pub fn timer_stop(timer: TimerId, timeout: Timeout) -> Result<()> {
    block_on(|t| t.timer_stop(timer, timeout), |t| t.finish_wait())
}
