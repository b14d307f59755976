//! # Critical Sections and Spinlocks
//!
//! Short mutual exclusion below the blocking primitives.
//!
//! - [`SpinLock`]: one lock word per protected domain. The owning core may
//!   re-enter it from the context that took it; other cores spin.
//! - Task context: entering also suspends the local scheduler, so no
//!   switch happens on this core until the matching exit. A switch
//!   requested meanwhile is applied on exit.
//! - Interrupt context: entry spins at most [`ISR_SPIN_LIMIT`] times and
//!   then gives up with `Timeout`. A lock the interrupted task holds is
//!   refused with `WouldBlock`.
//! - [`interrupt_free`]: run a closure with interrupts masked on this core
//!   (the `critical-section` implementation of the target).
//!
//! Blocking while a critical section is open is refused with
//! `InvalidState`.

use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::CriticalSection;

use crate::arch::Port;
use crate::config::ISR_SPIN_LIMIT;
use crate::error::{KernelError, Result};
use crate::isr::IsrContext;
use crate::kernel::TaskContext;
use crate::task::CoreId;

/// Execute a closure with interrupts disabled on the current core.
///
/// Keep it short: every interrupt on this core waits for it.
#[inline]
pub fn interrupt_free<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Which side of the interrupt boundary took a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Task,
    Isr,
}

/// Cross-core lock word. `0` when free, otherwise owning core + 1, with
/// [`ISR_HELD`] set when an interrupt handler took it.
#[derive(Debug, Default)]
pub struct SpinLock {
    owner: AtomicU32,
    nesting: AtomicU32,
}

const ISR_HELD: u32 = 1 << 8;

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
            nesting: AtomicU32::new(0),
        }
    }

    #[inline]
    fn token(cpu: CoreId, ctx: Context) -> u32 {
        let core = u32::from(cpu.0) + 1;
        match ctx {
            Context::Task => core,
            Context::Isr => core | ISR_HELD,
        }
    }

    /// Acquire once from task context, or re-enter when this core's task
    /// context already owns the lock.
    pub fn try_lock(&self, cpu: CoreId) -> bool {
        self.try_lock_in(cpu, Context::Task)
    }

    /// Re-entry is only granted to the same core in the same context.
    pub fn try_lock_in(&self, cpu: CoreId, ctx: Context) -> bool {
        let token = Self::token(cpu, ctx);
        match self
            .owner
            .compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                self.nesting.store(1, Ordering::Relaxed);
                true
            }
            Err(owner) if owner == token => {
                self.nesting.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Spin until acquired.
    pub fn lock(&self, cpu: CoreId) {
        while !self.try_lock(cpu) {
            core::hint::spin_loop();
        }
    }

    /// Spin at most `spins` times.
    pub fn lock_bounded(&self, cpu: CoreId, ctx: Context, spins: u32) -> bool {
        for _ in 0..spins {
            if self.try_lock_in(cpu, ctx) {
                return true;
            }
            core::hint::spin_loop();
        }
        self.try_lock_in(cpu, ctx)
    }

    pub fn unlock(&self, cpu: CoreId) -> Result<()> {
        self.unlock_in(cpu, Context::Task)
    }

    pub fn unlock_in(&self, cpu: CoreId, ctx: Context) -> Result<()> {
        if self.owner.load(Ordering::Relaxed) != Self::token(cpu, ctx) {
            return Err(KernelError::NotOwner);
        }
        if self.nesting.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<CoreId> {
        self.holder().map(|(cpu, _)| cpu)
    }

    /// Owning core and the context it holds the lock in.
    pub fn holder(&self) -> Option<(CoreId, Context)> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            n => {
                let ctx = if n & ISR_HELD != 0 { Context::Isr } else { Context::Task };
                Some((CoreId(((n & !ISR_HELD) - 1) as u8), ctx))
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }
}

impl<'k, P: Port> TaskContext<'k, P> {
    /// Take `lock` and suspend scheduling on this core.
    pub fn enter_critical(&mut self, lock: &SpinLock) -> Result<()> {
        self.kernel.running_task(self.core)?;
        if lock.holder() == Some((self.core, Context::Isr)) {
            return Err(KernelError::InvalidState);
        }
        lock.lock(self.core);
        self.kernel.sched.cores[self.core.index()].suspended += 1;
        Ok(())
    }

    /// Release `lock`. Leaving the outermost section applies any switch
    /// that was deferred.
    pub fn exit_critical(&mut self, lock: &SpinLock) -> Result<()> {
        if self.kernel.sched.cores[self.core.index()].suspended == 0 {
            return Err(KernelError::InvalidState);
        }
        lock.unlock(self.core)?;
        let state = &mut self.kernel.sched.cores[self.core.index()];
        state.suspended -= 1;
        if state.suspended == 0 && state.yield_pending {
            state.yield_pending = false;
            log::trace!("core {}: applying deferred switch", self.core.0);
            self.kernel.reschedule(self.core);
            self.kernel.settle();
        }
        Ok(())
    }

    /// Run `f` inside `lock`'s critical section.
    pub fn critical<R>(&mut self, lock: &SpinLock, f: impl FnOnce(&mut Self) -> R) -> Result<R> {
        self.enter_critical(lock)?;
        let out = f(self);
        self.exit_critical(lock)?;
        Ok(out)
    }
}

impl<'k, P: Port> IsrContext<'k, P> {
    /// Take `lock` from an interrupt handler, spinning a bounded number of
    /// times.
    ///
    /// A lock held by the task this handler interrupted cannot be released
    /// before the handler returns, so that case fails at once with
    /// `WouldBlock`.
    pub fn enter_critical_from_isr(&mut self, lock: &SpinLock) -> Result<()> {
        if lock.holder() == Some((self.core, Context::Task)) {
            log::warn!("core {}: spinlock held by the interrupted task", self.core.0);
            return Err(KernelError::WouldBlock);
        }
        if lock.lock_bounded(self.core, Context::Isr, ISR_SPIN_LIMIT) {
            Ok(())
        } else {
            log::warn!("core {}: spinlock held by core {:?}", self.core.0, lock.owner());
            Err(KernelError::Timeout)
        }
    }

    pub fn exit_critical_from_isr(&mut self, lock: &SpinLock) -> Result<()> {
        lock.unlock_in(self.core, Context::Isr)
    }
}
