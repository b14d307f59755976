//! # Shared Kernel Instance
//!
//! Interrupt handlers have no way to receive a `&mut Kernel`, so firmware
//! keeps the kernel in a [`SharedKernel`] static:
//!
//! ```text
//!   static KERNEL: SharedKernel<MyPort> = SharedKernel::new();
//!
//!   KERNEL.init(kernel)?;            // once, before interrupts are enabled
//!   KERNEL.with(|k| k.tick());       // from any context
//!   KERNEL.teardown();               // hands the kernel back
//! ```
//!
//! Every access runs inside a critical section. Re-entrant access (from
//! inside `with`) is refused rather than aliased.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::arch::Port;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;

pub struct SharedKernel<P: Port> {
    inner: Mutex<RefCell<Option<Kernel<P>>>>,
}

impl<P: Port> SharedKernel<P> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Install `kernel`. Fails with `InvalidState` if one is installed.
    pub fn init(&self, kernel: Kernel<P>) -> Result<()> {
        critical_section::with(|cs| {
            let mut slot = self.inner.borrow_ref_mut(cs);
            if slot.is_some() {
                return Err(KernelError::InvalidState);
            }
            *slot = Some(kernel);
            Ok(())
        })
    }

    /// Run `f` on the kernel. `None` when no kernel is installed or the
    /// call is nested inside another `with`.
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel<P>) -> R) -> Option<R> {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let Ok(mut slot) = cell.try_borrow_mut() else {
                log::error!("nested access to the shared kernel");
                return None;
            };
            slot.as_mut().map(f)
        })
    }

    pub fn is_initialized(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow(cs).try_borrow().map_or(true, |k| k.is_some()))
    }

    /// Remove and return the kernel.
    pub fn teardown(&self) -> Option<Kernel<P>> {
        critical_section::with(|cs| self.inner.borrow(cs).try_borrow_mut().ok()?.take())
    }
}

impl<P: Port> Default for SharedKernel<P> {
    fn default() -> Self {
        Self::new()
    }
}
