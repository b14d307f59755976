//! # Interrupt Deferral Boundary
//!
//! Interrupt handlers talk to the kernel only through [`IsrContext`]. It
//! exposes the non-blocking `*_from_isr` variants and nothing that can
//! wait, so a blocking call from interrupt context does not compile.
//!
//! ```text
//!   UART IRQ
//!     ├─► isr.queue_send_from_isr(q, &byte, &mut woken)
//!     ├─► isr.semaphore_give_from_isr(s, &mut woken)
//!     └─► isr.yield_from_isr(woken)   ← switch at interrupt exit
//! ```
//!
//! Wakes never switch the interrupted core by themselves; the handler
//! decides at its epilogue. Other cores a wake outranks are rescheduled
//! immediately.

use crate::arch::Port;
use crate::kernel::Kernel;
use crate::task::CoreId;
use crate::time::Tick;

pub struct IsrContext<'k, P: Port> {
    pub(crate) kernel: &'k mut Kernel<P>,
    pub(crate) core: CoreId,
}

impl<'k, P: Port> IsrContext<'k, P> {
    pub(crate) fn new(kernel: &'k mut Kernel<P>, core: CoreId) -> Self {
        Self { kernel, core }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn tick_count(&self) -> Tick {
        self.kernel.tick_count()
    }

    /// End-of-interrupt reschedule request. Switches this core to the best
    /// ready task when `woken` is set.
    pub fn yield_from_isr(&mut self, woken: bool) {
        if woken {
            self.kernel.reschedule(self.core);
            self.kernel.settle();
        }
    }
}
