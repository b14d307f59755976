//! # Cortex-M4 Port
//!
//! [`Port`] implementation for ARM Cortex-M4 (Thumb-2): stack frames for
//! new tasks, PendSV context switching and the SysTick tick.
//!
//! ## Stacks
//!
//! Interrupt handlers and the kernel run on MSP; tasks run in Thread mode
//! on PSP. Exception entry pushes R0-R3, R12, LR, PC and xPSR to the task's
//! stack in hardware, and PendSV pushes R4-R11 beside them, so a switch is
//! a matter of swapping PSP values.
//!
//! The kernel picks the next task inside whichever call changed readiness.
//! [`CortexM4Port::request_switch`] only records that decision and pends
//! PendSV, which carries it out once no other exception is active.
//!
//! ## Exception Priorities
//!
//! SysTick and PendSV both sit at 0xFF, below every device interrupt.

use alloc::boxed::Box;
use core::arch::{asm, naked_asm};

use cortex_m::peripheral::syst::SystClkSource;

use super::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::shared::SharedKernel;
use crate::task::{CoreId, Stack, TaskEntry, TaskId};

/// The firmware's kernel instance.
pub static KERNEL: SharedKernel<CortexM4Port> = SharedKernel::new();

/// xPSR with only the Thumb bit set.
const INITIAL_XPSR: u32 = 0x0100_0000;

#[derive(Debug, Default)]
pub struct CortexM4Port {
    /// Switch waiting for PendSV: (task on the CPU, task to load).
    pending: Option<(Option<TaskId>, TaskId)>,
    started: bool,
}

impl CortexM4Port {
    pub const fn new() -> Self {
        Self {
            pending: None,
            started: false,
        }
    }

    fn take_pending(&mut self) -> Option<(Option<TaskId>, TaskId)> {
        self.pending.take()
    }
}

impl Port for CortexM4Port {
    /// Build the initial frame so the first PendSV "return" enters
    /// [`task_trampoline`] with the boxed entry in R0.
    ///
    /// ## Stack Layout (top = high address, growing down)
    ///
    /// ```text
    /// [Hardware stacked frame]
    ///   xPSR  (Thumb bit set)
    ///   PC    (task_trampoline)
    ///   LR    (task_exit)
    ///   R12, R3, R2, R1 (0)
    ///   R0    (entry closure)
    /// [Software saved context]
    ///   R11 … R4 (0)              <- initial stack pointer
    /// ```
    fn init_stack(&mut self, _task: TaskId, stack: &mut Stack, entry: TaskEntry) -> usize {
        let base = stack.top() - stack.len();
        // Align to 8 bytes (AAPCS requirement)
        let frame = ((stack.top() & !0x07) - 16 * 4) - base;
        let arg = Box::into_raw(Box::new(entry)) as usize as u32;

        let mut words = [0u32; 16];
        words[8] = arg; // R0
        words[13] = task_exit as usize as u32; // LR
        words[14] = task_trampoline as usize as u32; // PC
        words[15] = INITIAL_XPSR;

        let memory = stack.as_mut_slice();
        for (i, word) in words.iter().enumerate() {
            let at = frame + i * 4;
            memory[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        base + frame
    }

    fn request_switch(&mut self, core: CoreId, from: Option<TaskId>, to: TaskId) {
        if core != CoreId::CORE0 {
            log::error!("cortex-m4 port drives a single core");
            return;
        }
        // several decisions before PendSV runs collapse into one switch
        let from = self.pending.map_or(from, |(first, _)| first);
        self.pending = Some((from, to));
        if self.started {
            trigger_pendsv();
        }
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer for the scheduler tick.
///
/// Sets up SysTick to fire at `TICK_HZ` frequency using the processor
/// clock. Each tick calls `Kernel::tick()`.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Trigger a PendSV exception to perform a context switch.
///
/// Sets the PENDSVSET bit in the Interrupt Control and State Register (ICSR).
#[inline]
pub fn trigger_pendsv() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    // SAFETY: SHPR3 is a memory-mapped system register; only the PendSV and
    // SysTick priority fields are changed.
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        core::ptr::write_volatile(shpr3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// Start and task exit
// ---------------------------------------------------------------------------

/// Start the kernel installed in [`KERNEL`] and enter its first task.
/// Never returns.
pub fn start(syst: &mut cortex_m::peripheral::SYST) -> ! {
    set_interrupt_priorities();
    let first = KERNEL.with(|k| {
        k.start();
        let (_, to) = k.port_mut().take_pending()?;
        k.port_mut().started = true;
        Some(k.complete_switch(None, 0, to))
    });
    let Some(Some(psp)) = first else {
        panic!("kernel not initialised or nothing to run");
    };
    configure_systick(syst);
    // SAFETY: `psp` is the initial frame built by `init_stack`.
    unsafe { start_first_task(psp as *const u32) }
}

/// Switch to PSP and branch to the first task via its initial frame.
///
/// # Safety
/// Must only be called once, with a frame produced by `init_stack`.
unsafe fn start_first_task(psp: *const u32) -> ! {
    asm!(
        // Skip the software-saved R4-R11
        "adds r0, #32",
        "msr psp, r0",
        // Thread mode uses PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",
        // Pop the hardware frame by hand; this is not an exception return
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR (task_exit)
        "pop {{r5}}",          // PC (task_trampoline)
        "pop {{r6}}",          // xPSR
        "mov lr, r4",
        "cpsie i",
        "bx r5",
        in("r0") psp,
        options(noreturn)
    );
}

/// First code a task executes: unbox and run its entry closure.
extern "C" fn task_trampoline(entry: *mut TaskEntry) -> ! {
    // SAFETY: `entry` came from `Box::into_raw` in `init_stack` and is
    // consumed exactly once, here.
    let entry = unsafe { Box::from_raw(entry) };
    entry();
    task_exit()
}

/// Reached when an entry function returns. A task that deleted itself
/// never gets here; any other task is a fatal error.
extern "C" fn task_exit() -> ! {
    KERNEL.with(|k| {
        if let Some(id) = k.current(CoreId::CORE0) {
            k.entry_returned(id);
        }
    });
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV handler: performs the context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. Hand the PSP to the kernel, get the next task's PSP back
/// 3. Restore R4–R11 from the new task's stack
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// # Safety
/// Naked exception handler; follows the Cortex-M4 exception convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch = sym pendsv_switch,
    );
}

/// Store the outgoing PSP and return the incoming one. Called from PendSV.
extern "C" fn pendsv_switch(psp: usize) -> usize {
    KERNEL
        .with(|k| match k.port_mut().take_pending() {
            Some((from, to)) => k.complete_switch(from, psp, to),
            None => psp,
        })
        .unwrap_or(psp)
}

/// SysTick handler: one kernel tick.
#[no_mangle]
pub extern "C" fn SysTick() {
    KERNEL.with(|k| k.tick());
}
