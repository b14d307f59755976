//! Shared helpers for the host integration tests.

#![allow(dead_code)]

use tickos::{CoreId, Kernel, KernelConfig, SimPort, Tick};

pub const C0: CoreId = CoreId::CORE0;
pub const C1: CoreId = CoreId::CORE1;

/// Timer service priority used by most tests: above every application
/// task, so it runs, parks on its command queue and stays out of the way.
pub const TIMER_PRIORITY: u8 = 20;

pub fn config(cores: usize) -> KernelConfig {
    KernelConfig::default()
        .with_cores(cores)
        .with_timer_task_priority(TIMER_PRIORITY)
}

pub fn kernel(cores: usize) -> Kernel<SimPort> {
    Kernel::new(config(cores), SimPort::new()).unwrap()
}

/// Tick until the clock reads `at`.
pub fn run_until(k: &mut Kernel<SimPort>, at: Tick) {
    while k.tick_count() < at {
        k.tick();
    }
}
