//! # Architecture Abstraction Layer
//!
//! The kernel decides *what* runs; a [`Port`] makes it happen on real (or
//! simulated) hardware. Two ports exist:
//!
//! - [`sim::SimPort`]: host port that records every switch and keeps task
//!   entry closures so a test harness can run them.
//! - `cortex_m4::CortexM4Port`: PendSV/SysTick port for ARM Cortex-M4,
//!   built only for bare-metal ARM targets.

use crate::task::{CoreId, Stack, TaskEntry, TaskId};

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod rt;
pub mod sim;

/// Hardware seam of the kernel.
pub trait Port: Send + 'static {
    /// Prepare `stack` so that switching to `task` the first time runs
    /// `entry`. Returns the initial stack pointer.
    fn init_stack(&mut self, task: TaskId, stack: &mut Stack, entry: TaskEntry) -> usize;

    /// Switch `core` from `from` to `to`. The switch may complete later
    /// (e.g. at PendSV), but the kernel already treats `to` as running.
    fn request_switch(&mut self, core: CoreId, from: Option<TaskId>, to: TaskId);

    /// Drop any per-task state once `task` is deleted.
    fn release_task(&mut self, _task: TaskId) {}
}
