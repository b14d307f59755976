//! # TickOS Configuration
//!
//! Compile-time constants bound the kernel's fixed structures; the runtime
//! [`KernelConfig`] selects values within those bounds when a [`Kernel`] is
//! built.
//!
//! [`Kernel`]: crate::kernel::Kernel

use crate::error::{KernelError, Result};
use crate::task::Priority;

/// Number of distinct priority levels. Priority 0 is the idle level and
/// `MAX_PRIORITIES - 1` the highest. Must not exceed 32 (one bit per level
/// in the ready-queue bitmap).
pub const MAX_PRIORITIES: usize = 25;

/// Number of processor cores the kernel can schedule. Tasks may be pinned
/// to either core or left free to run on whichever core asks first.
pub const MAX_CORES: usize = 2;

/// Tick frequency in Hz. Determines the resolution of delays, timeouts and
/// timer periods.
pub const TICK_HZ: u32 = 1000;

/// Default time slice in ticks. A task runs for this many ticks before
/// equal-priority peers get the CPU.
pub const DEFAULT_TIME_SLICE: u32 = 1;

/// Bytes available to the kernel heap by default. Task stacks, queue
/// storage and control blocks are all charged against it.
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

/// Smallest stack a task may be created with, in bytes.
pub const MIN_STACK_SIZE: usize = 256;

/// Longest task or timer name kept by the kernel. Longer names are
/// truncated.
pub const MAX_TASK_NAME_LEN: usize = 16;

/// Accounting cost of one task control block.
pub const TCB_OVERHEAD: usize = 96;

/// Accounting cost of one mutex, semaphore, queue or timer control block.
pub const OBJECT_OVERHEAD: usize = 80;

/// Depth of the timer service command queue.
pub const TIMER_QUEUE_LEN: usize = 10;

/// Default priority of the timer service task.
pub const TIMER_TASK_PRIORITY: u8 = 1;

/// Stack size of the timer service task in bytes.
pub const TIMER_TASK_STACK_SIZE: usize = 2048;

/// Stack size of each idle task in bytes.
pub const IDLE_STACK_SIZE: usize = 512;

/// Longest chain of mutex holders a single priority change is propagated
/// through. Bounds the work done when waits form a cycle (deadlock).
pub const MAX_INHERITANCE_DEPTH: usize = 8;

/// Spin iterations an interrupt-context critical section entry tries before
/// giving up.
pub const ISR_SPIN_LIMIT: u32 = 10_000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Runtime kernel configuration.
///
/// ```
/// use tickos::config::KernelConfig;
///
/// let config = KernelConfig::default().with_cores(1).with_heap_size(16 * 1024);
/// assert_eq!(config.cores, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Cores to schedule (1 or 2).
    pub cores: usize,
    /// Heap budget in bytes.
    pub heap_size: usize,
    /// Round-robin slice in ticks for tasks that do not set their own.
    pub time_slice: u32,
    /// Tick rate used by millisecond conversions.
    pub tick_hz: u32,
    /// Priority of the timer service task.
    pub timer_task_priority: Priority,
    /// Stack of the timer service task in bytes.
    pub timer_task_stack: usize,
    /// Capacity of the timer command queue.
    pub timer_queue_len: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cores: MAX_CORES,
            heap_size: DEFAULT_HEAP_SIZE,
            time_slice: DEFAULT_TIME_SLICE,
            tick_hz: TICK_HZ,
            timer_task_priority: Priority(TIMER_TASK_PRIORITY),
            timer_task_stack: TIMER_TASK_STACK_SIZE,
            timer_queue_len: TIMER_QUEUE_LEN,
        }
    }
}

impl KernelConfig {
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    pub fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice = ticks;
        self
    }

    pub fn with_tick_hz(mut self, hz: u32) -> Self {
        self.tick_hz = hz;
        self
    }

    pub fn with_timer_task_priority(mut self, priority: u8) -> Self {
        self.timer_task_priority = Priority(priority);
        self
    }

    pub fn with_timer_queue_len(mut self, len: usize) -> Self {
        self.timer_queue_len = len;
        self
    }

    /// Check every field against the compile-time bounds.
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 || self.cores > MAX_CORES {
            return Err(KernelError::InvalidArgument);
        }
        if self.time_slice == 0 || self.tick_hz == 0 || self.timer_queue_len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !self.timer_task_priority.is_valid() || self.timer_task_stack < MIN_STACK_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(KernelConfig::default().with_cores(0).validate().is_err());
        assert!(KernelConfig::default().with_cores(MAX_CORES + 1).validate().is_err());
        assert!(KernelConfig::default().with_time_slice(0).validate().is_err());
        assert!(KernelConfig::default()
            .with_timer_task_priority(MAX_PRIORITIES as u8)
            .validate()
            .is_err());
    }
}
