//! # Task Control Block
//!
//! Defines the task model for TickOS. Each task owns its stack, carries a
//! base priority chosen by the application and an effective priority that
//! priority inheritance may raise, and records what it is waiting for while
//! blocked.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use heapless::String;
use slotmap::new_key_type;

use crate::config::{DEFAULT_TIME_SLICE, MAX_CORES, MAX_PRIORITIES, MAX_TASK_NAME_LEN, MIN_STACK_SIZE};
use crate::sync::{MutexId, QueueId, SemaphoreId};
use crate::time::Tick;

new_key_type! {
    /// Handle to a task. Handles are generational: once a task is deleted
    /// its handle never refers to another task.
    pub struct TaskId;
}

/// Entry closure of a task, owning the task's parameter.
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Task name, truncated to [`MAX_TASK_NAME_LEN`] bytes.
pub type TaskName = String<MAX_TASK_NAME_LEN>;

pub(crate) fn make_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Priorities, cores and affinity
// ---------------------------------------------------------------------------

/// Scheduling priority. Higher values are more urgent; 0 is the idle level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    pub const IDLE: Priority = Priority(0);
    pub const MAX: Priority = Priority((MAX_PRIORITIES - 1) as u8);

    #[inline]
    pub const fn is_valid(&self) -> bool {
        (self.0 as usize) < MAX_PRIORITIES
    }

    #[inline]
    pub const fn level(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Processor core index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u8);

impl CoreId {
    pub const CORE0: CoreId = CoreId(0);
    pub const CORE1: CoreId = CoreId(1);

    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Which cores a task may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// Only ever dispatched on this core.
    Pinned(CoreId),
    /// Dispatched on whichever core selects it first.
    #[default]
    Any,
}

impl Affinity {
    #[inline]
    pub fn allows(&self, core: CoreId) -> bool {
        match self {
            Affinity::Pinned(c) => *c == core,
            Affinity::Any => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task in the scheduler's state machine.
///
/// ```text
///   ┌──────────┐     dispatch        ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///        ▲                                │
///        │      preempt / yield / slice   │
///        ├────────────────────────────────┤
///        │                                │ wait / delay
///        │   grant / timeout         ┌──────────┐
///        ├───────────────────────────│ Blocked  │
///        │                           └──────────┘
///        │   resume                  ┌───────────┐
///        └───────────────────────────│ Suspended │
///                                    └───────────┘
/// ```
///
/// `Terminated` is only observable between deletion and the removal of the
/// control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Task is ready to run and waiting in the run queue.
    Ready,
    /// Task is currently executing on a core.
    Running,
    /// Task is blocked waiting for an event, a resource or a delay.
    Blocked,
    /// Task is suspended by the kernel (not schedulable).
    Suspended,
    /// Task has been deleted and will not be scheduled again.
    Terminated,
}

// ---------------------------------------------------------------------------
// Task configuration
// ---------------------------------------------------------------------------

/// Creation parameters of a task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: TaskName,
    /// Base priority.
    pub priority: Priority,
    /// Stack size in bytes.
    pub stack_size: usize,
    pub affinity: Affinity,
    /// Time slice in ticks. If 0, the kernel default applies.
    pub time_slice: u32,
}

impl TaskConfig {
    pub fn new(name: &str, priority: u8) -> Self {
        Self {
            name: make_name(name),
            priority: Priority(priority),
            stack_size: 1024,
            affinity: Affinity::Any,
            time_slice: 0,
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn pinned(mut self, core: CoreId) -> Self {
        self.affinity = Affinity::Pinned(core);
        self
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn time_slice(mut self, ticks: u32) -> Self {
        self.time_slice = ticks;
        self
    }

    /// Returns the effective time slice, falling back to `default`.
    #[inline]
    pub const fn effective_time_slice(&self, default: u32) -> u32 {
        if self.time_slice > 0 {
            self.time_slice
        } else if default > 0 {
            default
        } else {
            DEFAULT_TIME_SLICE
        }
    }

    pub(crate) fn validate(&self, cores: usize) -> bool {
        let core_ok = match self.affinity {
            Affinity::Pinned(c) => c.index() < cores && c.index() < MAX_CORES,
            Affinity::Any => true,
        };
        core_ok && self.priority.is_valid() && self.stack_size >= MIN_STACK_SIZE
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Byte painted over a fresh stack. Bytes still holding it were never used.
pub const STACK_FILL: u8 = 0xA5;

/// Stack region exclusively owned by one task. Grows downwards from the end
/// of the buffer.
pub struct Stack {
    memory: Box<[u8]>,
}

impl Stack {
    pub fn new(size: usize) -> Self {
        Self {
            memory: alloc::vec![STACK_FILL; size].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Address one past the highest byte.
    pub fn top(&self) -> usize {
        self.memory.as_ptr() as usize + self.memory.len()
    }

    /// Bytes at the bottom of the stack that were never written, i.e. the
    /// minimum headroom the task has had so far.
    pub fn high_water_mark(&self) -> usize {
        self.memory.iter().take_while(|&&b| b == STACK_FILL).count()
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack").field("len", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Wait bookkeeping
// ---------------------------------------------------------------------------

/// What a blocked task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Delay,
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    QueueReceive(QueueId),
    QueueSend(QueueId),
}

/// How a wait ended. Stored on the task until it collects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The resource was handed over, the parked item was queued, or the
    /// delay elapsed.
    Granted,
    /// A queue item was handed over directly.
    Delivered(Box<[u8]>),
    TimedOut,
}

#[derive(Debug, Default)]
pub struct WaitState {
    pub object: Option<WaitObject>,
    /// Absolute tick at which the wait expires.
    pub wake_at: Option<Tick>,
    /// Item parked by a sender blocked on a full queue.
    pub pending_item: Option<Box<[u8]>>,
    pub outcome: Option<WakeOutcome>,
}

impl WaitState {
    pub fn clear(&mut self) {
        self.object = None;
        self.wake_at = None;
        self.pending_item = None;
    }
}

/// Runtime counters of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Ticks during which the task was Running.
    pub run_ticks: u64,
    /// Times the task was switched in.
    pub dispatches: u64,
    /// Times the task's effective priority was raised by inheritance.
    pub boosts: u32,
    /// Waits that ended with a timeout.
    pub timeouts: u32,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB): everything the kernel knows about one task.
#[derive(Debug)]
pub struct TaskControlBlock {
    pub id: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    /// Priority chosen by the application.
    pub base_priority: Priority,
    /// Priority used for scheduling and wait-list ordering; never below the
    /// base priority.
    pub effective_priority: Priority,
    pub affinity: Affinity,
    pub stack: Stack,
    /// Saved stack pointer, maintained by the port.
    pub saved_sp: usize,
    pub time_slice: u32,
    /// Remaining ticks in the current time slice.
    pub ticks_remaining: u32,
    /// Core the task is Running on.
    pub running_on: Option<CoreId>,
    pub wait: WaitState,
    /// Mutexes currently held, in acquisition order.
    pub held_mutexes: Vec<MutexId>,
    pub stats: TaskStats,
    /// Idle and timer service tasks cannot be deleted or suspended.
    pub system: bool,
}

impl TaskControlBlock {
    pub fn new(id: TaskId, config: &TaskConfig, default_slice: u32) -> Self {
        let time_slice = config.effective_time_slice(default_slice);
        Self {
            id,
            name: config.name.clone(),
            state: TaskState::Ready,
            base_priority: config.priority,
            effective_priority: config.priority,
            affinity: config.affinity,
            stack: Stack::new(config.stack_size),
            saved_sp: 0,
            time_slice,
            ticks_remaining: time_slice,
            running_on: None,
            wait: WaitState::default(),
            held_mutexes: Vec::new(),
            stats: TaskStats::default(),
            system: false,
        }
    }

    /// Check if this task is runnable.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Ready
    }

    /// Check if this task can run on the given core.
    #[inline]
    pub fn can_run_on_core(&self, core: CoreId) -> bool {
        self.affinity.allows(core)
    }

    /// Whether inheritance currently lifts this task above its base.
    #[inline]
    pub fn is_boosted(&self) -> bool {
        self.effective_priority > self.base_priority
    }

    pub fn reset_slice(&mut self) {
        self.ticks_remaining = self.time_slice;
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            base_priority: self.base_priority,
            effective_priority: self.effective_priority,
            affinity: self.affinity,
            running_on: self.running_on,
            stack_size: self.stack.len(),
            stack_high_water_mark: self.stack.high_water_mark(),
            held_mutexes: self.held_mutexes.len(),
            stats: self.stats,
        }
    }
}

/// Snapshot of a task for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    pub base_priority: Priority,
    pub effective_priority: Priority,
    pub affinity: Affinity,
    pub running_on: Option<CoreId>,
    pub stack_size: usize,
    pub stack_high_water_mark: usize,
    pub held_mutexes: usize,
    pub stats: TaskStats,
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn tcb(config: TaskConfig) -> TaskControlBlock {
        let mut map: SlotMap<TaskId, ()> = SlotMap::with_key();
        let id = map.insert(());
        TaskControlBlock::new(id, &config, DEFAULT_TIME_SLICE)
    }

    #[test]
    fn test_tcb_initialization() {
        let tcb = tcb(TaskConfig::new("sensor", 5).time_slice(15).pinned(CoreId::CORE1));

        assert_eq!(tcb.state, TaskState::Ready);
        assert_eq!(tcb.base_priority, Priority(5));
        assert_eq!(tcb.effective_priority, Priority(5));
        assert_eq!(tcb.ticks_remaining, 15);
        assert_eq!(tcb.name.as_str(), "sensor");
        assert!(!tcb.is_boosted());
    }

    #[test]
    fn test_name_truncation() {
        let name = make_name("a-very-long-task-name-indeed");
        assert_eq!(name.len(), MAX_TASK_NAME_LEN);
    }

    #[test]
    fn test_affinity() {
        let pinned = tcb(TaskConfig::new("p", 1).pinned(CoreId::CORE0));
        assert!(pinned.can_run_on_core(CoreId::CORE0));
        assert!(!pinned.can_run_on_core(CoreId::CORE1));

        let free = tcb(TaskConfig::new("f", 1));
        assert!(free.can_run_on_core(CoreId::CORE0));
        assert!(free.can_run_on_core(CoreId::CORE1));
    }

    #[test]
    fn test_effective_time_slice_default() {
        let config = TaskConfig::new("t", 1);
        assert_eq!(config.effective_time_slice(4), 4);
        assert_eq!(config.effective_time_slice(0), DEFAULT_TIME_SLICE);
    }

    #[test]
    fn test_config_validation() {
        assert!(TaskConfig::new("ok", 3).validate(2));
        assert!(!TaskConfig::new("prio", MAX_PRIORITIES as u8).validate(2));
        assert!(!TaskConfig::new("stack", 3).stack_size(16).validate(2));
        assert!(!TaskConfig::new("core", 3).pinned(CoreId::CORE1).validate(1));
    }

    #[test]
    fn test_stack_high_water_mark() {
        let mut stack = Stack::new(512);
        assert_eq!(stack.high_water_mark(), 512);

        // simulate 100 bytes of use from the top down
        let len = stack.len();
        for b in &mut stack.as_mut_slice()[len - 100..] {
            *b = 0;
        }
        assert_eq!(stack.high_water_mark(), 412);
    }
}
