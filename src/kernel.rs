//! # Kernel
//!
//! The kernel is one explicitly owned context object. It owns every task
//! control block, the ready queues, all synchronization primitives and the
//! timer service, and is passed by `&mut` to everything that touches them.
//!
//! ## Startup Sequence
//!
//! ```text
//! Kernel::new(config, port)
//!   ├─► idle task per core        ← priority 0, pinned
//!   └─► timer service task        ← command queue + daemon
//! kernel.spawn(..) ×N             ← application tasks
//! kernel.start()                  ← first dispatch on every core
//! tick interrupt ─► kernel.tick() ← timeouts, time slicing, preemption
//! ```
//!
//! Operations that act on behalf of the running task go through
//! [`Kernel::task`]; interrupt handlers only get [`Kernel::isr`], which
//! exposes no blocking call.

use alloc::boxed::Box;
use slotmap::SlotMap;

use crate::arch::Port;
use crate::config::{KernelConfig, IDLE_STACK_SIZE, TCB_OVERHEAD};
use crate::error::{KernelError, Result};
use crate::heap::HeapBudget;
use crate::isr::IsrContext;
use crate::scheduler::Scheduler;
use crate::sync::{
    MutexControlBlock, MutexId, QueueControlBlock, QueueId, SemaphoreControlBlock, SemaphoreId,
};
use crate::task::{
    CoreId, Priority, TaskConfig, TaskControlBlock, TaskEntry, TaskId, TaskInfo, TaskState,
    WaitObject, WakeOutcome,
};
use crate::time::{Tick, TickClock, Timeout};
use crate::timer::TimerService;

/// Result of a call that may block the calling task.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait<T> {
    /// Completed without blocking.
    Ready(T),
    /// The calling task is parked; collect the outcome with
    /// [`TaskContext::finish_wait`] (or `finish_receive`) once it runs again.
    Blocked,
}

impl<T> Wait<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Wait::Blocked)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Wait::Ready(v) => Some(v),
            Wait::Blocked => None,
        }
    }
}

/// Kernel-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub ticks: u64,
    pub context_switches: u64,
    /// Times a mutex holder was raised above its base priority.
    pub inheritance_activations: u64,
    pub timeouts: u64,
    pub timer_callbacks: u64,
    pub tasks_created: u64,
    pub tasks_deleted: u64,
}

pub struct Kernel<P: Port> {
    pub(crate) config: KernelConfig,
    pub(crate) port: P,
    pub(crate) clock: TickClock,
    pub(crate) tasks: SlotMap<TaskId, TaskControlBlock>,
    pub(crate) sched: Scheduler,
    pub(crate) mutexes: SlotMap<MutexId, MutexControlBlock>,
    pub(crate) semaphores: SlotMap<SemaphoreId, SemaphoreControlBlock>,
    pub(crate) queues: SlotMap<QueueId, QueueControlBlock>,
    pub(crate) timers: TimerService<P>,
    pub(crate) heap: HeapBudget,
    pub(crate) stats: KernelStats,
    seq: u64,
}

/// Body of the kernel's own tasks. Their real work (idling, servicing
/// timers) is done by the kernel whenever they are dispatched.
pub(crate) fn system_entry() {
    loop {
        core::hint::spin_loop();
    }
}

impl<P: Port> Kernel<P> {
    /// Build a kernel and its system tasks.
    ///
    /// # Panics
    /// If the heap budget cannot hold the idle tasks and the timer service.
    /// Running out of memory while bootstrapping the kernel is not
    /// recoverable.
    pub fn new(config: KernelConfig, port: P) -> Result<Self> {
        config.validate()?;
        let mut kernel = Self {
            config,
            port,
            clock: TickClock::new(),
            tasks: SlotMap::with_key(),
            sched: Scheduler::new(config.cores),
            mutexes: SlotMap::with_key(),
            semaphores: SlotMap::with_key(),
            queues: SlotMap::with_key(),
            timers: TimerService::new(),
            heap: HeapBudget::new(config.heap_size),
            stats: KernelStats::default(),
            seq: 0,
        };
        kernel.bootstrap();
        Ok(kernel)
    }

    fn bootstrap(&mut self) {
        for c in 0..self.config.cores {
            let core = CoreId(c as u8);
            let name = if c == 0 { "IDLE0" } else { "IDLE1" };
            let config = TaskConfig::new(name, Priority::IDLE.0)
                .stack_size(IDLE_STACK_SIZE)
                .pinned(core);
            match self.spawn_task(config, Box::new(system_entry), true) {
                Ok(id) => self.sched.cores[c].idle = Some(id),
                Err(e) => panic!("kernel bootstrap: cannot create idle task for core {}: {}", c, e),
            }
        }
        if let Err(e) = self.start_timer_service() {
            panic!("kernel bootstrap: cannot create timer service: {}", e);
        }
    }

    /// Dispatch the first task on every core. Tasks spawned before this
    /// call only become eligible now.
    pub fn start(&mut self) {
        if self.sched.started {
            return;
        }
        self.sched.started = true;
        log::info!(
            "kernel started: {} core(s), {} task(s), {} bytes heap free",
            self.config.cores,
            self.tasks.len(),
            self.heap.free()
        );
        for c in 0..self.config.cores {
            self.reschedule(CoreId(c as u8));
        }
        self.settle();
    }

    pub fn is_started(&self) -> bool {
        self.sched.started
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn core_count(&self) -> usize {
        self.config.cores
    }

    /// Ticks since the kernel was created.
    pub fn tick_count(&self) -> Tick {
        self.clock.now()
    }

    /// Task running on `core`.
    pub fn current(&self, core: CoreId) -> Option<TaskId> {
        let id = self.sched.cores.get(core.index())?.current?;
        let tcb = self.tasks.get(id)?;
        (tcb.state == TaskState::Running).then_some(id)
    }

    pub fn idle_task(&self, core: CoreId) -> Option<TaskId> {
        self.sched.cores.get(core.index())?.idle
    }

    pub fn stats(&self) -> KernelStats {
        self.stats
    }

    pub fn free_heap(&self) -> usize {
        self.heap.free()
    }

    pub fn min_ever_free_heap(&self) -> usize {
        self.heap.min_ever_free()
    }

    /// Tasks whose effective priority is currently raised by inheritance.
    /// Each one is a priority inversion in progress.
    pub fn inversion_hazards(&self) -> usize {
        self.tasks.values().filter(|t| t.is_boosted()).count()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.keys()
    }

    pub fn task_info(&self, id: TaskId) -> Result<TaskInfo> {
        Ok(self.tcb(id)?.info())
    }

    pub fn task_state(&self, id: TaskId) -> Result<TaskState> {
        Ok(self.tcb(id)?.state)
    }

    /// Look a task up by name.
    pub fn find_task(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().find(|(_, t)| t.name.as_str() == name).map(|(id, _)| id)
    }

    pub(crate) fn tcb(&self, id: TaskId) -> Result<&TaskControlBlock> {
        self.tasks.get(id).ok_or_else(|| {
            log::error!("stale task handle {:?}", id);
            KernelError::InvalidState
        })
    }

    pub(crate) fn tcb_mut(&mut self, id: TaskId) -> Result<&mut TaskControlBlock> {
        self.tasks.get_mut(id).ok_or_else(|| {
            log::error!("stale task handle {:?}", id);
            KernelError::InvalidState
        })
    }

    /// Next arrival number for wait-list ordering.
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Create a task that runs `entry(param)`. The parameter is moved into
    /// the task, so it cannot outlive the scope that produced it.
    pub fn spawn<T, F>(&mut self, config: TaskConfig, entry: F, param: T) -> Result<TaskId>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.spawn_task(config, Box::new(move || entry(param)), false)
    }

    /// Create a task from a closure that already owns its state.
    pub fn spawn_fn<F>(&mut self, config: TaskConfig, entry: F) -> Result<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(config, Box::new(entry), false)
    }

    pub(crate) fn spawn_task(
        &mut self,
        config: TaskConfig,
        entry: TaskEntry,
        system: bool,
    ) -> Result<TaskId> {
        if !config.validate(self.config.cores) {
            log::warn!("spawn '{}': invalid configuration", config.name);
            return Err(KernelError::InvalidArgument);
        }
        let bytes = config
            .stack_size
            .checked_add(TCB_OVERHEAD)
            .ok_or(KernelError::ResourceExhausted)?;
        self.heap.reserve(bytes)?;

        let slice = self.config.time_slice;
        let id = self
            .tasks
            .insert_with_key(|id| TaskControlBlock::new(id, &config, slice));
        let tcb = &mut self.tasks[id];
        tcb.system = system;
        tcb.saved_sp = self.port.init_stack(id, &mut tcb.stack, entry);
        self.sched.ready.push_back(id, config.priority);
        self.stats.tasks_created += 1;
        log::debug!(
            "spawned '{}' at {} ({:?})",
            config.name,
            config.priority,
            config.affinity
        );

        self.preemption_check(id, None);
        self.settle();
        Ok(id)
    }

    /// Delete a task. A mutex still held by the task passes to its next
    /// waiter.
    pub fn delete(&mut self, id: TaskId) -> Result<()> {
        let tcb = self.tcb(id)?;
        if tcb.system {
            log::error!("refusing to delete system task '{}'", tcb.name);
            return Err(KernelError::InvalidState);
        }
        let running_on = tcb.running_on;
        let state = tcb.state;
        self.detach(id, state);

        let held = core::mem::take(&mut self.tasks[id].held_mutexes);
        for m in held {
            self.force_release(m, id);
        }

        self.tasks[id].state = TaskState::Terminated;
        if let Some(tcb) = self.tasks.remove(id) {
            self.heap.release(tcb.stack.len() + TCB_OVERHEAD);
            log::debug!("deleted '{}'", tcb.name);
        }
        self.port.release_task(id);
        self.stats.tasks_deleted += 1;

        if let Some(core) = running_on {
            self.sched.cores[core.index()].current = None;
            self.reschedule(core);
        }
        self.settle();
        Ok(())
    }

    /// Take a task out of scheduling until [`Kernel::resume`]. A blocked
    /// task's wait is cancelled and reports `Timeout`.
    pub fn suspend(&mut self, id: TaskId) -> Result<()> {
        let tcb = self.tcb(id)?;
        if tcb.system {
            return Err(KernelError::InvalidState);
        }
        let state = tcb.state;
        let running_on = tcb.running_on;
        match state {
            TaskState::Suspended => return Ok(()),
            TaskState::Terminated => return Err(KernelError::InvalidState),
            TaskState::Blocked => {
                self.detach(id, state);
                self.tasks[id].wait.outcome = Some(WakeOutcome::TimedOut);
            }
            _ => self.detach(id, state),
        }
        let tcb = &mut self.tasks[id];
        tcb.state = TaskState::Suspended;
        tcb.running_on = None;
        log::debug!("suspended '{}'", tcb.name);

        if let Some(core) = running_on {
            self.reschedule(core);
        }
        self.settle();
        Ok(())
    }

    /// Make a suspended task ready again. No effect on other states.
    pub fn resume(&mut self, id: TaskId) -> Result<()> {
        if self.tcb(id)?.state != TaskState::Suspended {
            return Ok(());
        }
        self.make_ready(id, None, None);
        self.settle();
        Ok(())
    }

    /// Base priority of a task.
    pub fn priority_get(&self, id: TaskId) -> Result<Priority> {
        Ok(self.tcb(id)?.base_priority)
    }

    /// Change a task's base priority. Inheritance still applies on top.
    pub fn priority_set(&mut self, id: TaskId, priority: Priority) -> Result<()> {
        if !priority.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        self.tcb_mut(id)?.base_priority = priority;
        self.refresh_priority(id, 0);
        self.settle();
        Ok(())
    }

    /// Called by a port when a task's entry function returns.
    ///
    /// # Panics
    /// If the task still exists: a task must delete itself before its
    /// entry function ends.
    pub fn entry_returned(&mut self, id: TaskId) {
        if let Some(tcb) = self.tasks.get(id) {
            log::error!("task '{}' returned from its entry function", tcb.name);
            panic!("task '{}' returned without deleting itself", tcb.name);
        }
    }

    /// Finish a context switch started by [`Port::request_switch`]: store
    /// the outgoing task's stack pointer and return the incoming one's.
    pub fn complete_switch(&mut self, outgoing: Option<TaskId>, sp: usize, incoming: TaskId) -> usize {
        if let Some(tcb) = outgoing.and_then(|id| self.tasks.get_mut(id)) {
            tcb.saved_sp = sp;
        }
        self.tasks.get(incoming).map_or(sp, |t| t.saved_sp)
    }

    /// Remove a task from whatever structure its state puts it in.
    fn detach(&mut self, id: TaskId, state: TaskState) {
        match state {
            TaskState::Ready => {
                let prio = self.tasks[id].effective_priority;
                self.sched.ready.remove(id, prio);
            }
            TaskState::Blocked => {
                let tcb = &mut self.tasks[id];
                if let Some(at) = tcb.wait.wake_at.take() {
                    self.sched.delayed.remove(&(at, id));
                }
                if let Some(object) = tcb.wait.object.take() {
                    self.detach_waiter(id, object);
                }
                self.tasks[id].wait.clear();
            }
            TaskState::Running | TaskState::Suspended | TaskState::Terminated => {}
        }
    }

    /// Remove `id` from the wait-list of `object`. A departing mutex waiter
    /// may have been the reason its holder was boosted.
    pub(crate) fn detach_waiter(&mut self, id: TaskId, object: WaitObject) {
        match object {
            WaitObject::Delay => {}
            WaitObject::Mutex(m) => {
                let holder = self.mutexes.get_mut(m).and_then(|mcb| {
                    mcb.waiters.remove(id);
                    mcb.holder
                });
                if let Some(holder) = holder {
                    self.refresh_priority(holder, 0);
                }
            }
            WaitObject::Semaphore(s) => {
                if let Some(scb) = self.semaphores.get_mut(s) {
                    scb.waiters.remove(id);
                }
            }
            WaitObject::QueueReceive(q) => {
                if let Some(qcb) = self.queues.get_mut(q) {
                    qcb.receivers.remove(id);
                }
            }
            WaitObject::QueueSend(q) => {
                if let Some(qcb) = self.queues.get_mut(q) {
                    qcb.senders.remove(id);
                }
                if let Some(tcb) = self.tasks.get_mut(id) {
                    tcb.wait.pending_item = None;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Capability views
    // -----------------------------------------------------------------------

    /// Task-context API for the task running on `core`.
    pub fn task(&mut self, core: CoreId) -> TaskContext<'_, P> {
        TaskContext { kernel: self, core }
    }

    /// Interrupt-context API for a handler running on `core`.
    pub fn isr(&mut self, core: CoreId) -> IsrContext<'_, P> {
        IsrContext::new(self, core)
    }
}

/// Operations performed by the task currently running on one core.
///
/// Every call acts on behalf of that task; calls that may wait take a
/// [`Timeout`] and return [`Wait`].
pub struct TaskContext<'k, P: Port> {
    pub(crate) kernel: &'k mut Kernel<P>,
    pub(crate) core: CoreId,
}

impl<'k, P: Port> TaskContext<'k, P> {
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Handle of the calling task.
    pub fn id(&self) -> Result<TaskId> {
        self.kernel.running_task(self.core)
    }

    pub fn tick_count(&self) -> Tick {
        self.kernel.tick_count()
    }

    /// Block for `ticks` ticks. A zero delay just yields; delays longer
    /// than [`Timeout::MAX_FINITE`] are clamped to it.
    pub fn delay(&mut self, ticks: u32) -> Result<Wait<()>> {
        if ticks == 0 {
            self.yield_now()?;
            return Ok(Wait::Ready(()));
        }
        self.kernel
            .block_current(self.core, WaitObject::Delay, Timeout::finite(u64::from(ticks)))?;
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(Wait::Blocked)
    }

    /// Block until `*last_wake + period`, then advance `last_wake` by
    /// `period`. Returns immediately when that point already passed.
    pub fn delay_until(&mut self, last_wake: &mut Tick, period: u32) -> Result<Wait<()>> {
        let target = *last_wake + u64::from(period);
        *last_wake = target;
        let now = self.kernel.tick_count();
        if target <= now {
            return Ok(Wait::Ready(()));
        }
        self.delay((target - now) as u32)
    }

    /// Give up the rest of the time slice to an equal or higher priority
    /// task on this core.
    pub fn yield_now(&mut self) -> Result<()> {
        self.kernel.running_task(self.core)?;
        self.kernel.yield_core(self.core);
        self.kernel.settle();
        Ok(())
    }

    pub fn delete_self(&mut self) -> Result<()> {
        let id = self.kernel.running_task(self.core)?;
        self.kernel.delete(id)
    }

    pub fn suspend_self(&mut self) -> Result<()> {
        let id = self.kernel.running_task(self.core)?;
        self.kernel.suspend(id)
    }

    /// Effective priority of the calling task.
    pub fn priority(&self) -> Result<Priority> {
        let id = self.kernel.running_task(self.core)?;
        Ok(self.kernel.tcb(id)?.effective_priority)
    }

    /// Collect the outcome of the last blocking call that returned
    /// [`Wait::Blocked`]: `Ok` when granted, `Err(Timeout)` when it expired.
    pub fn finish_wait(&mut self) -> Result<()> {
        match self.take_outcome()? {
            WakeOutcome::Granted => Ok(()),
            WakeOutcome::TimedOut => Err(KernelError::Timeout),
            WakeOutcome::Delivered(item) => {
                // a received item must go through finish_receive
                let id = self.kernel.running_task(self.core)?;
                self.kernel.tasks[id].wait.outcome = Some(WakeOutcome::Delivered(item));
                Err(KernelError::InvalidState)
            }
        }
    }

    pub(crate) fn take_outcome(&mut self) -> Result<WakeOutcome> {
        let id = self.kernel.running_task(self.core)?;
        self.kernel.tasks[id]
            .wait
            .outcome
            .take()
            .ok_or(KernelError::InvalidState)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
