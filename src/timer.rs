//! # Software Timer Service
//!
//! Timers are owned by a dedicated service task. Tasks and interrupts
//! never touch timer state; they post commands to the service's command
//! queue, which is the single point where timer changes are ordered.
//!
//! ```text
//!   timer_start / _from_isr ──► [ command queue ] ──► service task
//!                                                       │ 1. drain commands
//!                                                       │ 2. fire expired
//!                                                       │ 3. wait for next
//!                                                       ▼    deadline or command
//!                                              callback(id, &mut IsrContext)
//! ```
//!
//! Auto-reload timers are re-armed at `deadline + period`, so a late firing
//! does not shift later ones. Callbacks run inside the service task and get
//! an [`IsrContext`]: they can signal tasks but cannot block.
//!
//! The service task's loop is executed by the kernel on the task's behalf
//! whenever the task is the one dispatched on its core.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;

use slotmap::{new_key_type, Key, KeyData, SlotMap};

use crate::arch::Port;
use crate::config::OBJECT_OVERHEAD;
use crate::error::{KernelError, Result};
use crate::isr::IsrContext;
use crate::kernel::{system_entry, Kernel, TaskContext, Wait};
use crate::sync::{QueueId, QueueItem};
use crate::task::{make_name, CoreId, TaskConfig, TaskId, TaskName, WaitObject, WakeOutcome};
use crate::time::{Tick, Timeout};

new_key_type! {
    /// Handle to a software timer.
    pub struct TimerId;
}

/// Core the service task is pinned to.
pub const TIMER_CORE: CoreId = CoreId::CORE0;

/// Timer callback. Runs in the timer service task.
pub type TimerCallback<P> = Box<dyn FnMut(TimerId, &mut IsrContext<'_, P>) + Send + 'static>;

pub struct TimerControlBlock<P: Port> {
    pub name: TaskName,
    pub period: u32,
    pub auto_reload: bool,
    pub active: bool,
    /// Next expiry while active.
    pub deadline: Option<Tick>,
    /// Application value attached to the timer.
    pub id_value: u32,
    pub fired: u64,
    callback: Option<TimerCallback<P>>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TimerOp {
    Start = 1,
    Reset = 2,
    Stop = 3,
    ChangePeriod = 4,
    Delete = 5,
}

impl TimerOp {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Start,
            2 => Self::Reset,
            3 => Self::Stop,
            4 => Self::ChangePeriod,
            5 => Self::Delete,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerCommand {
    op: u8,
    timer: TimerId,
    /// Tick at which the command was posted; start and reset count from here.
    issued: Tick,
    arg: u32,
}

impl QueueItem for TimerCommand {
    const SIZE: usize = 21;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.op;
        out[1..9].copy_from_slice(&self.timer.data().as_ffi().to_le_bytes());
        out[9..17].copy_from_slice(&self.issued.to_le_bytes());
        out[17..21].copy_from_slice(&self.arg.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let word = |range: core::ops::Range<usize>| {
            let mut raw = [0u8; 8];
            raw[..range.len()].copy_from_slice(&bytes[range]);
            u64::from_le_bytes(raw)
        };
        Self {
            op: bytes[0],
            timer: KeyData::from_ffi(word(1..9)).into(),
            issued: word(9..17),
            arg: word(17..21) as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Service state
// ---------------------------------------------------------------------------

pub struct TimerService<P: Port> {
    pub(crate) timers: SlotMap<TimerId, TimerControlBlock<P>>,
    /// Active timers by deadline.
    active: BTreeSet<(Tick, TimerId)>,
    pub(crate) queue: Option<QueueId>,
    pub(crate) task: Option<TaskId>,
    in_service: bool,
}

impl<P: Port> TimerService<P> {
    pub fn new() -> Self {
        Self {
            timers: SlotMap::with_key(),
            active: BTreeSet::new(),
            queue: None,
            task: None,
            in_service: false,
        }
    }
}

impl<P: Port> Default for TimerService<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> Kernel<P> {
    pub(crate) fn start_timer_service(&mut self) -> Result<()> {
        let queue = self.queue_create(self.config.timer_queue_len, TimerCommand::SIZE)?;
        self.timers.queue = Some(queue);
        let config = TaskConfig::new("Tmr Svc", self.config.timer_task_priority.0)
            .stack_size(self.config.timer_task_stack)
            .pinned(TIMER_CORE);
        let task = self.spawn_task(config, Box::new(system_entry), true)?;
        self.timers.task = Some(task);
        Ok(())
    }

    pub fn timer_task(&self) -> Option<TaskId> {
        self.timers.task
    }

    /// Create an inactive timer firing every `period` ticks (once, unless
    /// `auto_reload`).
    pub fn timer_create<F>(
        &mut self,
        name: &str,
        period: u32,
        auto_reload: bool,
        id_value: u32,
        callback: F,
    ) -> Result<TimerId>
    where
        F: FnMut(TimerId, &mut IsrContext<'_, P>) + Send + 'static,
    {
        if period == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.heap.reserve(OBJECT_OVERHEAD)?;
        Ok(self.timers.timers.insert(TimerControlBlock {
            name: make_name(name),
            period,
            auto_reload,
            active: false,
            deadline: None,
            id_value,
            fired: 0,
            callback: Some(Box::new(callback)),
        }))
    }

    fn timer_ref(&self, id: TimerId) -> Result<&TimerControlBlock<P>> {
        self.timers.timers.get(id).ok_or(KernelError::InvalidState)
    }

    pub fn timer_is_active(&self, id: TimerId) -> Result<bool> {
        Ok(self.timer_ref(id)?.active)
    }

    pub fn timer_period(&self, id: TimerId) -> Result<u32> {
        Ok(self.timer_ref(id)?.period)
    }

    pub fn timer_id_value(&self, id: TimerId) -> Result<u32> {
        Ok(self.timer_ref(id)?.id_value)
    }

    pub fn timer_set_id_value(&mut self, id: TimerId, value: u32) -> Result<()> {
        self.timers.timers.get_mut(id).ok_or(KernelError::InvalidState)?.id_value = value;
        Ok(())
    }

    /// Times the timer has fired.
    pub fn timer_fired(&self, id: TimerId) -> Result<u64> {
        Ok(self.timer_ref(id)?.fired)
    }

    /// Post a start command from setup code, before or outside any task.
    /// Fails with `WouldBlock` when the command queue is full.
    pub fn timer_start(&mut self, id: TimerId) -> Result<()> {
        let cmd = self.timer_command(id, TimerOp::Start, 0)?;
        self.post_timer_command(cmd, None)?;
        self.settle();
        Ok(())
    }

    fn timer_command(&self, id: TimerId, op: TimerOp, arg: u32) -> Result<TimerCommand> {
        self.timer_ref(id)?;
        if op == TimerOp::ChangePeriod && arg == 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(TimerCommand {
            op: op as u8,
            timer: id,
            issued: self.clock.now(),
            arg,
        })
    }

    /// Non-blocking post. Returns whether a task outranking `local` woke.
    fn post_timer_command(&mut self, cmd: TimerCommand, local: Option<CoreId>) -> Result<bool> {
        let queue = self.timers.queue.ok_or(KernelError::InvalidState)?;
        let mut bytes = [0u8; TimerCommand::SIZE];
        cmd.encode(&mut bytes);
        self.queue_put(queue, &bytes, local)?
            .ok_or(KernelError::WouldBlock)
    }

    // -----------------------------------------------------------------------
    // Service loop
    // -----------------------------------------------------------------------

    /// Run the timer service while its task is the one dispatched. Called at
    /// the end of every public kernel operation.
    pub(crate) fn settle(&mut self) {
        if self.timers.in_service {
            return;
        }
        let Some(task) = self.timers.task else {
            return;
        };
        while self.current(TIMER_CORE) == Some(task) {
            self.timers.in_service = true;
            let progressed = self.service_timers(task);
            self.timers.in_service = false;
            if !progressed {
                break;
            }
        }
    }

    /// One pass of the service loop. Returns false when the service could
    /// neither block nor be preempted.
    fn service_timers(&mut self, task: TaskId) -> bool {
        let Some(queue) = self.timers.queue else {
            return false;
        };
        if let Some(WakeOutcome::Delivered(bytes)) = self.tasks[task].wait.outcome.take() {
            self.apply_timer_command(TimerCommand::decode(&bytes));
        }

        loop {
            while let Ok(Some((bytes, woken))) = self.queue_get(queue, Some(TIMER_CORE)) {
                self.apply_timer_command(TimerCommand::decode(&bytes));
                if woken {
                    self.reschedule(TIMER_CORE);
                    if self.current(TIMER_CORE) != Some(task) {
                        return true;
                    }
                }
            }

            let now = self.clock.now();
            while let Some(&(deadline, id)) = self.timers.active.first() {
                if deadline > now {
                    break;
                }
                self.timers.active.remove(&(deadline, id));
                self.fire_timer(id, deadline);
                // a callback may have released a more urgent task
                self.reschedule(TIMER_CORE);
                if self.current(TIMER_CORE) != Some(task) {
                    return true;
                }
            }

            // callbacks may have posted commands
            if self.queues.get(queue).map_or(true, |q| q.is_empty()) {
                break;
            }
        }

        let now = self.clock.now();
        let timeout = match self.timers.active.first() {
            Some(&(deadline, _)) => Timeout::finite(deadline.saturating_sub(now).max(1)),
            None => Timeout::FOREVER,
        };
        let prio = self.tasks[task].effective_priority;
        if let Err(e) = self.block_current(TIMER_CORE, WaitObject::QueueReceive(queue), timeout) {
            log::error!("timer service cannot wait: {}", e);
            return false;
        }
        let seq = self.next_seq();
        self.queues[queue].receivers.insert(task, prio, seq);
        self.reschedule(TIMER_CORE);
        true
    }

    fn apply_timer_command(&mut self, cmd: TimerCommand) {
        let Some(op) = TimerOp::from_u8(cmd.op) else {
            log::error!("timer service: unknown command {}", cmd.op);
            return;
        };
        let Some(tcb) = self.timers.timers.get_mut(cmd.timer) else {
            log::warn!("timer service: {:?} for a deleted timer", op);
            return;
        };
        if let Some(deadline) = tcb.deadline.take() {
            self.timers.active.remove(&(deadline, cmd.timer));
        }
        match op {
            TimerOp::Start | TimerOp::Reset | TimerOp::ChangePeriod => {
                if op == TimerOp::ChangePeriod {
                    tcb.period = cmd.arg;
                }
                let deadline = cmd.issued + u64::from(tcb.period);
                tcb.deadline = Some(deadline);
                tcb.active = true;
                self.timers.active.insert((deadline, cmd.timer));
            }
            TimerOp::Stop => tcb.active = false,
            TimerOp::Delete => {
                self.timers.timers.remove(cmd.timer);
                self.heap.release(OBJECT_OVERHEAD);
            }
        }
    }

    fn fire_timer(&mut self, id: TimerId, deadline: Tick) {
        let Some(tcb) = self.timers.timers.get_mut(id) else {
            return;
        };
        if tcb.auto_reload {
            let next = deadline + u64::from(tcb.period);
            tcb.deadline = Some(next);
            self.timers.active.insert((next, id));
        } else {
            tcb.deadline = None;
            tcb.active = false;
        }
        tcb.fired += 1;
        log::trace!("timer '{}' fired at {} (due {})", tcb.name, self.clock.now(), deadline);
        self.stats.timer_callbacks += 1;

        if let Some(mut callback) = tcb.callback.take() {
            callback(id, &mut IsrContext::new(self, TIMER_CORE));
            if let Some(tcb) = self.timers.timers.get_mut(id) {
                tcb.callback = Some(callback);
            }
        }
    }
}

impl<'k, P: Port> TaskContext<'k, P> {
    fn timer_send(&mut self, id: TimerId, op: TimerOp, arg: u32, timeout: Timeout) -> Result<Wait<()>> {
        let cmd = self.kernel.timer_command(id, op, arg)?;
        let queue = self.kernel.timers.queue.ok_or(KernelError::InvalidState)?;
        self.queue_send(queue, &cmd, timeout)
    }

    /// Start `timer`; it first expires one period from now. Waits at most
    /// `timeout` for room in the command queue.
    pub fn timer_start(&mut self, timer: TimerId, timeout: Timeout) -> Result<Wait<()>> {
        self.timer_send(timer, TimerOp::Start, 0, timeout)
    }

    /// Restart the period of `timer` from now.
    pub fn timer_reset(&mut self, timer: TimerId, timeout: Timeout) -> Result<Wait<()>> {
        self.timer_send(timer, TimerOp::Reset, 0, timeout)
    }

    pub fn timer_stop(&mut self, timer: TimerId, timeout: Timeout) -> Result<Wait<()>> {
        self.timer_send(timer, TimerOp::Stop, 0, timeout)
    }

    /// Set a new period and (re)start the timer with it.
    pub fn timer_change_period(&mut self, timer: TimerId, period: u32, timeout: Timeout) -> Result<Wait<()>> {
        self.timer_send(timer, TimerOp::ChangePeriod, period, timeout)
    }

    pub fn timer_delete(&mut self, timer: TimerId, timeout: Timeout) -> Result<Wait<()>> {
        self.timer_send(timer, TimerOp::Delete, 0, timeout)
    }
}

impl<'k, P: Port> IsrContext<'k, P> {
    fn timer_post(&mut self, id: TimerId, op: TimerOp, arg: u32, woken: &mut bool) -> Result<()> {
        let cmd = self.kernel.timer_command(id, op, arg)?;
        *woken |= self.kernel.post_timer_command(cmd, Some(self.core))?;
        Ok(())
    }

    pub fn timer_start_from_isr(&mut self, timer: TimerId, woken: &mut bool) -> Result<()> {
        self.timer_post(timer, TimerOp::Start, 0, woken)
    }

    pub fn timer_reset_from_isr(&mut self, timer: TimerId, woken: &mut bool) -> Result<()> {
        self.timer_post(timer, TimerOp::Reset, 0, woken)
    }

    pub fn timer_stop_from_isr(&mut self, timer: TimerId, woken: &mut bool) -> Result<()> {
        self.timer_post(timer, TimerOp::Stop, 0, woken)
    }

    pub fn timer_change_period_from_isr(&mut self, timer: TimerId, period: u32, woken: &mut bool) -> Result<()> {
        self.timer_post(timer, TimerOp::ChangePeriod, period, woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::config::KernelConfig;
    use crate::task::TaskState;

    fn kernel() -> Kernel<SimPort> {
        Kernel::new(KernelConfig::default().with_cores(1), SimPort::new()).unwrap()
    }

    #[test]
    fn test_command_encoding() {
        let mut map: SlotMap<TimerId, ()> = SlotMap::with_key();
        map.insert(());
        let timer = map.insert(());
        let cmd = TimerCommand {
            op: TimerOp::ChangePeriod as u8,
            timer,
            issued: 0x1_0000_0001,
            arg: 250,
        };
        let mut bytes = [0u8; TimerCommand::SIZE];
        cmd.encode(&mut bytes);
        assert_eq!(TimerCommand::decode(&bytes), cmd);
    }

    #[test]
    fn test_service_task_waits_for_commands() {
        let mut k = kernel();
        k.start();
        let task = k.timer_task().unwrap();
        assert_eq!(k.task_state(task), Ok(TaskState::Blocked));
        assert_eq!(k.current(TIMER_CORE), k.idle_task(TIMER_CORE));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut k = kernel();
        let t = k.timer_create("once", 3, false, 7, |_, _| {}).unwrap();
        assert!(!k.timer_is_active(t).unwrap());
        k.start();
        k.timer_start(t).unwrap();
        assert!(k.timer_is_active(t).unwrap());
        for _ in 0..10 {
            k.tick();
        }
        assert_eq!(k.timer_fired(t), Ok(1));
        assert!(!k.timer_is_active(t).unwrap());
        assert_eq!(k.timer_id_value(t), Ok(7));
    }

    #[test]
    fn test_auto_reload_period() {
        let mut k = kernel();
        let t = k.timer_create("tick", 4, true, 0, |_, _| {}).unwrap();
        k.timer_start(t).unwrap();
        k.start();
        for _ in 0..12 {
            k.tick();
        }
        assert_eq!(k.timer_fired(t), Ok(3));
        assert!(k.timer_is_active(t).unwrap());
        assert_eq!(k.stats().timer_callbacks, 3);
    }

    #[test]
    fn test_longest_period_still_expires() {
        let mut k = kernel();
        let t = k.timer_create("slow", u32::MAX, false, 0, |_, _| {}).unwrap();
        k.start();
        k.timer_start(t).unwrap();
        let task = k.timer_task().unwrap();
        let wake = k.sched.delayed.iter().find(|(_, id)| *id == task).map(|(at, _)| *at);
        assert_eq!(wake, Some(u64::from(Timeout::MAX_FINITE)));
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut k = kernel();
        assert_eq!(
            k.timer_create("bad", 0, false, 0, |_, _| {}).err(),
            Some(KernelError::InvalidArgument)
        );
    }
}
