//! # Host Port
//!
//! Runs the kernel on the host. Switches are recorded instead of performed
//! and task entry closures are kept, so tests can drive the kernel tick by
//! tick and execute a task body when they want to.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::Port;
use crate::task::{CoreId, Stack, TaskEntry, TaskId};

/// Bytes of initial frame written at the top of every stack, matching the
/// 16-word frame of the Cortex-M4 port.
pub const INITIAL_FRAME: usize = 16 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub core: CoreId,
    pub from: Option<TaskId>,
    pub to: TaskId,
}

#[derive(Default)]
pub struct SimPort {
    entries: BTreeMap<TaskId, TaskEntry>,
    switches: Vec<Switch>,
}

impl SimPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the entry closure of `task`, if it has not been taken yet.
    pub fn take_entry(&mut self, task: TaskId) -> Option<TaskEntry> {
        self.entries.remove(&task)
    }

    /// Every switch requested so far, oldest first.
    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    /// Tasks switched to on `core`, oldest first.
    pub fn trace(&self, core: CoreId) -> impl Iterator<Item = TaskId> + '_ {
        self.switches
            .iter()
            .filter(move |s| s.core == core)
            .map(|s| s.to)
    }

    pub fn clear_switches(&mut self) {
        self.switches.clear();
    }
}

impl Port for SimPort {
    fn init_stack(&mut self, task: TaskId, stack: &mut Stack, entry: TaskEntry) -> usize {
        let len = stack.len();
        let frame = INITIAL_FRAME.min(len);
        stack.as_mut_slice()[len - frame..].fill(0);
        self.entries.insert(task, entry);
        stack.top() - frame
    }

    fn request_switch(&mut self, core: CoreId, from: Option<TaskId>, to: TaskId) {
        self.switches.push(Switch { core, from, to });
    }

    fn release_task(&mut self, task: TaskId) {
        self.entries.remove(&task);
    }
}
