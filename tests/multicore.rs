//! Two-core scheduling: affinity, global preemption and cross-core locks.

mod common;

use common::{kernel, C0, C1};
use tickos::{KernelError, SpinLock, TaskConfig, TaskState, Timeout};

#[test]
fn test_start_fills_both_cores() {
    let mut k = kernel(2);
    let a = k.spawn_fn(TaskConfig::new("a", 3), || {}).unwrap();
    let b = k.spawn_fn(TaskConfig::new("b", 2), || {}).unwrap();
    k.start();

    // the timer service takes core 0 first, then parks
    assert_eq!(k.current(C1), Some(a));
    assert_eq!(k.current(C0), Some(b));
}

#[test]
fn test_new_task_displaces_lowest_running() {
    let mut k = kernel(2);
    let a = k.spawn_fn(TaskConfig::new("a", 3), || {}).unwrap();
    let b = k.spawn_fn(TaskConfig::new("b", 2), || {}).unwrap();
    k.start();

    let c = k.spawn_fn(TaskConfig::new("c", 5), || {}).unwrap();
    assert!(k.task_info(c).unwrap().running_on.is_some());
    assert!(k.task_info(a).unwrap().running_on.is_some());
    assert_eq!(k.task_state(b).unwrap(), TaskState::Ready);
}

#[test]
fn test_preemption_takes_lowest_priority_core() {
    let mut k = kernel(2);
    let a = k.spawn_fn(TaskConfig::new("a", 3), || {}).unwrap();
    let b = k.spawn_fn(TaskConfig::new("b", 2), || {}).unwrap();
    k.start();
    assert_eq!(k.current(C1), Some(a));
    assert_eq!(k.current(C0), Some(b));
    k.port_mut().clear_switches();

    let c = k.spawn_fn(TaskConfig::new("c", 5), || {}).unwrap();
    assert_eq!(k.current(C0), Some(c));
    assert_eq!(k.current(C1), Some(a));
    // one switch, no migration of `a`
    assert_eq!(k.port().switches().len(), 1);
}

#[test]
fn test_pinned_task_waits_for_its_core() {
    let mut k = kernel(2);
    let hog = k.spawn_fn(TaskConfig::new("hog", 6).pinned(C1), || {}).unwrap();
    let pinned = k.spawn_fn(TaskConfig::new("pinned", 4).pinned(C1), || {}).unwrap();
    k.start();

    assert_eq!(k.current(C1), Some(hog));
    // core 0 is idle, yet the pinned task may not use it
    assert_eq!(k.current(C0), k.idle_task(C0));
    for _ in 0..10 {
        k.tick();
        assert_eq!(k.task_state(pinned).unwrap(), TaskState::Ready);
    }

    assert!(k.task(C1).delay(2).unwrap().is_blocked());
    assert_eq!(k.current(C1), Some(pinned));
    k.tick();
    k.tick();
    assert_eq!(k.current(C1), Some(hog));
    assert_eq!(k.task_info(pinned).unwrap().running_on, None);
}

#[test]
fn test_wake_on_other_core() {
    let mut k = kernel(2);
    let sem = k.semaphore_create_binary().unwrap();
    let waiter = k.spawn_fn(TaskConfig::new("waiter", 3).pinned(C1), || {}).unwrap();
    let giver = k.spawn_fn(TaskConfig::new("giver", 2).pinned(C0), || {}).unwrap();
    k.start();

    assert_eq!(k.current(C1), Some(waiter));
    assert!(k.task(C1).semaphore_take(sem, Timeout::FOREVER).unwrap().is_blocked());
    assert_eq!(k.current(C1), k.idle_task(C1));

    assert_eq!(k.current(C0), Some(giver));
    k.task(C0).semaphore_give(sem).unwrap();
    // the waiter runs on its own core; the giver keeps core 0
    assert_eq!(k.current(C1), Some(waiter));
    assert_eq!(k.current(C0), Some(giver));
    assert_eq!(k.task(C1).finish_wait(), Ok(()));
}

#[test]
fn test_spinlock_excludes_other_core() {
    let mut k = kernel(2);
    let lock = SpinLock::new();
    k.spawn_fn(TaskConfig::new("a", 2).pinned(C0), || {}).unwrap();
    k.start();

    k.task(C0).enter_critical(&lock).unwrap();
    assert_eq!(lock.owner(), Some(C0));
    assert_eq!(k.isr(C1).enter_critical_from_isr(&lock), Err(KernelError::Timeout));
    assert_eq!(k.isr(C1).exit_critical_from_isr(&lock), Err(KernelError::NotOwner));

    k.task(C0).exit_critical(&lock).unwrap();
    k.isr(C1).enter_critical_from_isr(&lock).unwrap();
    assert_eq!(lock.owner(), Some(C1));
    k.isr(C1).exit_critical_from_isr(&lock).unwrap();
    assert!(!lock.is_locked());
}

#[test]
fn test_bad_core_is_rejected() {
    let mut k = kernel(1);
    k.start();
    assert_eq!(
        k.spawn_fn(TaskConfig::new("far", 2).pinned(C1), || {}).err(),
        Some(KernelError::InvalidArgument)
    );
    assert_eq!(k.task(C1).delay(1), Err(KernelError::InvalidArgument));
}
