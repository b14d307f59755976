//! Timer service driven from tasks and interrupt handlers.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{kernel, run_until, C0};
use tickos::{Kernel, KernelError, SimPort, TaskConfig, Timeout, Wait};

#[test]
fn test_one_shot_started_from_task() {
    let mut k = kernel(1);
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let timer = k
        .timer_create("once", 5, false, 0, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let app = k.spawn_fn(TaskConfig::new("app", 2), || {}).unwrap();
    k.start();

    assert!(!k.timer_is_active(timer).unwrap());
    assert_eq!(k.task(C0).timer_start(timer, Timeout::NO_WAIT), Ok(Wait::Ready(())));
    // the service applied the command before the caller got the CPU back
    assert_eq!(k.current(C0), Some(app));
    assert!(k.timer_is_active(timer).unwrap());

    run_until(&mut k, 4);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    k.tick();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!k.timer_is_active(timer).unwrap());
    assert_eq!(k.current(C0), Some(app));

    run_until(&mut k, 20);
    assert_eq!(k.timer_fired(timer).unwrap(), 1);
}

#[test]
fn test_reset_restarts_period_from_now() {
    let mut k = kernel(1);
    let timer = k.timer_create("watchdog", 10, false, 0, |_, _| {}).unwrap();
    k.spawn_fn(TaskConfig::new("app", 2), || {}).unwrap();
    k.start();

    k.task(C0).timer_start(timer, Timeout::NO_WAIT).unwrap().ready().unwrap();
    run_until(&mut k, 8);
    k.task(C0).timer_reset(timer, Timeout::NO_WAIT).unwrap().ready().unwrap();
    run_until(&mut k, 17);
    assert_eq!(k.timer_fired(timer).unwrap(), 0);
    k.tick();
    assert_eq!(k.timer_fired(timer).unwrap(), 1);
}

#[test]
fn test_stop_change_period_and_delete() {
    let mut k = kernel(1);
    let timer = k.timer_create("blink", 4, true, 7, |_, _| {}).unwrap();
    k.spawn_fn(TaskConfig::new("app", 2), || {}).unwrap();
    k.start();
    assert_eq!(k.timer_id_value(timer).unwrap(), 7);
    k.timer_set_id_value(timer, 9).unwrap();
    assert_eq!(k.timer_id_value(timer).unwrap(), 9);

    k.task(C0).timer_start(timer, Timeout::NO_WAIT).unwrap().ready().unwrap();
    run_until(&mut k, 12);
    assert_eq!(k.timer_fired(timer).unwrap(), 3);

    k.task(C0).timer_stop(timer, Timeout::NO_WAIT).unwrap().ready().unwrap();
    assert!(!k.timer_is_active(timer).unwrap());
    run_until(&mut k, 30);
    assert_eq!(k.timer_fired(timer).unwrap(), 3);

    // a new period also restarts the timer
    k.task(C0)
        .timer_change_period(timer, 6, Timeout::NO_WAIT)
        .unwrap()
        .ready()
        .unwrap();
    assert!(k.timer_is_active(timer).unwrap());
    assert_eq!(k.timer_period(timer).unwrap(), 6);
    run_until(&mut k, 36);
    assert_eq!(k.timer_fired(timer).unwrap(), 4);

    let free = k.free_heap();
    k.task(C0).timer_delete(timer, Timeout::NO_WAIT).unwrap().ready().unwrap();
    assert_eq!(k.timer_is_active(timer), Err(KernelError::InvalidState));
    assert!(k.free_heap() > free);
}

#[test]
fn test_change_period_from_isr() {
    let mut k = kernel(1);
    let timer = k.timer_create("sample", 50, true, 0, |_, _| {}).unwrap();
    k.spawn_fn(TaskConfig::new("app", 2), || {}).unwrap();
    k.start();

    let mut woken = false;
    k.isr(C0).timer_start_from_isr(timer, &mut woken).unwrap();
    assert!(woken);
    k.isr(C0).yield_from_isr(woken);
    assert!(k.timer_is_active(timer).unwrap());

    run_until(&mut k, 5);
    let mut woken = false;
    k.isr(C0).timer_change_period_from_isr(timer, 3, &mut woken).unwrap();
    k.isr(C0).yield_from_isr(woken);
    assert_eq!(k.timer_period(timer).unwrap(), 3);

    run_until(&mut k, 11);
    assert_eq!(k.timer_fired(timer).unwrap(), 2);
    assert_eq!(
        k.isr(C0).timer_change_period_from_isr(timer, 0, &mut woken),
        Err(KernelError::InvalidArgument)
    );
}

#[test]
fn test_command_queue_full_from_isr() {
    // a busy application keeps the service from draining its queue
    let config = common::config(1).with_timer_task_priority(1).with_timer_queue_len(2);
    let mut k: Kernel<SimPort> = Kernel::new(config, SimPort::new()).unwrap();
    let timer = k.timer_create("t", 10, false, 0, |_, _| {}).unwrap();
    k.spawn_fn(TaskConfig::new("busy", 5), || {}).unwrap();
    k.start();

    let mut woken = false;
    let mut isr = k.isr(C0);
    isr.timer_start_from_isr(timer, &mut woken).unwrap();
    isr.timer_stop_from_isr(timer, &mut woken).unwrap();
    assert_eq!(isr.timer_reset_from_isr(timer, &mut woken), Err(KernelError::WouldBlock));
    assert!(!woken);
    assert_eq!(k.task(C0).timer_start(timer, Timeout::NO_WAIT), Err(KernelError::WouldBlock));
}

#[test]
fn test_callback_wakes_task_through_isr_context() {
    let config = common::config(1);
    let mut k: Kernel<SimPort> = Kernel::new(config, SimPort::new()).unwrap();
    let sem = k.semaphore_create_binary().unwrap();
    let timer = k
        .timer_create("kick", 3, true, 0, move |_, isr| {
            let mut woken = false;
            isr.semaphore_give_from_isr(sem, &mut woken).unwrap();
            isr.yield_from_isr(woken);
        })
        .unwrap();
    let worker = k.spawn_fn(TaskConfig::new("worker", 4), || {}).unwrap();
    k.timer_start(timer).unwrap();
    k.start();

    assert!(k.task(C0).semaphore_take(sem, Timeout::FOREVER).unwrap().is_blocked());
    run_until(&mut k, 3);
    assert_eq!(k.current(C0), Some(worker));
    assert_eq!(k.task(C0).finish_wait(), Ok(()));
}

#[test]
fn test_zero_period_rejected() {
    let mut k = kernel(1);
    assert_eq!(
        k.timer_create("bad", 0, false, 0, |_, _| {}).err(),
        Some(KernelError::InvalidArgument)
    );
}
