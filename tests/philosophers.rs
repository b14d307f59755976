//! Dining philosophers on the kernel's mutexes.
//!
//! Philosopher `i` sits between chopstick `i` (left) and chopstick
//! `(i + 1) % N` (right). Each philosopher task is driven as a small state
//! machine: every step performs one kernel call on behalf of the task that
//! is currently running, and a blocked call is completed with
//! `finish_wait` when that task is dispatched again.

mod common;

use common::{kernel, C0};
use tickos::{Kernel, MutexId, SemaphoreId, SimPort, TaskConfig, TaskId, Timeout, Wait};

const N: usize = 5;
const EAT_TICKS: u32 = 3;
const ROUNDS: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Think,
    Seat,
    First,
    Second,
    Eat(u32),
}

struct Philosopher {
    task: TaskId,
    seat: usize,
    phase: Phase,
    parked: bool,
    meals: u32,
}

impl Philosopher {
    fn left(&self) -> usize {
        self.seat
    }

    fn right(&self) -> usize {
        (self.seat + 1) % N
    }

    /// Chopsticks in the order this philosopher picks them up.
    fn order(&self, hierarchy: bool) -> (usize, usize) {
        if hierarchy {
            (self.left().min(self.right()), self.left().max(self.right()))
        } else {
            (self.left(), self.right())
        }
    }

    fn advance(&mut self, waiter: Option<SemaphoreId>) {
        self.phase = match self.phase {
            Phase::Think if waiter.is_some() => Phase::Seat,
            Phase::Think | Phase::Seat => Phase::First,
            Phase::First => Phase::Second,
            Phase::Second => Phase::Eat(EAT_TICKS),
            Phase::Eat(n) => Phase::Eat(n),
        };
    }
}

struct Table {
    kernel: Kernel<SimPort>,
    chopsticks: Vec<MutexId>,
    waiter: Option<SemaphoreId>,
    hierarchy: bool,
    philosophers: Vec<Philosopher>,
}

impl Table {
    fn new(hierarchy: bool, arbitrated: bool) -> Self {
        let mut kernel = kernel(1);
        let chopsticks = (0..N).map(|_| kernel.mutex_create().unwrap()).collect();
        let waiter = arbitrated.then(|| {
            let seats = (N - 1) as u32;
            kernel.semaphore_create_counting(seats, seats).unwrap()
        });
        let philosophers = (0..N)
            .map(|seat| {
                let name = format!("phil{}", seat);
                let task = kernel.spawn_fn(TaskConfig::new(&name, 2), || {}).unwrap();
                Philosopher {
                    task,
                    seat,
                    phase: Phase::Think,
                    parked: false,
                    meals: 0,
                }
            })
            .collect();
        kernel.start();
        Self {
            kernel,
            chopsticks,
            waiter,
            hierarchy,
            philosophers,
        }
    }

    /// One action of the philosopher running on core 0, if any.
    fn step(&mut self) {
        let Some(current) = self.kernel.current(C0) else {
            return;
        };
        let Some(p) = self.philosophers.iter_mut().find(|p| p.task == current) else {
            return;
        };
        let mut task = self.kernel.task(C0);

        if p.parked {
            p.parked = false;
            assert_eq!(task.finish_wait(), Ok(()));
            p.advance(self.waiter);
            return;
        }

        let (first, second) = p.order(self.hierarchy);
        let wait = match p.phase {
            Phase::Think => task.delay(1 + p.seat as u32).unwrap(),
            Phase::Seat => task.semaphore_take(self.waiter.unwrap(), Timeout::FOREVER).unwrap(),
            Phase::First => task.mutex_lock(self.chopsticks[first], Timeout::FOREVER).unwrap(),
            Phase::Second => task.mutex_lock(self.chopsticks[second], Timeout::FOREVER).unwrap(),
            Phase::Eat(n) if n > 1 => {
                p.phase = Phase::Eat(n - 1);
                return;
            }
            Phase::Eat(_) => {
                task.mutex_unlock(self.chopsticks[second]).unwrap();
                task.mutex_unlock(self.chopsticks[first]).unwrap();
                if let Some(waiter) = self.waiter {
                    task.semaphore_give(waiter).unwrap();
                }
                p.meals += 1;
                p.phase = Phase::Think;
                return;
            }
        };
        match wait {
            Wait::Ready(()) => p.advance(self.waiter),
            Wait::Blocked => p.parked = true,
        }
    }

    /// Every eating philosopher holds both of its chopsticks.
    fn check_exclusion(&self) {
        for p in &self.philosophers {
            if let Phase::Eat(_) = p.phase {
                for c in [p.left(), p.right()] {
                    assert_eq!(self.kernel.mutex_holder(self.chopsticks[c]).unwrap(), Some(p.task));
                }
            }
        }
    }

    fn dine(&mut self) {
        for _ in 0..ROUNDS {
            self.step();
            self.check_exclusion();
            self.kernel.tick();
        }
    }
}

#[test]
fn test_resource_hierarchy_never_deadlocks() {
    let mut table = Table::new(true, false);
    table.dine();
    for p in &table.philosophers {
        assert!(p.meals > 0, "philosopher {} starved", p.seat);
    }
    assert_eq!(table.kernel.stats().timeouts, 0);
}

#[test]
fn test_arbitrator_never_deadlocks() {
    let mut table = Table::new(false, true);
    table.dine();
    for p in &table.philosophers {
        assert!(p.meals > 0, "philosopher {} starved", p.seat);
    }
    // never more than N - 1 philosophers at the table
    let seated = table
        .philosophers
        .iter()
        .filter(|p| matches!(p.phase, Phase::First | Phase::Second | Phase::Eat(_)))
        .count();
    assert!(seated < N);
}

#[test]
fn test_left_first_without_arbitrator_can_deadlock() {
    let mut table = Table::new(false, false);
    // everyone picks up the left chopstick before anyone takes a right one
    for p in &mut table.philosophers {
        p.phase = Phase::First;
    }
    for _ in 0..N {
        table.step();
        table.kernel.tick();
    }
    table.dine();
    assert!(table.philosophers.iter().all(|p| p.meals == 0));
    assert_eq!(table.kernel.current(C0), table.kernel.idle_task(C0));
}
