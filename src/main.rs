//! # TickOS Demo Firmware
//!
//! Priority inversion, and how the inheriting mutex bounds it:
//!
//! | Task     | Priority | Behavior                                      |
//! |----------|----------|-----------------------------------------------|
//! | `low`    | 1        | Holds the shared mutex for a long stretch     |
//! | `medium` | 2        | CPU work that does not touch the mutex        |
//! | `high`   | 3        | Periodically needs the mutex, briefly         |
//! | `blink`  | timer    | Auto-reload software timer, counts heartbeats |
//!
//! ## Expected Dynamics
//!
//! 1. `low` takes the mutex, then `high` wakes and blocks on it.
//! 2. `low` inherits priority 3, so `medium` cannot preempt it.
//! 3. `low` unlocks, drops back to priority 1, and `high` runs at once.
//!
//! Without inheritance `medium` would run for its whole burst while
//! `high` waits on a task of lower priority than `medium`.

#![no_std]
#![no_main]

extern crate alloc;

use core::sync::atomic::{AtomicU32, Ordering};

use buddy_alloc::{BuddyAllocParam, FastAllocParam, NonThreadsafeAlloc};
use cortex_m_rt::entry;
use panic_halt as _;

use tickos::arch::cortex_m4::{self, CortexM4Port, KERNEL};
use tickos::arch::rt;
use tickos::{Kernel, KernelConfig, MutexId, TaskConfig, Timeout};

const FAST_HEAP_SIZE: usize = 4 * 1024;
const HEAP_SIZE: usize = 32 * 1024;
const LEAF_SIZE: usize = 16;

pub static mut FAST_HEAP: [u8; FAST_HEAP_SIZE] = [0u8; FAST_HEAP_SIZE];
pub static mut HEAP: [u8; HEAP_SIZE] = [0u8; HEAP_SIZE];

#[cfg_attr(not(test), global_allocator)]
static ALLOC: NonThreadsafeAlloc = unsafe {
    let fast_param = FastAllocParam::new(core::ptr::addr_of!(FAST_HEAP) as *const u8, FAST_HEAP_SIZE);
    let buddy_param = BuddyAllocParam::new(core::ptr::addr_of!(HEAP) as *const u8, HEAP_SIZE, LEAF_SIZE);
    NonThreadsafeAlloc::new(fast_param, buddy_param)
};

static HEARTBEATS: AtomicU32 = AtomicU32::new(0);
static HIGH_LATENCY_MAX: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

fn busy(ticks: u64) {
    let until = rt::tick_count() + ticks;
    while rt::tick_count() < until {
        core::hint::spin_loop();
    }
}

fn low_task(shared: MutexId) {
    loop {
        if rt::mutex_lock(shared, Timeout::FOREVER).is_ok() {
            busy(20);
            let _ = rt::mutex_unlock(shared);
        }
        let _ = rt::delay(5);
    }
}

fn medium_task() {
    let _ = rt::delay(3);
    loop {
        busy(50);
        let _ = rt::delay(100);
    }
}

fn high_task(shared: MutexId) {
    let mut last_wake = rt::tick_count();
    loop {
        let _ = rt::delay_until(&mut last_wake, 40);
        let asked = rt::tick_count();
        if rt::mutex_lock(shared, Timeout::ticks(100)).is_ok() {
            let waited = (rt::tick_count() - asked) as u32;
            HIGH_LATENCY_MAX.fetch_max(waited, Ordering::Relaxed);
            let _ = rt::mutex_unlock(shared);
        } else {
            log::warn!("high: mutex wait timed out");
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    tickos::logging::init(log::LevelFilter::Info);

    let mut cp = cortex_m::Peripherals::take().unwrap_or_else(|| panic!("peripherals taken"));

    let config = KernelConfig::default().with_cores(1).with_heap_size(24 * 1024);
    let mut kernel = match Kernel::new(config, CortexM4Port::new()) {
        Ok(k) => k,
        Err(e) => panic!("kernel: {}", e),
    };

    let setup = (|| -> tickos::Result<()> {
        let shared = kernel.mutex_create()?;
        kernel.spawn(TaskConfig::new("low", 1), low_task, shared)?;
        kernel.spawn_fn(TaskConfig::new("medium", 2), medium_task)?;
        kernel.spawn(TaskConfig::new("high", 3), high_task, shared)?;

        let blink = kernel.timer_create("blink", 500, true, 0, |_, _| {
            HEARTBEATS.fetch_add(1, Ordering::Relaxed);
        })?;
        kernel.timer_start(blink)
    })();
    if let Err(e) = setup {
        panic!("setup: {}", e);
    }

    if KERNEL.init(kernel).is_err() {
        panic!("kernel installed twice");
    }
    cortex_m4::start(&mut cp.SYST)
}
