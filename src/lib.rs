//! # TickOS
//!
//! A fixed-priority preemptive real-time kernel for one or two cores, with
//! priority-inheriting mutexes, counting/binary semaphores, message queues
//! and a software timer service.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├───────────────────────────┬────────────────────────────┤
//! │  TaskContext (blocking)   │  IsrContext (_from_isr)     │
//! ├───────────────────────────┴────────────────────────────┤
//! │                 Kernel (kernel.rs)                      │
//! │       spawn · delete · suspend · resume · tick          │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │  Sync Primitives   │  Timer Service    │
//! │  scheduler.rs│  sync/             │  timer.rs         │
//! │  ready.rs    │  mutex · semaphore │  command queue    │
//! │              │  queue · inherit   │                   │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │   Task Model (task.rs) · Critical Sections (critical)  │
//! ├────────────────────────────────────────────────────────┤
//! │   Port (arch/): sim (host) · cortex_m4 (PendSV/SysTick)│
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Model
//!
//! The kernel is one owned value, [`Kernel`]. A blocking call made through
//! [`Kernel::task`] either completes at once (`Wait::Ready`) or parks the
//! calling task (`Wait::Blocked`) and dispatches another one; when the task
//! runs again it collects the outcome with `finish_wait`/`finish_receive`.
//! The [`arch::Port`] turns dispatch decisions into real context switches.
//!
//! ```
//! use tickos::{CoreId, Kernel, KernelConfig, SimPort, TaskConfig, Timeout, Wait};
//!
//! let mut kernel = Kernel::new(KernelConfig::default().with_cores(1), SimPort::new()).unwrap();
//! let sem = kernel.semaphore_create_binary().unwrap();
//! let worker = kernel.spawn_fn(TaskConfig::new("worker", 2), || {}).unwrap();
//! kernel.start();
//!
//! let mut task = kernel.task(CoreId::CORE0);
//! assert_eq!(task.semaphore_take(sem, Timeout::FOREVER), Ok(Wait::Blocked));
//!
//! let mut woken = false;
//! kernel.isr(CoreId::CORE0).semaphore_give_from_isr(sem, &mut woken).unwrap();
//! kernel.isr(CoreId::CORE0).yield_from_isr(woken);
//! assert_eq!(kernel.current(CoreId::CORE0), Some(worker));
//! ```
//!
//! ## Memory Model
//!
//! - Control blocks live in generational slot maps; a stale handle reports
//!   `InvalidState` instead of reaching another object
//! - Stacks, queue storage and control blocks are charged to a fixed heap
//!   budget ([`KernelConfig::heap_size`])
//! - `alloc` is required; firmware provides the global allocator

#![no_std]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod critical;
pub mod error;
pub mod heap;
pub mod isr;
pub mod kernel;
pub mod logging;
pub mod ready;
pub mod scheduler;
pub mod shared;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

pub use arch::sim::SimPort;
pub use arch::Port;
pub use config::KernelConfig;
pub use critical::SpinLock;
pub use error::{KernelError, Result};
pub use isr::IsrContext;
pub use kernel::{Kernel, KernelStats, TaskContext, Wait};
pub use shared::SharedKernel;
pub use sync::{MutexId, QueueId, QueueItem, SemaphoreId};
pub use task::{Affinity, CoreId, Priority, TaskConfig, TaskId, TaskInfo, TaskState};
pub use time::{Tick, Timeout};
pub use timer::TimerId;
