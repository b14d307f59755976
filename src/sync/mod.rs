//! # Synchronization Primitives
//!
//! Mutexes with priority inheritance, counting/binary semaphores and
//! fixed-item-size message queues. All three share one blocking model:
//!
//! ```text
//!   task op ──► available? ──yes──► Ok(Wait::Ready)
//!                   │no
//!                   ├── timeout 0 ──► Err(WouldBlock)
//!                   └── park on wait list (priority, then arrival)
//!                          │
//!       release/give/send ─┴─► hand the resource straight to the
//!                              first waiter and make it Ready
//! ```
//!
//! A handed-over resource never passes through the "available" state, so a
//! task that wakes up already owns what it waited for.

use slotmap::new_key_type;

pub mod inherit;
pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod wait;

pub use mutex::{MutexControlBlock, MutexInfo};
pub use queue::{QueueControlBlock, QueueItem};
pub use semaphore::SemaphoreControlBlock;
pub use wait::WaitList;

new_key_type! {
    /// Handle to a mutex.
    pub struct MutexId;
    /// Handle to a counting or binary semaphore.
    pub struct SemaphoreId;
    /// Handle to a message queue.
    pub struct QueueId;
}
