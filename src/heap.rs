//! # Kernel Heap Budget
//!
//! Every kernel allocation (task stacks, queue storage, control blocks) is
//! charged against a fixed byte budget so creation fails with
//! `ResourceExhausted` instead of exhausting the real allocator.

use crate::error::{KernelError, Result};

#[derive(Debug, Clone)]
pub struct HeapBudget {
    total: usize,
    used: usize,
    min_ever_free: usize,
}

impl HeapBudget {
    pub const fn new(total: usize) -> Self {
        Self {
            total,
            used: 0,
            min_ever_free: total,
        }
    }

    /// Reserve `bytes`, or fail without changing anything.
    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.free() {
            log::warn!("heap: cannot reserve {} bytes ({} free)", bytes, self.free());
            return Err(KernelError::ResourceExhausted);
        }
        self.used += bytes;
        self.min_ever_free = self.min_ever_free.min(self.free());
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.used, "heap release underflow");
        self.used = self.used.saturating_sub(bytes);
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.total - self.used
    }

    /// Lowest free amount ever observed.
    #[inline]
    pub fn min_ever_free(&self) -> usize {
        self.min_ever_free
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }
}
