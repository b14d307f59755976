//! # Kernel Errors
//!
//! One error type for every kernel operation. Waits that expire are
//! recoverable (`Timeout`, `WouldBlock`); everything else points at a
//! resource limit or a programming error in the caller.

use core::fmt;

/// Result type alias for kernel operations.
pub type Result<T> = core::result::Result<T, KernelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// A blocking wait ran out of ticks before it was satisfied.
    Timeout,
    /// A non-blocking attempt (timeout 0, or interrupt context) could not
    /// complete immediately.
    WouldBlock,
    /// The kernel heap cannot satisfy the allocation.
    ResourceExhausted,
    /// Stale handle, double delete, destroying a primitive still in use, or
    /// blocking while the scheduler is suspended.
    InvalidState,
    /// A mutex was released by a task that does not hold it.
    NotOwner,
    /// A parameter is outside what the kernel accepts (priority, core,
    /// stack size, item size, period).
    InvalidArgument,
}

impl KernelError {
    /// Whether the caller may simply retry the operation later.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::WouldBlock)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Timeout => "wait timed out",
            Self::WouldBlock => "operation would block",
            Self::ResourceExhausted => "kernel heap exhausted",
            Self::InvalidState => "invalid kernel object state",
            Self::NotOwner => "mutex not held by caller",
            Self::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_only_waits_are_recoverable() {
        assert!(KernelError::Timeout.is_recoverable());
        assert!(KernelError::WouldBlock.is_recoverable());
        assert!(!KernelError::ResourceExhausted.is_recoverable());
        assert!(!KernelError::InvalidState.is_recoverable());
    }

    #[test]
    fn test_display_is_human_readable() {
        assert_eq!(KernelError::NotOwner.to_string(), "mutex not held by caller");
    }
}
