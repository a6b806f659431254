//! # DMA-BUF Error Handling
//!
//! Error types for fence and reservation operations.
//!
//! Two kinds of failure live here:
//! - [`Error`]: returned to the caller of an API (allocation, interruption,
//!   lock-order back-off, duplicate signaling)
//! - errno-style codes latched *on a fence* to record why the work it
//!   represents failed; see [`errno`]
//!
//! Contract violations by the calling layer are not represented: they panic.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// DMA-BUF Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// DMA-BUF unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Malformed handle or argument
    InvalidArgument,
    /// Fence was already signaled; the duplicate signal was rejected
    AlreadySignaled,
    /// Fence already completed, callback was not queued
    CallbackNotAccepted,
    /// Table, array or link allocation failed
    AllocationFailed,
    /// Wait or lock acquisition aborted by a pending interrupt
    Interrupted,
    /// Deadline reached before the fence signaled
    Timeout,
    /// Lock order violation; release held locks and retry with `lock_slow`
    Deadlock,
    /// The acquire context already holds this lock
    AlreadyLocked,
    /// No matching fence or chain link
    NotFound,
}

impl Error {
    /// Negative errno-style code suitable for [`Fence::set_error`](crate::Fence::set_error)
    pub const fn to_errno(self) -> i32 {
        match self {
            Self::InvalidArgument | Self::AlreadySignaled => errno::EINVAL,
            Self::CallbackNotAccepted | Self::NotFound => errno::ENOENT,
            Self::AllocationFailed => errno::ENOMEM,
            Self::Interrupted => errno::ERESTARTSYS,
            Self::Timeout => errno::ETIMEDOUT,
            Self::Deadlock => errno::EDEADLK,
            Self::AlreadyLocked => errno::EALREADY,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::AlreadySignaled => write!(f, "fence already signaled"),
            Self::CallbackNotAccepted => write!(f, "fence already signaled, callback not accepted"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::Interrupted => write!(f, "operation interrupted"),
            Self::Timeout => write!(f, "wait timed out"),
            Self::Deadlock => write!(f, "lock order violation, back off and retry"),
            Self::AlreadyLocked => write!(f, "lock already held by this context"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// FENCE ERROR CODES
// =============================================================================

/// Errno-style codes latched on fences
pub mod errno {
    /// I/O error in the producer
    pub const EIO: i32 = -5;
    /// No such entry
    pub const ENOENT: i32 = -2;
    /// Out of memory
    pub const ENOMEM: i32 = -12;
    /// Invalid argument
    pub const EINVAL: i32 = -22;
    /// Released with pending callbacks (producer refcount bug)
    pub const EDEADLK: i32 = -35;
    /// Operation already in progress
    pub const EALREADY: i32 = -114;
    /// Timed out
    pub const ETIMEDOUT: i32 = -110;
    /// Work was cancelled before completion
    pub const ECANCELED: i32 = -125;
    /// Interrupted, restart the call
    pub const ERESTARTSYS: i32 = -512;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes_are_negative() {
        let all = [
            Error::InvalidArgument,
            Error::AlreadySignaled,
            Error::CallbackNotAccepted,
            Error::AllocationFailed,
            Error::Interrupted,
            Error::Timeout,
            Error::Deadlock,
            Error::AlreadyLocked,
            Error::NotFound,
        ];
        for e in all {
            assert!(e.to_errno() < 0, "{} maps to {}", e, e.to_errno());
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Deadlock.to_string(), "lock order violation, back off and retry");
        assert_eq!(Error::Timeout.to_string(), "wait timed out");
    }
}
