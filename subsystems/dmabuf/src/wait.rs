//! # Waiting
//!
//! Blocking waits on one fence or on the first of several.
//!
//! A waiter queues a callback that unparks it, then parks until the fence
//! signals, the deadline passes, or (for interruptible waits) the thread is
//! interrupted. The callback is always removed before returning, whatever
//! the outcome. A zero timeout never blocks: it only polls.

use core::time::Duration;
use std::thread;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::fence::{CallbackId, Fence};
use crate::interrupt;

// ============================================================================
// Wait Timeout
// ============================================================================

/// Wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// No timeout (poll and return immediately).
    None,
    /// Wait with timeout.
    Duration(Duration),
    /// Wait indefinitely.
    Infinite,
}

impl WaitTimeout {
    /// Create a timeout in milliseconds.
    pub fn millis(ms: u64) -> Self {
        WaitTimeout::Duration(Duration::from_millis(ms))
    }

    /// Create a timeout in seconds.
    pub fn secs(s: u64) -> Self {
        WaitTimeout::Duration(Duration::from_secs(s))
    }

    /// Create a timeout in nanoseconds.
    pub fn nanos(ns: u64) -> Self {
        WaitTimeout::Duration(Duration::from_nanos(ns))
    }

    /// Get duration or None for infinite.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::None => Some(Duration::ZERO),
            WaitTimeout::Duration(d) => Some(*d),
            WaitTimeout::Infinite => None,
        }
    }

    /// Check if infinite.
    pub fn is_infinite(&self) -> bool {
        matches!(self, WaitTimeout::Infinite)
    }

    /// Check if this is a pure poll.
    pub fn is_zero(&self) -> bool {
        self.as_duration() == Some(Duration::ZERO)
    }
}

impl Default for WaitTimeout {
    fn default() -> Self {
        WaitTimeout::Infinite
    }
}

impl From<Duration> for WaitTimeout {
    fn from(d: Duration) -> Self {
        WaitTimeout::Duration(d)
    }
}

// ============================================================================
// Deadline
// ============================================================================

/// Absolute form of a [`WaitTimeout`], fixed when the wait starts
#[derive(Debug, Clone, Copy)]
struct Deadline {
    timeout: WaitTimeout,
    at: Option<Instant>,
}

impl Deadline {
    fn start(timeout: WaitTimeout) -> Self {
        let at = match timeout {
            WaitTimeout::Duration(d) => Instant::now().checked_add(d),
            WaitTimeout::None => Some(Instant::now()),
            WaitTimeout::Infinite => None,
        };
        Self { timeout, at }
    }

    /// Time left, `None` once expired
    fn remaining(&self) -> Option<WaitTimeout> {
        match (self.timeout, self.at) {
            (WaitTimeout::Duration(_), Some(at)) => {
                let left = at.saturating_duration_since(Instant::now());
                (!left.is_zero()).then_some(WaitTimeout::Duration(left))
            },
            (WaitTimeout::None, _) => None,
            // Overflowed deadline or infinite wait
            _ => Some(WaitTimeout::Infinite),
        }
    }

    /// What to report back once the fence is found signaled
    fn unused(&self) -> WaitTimeout {
        match self.timeout {
            WaitTimeout::Duration(_) => self
                .remaining()
                .unwrap_or(WaitTimeout::Duration(Duration::ZERO)),
            other => other,
        }
    }

    fn park(&self) -> Result<()> {
        match self.remaining() {
            Some(WaitTimeout::Duration(left)) => thread::park_timeout(left),
            Some(_) => thread::park(),
            None => return Err(Error::Timeout),
        }
        Ok(())
    }
}

// ============================================================================
// Single Fence
// ============================================================================

/// Default [`FenceOps::wait`](crate::FenceOps::wait) implementation
///
/// Returns the unused part of `timeout`, [`Error::Timeout`] when the deadline
/// passes, or [`Error::Interrupted`] for an interrupted interruptible wait.
pub fn default_wait(fence: &Fence, interruptible: bool, timeout: WaitTimeout) -> Result<WaitTimeout> {
    if fence.test_signaled_flag() {
        return Ok(timeout);
    }
    interrupt::check(interruptible)?;
    if timeout.is_zero() {
        return if fence.is_signaled() {
            Ok(timeout)
        } else {
            Err(Error::Timeout)
        };
    }

    let deadline = Deadline::start(timeout);
    let waiter = thread::current();
    let id = match fence.add_callback(move |_| waiter.unpark()) {
        Ok(id) => id,
        Err(_) => return Ok(timeout),
    };

    let result = loop {
        if fence.test_signaled_flag() {
            break Ok(deadline.unused());
        }
        if let Err(err) = interrupt::check(interruptible).and_then(|()| deadline.park()) {
            break Err(err);
        }
    };

    fence.remove_callback(id);
    if result.is_err() && fence.test_signaled_flag() {
        return Ok(deadline.unused());
    }
    result
}

// ============================================================================
// Any Fence
// ============================================================================

fn first_signaled(fences: &[Fence]) -> Option<usize> {
    fences.iter().position(Fence::test_signaled_flag)
}

/// Wait until any of `fences` signals
///
/// Returns the index of a signaled fence and the unused part of `timeout`.
/// With a zero timeout this only polls and never blocks.
pub fn wait_any_timeout(
    fences: &[Fence],
    interruptible: bool,
    timeout: WaitTimeout,
) -> Result<(usize, WaitTimeout)> {
    if fences.is_empty() {
        return Err(Error::InvalidArgument);
    }

    if timeout.is_zero() {
        return fences
            .iter()
            .position(Fence::is_signaled)
            .map(|index| (index, timeout))
            .ok_or(Error::Timeout);
    }

    let deadline = Deadline::start(timeout);
    let mut armed: Vec<(usize, CallbackId)> = Vec::with_capacity(fences.len());
    let mut found = None;

    for (index, fence) in fences.iter().enumerate() {
        let waiter = thread::current();
        match fence.add_callback(move |_| waiter.unpark()) {
            Ok(id) => armed.push((index, id)),
            Err(_) => {
                found = Some(index);
                break;
            },
        }
    }

    let result = match found {
        Some(index) => Ok((index, timeout)),
        None => loop {
            if let Some(index) = first_signaled(fences) {
                break Ok((index, deadline.unused()));
            }
            if let Err(err) = interrupt::check(interruptible).and_then(|()| deadline.park()) {
                break Err(err);
            }
        },
    };

    for (index, id) in armed {
        fences[index].remove_callback(id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{context_alloc, SoftwareOps};

    fn sw_fence() -> Fence {
        Fence::new(SoftwareOps::new("test", "wait"), context_alloc(1), 1)
    }

    #[test]
    fn test_zero_timeout_polls() {
        let fence = sw_fence();
        let start = Instant::now();
        assert_eq!(fence.wait_timeout(false, WaitTimeout::None), Err(Error::Timeout));
        assert_eq!(
            fence.wait_timeout(false, WaitTimeout::Duration(Duration::ZERO)),
            Err(Error::Timeout)
        );
        assert!(start.elapsed() < Duration::from_secs(1));

        fence.signal().unwrap();
        assert_eq!(fence.wait_timeout(false, WaitTimeout::None), Ok(WaitTimeout::None));
    }

    #[test]
    fn test_timeout_expires() {
        let fence = sw_fence();
        let start = Instant::now();
        assert_eq!(fence.wait_timeout(false, WaitTimeout::millis(20)), Err(Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
        // The waiter's callback is gone; signaling runs nothing stale
        fence.signal().unwrap();
    }

    #[test]
    fn test_wait_interrupted() {
        let fence = sw_fence();
        let waiting = fence.clone();
        let handle = thread::spawn(move || {
            let result = waiting.wait(true);
            interrupt::clear();
            result
        });
        thread::sleep(Duration::from_millis(10));
        interrupt::interrupt(handle.thread());
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_uninterruptible_ignores_interrupt() {
        interrupt::interrupt(&thread::current());
        let fence = sw_fence();
        assert_eq!(fence.wait_timeout(false, WaitTimeout::millis(5)), Err(Error::Timeout));
        assert_eq!(fence.wait_timeout(true, WaitTimeout::millis(5)), Err(Error::Interrupted));
        assert!(interrupt::clear());
    }

    #[test]
    fn test_wait_any_second_fence() {
        let fences: Vec<Fence> = (0..3).map(|_| sw_fence()).collect();
        let producer = fences[1].clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.signal().unwrap();
        });

        let (index, remaining) = wait_any_timeout(&fences, false, WaitTimeout::secs(1)).unwrap();
        assert_eq!(index, 1);
        assert!(matches!(remaining, WaitTimeout::Duration(d) if d > Duration::ZERO));
        handle.join().unwrap();
        assert!(!fences[0].is_signaled());
        assert!(!fences[2].is_signaled());
    }

    #[test]
    fn test_wait_any_poll() {
        let fences: Vec<Fence> = (0..3).map(|_| sw_fence()).collect();
        assert_eq!(wait_any_timeout(&fences, false, WaitTimeout::None), Err(Error::Timeout));
        fences[2].signal().unwrap();
        assert_eq!(
            wait_any_timeout(&fences, false, WaitTimeout::None),
            Ok((2, WaitTimeout::None))
        );
        assert_eq!(
            wait_any_timeout(&[], false, WaitTimeout::Infinite),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_wait_any_interrupted() {
        let fences: Vec<Fence> = (0..3).map(|_| sw_fence()).collect();
        let waiting = fences.clone();
        let handle = thread::spawn(move || {
            let result = wait_any_timeout(&waiting, true, WaitTimeout::secs(5));
            interrupt::clear();
            result
        });
        thread::sleep(Duration::from_millis(10));
        interrupt::interrupt(handle.thread());
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));

        // Every waiter callback was detached on the way out
        for fence in &fences {
            assert_eq!(fence.num_callbacks(), 0);
            assert!(!fence.is_signaled());
        }
        fences[0].signal().unwrap();
    }

    #[test]
    fn test_wait_any_timeout_expires() {
        let fences: Vec<Fence> = (0..2).map(|_| sw_fence()).collect();
        assert_eq!(
            wait_any_timeout(&fences, false, WaitTimeout::millis(10)),
            Err(Error::Timeout)
        );
    }
}
