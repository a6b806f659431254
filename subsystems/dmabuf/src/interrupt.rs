//! # Wait Interruption
//!
//! Per-thread cancellation for interruptible waits.
//!
//! A thread with a pending interrupt fails every interruptible wait or lock
//! acquisition with [`Error::Interrupted`](crate::Error::Interrupted) until it
//! acknowledges the interrupt with [`clear`]. Non-interruptible waits ignore
//! it. Interrupting a waiter never cancels the producer's work.
//!
//! A thread that has checked for interrupts drops its pending entry when it
//! exits. An interrupt aimed at a thread that never waits interruptibly
//! stays recorded until that thread calls [`clear`].

use std::thread::{self, Thread, ThreadId};

use hashbrown::HashSet;
use spin::{Mutex, Once};

static PENDING: Once<Mutex<HashSet<ThreadId>>> = Once::new();

fn pending_set() -> &'static Mutex<HashSet<ThreadId>> {
    PENDING.call_once(|| Mutex::new(HashSet::new()))
}

/// Removes the owning thread's pending entry on thread exit
struct ExitHook(ThreadId);

impl Drop for ExitHook {
    fn drop(&mut self) {
        pending_set().lock().remove(&self.0);
    }
}

std::thread_local! {
    static EXIT_HOOK: ExitHook = ExitHook(thread::current().id());
}

/// Mark `thread` as interrupted and wake it if it is parked
pub fn interrupt(thread: &Thread) {
    pending_set().lock().insert(thread.id());
    thread.unpark();
}

/// Whether the calling thread has a pending interrupt
pub fn pending() -> bool {
    let _ = EXIT_HOOK.try_with(|_| ());
    let set = pending_set().lock();
    !set.is_empty() && set.contains(&thread::current().id())
}

/// Acknowledge the calling thread's interrupt; returns whether one was pending
pub fn clear() -> bool {
    pending_set().lock().remove(&thread::current().id())
}

/// Interrupt check for a wait loop
pub(crate) fn check(interruptible: bool) -> crate::Result<()> {
    if interruptible && pending() {
        Err(crate::Error::Interrupted)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_is_per_thread() {
        let other = thread::spawn(|| {
            while !pending() {
                thread::park();
            }
            clear()
        });
        assert!(!pending());
        interrupt(other.thread());
        assert!(other.join().unwrap());
        assert!(!pending());
    }

    #[test]
    fn test_exited_thread_drops_interrupt() {
        let other = thread::spawn(|| {
            while !pending() {
                thread::park();
            }
            thread::current().id()
        });
        interrupt(other.thread());
        let id = other.join().unwrap();
        assert!(!pending_set().lock().contains(&id));
    }

    #[test]
    fn test_clear_acknowledges() {
        interrupt(&thread::current());
        assert!(pending());
        assert!(check(false).is_ok());
        assert_eq!(check(true), Err(crate::Error::Interrupted));
        assert!(clear());
        assert!(!clear());
        assert!(check(true).is_ok());
    }
}
