//! # Wait-Die Mutex
//!
//! Deadlock-avoiding lock for taking several reservation objects at once.
//!
//! Every multi-object transaction runs inside an [`AcquireCtx`] that carries
//! a stamp from its [`WwClass`]; lower stamps are older. When a context that
//! already holds locks meets a lock owned by an *older* context, it fails
//! with [`Error::Deadlock`] instead of blocking. The caller then drops every
//! lock it holds, takes the contended one with a `lock_slow` variant, and
//! retries the rest.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::thread::{self, Thread};

use spin::Mutex;

use crate::error::{Error, Result};
use crate::interrupt;

// =============================================================================
// CLASS AND CONTEXT
// =============================================================================

/// Family of wait-die locks sharing one stamp counter
pub struct WwClass {
    name: &'static str,
    stamp: AtomicU64,
}

impl WwClass {
    /// Create a class
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            stamp: AtomicU64::new(1),
        }
    }

    /// Class name
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn next_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for WwClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WwClass").field("name", &self.name).finish()
    }
}

/// Class used by every reservation object
pub static RESERVATION_WW_CLASS: WwClass = WwClass::new("reservation_ww_class");

/// One multi-lock transaction
///
/// Locks taken with a context borrow it, so a context cannot be dropped while
/// it still holds any of them.
#[derive(Debug)]
pub struct AcquireCtx {
    class: &'static WwClass,
    stamp: u64,
    acquired: Cell<usize>,
    done: Cell<bool>,
}

impl AcquireCtx {
    /// Start a transaction in `class`
    pub fn new(class: &'static WwClass) -> Self {
        Self {
            class,
            stamp: class.next_stamp(),
            acquired: Cell::new(0),
            done: Cell::new(false),
        }
    }

    /// Start a transaction on reservation objects
    pub fn reservation() -> Self {
        Self::new(&RESERVATION_WW_CLASS)
    }

    /// Age of the transaction; lower is older
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Number of locks currently held
    pub fn acquired(&self) -> usize {
        self.acquired.get()
    }

    /// Mark the acquire phase finished; no further locks may be taken
    pub fn done(&self) {
        self.done.set(true);
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }

    /// End the transaction
    pub fn fini(self) {
        assert_eq!(
            self.acquired(),
            0,
            "dmabuf: acquire context {} finished with locks held",
            self.stamp
        );
    }
}

// =============================================================================
// MUTEX
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Free,
    /// Held; `stamp` is the owning context, if any
    Held { stamp: Option<u64> },
}

struct WwState {
    holder: Holder,
    waiters: VecDeque<Thread>,
}

/// How a blocked acquisition behaves
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockMode {
    pub interruptible: bool,
    /// Fail with `Deadlock` rather than wait on an older owner
    pub may_die: bool,
}

/// Wait-die mutex
pub(crate) struct WwMutex {
    class: &'static WwClass,
    state: Mutex<WwState>,
}

impl WwMutex {
    pub(crate) const fn new(class: &'static WwClass) -> Self {
        Self {
            class,
            state: Mutex::new(WwState {
                holder: Holder::Free,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn check_ctx(&self, ctx: &AcquireCtx) {
        assert!(
            core::ptr::eq(ctx.class, self.class),
            "dmabuf: acquire context of class {} used on lock of class {}",
            ctx.class.name,
            self.class.name
        );
        assert!(!ctx.is_done(), "dmabuf: lock taken after AcquireCtx::done");
    }

    /// Acquire the lock, blocking as `mode` allows
    pub(crate) fn lock(&self, ctx: Option<&AcquireCtx>, mode: LockMode) -> Result<()> {
        if let Some(ctx) = ctx {
            self.check_ctx(ctx);
        }
        let stamp = ctx.map(AcquireCtx::stamp);

        loop {
            interrupt::check(mode.interruptible)?;
            {
                let mut state = self.state.lock();
                match state.holder {
                    Holder::Free => {
                        state.holder = Holder::Held { stamp };
                        drop(state);
                        if let Some(ctx) = ctx {
                            ctx.acquired.set(ctx.acquired.get() + 1);
                        }
                        return Ok(());
                    },
                    Holder::Held { stamp: owner } => {
                        if let (Some(ours), Some(theirs)) = (stamp, owner) {
                            if ours == theirs {
                                return Err(Error::AlreadyLocked);
                            }
                            let holds_locks = ctx.is_some_and(|c| c.acquired() > 0);
                            if mode.may_die && theirs < ours && holds_locks {
                                log::debug!(
                                    "dmabuf: ctx {} backs off from lock held by older ctx {}",
                                    ours,
                                    theirs
                                );
                                return Err(Error::Deadlock);
                            }
                        }
                        state.waiters.push_back(thread::current());
                    },
                }
            }
            thread::park();
        }
    }

    /// Acquire without blocking
    pub(crate) fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.holder != Holder::Free {
            return false;
        }
        state.holder = Holder::Held { stamp: None };
        true
    }

    /// Release the lock taken with `ctx`
    pub(crate) fn unlock(&self, ctx: Option<&AcquireCtx>) {
        let waiters = {
            let mut state = self.state.lock();
            if let (Holder::Held { stamp: Some(owner) }, Some(ctx)) = (state.holder, ctx) {
                assert_eq!(owner, ctx.stamp, "dmabuf: unlock by context {} of a lock owned by {}", ctx.stamp, owner);
            }
            state.holder = Holder::Free;
            core::mem::take(&mut state.waiters)
        };
        if let Some(ctx) = ctx {
            ctx.acquired.set(ctx.acquired.get().saturating_sub(1));
        }
        for waiter in waiters {
            waiter.unpark();
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().holder != Holder::Free
    }

    /// Stamp of the owning context, if held with one
    pub(crate) fn owner_stamp(&self) -> Option<u64> {
        match self.state.lock().holder {
            Holder::Held { stamp } => stamp,
            Holder::Free => None,
        }
    }
}
