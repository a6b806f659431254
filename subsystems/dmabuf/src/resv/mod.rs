//! # Reservation Objects
//!
//! Per-resource record of the fences that guard access to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── ReservationObject ───────────────────────┐
//! │  WwMutex (writers)    generation: u64    fences ──▶ Arc<FenceList>│
//! └──────────────────────────────────────────────────────┬──────────┘
//!                                                        │
//!          ┌───────────────┬───────────────┬─────────────▼──┐
//!          │ fence, Write  │ fence, Read   │  ...  (max)    │
//!          └───────────────┴───────────────┴────────────────┘
//! ```
//!
//! Writers hold the object's lock (a [`ResvGuard`]). Growing the table builds
//! a new [`FenceList`](list::FenceList), compacts signaled entries out of it,
//! swaps it in and bumps `generation`. The old table is freed when the last
//! reader drops its `Arc`. Readers never take the lock; see
//! [`UnlockedIter`].
//!
//! Usage levels are ordered `Kernel < Write < Read < Bookkeep`. Asking for
//! level `L` returns every fence recorded at a level `<= L`.

pub mod iter;
mod list;
pub mod ww;

use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::RwLock;

use self::iter::{LockedIter, UnlockedIter};
use self::list::{Entry, FenceList};
use self::ww::{AcquireCtx, LockMode, WwMutex, RESERVATION_WW_CLASS};
use crate::config::ResvConfig;
use crate::error::{Error, Result};
use crate::fence::array::FenceArray;
use crate::fence::{context_alloc, Fence};
use crate::wait::WaitTimeout;

// =============================================================================
// USAGE
// =============================================================================

/// How a recorded fence uses the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Usage {
    /// Kernel-internal memory management (moves, clears)
    Kernel = 0,
    /// Implicit-sync writer
    Write = 1,
    /// Implicit-sync reader
    Read = 2,
    /// Tracked for bookkeeping only, never waited on implicitly
    Bookkeep = 3,
}

impl Usage {
    /// Level a new access must wait for: writers wait for readers,
    /// readers wait for writers
    pub const fn rw(write: bool) -> Self {
        if write {
            Usage::Read
        } else {
            Usage::Write
        }
    }

    /// Lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            Usage::Kernel => "kernel",
            Usage::Write => "write",
            Usage::Read => "read",
            Usage::Bookkeep => "bookkeep",
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// RESERVATION OBJECT
// =============================================================================

/// Fences guarding one shared resource
pub struct ReservationObject {
    lock: WwMutex,
    fences: RwLock<Option<Arc<FenceList>>>,
    generation: AtomicU64,
    config: ResvConfig,
}

impl ReservationObject {
    /// Create an empty object with the default configuration
    pub fn new() -> Self {
        Self::with_config(ResvConfig::default())
    }

    /// Create an empty object
    pub fn with_config(config: ResvConfig) -> Self {
        Self {
            lock: WwMutex::new(&RESERVATION_WW_CLASS),
            fences: RwLock::new(None),
            generation: AtomicU64::new(0),
            config,
        }
    }

    /// Table growth policy
    pub fn config(&self) -> &ResvConfig {
        &self.config
    }

    /// Table replacement counter
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn current_list(&self) -> Option<Arc<FenceList>> {
        self.fences.read().clone()
    }

    /// Swap in a new table; the caller drops the old one after this returns
    fn install(&self, list: Option<Arc<FenceList>>) -> Option<Arc<FenceList>> {
        let old = core::mem::replace(&mut *self.fences.write(), list);
        self.generation.fetch_add(1, Ordering::AcqRel);
        old
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    fn acquire<'a>(&'a self, ctx: Option<&'a AcquireCtx>, mode: LockMode) -> Result<ResvGuard<'a>> {
        self.lock.lock(ctx, mode)?;
        Ok(ResvGuard { obj: self, ctx })
    }

    /// Take the object's lock
    ///
    /// With a context, fails with [`Error::Deadlock`](crate::Error::Deadlock)
    /// when an older transaction holds the lock and this one already holds
    /// others.
    pub fn lock<'a>(&'a self, ctx: Option<&'a AcquireCtx>) -> Result<ResvGuard<'a>> {
        self.acquire(ctx, LockMode {
            interruptible: false,
            may_die: true,
        })
    }

    /// [`lock`](Self::lock), aborted by a pending interrupt
    pub fn lock_interruptible<'a>(&'a self, ctx: Option<&'a AcquireCtx>) -> Result<ResvGuard<'a>> {
        self.acquire(ctx, LockMode {
            interruptible: true,
            may_die: true,
        })
    }

    /// Block on the lock that made `ctx` back off
    ///
    /// `ctx` must have released every lock it held.
    pub fn lock_slow<'a>(&'a self, ctx: &'a AcquireCtx) -> Result<ResvGuard<'a>> {
        Self::check_slow(ctx);
        self.acquire(Some(ctx), LockMode {
            interruptible: false,
            may_die: false,
        })
    }

    /// [`lock_slow`](Self::lock_slow), aborted by a pending interrupt
    pub fn lock_slow_interruptible<'a>(&'a self, ctx: &'a AcquireCtx) -> Result<ResvGuard<'a>> {
        Self::check_slow(ctx);
        self.acquire(Some(ctx), LockMode {
            interruptible: true,
            may_die: false,
        })
    }

    fn check_slow(ctx: &AcquireCtx) {
        assert_eq!(
            ctx.acquired(),
            0,
            "dmabuf: lock_slow while context {} still holds locks",
            ctx.stamp()
        );
    }

    /// Take the lock if it is free
    pub fn try_lock(&self) -> Option<ResvGuard<'_>> {
        self.lock.try_lock().then(|| ResvGuard {
            obj: self,
            ctx: None,
        })
    }

    /// Whether anyone holds the lock
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Stamp of the acquire context holding the lock, if any
    pub fn locking_ctx(&self) -> Option<u64> {
        self.lock.owner_stamp()
    }

    // -------------------------------------------------------------------------
    // Lock-free readers
    // -------------------------------------------------------------------------

    /// Iterate unsignaled fences at level `<= usage` without the lock
    pub fn iter_unlocked(&self, usage: Usage) -> UnlockedIter<'_> {
        UnlockedIter::new(self, usage)
    }

    /// Snapshot of the unsignaled fences at level `<= usage`
    pub fn get_fences(&self, usage: Usage) -> Result<Vec<Fence>> {
        let mut cursor = self.iter_unlocked(usage);
        let mut fences = Vec::new();
        while let Some(fence) = cursor.next() {
            if cursor.is_restarted() {
                fences.clear();
                fences
                    .try_reserve(cursor.num_fences())
                    .map_err(|_| Error::AllocationFailed)?;
            }
            fences.push(fence);
        }
        Ok(fences)
    }

    /// All unsignaled fences at level `<= usage` as a single fence
    ///
    /// `None` when there are none; the fence itself when there is one; an
    /// all-signaled [`FenceArray`] on a fresh context otherwise.
    pub fn get_singleton(&self, usage: Usage) -> Result<Option<Fence>> {
        let mut fences = self.get_fences(usage)?;
        match fences.len() {
            0 => Ok(None),
            1 => Ok(fences.pop()),
            _ => FenceArray::create(fences, context_alloc(1), 1, false).map(Some),
        }
    }

    /// Wait for every fence at level `<= usage`, sharing one timeout budget
    ///
    /// Returns the unused part of `timeout`.
    pub fn wait_timeout(&self, usage: Usage, interruptible: bool, timeout: WaitTimeout) -> Result<WaitTimeout> {
        let mut remaining = timeout;
        for fence in self.iter_unlocked(usage) {
            remaining = fence.wait_timeout(interruptible, remaining)?;
        }
        Ok(remaining)
    }

    /// Whether every fence at level `<= usage` has signaled
    pub fn test_signaled(&self, usage: Usage) -> bool {
        self.iter_unlocked(usage).next().is_none()
    }
}

impl Default for ReservationObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReservationObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.current_list();
        f.debug_struct("ReservationObject")
            .field("locked", &self.is_locked())
            .field("generation", &self.generation())
            .field("num_fences", &list.as_ref().map_or(0, |l| l.len()))
            .field("max_fences", &list.as_ref().map_or(0, |l| l.max_fences()))
            .finish()
    }
}

// =============================================================================
// GUARD
// =============================================================================

/// Exclusive access to a reservation object; unlocks on drop
pub struct ResvGuard<'a> {
    obj: &'a ReservationObject,
    ctx: Option<&'a AcquireCtx>,
}

impl<'a> ResvGuard<'a> {
    /// Locked object
    pub fn object(&self) -> &'a ReservationObject {
        self.obj
    }

    /// Number of recorded entries
    pub fn num_fences(&self) -> usize {
        self.obj.current_list().map_or(0, |list| list.len())
    }

    /// Make room for `num_fences` more [`add_fence`](Self::add_fence) calls
    ///
    /// Growing copies the live entries into a larger table, dropping the ones
    /// that already signaled. Their references are released only after the
    /// new table is visible.
    pub fn reserve_slots(&self, num_fences: usize) -> Result<()> {
        let old = self.obj.current_list();
        let (used, max) = old
            .as_ref()
            .map_or((0, 0), |list| (list.len(), list.max_fences()));
        let needed = used.checked_add(num_fences).ok_or(Error::AllocationFailed)?;
        if max > 0 && needed <= max {
            return Ok(());
        }

        let capacity = self
            .obj
            .config
            .grown_capacity(used, max, num_fences)
            .ok_or(Error::AllocationFailed)?;
        let new = FenceList::alloc(capacity)?;
        let mut dropped = Vec::new();
        let mut kept = 0;
        if let Some(old) = &old {
            for entry in (0..used).filter_map(|i| old.entry(i)) {
                if entry.fence.is_signaled() {
                    dropped.push(entry);
                } else {
                    new.set(kept, entry);
                    kept += 1;
                }
            }
        }
        new.publish_len(kept);

        log::debug!(
            "dmabuf: reservation table {} -> {} slots, {} live, {} dropped",
            max,
            capacity,
            kept,
            dropped.len()
        );
        let replaced = self.obj.install(Some(Arc::new(new)));
        drop(replaced);
        drop(dropped);
        Ok(())
    }

    /// Record `fence` at `usage`
    ///
    /// Replaces an entry from the same context at the same or a higher level
    /// whose fence is not later than `fence`, or any signaled entry;
    /// otherwise appends.
    ///
    /// # Panics
    ///
    /// If no slot was reserved with [`reserve_slots`](Self::reserve_slots).
    pub fn add_fence(&self, fence: &Fence, usage: Usage) {
        if fence.is_container() {
            log::warn!(
                "dmabuf: container fence {} added to a reservation object",
                fence.describe()
            );
        }

        let list = self.obj.current_list();
        let Some(list) = list else {
            panic!("dmabuf: add_fence without reserve_slots");
        };

        let count = list.len();
        for index in 0..count {
            let Some(old) = list.entry(index) else {
                continue;
            };
            let superseded = old.fence.context() == fence.context()
                && old.usage >= usage
                && !old.fence.is_later(fence);
            if superseded || old.fence.is_signaled() {
                let replaced = list.set(index, Entry {
                    fence: fence.clone(),
                    usage,
                });
                drop(replaced);
                return;
            }
        }

        assert!(
            count < list.max_fences(),
            "dmabuf: add_fence without reserved slot ({} of {} used)",
            count,
            list.max_fences()
        );
        list.set(count, Entry {
            fence: fence.clone(),
            usage,
        });
        list.publish_len(count + 1);
    }

    /// Replace every entry from `context` with `replacement` at `usage`
    pub fn replace_fences(&self, context: u64, replacement: &Fence, usage: Usage) {
        let Some(list) = self.obj.current_list() else {
            return;
        };
        for index in 0..list.len() {
            let matches = list
                .entry(index)
                .is_some_and(|old| old.fence.context() == context);
            if matches {
                let replaced = list.set(index, Entry {
                    fence: replacement.clone(),
                    usage,
                });
                drop(replaced);
            }
        }
    }

    /// Iterate every fence at level `<= usage`, signaled or not
    pub fn iter(&self, usage: Usage) -> LockedIter<'_> {
        LockedIter::new(self, usage)
    }

    /// Replace this object's fences with a snapshot of `src`'s
    pub fn copy_fences(&self, src: &ReservationObject) -> Result<()> {
        let mut cursor = src.iter_unlocked(Usage::Bookkeep);
        let mut copy: Option<FenceList> = None;
        let mut count = 0;
        while let Some(fence) = cursor.next() {
            if cursor.is_restarted() {
                copy = Some(FenceList::alloc(cursor.num_fences())?);
                count = 0;
            }
            if let Some(list) = &copy {
                list.set(count, Entry {
                    fence,
                    usage: cursor.usage(),
                });
                count += 1;
            }
        }
        if let Some(list) = &copy {
            list.publish_len(count);
        }

        let replaced = self.obj.install(copy.map(Arc::new));
        drop(replaced);
        Ok(())
    }

    /// Trim the reserved capacity to the used count
    #[cfg(feature = "validation")]
    pub fn reset_max_fences(&self) {
        if let Some(list) = self.obj.current_list() {
            list.clamp_max_fences();
        }
    }

    /// One line per fence at level `<= Read`
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let mut cursor = self.iter(Usage::Read);
        while let Some(fence) = cursor.next() {
            let _ = writeln!(out, "\t{} fence:{}", cursor.usage(), fence.describe());
        }
        out
    }

    /// Release the lock
    pub fn unlock(self) {}
}

impl Drop for ResvGuard<'_> {
    fn drop(&mut self) {
        self.obj.lock.unlock(self.ctx);
    }
}

impl fmt::Debug for ResvGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResvGuard")
            .field("ctx", &self.ctx.map(AcquireCtx::stamp))
            .field("num_fences", &self.num_fences())
            .finish()
    }
}
