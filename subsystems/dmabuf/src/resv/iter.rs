//! # Reservation Iterators
//!
//! [`UnlockedIter`] walks a reservation object without its lock. It
//! snapshots the table generation, reads slots optimistically, and restarts
//! from the first entry whenever the table was replaced under it or a slot
//! was being rewritten. Callers accumulating results must discard them when
//! [`UnlockedIter::is_restarted`] reports a restart.
//!
//! [`LockedIter`] borrows a [`ResvGuard`](super::ResvGuard) and sees a stable
//! table.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;
use std::sync::Arc;

use super::list::{FenceList, Slot};
use super::{ReservationObject, ResvGuard, Usage};
use crate::fence::Fence;

// =============================================================================
// UNLOCKED
// =============================================================================

/// Lock-free iterator over unsignaled fences of at most a given usage
#[derive(Debug)]
pub struct UnlockedIter<'a> {
    obj: &'a ReservationObject,
    usage: Usage,
    list: Option<Arc<FenceList>>,
    generation: u64,
    index: usize,
    num_fences: usize,
    fence_usage: Usage,
    restarted: bool,
    started: bool,
}

impl<'a> UnlockedIter<'a> {
    pub(crate) fn new(obj: &'a ReservationObject, usage: Usage) -> Self {
        Self {
            obj,
            usage,
            list: None,
            generation: 0,
            index: 0,
            num_fences: 0,
            fence_usage: usage,
            restarted: false,
            started: false,
        }
    }

    /// Whether the last returned fence starts a fresh pass over the table
    pub fn is_restarted(&self) -> bool {
        self.restarted
    }

    /// Usage recorded with the last returned fence
    pub fn usage(&self) -> Usage {
        self.fence_usage
    }

    /// Entry count of the table snapshot being walked
    pub fn num_fences(&self) -> usize {
        self.num_fences
    }

    fn restart(&mut self) {
        self.generation = self.obj.generation.load(Ordering::Acquire);
        self.list = self.obj.current_list();
        self.num_fences = self.list.as_ref().map_or(0, |list| list.len());
        self.index = 0;
        self.restarted = true;
    }

    fn changed(&self) -> bool {
        self.obj.generation.load(Ordering::Acquire) != self.generation
    }

    fn walk(&mut self) -> Option<Fence> {
        loop {
            let list = self.list.clone()?;
            let mut busy = false;
            while self.index < self.num_fences {
                let index = self.index;
                self.index += 1;
                match list.try_entry(index) {
                    Slot::Entry(entry) => {
                        if entry.usage <= self.usage && !entry.fence.is_signaled() {
                            self.fence_usage = entry.usage;
                            return Some(entry.fence);
                        }
                    },
                    Slot::Empty => {},
                    Slot::Busy => {
                        log::trace!("dmabuf: slot {} busy, restarting unlocked walk", index);
                        busy = true;
                        break;
                    },
                }
            }
            if !busy {
                return None;
            }
            self.restart();
        }
    }
}

impl Iterator for UnlockedIter<'_> {
    type Item = Fence;

    fn next(&mut self) -> Option<Fence> {
        let mut restart = !self.started || self.changed();
        self.started = true;
        self.restarted = false;
        loop {
            if restart {
                self.restart();
            }
            let fence = self.walk();
            if !self.changed() {
                return fence;
            }
            restart = true;
        }
    }
}

// =============================================================================
// LOCKED
// =============================================================================

/// Iterator over a locked reservation object
#[derive(Debug)]
pub struct LockedIter<'g> {
    list: Option<Arc<FenceList>>,
    usage: Usage,
    index: usize,
    fence_usage: Usage,
    _guard: PhantomData<&'g ResvGuard<'g>>,
}

impl<'g> LockedIter<'g> {
    pub(crate) fn new(guard: &'g ResvGuard<'g>, usage: Usage) -> Self {
        Self {
            list: guard.obj.current_list(),
            usage,
            index: 0,
            fence_usage: usage,
            _guard: PhantomData,
        }
    }

    /// Usage recorded with the last returned fence
    pub fn usage(&self) -> Usage {
        self.fence_usage
    }
}

impl Iterator for LockedIter<'_> {
    type Item = Fence;

    fn next(&mut self) -> Option<Fence> {
        let list = self.list.as_ref()?;
        while self.index < list.len() {
            let index = self.index;
            self.index += 1;
            if let Some(entry) = list.entry(index) {
                if entry.usage <= self.usage {
                    self.fence_usage = entry.usage;
                    return Some(entry.fence);
                }
            }
        }
        None
    }
}
