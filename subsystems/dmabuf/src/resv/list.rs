//! Fixed-capacity slot table behind a reservation object.
//!
//! Slots are written only by the lock holder. Lock-free readers load the
//! published count with acquire ordering and read each slot through
//! `try_read`; a slot being rewritten at that moment reports [`Slot::Busy`]
//! and the reader restarts.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::RwLock;

use super::Usage;
use crate::error::{Error, Result};
use crate::fence::Fence;

/// One recorded fence
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub fence: Fence,
    pub usage: Usage,
}

/// Outcome of a lock-free slot read
pub(crate) enum Slot {
    Entry(Entry),
    Empty,
    Busy,
}

#[derive(Debug)]
pub(crate) struct FenceList {
    num_fences: AtomicUsize,
    max_fences: AtomicUsize,
    table: Box<[RwLock<Option<Entry>>]>,
}

impl FenceList {
    pub(crate) fn alloc(capacity: usize) -> Result<Self> {
        let mut table = Vec::new();
        table
            .try_reserve_exact(capacity)
            .map_err(|_| Error::AllocationFailed)?;
        table.extend((0..capacity).map(|_| RwLock::new(None)));
        Ok(Self {
            num_fences: AtomicUsize::new(0),
            max_fences: AtomicUsize::new(capacity),
            table: table.into_boxed_slice(),
        })
    }

    /// Published entry count
    pub(crate) fn len(&self) -> usize {
        self.num_fences.load(Ordering::Acquire)
    }

    pub(crate) fn max_fences(&self) -> usize {
        self.max_fences.load(Ordering::Relaxed)
    }

    /// Shrink the usable capacity to the current count
    #[cfg(feature = "validation")]
    pub(crate) fn clamp_max_fences(&self) {
        self.max_fences.store(self.len(), Ordering::Relaxed);
    }

    pub(crate) fn publish_len(&self, count: usize) {
        self.num_fences.store(count, Ordering::Release);
    }

    /// Read a slot; caller holds the reservation lock
    pub(crate) fn entry(&self, index: usize) -> Option<Entry> {
        self.table.get(index).and_then(|slot| slot.read().clone())
    }

    /// Read a slot without the reservation lock
    pub(crate) fn try_entry(&self, index: usize) -> Slot {
        let Some(slot) = self.table.get(index) else {
            return Slot::Empty;
        };
        match slot.try_read() {
            Some(guard) => match guard.as_ref() {
                Some(entry) => Slot::Entry(entry.clone()),
                None => Slot::Empty,
            },
            None => Slot::Busy,
        }
    }

    /// Overwrite a slot, returning the previous entry
    ///
    /// The old entry is handed back so its reference is dropped outside the
    /// slot lock.
    pub(crate) fn set(&self, index: usize, entry: Entry) -> Option<Entry> {
        let slot = &self.table[index];
        let mut guard = slot.write();
        guard.replace(entry)
    }

    /// Hold a slot's write lock the way a writer mid-update does
    #[cfg(test)]
    pub(crate) fn lock_slot(&self, index: usize) -> spin::RwLockWriteGuard<'_, Option<Entry>> {
        self.table[index].write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{context_alloc, SoftwareOps};

    #[test]
    fn test_publish_and_read() {
        let list = FenceList::alloc(4).unwrap();
        assert_eq!(list.len(), 0);
        assert_eq!(list.max_fences(), 4);

        let fence = Fence::new(SoftwareOps::new("test", "list"), context_alloc(1), 1);
        assert!(list
            .set(0, Entry {
                fence: fence.clone(),
                usage: Usage::Read,
            })
            .is_none());
        list.publish_len(1);

        assert!(list.entry(0).is_some_and(|e| e.fence.ptr_eq(&fence)));
        assert!(matches!(list.try_entry(0), Slot::Entry(e) if e.usage == Usage::Read));
        assert!(matches!(list.try_entry(1), Slot::Empty));
        assert!(matches!(list.try_entry(9), Slot::Empty));
    }

    #[test]
    fn test_busy_slot() {
        let list = FenceList::alloc(1).unwrap();
        let _writer = list.lock_slot(0);
        assert!(matches!(list.try_entry(0), Slot::Busy));
    }

    #[test]
    fn test_oversized_allocation_fails() {
        assert!(matches!(FenceList::alloc(usize::MAX), Err(Error::AllocationFailed)));
    }
}
