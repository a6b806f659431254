//! # Fence Arrays
//!
//! A fence that signals when all (or any one) of a fixed set of child fences
//! has signaled. The first child error is latched and becomes the array's
//! error.
//!
//! Each child's callback only decrements the pending counter. The one that
//! brings it to zero posts the array's signal to the deferred-work thread, so
//! the array never signals from inside a child's signal path.

use core::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use super::{Fence, FenceOps, SignalInfo};
use crate::error::{Error, Result};
use crate::work;

/// Composite fence over a fixed set of children
#[derive(Debug)]
pub struct FenceArray {
    fences: Box<[Fence]>,
    pending: AtomicI64,
    first_error: AtomicI32,
    signal_on_any: bool,
}

impl FenceArray {
    /// Build an array fence over `fences`
    ///
    /// An empty array waiting for all children signals immediately; an empty
    /// array waiting for any child is rejected.
    pub fn create(fences: Vec<Fence>, context: u64, seqno: u64, signal_on_any: bool) -> Result<Fence> {
        if fences.is_empty() && signal_on_any {
            return Err(Error::InvalidArgument);
        }
        let pending = if signal_on_any { 1 } else { fences.len() as i64 };
        let fence = Fence::new(
            FenceArray {
                fences: fences.into_boxed_slice(),
                pending: AtomicI64::new(pending),
                first_error: AtomicI32::new(0),
                signal_on_any,
            },
            context,
            seqno,
        );
        if pending == 0 {
            let _ = fence.signal();
        }
        Ok(fence)
    }

    /// Array state behind `fence`, if it is an array
    pub fn from_fence(fence: &Fence) -> Option<&FenceArray> {
        fence.downcast_ops::<FenceArray>()
    }

    /// Whether `fence` is an array fence
    pub fn is_array(fence: &Fence) -> bool {
        Self::from_fence(fence).is_some()
    }

    /// Children, in construction order
    pub fn fences(&self) -> &[Fence] {
        &self.fences
    }

    /// Number of children
    pub fn num_fences(&self) -> usize {
        self.fences.len()
    }

    /// Whether the array completes on its first signaled child
    pub fn signal_on_any(&self) -> bool {
        self.signal_on_any
    }

    /// First child of an array, or `head` itself for a plain fence
    pub fn first(head: &Fence) -> Option<Fence> {
        match Self::from_fence(head) {
            Some(array) => array.fences.first().cloned(),
            None => Some(head.clone()),
        }
    }

    /// Child at `index`, or `None` past the end (or for a plain fence)
    pub fn next(head: &Fence, index: usize) -> Option<Fence> {
        Self::from_fence(head).and_then(|array| array.fences.get(index).cloned())
    }

    /// Whether every child belongs to `context`
    pub fn match_context(fence: &Fence, context: u64) -> bool {
        match Self::from_fence(fence) {
            Some(array) => array.fences.iter().all(|child| child.context() == context),
            None => fence.context() == context,
        }
    }

    fn latch_error(&self, error: i32) {
        if error != 0 {
            let _ = self
                .first_error
                .compare_exchange(0, error, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn publish_error(&self, fence: &Fence) {
        let error = self.first_error.load(Ordering::Acquire);
        if error != 0 {
            fence.store_error(error);
        }
    }

    /// Decrement pending; true when this call completed the array
    fn complete_one(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn child_signaled(head: Fence, info: &SignalInfo) {
        let completed = match Self::from_fence(&head) {
            Some(array) => {
                array.latch_error(info.error);
                array.complete_one()
            },
            None => false,
        };
        if completed {
            work::queue(move || {
                if let Some(array) = Self::from_fence(&head) {
                    array.publish_error(&head);
                }
                let _ = head.signal();
            });
        }
    }
}

impl FenceOps for FenceArray {
    fn driver_name(&self) -> &str {
        "dma_fence_array"
    }

    fn timeline_name(&self) -> &str {
        "unbound"
    }

    fn enable_signaling(&self, fence: &Fence) -> bool {
        for child in self.fences.iter() {
            let head = fence.clone();
            if child.add_callback(move |info| Self::child_signaled(head, info)).is_err() {
                self.latch_error(child.error());
                if self.complete_one() {
                    self.publish_error(fence);
                    return false;
                }
            }
        }
        true
    }

    fn signaled(&self, fence: &Fence) -> bool {
        if self.pending.load(Ordering::Acquire) > 0 {
            return false;
        }
        self.publish_error(fence);
        true
    }

    fn release(&self) {
        log::trace!("dmabuf: releasing fence array of {} children", self.fences.len());
    }
}
