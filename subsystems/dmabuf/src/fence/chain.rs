//! # Fence Chains
//!
//! A timeline built from links. Each link wraps one fence (the *contained*
//! fence) and points at the previous link, so the head of a chain stands for
//! every point on the timeline up to its sequence number.
//!
//! ```text
//!   head(7) ──prev──▶ link(3) ──prev──▶ link(3') ──prev──▶ link(1) ──▶ ∅
//!     │                 │                  │                  │
//!   fence             fence              fence              fence
//! ```
//!
//! Walking a chain drops links whose contained fence has signaled, so long
//! lived timelines do not grow without bound.

use core::iter::FusedIterator;
use std::sync::Arc;

use spin::Mutex;

use super::{context_alloc, seqno_is_later, Fence, FenceOps};
use crate::error::{Error, Result};
use crate::work;

/// One link of a fence chain
#[derive(Debug)]
pub struct FenceChain {
    prev: Mutex<Option<Fence>>,
    prev_seqno: u64,
    fence: Fence,
}

impl FenceChain {
    /// Link `fence` at `seqno` onto `prev`
    ///
    /// The link stays on the previous link's timeline only if `seqno` moves
    /// it forward. Otherwise it starts a fresh context and takes the larger of
    /// the two sequence numbers.
    pub fn init(prev: Option<Fence>, fence: Fence, seqno: u64) -> Fence {
        let prev_link = prev.as_ref().filter(|p| Self::is_chain(p));
        let (context, seqno, prev_seqno) = match prev_link {
            Some(p) if seqno_is_later(seqno, p.seqno(), true) => (p.context(), seqno, p.seqno()),
            Some(p) => (context_alloc(1), seqno.max(p.seqno()), 0),
            None => (context_alloc(1), seqno, 0),
        };

        Fence::new(
            FenceChain {
                prev: Mutex::new(prev),
                prev_seqno,
                fence,
            },
            context,
            seqno,
        )
    }

    /// Link state behind `fence`, if it is a chain link
    pub fn from_fence(fence: &Fence) -> Option<&FenceChain> {
        fence.downcast_ops::<FenceChain>()
    }

    /// Whether `fence` is a chain link
    pub fn is_chain(fence: &Fence) -> bool {
        Self::from_fence(fence).is_some()
    }

    /// Fence wrapped by a link, or `fence` itself if it is not a link
    pub fn contained(fence: &Fence) -> Fence {
        match Self::from_fence(fence) {
            Some(link) => link.fence.clone(),
            None => fence.clone(),
        }
    }

    /// Wrapped fence
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Sequence number of the previous link when this one was created, 0 if
    /// the link started a new context
    pub fn prev_seqno(&self) -> u64 {
        self.prev_seqno
    }

    fn get_prev(&self) -> Option<Fence> {
        self.prev.lock().clone()
    }

    /// Step from `fence` to the previous unsignaled link
    ///
    /// Links whose contained fence has already signaled are unlinked on the
    /// way. Returns `None` at the end of the chain or for a plain fence.
    pub fn walk(fence: &Fence) -> Option<Fence> {
        let chain = Self::from_fence(fence)?;
        loop {
            let prev = chain.get_prev()?;
            let replacement = match Self::from_fence(&prev) {
                Some(prev_chain) if prev_chain.fence.is_signaled() => Some(prev_chain.get_prev()),
                None if prev.is_signaled() => Some(None),
                _ => None,
            };
            let Some(replacement) = replacement else {
                return Some(prev);
            };

            let mut slot = chain.prev.lock();
            let unlinked = match slot.as_ref() {
                Some(current) if current.ptr_eq(&prev) => core::mem::replace(&mut *slot, replacement),
                _ => None,
            };
            drop(slot);
            drop(unlinked);
        }
    }

    /// Iterate from `head` through every unsignaled link, `head` included
    pub fn iter(head: &Fence) -> ChainIter {
        ChainIter {
            cursor: Some(head.clone()),
        }
    }

    /// Move `fence` to the contained fence of the most recent link whose
    /// sequence number is at most `seqno`
    ///
    /// Fails with [`Error::NotFound`] when every link is newer than `seqno`.
    pub fn find_seqno(fence: &mut Fence, seqno: u64) -> Result<()> {
        let mut link = fence.clone();
        loop {
            if link.seqno() <= seqno {
                *fence = Self::contained(&link);
                return Ok(());
            }
            let prev = Self::from_fence(&link).and_then(FenceChain::get_prev);
            link = match prev {
                Some(prev) if Self::is_chain(&prev) => prev,
                _ => return Err(Error::NotFound),
            };
        }
    }

    fn contained_signaled(head: Fence) {
        work::queue(move || {
            let rearmed = Self::from_fence(&head).is_some_and(|chain| chain.enable_signaling(&head));
            if !rearmed {
                let _ = head.signal();
            }
        });
    }
}

impl FenceOps for FenceChain {
    fn driver_name(&self) -> &str {
        "dma_fence_chain"
    }

    fn timeline_name(&self) -> &str {
        "unbound"
    }

    fn use_64bit_seqno(&self) -> bool {
        true
    }

    fn enable_signaling(&self, fence: &Fence) -> bool {
        for link in Self::iter(fence) {
            let contained = Self::contained(&link);
            let head = fence.clone();
            if contained
                .add_callback(move |_| Self::contained_signaled(head))
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    fn signaled(&self, fence: &Fence) -> bool {
        Self::iter(fence).all(|link| Self::contained(&link).is_signaled())
    }
}

impl Drop for FenceChain {
    fn drop(&mut self) {
        // Unlink iteratively so a long chain does not recurse on release
        let mut next = self.prev.get_mut().take();
        while let Some(prev) = next {
            if Arc::strong_count(&prev.inner) > 1 {
                break;
            }
            next = Self::from_fence(&prev).and_then(|link| link.prev.lock().take());
        }
    }
}

/// Iterator over the unsignaled links of a chain
#[derive(Debug)]
pub struct ChainIter {
    cursor: Option<Fence>,
}

impl Iterator for ChainIter {
    type Item = Fence;

    fn next(&mut self) -> Option<Fence> {
        let current = self.cursor.take()?;
        self.cursor = FenceChain::walk(&current);
        Some(current)
    }
}

impl FusedIterator for ChainIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::SoftwareOps;
    use crate::wait::WaitTimeout;

    fn leaf(seqno: u64) -> Fence {
        Fence::new(SoftwareOps::new("test", "leaf"), context_alloc(1), seqno)
    }

    /// Build a chain over fresh leaves, returning the head and the leaves
    fn build(seqnos: &[u64]) -> (Fence, Vec<Fence>) {
        let mut head: Option<Fence> = None;
        let mut leaves = Vec::new();
        for &seqno in seqnos {
            let fence = leaf(seqno);
            leaves.push(fence.clone());
            head = Some(FenceChain::init(head, fence, seqno));
        }
        (head.unwrap(), leaves)
    }

    #[test]
    fn test_find_seqno() {
        let (head, leaves) = build(&[1, 3, 3, 7]);

        let mut cursor = head.clone();
        FenceChain::find_seqno(&mut cursor, 4).unwrap();
        assert!(cursor.ptr_eq(&leaves[2]));
        assert_eq!(cursor.seqno(), 3);

        let mut cursor = head.clone();
        FenceChain::find_seqno(&mut cursor, 7).unwrap();
        assert!(cursor.ptr_eq(&leaves[3]));

        let mut cursor = head.clone();
        assert_eq!(FenceChain::find_seqno(&mut cursor, 0), Err(Error::NotFound));
        assert!(cursor.ptr_eq(&head));
    }

    #[test]
    fn test_context_reuse_and_fresh_context() {
        let (head, _) = build(&[1, 3, 3, 7]);
        let links: Vec<Fence> = FenceChain::iter(&head).collect();
        let seqnos: Vec<u64> = links.iter().map(Fence::seqno).collect();
        assert_eq!(seqnos, vec![7, 3, 3, 1]);

        // 3 after 3 does not move forward: new context
        assert_eq!(links[0].context(), links[1].context());
        assert_ne!(links[1].context(), links[2].context());
        assert_eq!(links[2].context(), links[3].context());
        assert_eq!(FenceChain::from_fence(&links[1]).map(FenceChain::prev_seqno), Some(0));
        assert_eq!(FenceChain::from_fence(&links[0]).map(FenceChain::prev_seqno), Some(3));
    }

    #[test]
    fn test_walk_collects_signaled_links() {
        let (head, leaves) = build(&[1, 2, 3]);
        leaves[1].signal().unwrap();

        let seqnos: Vec<u64> = FenceChain::iter(&head).map(|f| f.seqno()).collect();
        assert_eq!(seqnos, vec![3, 1]);

        // Link 2 is gone for good
        let prev = FenceChain::walk(&head).unwrap();
        assert_eq!(prev.seqno(), 1);
    }

    #[test]
    fn test_chain_signals_after_all_links() {
        let (head, leaves) = build(&[1, 2, 3]);
        head.enable_sw_signaling();

        leaves[2].signal().unwrap();
        leaves[0].signal().unwrap();
        work::flush();
        assert!(!head.is_signaled());

        leaves[1].signal().unwrap();
        assert!(head.wait_timeout(false, WaitTimeout::secs(5)).is_ok());
    }

    #[test]
    fn test_chain_over_signaled_fences() {
        let (head, leaves) = build(&[1, 2]);
        for leaf in &leaves {
            leaf.signal().unwrap();
        }
        assert!(head.is_signaled());
        assert!(head.is_container());
        assert!(FenceChain::contained(&head).ptr_eq(&leaves[1]));
    }

    #[test]
    fn test_plain_fence_helpers() {
        let plain = leaf(5);
        assert!(FenceChain::walk(&plain).is_none());
        assert!(FenceChain::contained(&plain).ptr_eq(&plain));

        let mut cursor = plain.clone();
        FenceChain::find_seqno(&mut cursor, 5).unwrap();
        assert!(cursor.ptr_eq(&plain));
    }

    #[test]
    fn test_long_chain_release() {
        let mut head: Option<Fence> = None;
        for seqno in 1..=100_000 {
            let fence = Fence::private_stub();
            head = Some(FenceChain::init(head, fence, seqno));
        }
        drop(head);
    }
}
