//! # Helix DMA-BUF Synchronization
//!
//! Cross-component completion tracking for buffers shared between producers
//! (GPU rings, copy engines, display scanout) and consumers.
//!
//! ## Components
//!
//! - **Fence**: one-shot, monotonic completion signal with a FIFO callback list
//! - **FenceArray**: fan-in of N fences, signaled when all (or any) complete
//! - **FenceChain**: incrementally extended timeline of fences
//! - **ReservationObject**: per-buffer set of fences classified by [`Usage`],
//!   written under a wound/wait mutex and read lock-free
//! - **Wait**: blocking waits with timeout and cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ReservationObject                       │
//! │   WwMutex (writers)        FenceList (copy-on-grow table)    │
//! │        │                   ┌────────┬────────┬────────┐      │
//! │        └── add/replace ──▶ │ fence  │ fence  │ fence  │ ...  │
//! │                            │ usage  │ usage  │ usage  │      │
//! │   unlocked readers ──────▶ └───┬────┴───┬────┴───┬────┘      │
//! └────────────────────────────────┼────────┼────────┼───────────┘
//!                                  ▼        ▼        ▼
//!                               Fence   FenceArray  FenceChain
//!                                  │        │          │
//!                                  └── callbacks ──▶ deferred work
//! ```
//!
//! Waiting threads park; signaling threads unpark them from the fence's
//! callback list. Composite fences never signal from the child's call stack,
//! their completion is posted to the deferred-work thread.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(not(feature = "std"))]
compile_error!("helix-dmabuf parks OS threads and requires the `std` feature");

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod fence;
pub mod interrupt;
pub mod resv;
pub mod wait;
pub mod work;

// Re-exports for convenience
pub use config::{ResvConfig, WorkConfig};
pub use error::{Error, Result};
pub use fence::array::FenceArray;
pub use fence::chain::FenceChain;
pub use fence::{context_alloc, CallbackId, Fence, FenceFlags, FenceOps, FenceStatus, SignalInfo, SoftwareOps};
pub use resv::ww::{AcquireCtx, WwClass};
pub use resv::iter::{LockedIter, UnlockedIter};
pub use resv::{ReservationObject, ResvGuard, Usage};
pub use wait::{wait_any_timeout, WaitTimeout};

static_assertions::assert_impl_all!(Fence: Send, Sync, Clone);
static_assertions::assert_impl_all!(ReservationObject: Send, Sync);
static_assertions::assert_impl_all!(WwClass: Send, Sync);
