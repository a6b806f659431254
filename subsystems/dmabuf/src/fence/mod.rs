//! # Fences
//!
//! A fence is a one-shot completion signal for asynchronous work.
//!
//! ## Lifecycle
//!
//! ```text
//!   new ──▶ unsignaled ──(first callback / wait)──▶ signaling enabled
//!                │                                        │
//!                └────────────── signal() ◀───────────────┘
//!                                   │
//!                                   ▼
//!                   signaled (never cleared), callbacks fired FIFO
//! ```
//!
//! All mutation happens under the fence's own lock. The `SIGNALED` bit is
//! published with release ordering after the error code and timestamp, so a
//! reader that observes it also observes both.
//!
//! Producers describe their fences through [`FenceOps`]. Composite fences
//! ([`array::FenceArray`], [`chain::FenceChain`]) are themselves `FenceOps`
//! implementations.

pub mod array;
pub mod chain;

use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use spin::{Mutex, Once};

use crate::error::{errno, Error, Result};
use crate::wait::{self, WaitTimeout};

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Fence state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FenceFlags: u32 {
        /// Fence has completed
        const SIGNALED = 1 << 0;
        /// `enable_signaling` has been requested
        const ENABLE_SIGNAL = 1 << 1;
        /// Signal timestamp is valid
        const TIMESTAMP = 1 << 2;
    }
}

// =============================================================================
// CONTEXTS AND TIME
// =============================================================================

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate `num` consecutive fence contexts, returning the first
pub fn context_alloc(num: u32) -> u64 {
    CONTEXT_COUNTER.fetch_add(u64::from(num), Ordering::Relaxed)
}

static CLOCK_BASE: Once<Instant> = Once::new();

/// Monotonic nanoseconds used for signal timestamps
pub fn now_ns() -> u64 {
    let base = CLOCK_BASE.call_once(Instant::now);
    base.elapsed().as_nanos() as u64
}

/// Whether sequence number `a` is chronologically after `b`
///
/// With 32-bit semantics only the low 32 bits are compared, wraparound-safe.
pub const fn seqno_is_later(a: u64, b: u64, use_64bit: bool) -> bool {
    if use_64bit {
        a > b
    } else {
        (a as u32).wrapping_sub(b as u32) as i32 > 0
    }
}

// =============================================================================
// CALLBACKS
// =============================================================================

/// State of a fence at the moment it signaled, handed to callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    /// Producer timeline
    pub context: u64,
    /// Position on the timeline
    pub seqno: u64,
    /// Latched error code, 0 if none
    pub error: i32,
    /// Signal timestamp in [`now_ns`] units
    pub timestamp_ns: u64,
}

/// Handle for removing a queued callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Box<dyn FnOnce(&SignalInfo) + Send + 'static>;
type Detached = VecDeque<(CallbackId, Callback)>;

struct CallbackList {
    next_id: u64,
    pending: Detached,
}

impl CallbackList {
    fn new() -> Self {
        Self {
            next_id: 0,
            pending: VecDeque::new(),
        }
    }

    fn push(&mut self, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.pending.push_back((id, callback));
        id
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        match self.pending.iter().position(|(queued, _)| *queued == id) {
            Some(index) => self.pending.remove(index).is_some(),
            None => false,
        }
    }
}

/// Result of lazily enabling signaling under the fence lock
enum Armed {
    /// Fence is pending; callbacks may be queued
    Pending,
    /// The producer reported completion; run these after unlocking
    Signaled(Detached),
    /// Fence had already signaled
    Done,
}

// =============================================================================
// OPS
// =============================================================================

/// Downcast support for [`FenceOps`] implementations
#[doc(hidden)]
pub trait AsAny {
    /// Borrow as `Any`
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Producer contract for a fence implementation
///
/// `enable_signaling` runs with the fence lock held and must not call back
/// into the same fence; returning `false` signals the fence on the spot.
pub trait FenceOps: AsAny + Send + Sync + 'static {
    /// Name of the driver that created the fence
    fn driver_name(&self) -> &str;

    /// Name of the producer timeline
    fn timeline_name(&self) -> &str;

    /// Compare full 64-bit sequence numbers instead of the low 32 bits
    fn use_64bit_seqno(&self) -> bool {
        false
    }

    /// Start whatever eventually calls `signal`; `false` means already done
    fn enable_signaling(&self, _fence: &Fence) -> bool {
        true
    }

    /// Cheap completion poll
    fn signaled(&self, _fence: &Fence) -> bool {
        false
    }

    /// Wait for completion; the default parks on a callback
    fn wait(&self, fence: &Fence, interruptible: bool, timeout: WaitTimeout) -> Result<WaitTimeout> {
        wait::default_wait(fence, interruptible, timeout)
    }

    /// Called once when the last reference is dropped
    fn release(&self) {}
}

/// Plain software timeline: the producer calls [`Fence::signal`] itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareOps {
    driver: &'static str,
    timeline: &'static str,
    use_64bit: bool,
}

impl SoftwareOps {
    /// Create ops with the given names and 32-bit sequence semantics
    pub const fn new(driver: &'static str, timeline: &'static str) -> Self {
        Self {
            driver,
            timeline,
            use_64bit: false,
        }
    }

    /// Use 64-bit sequence comparisons
    pub const fn with_64bit_seqno(mut self) -> Self {
        self.use_64bit = true;
        self
    }
}

impl FenceOps for SoftwareOps {
    fn driver_name(&self) -> &str {
        self.driver
    }

    fn timeline_name(&self) -> &str {
        self.timeline
    }

    fn use_64bit_seqno(&self) -> bool {
        self.use_64bit
    }
}

// =============================================================================
// FENCE
// =============================================================================

/// Completion status of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not yet signaled
    Pending,
    /// Signaled without error
    Signaled,
    /// Signaled with a latched error code
    Error(i32),
}

struct FenceInner {
    ops: Box<dyn FenceOps>,
    context: u64,
    seqno: u64,
    flags: AtomicU32,
    error: AtomicI32,
    timestamp: AtomicU64,
    callbacks: Mutex<CallbackList>,
}

impl FenceInner {
    fn test(&self, flag: FenceFlags) -> bool {
        FenceFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    fn info(&self) -> SignalInfo {
        SignalInfo {
            context: self.context,
            seqno: self.seqno,
            error: self.error.load(Ordering::Acquire),
            timestamp_ns: self.timestamp.load(Ordering::Acquire),
        }
    }

    /// Mark signaled and detach the callback list; caller holds the lock
    fn signal_locked(&self, list: &mut CallbackList, timestamp_ns: u64) -> Result<Detached> {
        if self.test(FenceFlags::SIGNALED) {
            return Err(Error::AlreadySignaled);
        }
        self.timestamp.store(timestamp_ns, Ordering::Relaxed);
        self.flags.fetch_or(
            (FenceFlags::SIGNALED | FenceFlags::TIMESTAMP).bits(),
            Ordering::Release,
        );
        Ok(core::mem::take(&mut list.pending))
    }

    fn run(&self, detached: Detached) {
        if detached.is_empty() {
            return;
        }
        let info = self.info();
        for (_, callback) in detached {
            callback(&info);
        }
    }
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        let mut list = self.callbacks.lock();
        if !list.pending.is_empty() && !self.test(FenceFlags::SIGNALED) {
            log::error!(
                "dmabuf: fence {}:{}:{:#x}:{:#x} released with pending signals",
                self.ops.driver_name(),
                self.ops.timeline_name(),
                self.context,
                self.seqno
            );
            self.error.store(errno::EDEADLK, Ordering::Release);
            let detached = self.signal_locked(&mut list, now_ns()).unwrap_or_default();
            drop(list);
            self.run(detached);
        } else {
            drop(list);
        }
        self.ops.release();
    }
}

/// Shared, reference-counted fence handle
///
/// Cloning takes a reference; dropping the last one releases the fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Create an unsignaled fence on `context` at position `seqno`
    pub fn new<O: FenceOps>(ops: O, context: u64, seqno: u64) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                ops: Box::new(ops),
                context,
                seqno,
                flags: AtomicU32::new(0),
                error: AtomicI32::new(0),
                timestamp: AtomicU64::new(0),
                callbacks: Mutex::new(CallbackList::new()),
            }),
        }
    }

    /// Process-wide signaled fence, created once on first use
    pub fn stub() -> Self {
        static STUB: Once<Fence> = Once::new();
        STUB.call_once(Self::private_stub).clone()
    }

    /// Newly allocated, already signaled fence
    pub fn private_stub() -> Self {
        let fence = Self::new(SoftwareOps::new("stub", "stub"), 0, 0);
        fence
            .inner
            .flags
            .fetch_or(FenceFlags::ENABLE_SIGNAL.bits(), Ordering::Relaxed);
        let _ = fence.signal();
        fence
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Producer timeline
    pub fn context(&self) -> u64 {
        self.inner.context
    }

    /// Position on the timeline
    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    /// Current state bits
    pub fn flags(&self) -> FenceFlags {
        FenceFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    /// Driver name reported by the producer
    pub fn driver_name(&self) -> &str {
        self.inner.ops.driver_name()
    }

    /// Timeline name reported by the producer
    pub fn timeline_name(&self) -> &str {
        self.inner.ops.timeline_name()
    }

    /// Producer operations
    pub fn ops(&self) -> &dyn FenceOps {
        &*self.inner.ops
    }

    /// Producer operations as a concrete type
    pub fn downcast_ops<T: FenceOps>(&self) -> Option<&T> {
        AsAny::as_any(self.ops()).downcast_ref::<T>()
    }

    /// Whether both handles refer to the same fence
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this fence aggregates other fences (array or chain)
    pub fn is_container(&self) -> bool {
        self.downcast_ops::<array::FenceArray>().is_some()
            || self.downcast_ops::<chain::FenceChain>().is_some()
    }

    // -------------------------------------------------------------------------
    // Signaling
    // -------------------------------------------------------------------------

    /// Signal completion now
    pub fn signal(&self) -> Result<()> {
        self.signal_timestamp(now_ns())
    }

    /// Signal completion with an explicit timestamp
    ///
    /// Callbacks run on the calling thread, in FIFO order, after the fence
    /// lock has been dropped.
    pub fn signal_timestamp(&self, timestamp_ns: u64) -> Result<()> {
        let detached = {
            let mut list = self.inner.callbacks.lock();
            self.inner.signal_locked(&mut list, timestamp_ns)?
        };
        self.inner.run(detached);
        Ok(())
    }

    /// Signal timestamp, if signaled
    pub fn timestamp(&self) -> Option<u64> {
        if self.inner.test(FenceFlags::TIMESTAMP) {
            Some(self.inner.timestamp.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn arm(&self, list: &mut CallbackList) -> Armed {
        let previous = self
            .inner
            .flags
            .fetch_or(FenceFlags::ENABLE_SIGNAL.bits(), Ordering::AcqRel);
        if self.inner.test(FenceFlags::SIGNALED) {
            return Armed::Done;
        }
        let was_enabled = FenceFlags::from_bits_truncate(previous).contains(FenceFlags::ENABLE_SIGNAL);
        if !was_enabled && !self.inner.ops.enable_signaling(self) {
            return match self.inner.signal_locked(list, now_ns()) {
                Ok(detached) => Armed::Signaled(detached),
                Err(_) => Armed::Done,
            };
        }
        Armed::Pending
    }

    /// Ask the producer to start signaling without queueing a callback
    pub fn enable_sw_signaling(&self) {
        let armed = {
            let mut list = self.inner.callbacks.lock();
            self.arm(&mut list)
        };
        if let Armed::Signaled(detached) = armed {
            self.inner.run(detached);
        }
    }

    /// Queue `func` to run when the fence signals
    ///
    /// The first callback enables signaling. Fails with
    /// [`Error::CallbackNotAccepted`] if the fence has already completed, in
    /// which case `func` is dropped without running.
    pub fn add_callback<F>(&self, func: F) -> Result<CallbackId>
    where
        F: FnOnce(&SignalInfo) + Send + 'static,
    {
        if self.inner.test(FenceFlags::SIGNALED) {
            return Err(Error::CallbackNotAccepted);
        }

        let mut list = self.inner.callbacks.lock();
        match self.arm(&mut list) {
            Armed::Pending => Ok(list.push(Box::new(func))),
            Armed::Signaled(detached) => {
                drop(list);
                self.inner.run(detached);
                Err(Error::CallbackNotAccepted)
            },
            Armed::Done => Err(Error::CallbackNotAccepted),
        }
    }

    /// Detach a queued callback; false if it already ran or was removed
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.lock().remove(id)
    }

    /// Whether the fence has signaled, polling the producer if needed
    pub fn is_signaled(&self) -> bool {
        if self.inner.test(FenceFlags::SIGNALED) {
            return true;
        }
        if self.inner.ops.signaled(self) {
            let _ = self.signal();
            return true;
        }
        false
    }

    /// Signaled bit only, no producer poll
    pub(crate) fn test_signaled_flag(&self) -> bool {
        self.inner.test(FenceFlags::SIGNALED)
    }

    #[cfg(test)]
    pub(crate) fn num_callbacks(&self) -> usize {
        self.inner.callbacks.lock().pending.len()
    }

    // -------------------------------------------------------------------------
    // Ordering
    // -------------------------------------------------------------------------

    /// Whether `self` is chronologically after `other` on the same timeline
    pub fn is_later(&self, other: &Fence) -> bool {
        if self.context() != other.context() {
            log::warn!(
                "dmabuf: is_later across contexts {:#x} and {:#x}",
                self.context(),
                other.context()
            );
            return false;
        }
        seqno_is_later(self.seqno(), other.seqno(), self.inner.ops.use_64bit_seqno())
    }

    /// The later of two same-context fences, `None` if it already signaled
    pub fn later(a: &Fence, b: &Fence) -> Option<Fence> {
        if a.context() != b.context() {
            log::warn!("dmabuf: later() across contexts {:#x} and {:#x}", a.context(), b.context());
            return None;
        }
        let later = if a.is_later(b) { a } else { b };
        if later.is_signaled() {
            None
        } else {
            Some(later.clone())
        }
    }

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------

    /// Latched error code, 0 if none
    pub fn error(&self) -> i32 {
        self.inner.error.load(Ordering::Acquire)
    }

    /// Latch a negative error code; must precede signaling
    pub fn set_error(&self, error: i32) {
        if error >= 0 {
            log::warn!("dmabuf: ignoring non-negative fence error {}", error);
            return;
        }
        if self.test_signaled_flag() {
            log::warn!("dmabuf: set_error({}) on signaled fence {}", error, self.describe());
        }
        self.store_error(error);
    }

    pub(crate) fn store_error(&self, error: i32) {
        self.inner.error.store(error, Ordering::Release);
    }

    /// Completion status
    pub fn status(&self) -> FenceStatus {
        if !self.is_signaled() {
            return FenceStatus::Pending;
        }
        match self.error() {
            0 => FenceStatus::Signaled,
            code => FenceStatus::Error(code),
        }
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Block until signaled, `timeout` elapses, or (if `interruptible`) the
    /// thread is interrupted
    ///
    /// Returns the unused part of `timeout` on success.
    pub fn wait_timeout(&self, interruptible: bool, timeout: WaitTimeout) -> Result<WaitTimeout> {
        self.enable_sw_signaling();
        self.inner.ops.wait(self, interruptible, timeout)
    }

    /// Block until signaled or interrupted
    pub fn wait(&self, interruptible: bool) -> Result<()> {
        self.wait_timeout(interruptible, WaitTimeout::Infinite).map(|_| ())
    }

    /// One-line description: driver, timeline, sequence and state
    pub fn describe(&self) -> String {
        format!(
            "{} {} seq {} {}signalled",
            self.driver_name(),
            self.timeline_name(),
            self.seqno(),
            if self.is_signaled() { "" } else { "un" }
        )
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("driver", &self.driver_name())
            .field("timeline", &self.timeline_name())
            .field("context", &self.context())
            .field("seqno", &self.seqno())
            .field("flags", &self.flags())
            .field("error", &self.error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use std::time::Duration;

    fn sw_fence(seqno: u64) -> Fence {
        Fence::new(SoftwareOps::new("test", "timeline"), context_alloc(1), seqno)
    }

    /// Producer whose hardware has already finished when asked to arm
    struct FinishedOps;

    impl FenceOps for FinishedOps {
        fn driver_name(&self) -> &str {
            "finished"
        }

        fn timeline_name(&self) -> &str {
            "finished"
        }

        fn enable_signaling(&self, _fence: &Fence) -> bool {
            false
        }
    }

    /// Producer whose completion is visible through a polled register
    struct PolledOps {
        done: Arc<AtomicBool>,
        enabled: Arc<AtomicUsize>,
    }

    impl FenceOps for PolledOps {
        fn driver_name(&self) -> &str {
            "polled"
        }

        fn timeline_name(&self) -> &str {
            "ring0"
        }

        fn enable_signaling(&self, _fence: &Fence) -> bool {
            self.enabled.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn signaled(&self, _fence: &Fence) -> bool {
            self.done.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_double_signal_rejected() {
        let fence = sw_fence(1);
        assert!(!fence.is_signaled());
        assert_eq!(fence.signal(), Ok(()));
        assert!(fence.is_signaled());
        assert_eq!(fence.signal(), Err(Error::AlreadySignaled));
        assert!(fence.is_signaled());
        assert!(fence.timestamp().is_some());
    }

    #[test]
    fn test_callbacks_fire_once_in_order() {
        let fence = sw_fence(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            fence.add_callback(move |_| order.lock().push(i)).unwrap();
        }
        fence.signal().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        let _ = fence.signal();
        assert_eq!(order.lock().len(), 4);
    }

    #[test]
    fn test_add_callback_after_signal() {
        let fence = sw_fence(1);
        fence.signal().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let result = fence.add_callback(move |_| flag.store(true, Ordering::SeqCst));
        assert_eq!(result, Err(Error::CallbackNotAccepted));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_callback_may_reenter_fence() {
        let fence = sw_fence(1);
        let observed = Arc::new(Mutex::new(None));
        let (handle, slot) = (fence.clone(), observed.clone());
        fence
            .add_callback(move |_| *slot.lock() = Some(handle.status()))
            .unwrap();
        fence.signal().unwrap();
        assert_eq!(*observed.lock(), Some(FenceStatus::Signaled));
    }

    #[test]
    fn test_remove_callback() {
        let fence = sw_fence(1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let id = fence.add_callback(move |_| flag.store(true, Ordering::SeqCst)).unwrap();
        assert!(fence.remove_callback(id));
        assert!(!fence.remove_callback(id));
        fence.signal().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_enable_signaling_runs_once() {
        let done = Arc::new(AtomicBool::new(false));
        let enabled = Arc::new(AtomicUsize::new(0));
        let fence = Fence::new(
            PolledOps {
                done: done.clone(),
                enabled: enabled.clone(),
            },
            context_alloc(1),
            1,
        );
        fence.add_callback(|_| {}).unwrap();
        fence.add_callback(|_| {}).unwrap();
        fence.enable_sw_signaling();
        assert_eq!(enabled.load(Ordering::SeqCst), 1);

        assert!(!fence.is_signaled());
        done.store(true, Ordering::SeqCst);
        assert!(fence.is_signaled());
        assert!(fence.flags().contains(FenceFlags::SIGNALED));
    }

    #[test]
    fn test_enable_signaling_failure_signals() {
        let fence = Fence::new(FinishedOps, context_alloc(1), 1);
        assert_eq!(fence.add_callback(|_| {}), Err(Error::CallbackNotAccepted));
        assert!(fence.flags().contains(FenceFlags::SIGNALED));
    }

    #[test]
    fn test_is_later_wraparound() {
        let ctx = context_alloc(1);
        let a = Fence::new(SoftwareOps::new("t", "t"), ctx, 0x1_0000_0001);
        let b = Fence::new(SoftwareOps::new("t", "t"), ctx, 0xFFFF_FFFF);
        assert!(a.is_later(&b));
        assert!(!b.is_later(&a));

        let wide_a = Fence::new(SoftwareOps::new("t", "t").with_64bit_seqno(), ctx, 1);
        let wide_b = Fence::new(SoftwareOps::new("t", "t").with_64bit_seqno(), ctx, 0xFFFF_FFFF);
        assert!(!wide_a.is_later(&wide_b));
        assert!(wide_b.is_later(&wide_a));
    }

    #[test]
    fn test_is_later_other_context() {
        assert!(!sw_fence(5).is_later(&sw_fence(1)));
    }

    #[test]
    fn test_later() {
        let ctx = context_alloc(1);
        let a = Fence::new(SoftwareOps::new("t", "t"), ctx, 1);
        let b = Fence::new(SoftwareOps::new("t", "t"), ctx, 2);
        assert!(Fence::later(&a, &b).unwrap().ptr_eq(&b));
        b.signal().unwrap();
        assert!(Fence::later(&a, &b).is_none());
    }

    #[test]
    fn test_status_reports_latched_error() {
        let fence = sw_fence(1);
        assert_eq!(fence.status(), FenceStatus::Pending);
        fence.set_error(errno::EIO);
        fence.signal().unwrap();
        assert_eq!(fence.wait_timeout(false, WaitTimeout::None), Ok(WaitTimeout::None));
        assert_eq!(fence.status(), FenceStatus::Error(errno::EIO));
    }

    #[test]
    fn test_release_with_pending_callbacks_signals() {
        let fence = sw_fence(1);
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        fence.add_callback(move |info| *slot.lock() = Some(info.error)).unwrap();
        drop(fence);
        assert_eq!(*seen.lock(), Some(errno::EDEADLK));
    }

    #[test]
    fn test_stub_is_shared_and_signaled() {
        let handles: Vec<_> = (0..4).map(|_| thread::spawn(Fence::stub)).collect();
        let stubs: Vec<Fence> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for stub in &stubs {
            assert!(stub.is_signaled());
            assert!(stub.ptr_eq(&stubs[0]));
        }
        let private = Fence::private_stub();
        assert!(private.is_signaled());
        assert!(!private.ptr_eq(&stubs[0]));
        assert_eq!(private.driver_name(), "stub");
    }

    #[test]
    fn test_context_alloc_is_unique() {
        let first = context_alloc(4);
        let next = context_alloc(1);
        assert!(next >= first + 4);
    }

    #[test]
    fn test_describe() {
        let fence = Fence::new(SoftwareOps::new("gpu", "gfx"), context_alloc(1), 7);
        assert_eq!(fence.describe(), "gpu gfx seq 7 unsignalled");
        fence.signal().unwrap();
        assert_eq!(fence.describe(), "gpu gfx seq 7 signalled");
    }

    #[test]
    fn test_signal_from_other_thread_wakes_waiter() {
        let fence = sw_fence(1);
        let producer = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.signal().unwrap();
        });
        let remaining = fence.wait_timeout(false, WaitTimeout::secs(5)).unwrap();
        assert!(matches!(remaining, WaitTimeout::Duration(d) if d > Duration::ZERO));
        handle.join().unwrap();
    }
}
