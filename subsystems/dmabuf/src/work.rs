//! # Deferred Work
//!
//! Composite fences never signal from the call stack of the child that
//! completed them: the child's callback only updates counters and posts the
//! actual `signal` here. Jobs run in FIFO order on a single worker thread
//! with no fence or reservation locks held.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, Thread};

use spin::{Mutex, Once};

use crate::config::WorkConfig;
use crate::fence::{context_alloc, Fence, SoftwareOps};
use crate::wait::WaitTimeout;

type Job = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Work Queue
// =============================================================================

struct WorkQueue {
    jobs: Mutex<VecDeque<Job>>,
    /// `None` if the worker could not be spawned; jobs then run inline
    worker: Option<Thread>,
}

impl WorkQueue {
    fn start(config: &WorkConfig) -> Self {
        let spawned = thread::Builder::new()
            .name(config.thread_name.into())
            .spawn(worker_loop);

        let worker = match spawned {
            Ok(handle) => Some(handle.thread().clone()),
            Err(err) => {
                log::warn!("dmabuf: cannot spawn deferred worker ({}), running work inline", err);
                None
            },
        };
        Self {
            jobs: Mutex::new(VecDeque::new()),
            worker,
        }
    }

    fn pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }
}

static CONFIG: Once<WorkConfig> = Once::new();
static QUEUE: Once<WorkQueue> = Once::new();

fn work_queue() -> &'static WorkQueue {
    QUEUE.call_once(|| WorkQueue::start(CONFIG.call_once(WorkConfig::default)))
}

fn worker_loop() {
    let queue = work_queue();
    loop {
        match queue.pop() {
            Some(job) => run(job),
            None => thread::park(),
        }
    }
}

/// Run one job; a panicking job is logged and the worker keeps going
fn run(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("dmabuf: deferred work panicked, continuing with the next job");
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Install the worker configuration; returns false if work already started
/// with another configuration
pub fn configure(config: WorkConfig) -> bool {
    let installed = CONFIG.call_once(|| config.clone());
    *installed == config
}

/// Post `job` to the deferred-work thread
pub fn queue<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    let queue = work_queue();
    match &queue.worker {
        Some(worker) => {
            queue.jobs.lock().push_back(Box::new(job));
            log::trace!("dmabuf: deferred work queued");
            worker.unpark();
        },
        None => job(),
    }
}

/// Block until every job queued before this call has run
pub fn flush() {
    let done = Fence::new(SoftwareOps::new("dmabuf", "flush"), context_alloc(1), 1);
    let signal = done.clone();
    queue(move || {
        let _ = signal.signal();
    });
    let _ = done.wait_timeout(false, WaitTimeout::Infinite);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = order.clone();
            queue(move || order.lock().push(i));
        }
        flush();
        let seen = order.lock().clone();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_jobs_run_off_caller_thread() {
        let caller = thread::current().id();
        let off_thread = Arc::new(AtomicUsize::new(0));
        let flag = off_thread.clone();
        queue(move || {
            if thread::current().id() != caller {
                flag.store(1, Ordering::SeqCst);
            }
        });
        flush();
        assert_eq!(off_thread.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_survives_panicking_job() {
        let ran = Arc::new(AtomicUsize::new(0));
        queue(|| panic!("job failure"));
        let flag = ran.clone();
        queue(move || {
            flag.store(1, Ordering::SeqCst);
        });
        flush();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
