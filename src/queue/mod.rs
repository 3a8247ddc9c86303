//! Process-based work queue.
//!
//! Forks a persistent pool of worker processes and feeds them fixed-size
//! work items through a shared-memory FIFO:
//!
//! ```text
//!   Supervisor ──post()──▶ ┌─────────────────────────────┐
//!                          │ shared mapping              │
//!                          │ [header|node|node|node|...] │
//!                          └─────────────────────────────┘
//!                             ▲         ▲         ▲
//!                          next()    next()    next()
//!                          Worker 0  Worker 1  Worker N-1
//! ```
//!
//! The supervisor is the only producer; every worker is a consumer. All
//! list mutations happen under a single-byte spinlock in the queue header.
//! Items are copied by value into shared nodes, so the payload type must
//! be self-contained: anything holding pointers or references would smuggle
//! addresses that mean nothing in (or worse, something else in) another
//! process.

mod layout;
mod spinlock;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::pool::{Forked, PoolStats, ProcessPool};
use crate::shm::SharedRegion;
use layout::QueueView;
use spinlock::Backoff;

/// Sleep between polls in the worker loop and `wait_for_completion`.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the supervisor probes worker liveness.
const CRASH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued items. This is the worst case where
    /// processing is slow and every posted request waits in the queue.
    pub capacity: usize,
    /// Wall-clock budget for acquiring the queue lock.
    pub lock_budget: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000_000,
            lock_budget: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Set the queue capacity in items.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the lock acquisition budget.
    pub fn with_lock_budget(mut self, budget: Duration) -> Self {
        self.lock_budget = budget;
        self
    }
}

/// A supervisor-fed queue of work items served by forked worker processes.
///
/// [`WorkQueue::run`] forks the workers and returns in the supervisor;
/// each worker enters its dequeue loop and never returns. The supervisor
/// then [`WorkQueue::post`]s items, optionally waits for the queue to
/// drain, and finally [`WorkQueue::destroy`]s the queue, which stops and
/// reclaims the workers. Dropping the supervisor-side queue destroys it.
///
/// `T` must be trivially copyable and self-contained; it is copied byte
/// for byte into shared memory.
pub struct WorkQueue<T: Copy + 'static> {
    pool: ProcessPool,
    config: QueueConfig,
    region: Option<SharedRegion>,
    view: Option<QueueView<T>>,
    backoff: Backoff,
    last_crash_check: Instant,
    posted: u64,
}

impl<T: Copy + 'static> WorkQueue<T> {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            pool: ProcessPool::new(),
            config,
            region: None,
            view: None,
            backoff: Backoff::new(),
            last_crash_check: Instant::now(),
            posted: 0,
        }
    }

    /// Map the queue and fork `workers` consumer processes.
    ///
    /// Returns in the supervisor once all workers are forked; the queue is
    /// then ready for [`WorkQueue::post`]. In each worker this enters the
    /// dequeue loop, invokes `handler` for every item, and never returns.
    pub fn run(&mut self, workers: usize, handler: fn(&T)) -> Result<()> {
        if self.pool.is_worker() {
            tracing::error!("run is not allowed in a worker");
            return Err(Error::Role("run"));
        }
        if self.view.is_some() {
            return Err(Error::Config("the queue is already running".into()));
        }
        if workers == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        if self.config.capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }

        let len = QueueView::<T>::layout_len(self.config.capacity);
        let region = SharedRegion::zeroed(len)?;
        // SAFETY: the region is zeroed, large enough by construction, and
        // owned by self alongside the view.
        let view = unsafe { QueueView::new(region.as_ptr(), region.len()) };
        view.init();
        self.region = Some(region);
        self.view = Some(view);

        match self.pool.fork_workers(workers, workers, false) {
            Err(err) => {
                self.view = None;
                self.region = None;
                Err(err)
            }
            Ok(Forked::Supervisor) => {
                self.last_crash_check = Instant::now();
                tracing::info!(
                    workers,
                    capacity = self.config.capacity,
                    bytes = len,
                    "request queue running"
                );
                Ok(())
            }
            Ok(Forked::Worker { index }) => self.worker_loop(index, handler),
        }
    }

    /// Append one item to the queue. Supervisor-only.
    ///
    /// Fails with [`Error::QueueFull`] when the arena and freelist are both
    /// exhausted, leaving the queued items intact.
    pub fn post(&mut self, item: T) -> Result<()> {
        if self.pool.is_worker() {
            tracing::error!("post is not allowed in a worker");
            return Err(Error::Role("post"));
        }
        self.check_crashed();

        let Some(view) = &self.view else {
            return Err(Error::QueueInactive);
        };

        let guard = spinlock::acquire(
            &view.header().lock,
            self.config.lock_budget,
            &mut self.backoff,
        )?;
        view.push_back(item)?;
        drop(guard);

        self.posted += 1;
        Ok(())
    }

    /// Block until every queued item has been picked up by a worker.
    /// Supervisor-only.
    pub fn wait_for_completion(&mut self) -> Result<()> {
        if self.pool.is_worker() {
            tracing::error!("wait_for_completion is not allowed in a worker");
            return Err(Error::Role("wait_for_completion"));
        }

        loop {
            self.check_crashed();

            let Some(view) = &self.view else {
                return Err(Error::QueueInactive);
            };

            {
                let _guard = spinlock::acquire(
                    &view.header().lock,
                    self.config.lock_budget,
                    &mut self.backoff,
                )?;
                if view.is_empty() {
                    return Ok(());
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stop the workers, reclaim them, and unmap the queue.
    ///
    /// Workers finish the item they are processing, observe the stop flag,
    /// and exit; stragglers and idle workers are then killed. Destroying a
    /// queue that is not running is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.pool.is_worker() {
            return Err(Error::Role("destroy"));
        }
        if self.view.is_none() {
            return Ok(());
        }

        tracing::info!(posted = self.posted, "destroying request queue");

        if let Some(view) = &self.view {
            view.request_stop();
        }

        if let Err(err) = self.pool.wait_for_all() {
            // Report and carry on; teardown must finish regardless.
            tracing::warn!(%err, "worker crashed during queue shutdown");
        }
        self.pool.kill_all();
        self.pool.post_fork();

        self.view = None;
        self.region = None;
        Ok(())
    }

    /// Number of successful posts over this queue's lifetime.
    pub fn posted(&self) -> u64 {
        self.posted
    }

    /// The underlying process pool (role accessors, statistics).
    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    /// Aggregate worker counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Child side: dequeue and execute until stop is observed.
    fn worker_loop(&mut self, index: usize, handler: fn(&T)) -> ! {
        tracing::debug!(worker = index, "queue worker loop starting");

        // Re-seed with this worker's own pid; the state inherited across
        // fork would make every worker back off in lockstep.
        self.backoff = Backoff::new();

        loop {
            if self.view.as_ref().is_none_or(|view| view.stop_requested()) {
                break;
            }

            match self.next_request() {
                Ok(Some(offset)) => {
                    let panicked = if let Some(view) = &self.view {
                        catch_unwind(AssertUnwindSafe(|| handler(view.item(offset)))).is_err()
                    } else {
                        false
                    };
                    if panicked {
                        // Die without the completion byte; the supervisor
                        // classifies that as a crash. Unwinding further
                        // would run supervisor-owned caller frames in this
                        // forked copy.
                        tracing::error!(worker = index, "worker function panicked");
                        let _ = self.pool.exit_child(false, false);
                        unsafe { libc::_exit(1) }
                    }
                    if let Err(err) = self.free_request(offset) {
                        tracing::error!(worker = index, %err, "failed to free request node");
                    }
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    // Lock timeout; treated like an empty poll.
                    tracing::error!(worker = index, %err, "dequeue failed");
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }

        tracing::debug!(worker = index, "queue worker loop stopping");

        // exit_child only errs in the supervisor, and this is a worker.
        match self.pool.exit_child(true, false) {
            Ok(never) => match never {},
            Err(_) => unsafe { libc::_exit(0) },
        }
    }

    /// Detach the head node, if any.
    fn next_request(&mut self) -> Result<Option<usize>> {
        let Some(view) = &self.view else {
            return Err(Error::QueueInactive);
        };
        let _guard = spinlock::acquire(
            &view.header().lock,
            self.config.lock_budget,
            &mut self.backoff,
        )?;
        Ok(view.pop_front())
    }

    /// Return a processed node to the freelist.
    fn free_request(&mut self, offset: usize) -> Result<()> {
        let Some(view) = &self.view else {
            return Err(Error::QueueInactive);
        };
        let _guard = spinlock::acquire(
            &view.header().lock,
            self.config.lock_budget,
            &mut self.backoff,
        )?;
        view.push_free(offset);
        Ok(())
    }

    /// At most once per [`CRASH_CHECK_INTERVAL`], probe worker liveness.
    /// A crashed worker is reported; the queue keeps serving with the
    /// remaining workers.
    fn check_crashed(&mut self) {
        if self.last_crash_check.elapsed() < CRASH_CHECK_INTERVAL {
            return;
        }
        self.last_crash_check = Instant::now();

        let crashed = self.pool.reap_dead_workers();
        if crashed > 0 {
            tracing::warn!(crashed, "continuing with the remaining workers");
        }
    }
}

impl<T: Copy + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        if self.pool.is_supervisor() {
            let _ = self.destroy();
        }
    }
}
