//! Fixed-size process pool.
//!
//! Forks a bounded number of worker processes, runs each to completion, and
//! reports aggregate success or failure. Completion is observed through a
//! shared-memory byte array rather than `waitpid`:
//!
//! ```text
//!                   ┌──────────────────┐
//!                   │    Supervisor    │
//!                   │  (poll loop over │
//!                   │ completion array)│
//!                   └────────┬─────────┘
//!                            │ fork × N, at most M at a time
//!             ┌──────────────┼──────────────┐
//!       ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!       │ Worker 0  │  │ Worker 1  │  │ Worker N-1│
//!       │ sets byte │  │ sets byte │  │ sets byte │
//!       │  0 when   │  │  1 when   │  │ N-1 when  │
//!       │   done    │  │   done    │  │   done    │
//!       └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! The poll loop observes completion within one ~10 ms pass instead of
//! paying for full child teardown and parent rescheduling, and it stays
//! correct for workers that remain alive (idle) after finishing. `SIGCHLD`
//! is scoped to `SIG_IGN` for the duration of a run so exiting children are
//! reaped by the kernel and never become zombies.

mod completion;
mod role;
mod signal;

pub use role::{PoolEvent, PoolObserver, PoolStats, WorkerStatus};

use std::convert::Infallible;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::{self, ForkResult, Pid};

use crate::error::{Error, Result};
use completion::CompletionBoard;
use role::{Role, WorkerRecord};
use signal::{SigchldGuard, process_alive};

/// Poll loop frequency for the wait and kill loops.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How many poll passes between liveness probes (~100 ms).
const CRASH_TEST_PASSES: u32 = 10;

/// How often an idle worker probes the supervisor's liveness.
const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of [`ProcessPool::run`], distinguishing the two sides of the
/// fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Run {
    /// In the supervisor: every worker completed and was reclaimed.
    Supervisor,
    /// In worker `index`: execute the workload, then call
    /// [`ProcessPool::exit_child`].
    Worker {
        /// Zero-based index of this worker in fork order.
        index: usize,
    },
}

/// Which side of a detached fork this process is on. Unlike [`Run`], the
/// supervisor side has not waited for anything yet.
pub(crate) enum Forked {
    Supervisor,
    Worker { index: usize },
}

/// Result of one pass over the worker records.
#[allow(dead_code)] // identity fields are for diagnostics
enum WaitOutcome {
    Completed { index: usize, pid: Pid },
    Crashed { index: usize, pid: Pid },
    AllDone,
}

/// A pool of forked worker processes coordinated through shared memory.
///
/// One value serves both sides of the fork: after [`ProcessPool::run`]
/// returns, the value either is the supervisor (workers done, resources
/// released) or has become worker `i` and must finish with
/// [`ProcessPool::exit_child`]. A pool can be reused for another run after
/// a successful one.
pub struct ProcessPool {
    role: Role,
    parent_pid: Pid,
    records: Vec<WorkerRecord>,
    board: Option<CompletionBoard>,
    sigchld: Option<SigchldGuard>,
    observer: Option<Box<dyn PoolObserver>>,
    stats: PoolStats,
}

impl ProcessPool {
    pub fn new() -> Self {
        Self {
            role: Role::Supervisor,
            parent_pid: unistd::getpid(),
            records: Vec::new(),
            board: None,
            sigchld: None,
            observer: None,
            stats: PoolStats::default(),
        }
    }

    /// Attach an observer receiving [`PoolEvent`] notifications.
    pub fn with_observer(mut self, observer: Box<dyn PoolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replace the observer.
    pub fn set_observer(&mut self, observer: Box<dyn PoolObserver>) {
        self.observer = Some(observer);
    }

    /// Fork `total` workers, at most `max_concurrent` alive at a time, and
    /// block until all of them have completed.
    ///
    /// In the supervisor this returns [`Run::Supervisor`] once every worker
    /// reported completion and all resources are released, or
    /// [`Error::ChildCrashed`] if any worker died without completing (the
    /// remaining workers are killed first). In each forked child it returns
    /// [`Run::Worker`]; the child must eventually call
    /// [`ProcessPool::exit_child`] and never returns to the caller's caller.
    ///
    /// `total >= 1` and `max_concurrent >= 1`; `max_concurrent` is clamped
    /// to `total`.
    pub fn run(&mut self, total: usize, max_concurrent: usize) -> Result<Run> {
        match self.fork_workers(total, max_concurrent, true)? {
            Forked::Worker { index } => Ok(Run::Worker { index }),
            Forked::Supervisor => Ok(Run::Supervisor),
        }
    }

    /// Worker side: report the workload's outcome and terminate.
    ///
    /// On `success`, the worker's completion byte is published first; with
    /// `keep_idle` the process then stays alive (polling the supervisor's
    /// liveness every 500 ms) so shared resources it exposes remain valid
    /// until the supervisor kills it or dies. On failure the process exits
    /// immediately with a non-zero code and no completion byte, which the
    /// supervisor classifies as a crash.
    ///
    /// Never returns in a worker. In the supervisor this is a role misuse:
    /// an error is returned and nothing happens.
    pub fn exit_child(&self, success: bool, keep_idle: bool) -> Result<Infallible> {
        let Role::Worker { index } = self.role else {
            tracing::error!("exit_child is not allowed in the supervisor");
            return Err(Error::Role("exit_child"));
        };

        // The child duplicated the parent's stdio buffers at fork; flush so
        // nothing is lost by _exit below.
        flush_output();

        if success {
            if let Some(board) = &self.board {
                board.mark_done(index);
            }
            if keep_idle {
                while process_alive(self.parent_pid) {
                    thread::sleep(PARENT_POLL_INTERVAL);
                }
                tracing::debug!(
                    worker = index,
                    parent = self.parent_pid.as_raw(),
                    "supervisor is gone, idle worker exiting"
                );
            }
            // _exit skips at-exit hooks and stdio finalization; the flush
            // above is the only cleanup a worker needs.
            unsafe { libc::_exit(0) }
        } else {
            tracing::error!(worker = index, "worker reported failure");
            unsafe { libc::_exit(1) }
        }
    }

    /// Whether this process is the supervisor.
    pub fn is_supervisor(&self) -> bool {
        matches!(self.role, Role::Supervisor)
    }

    /// Whether this process is a forked worker.
    pub fn is_worker(&self) -> bool {
        !self.is_supervisor()
    }

    /// This worker's zero-based index, or `None` in the supervisor.
    pub fn worker_index(&self) -> Option<usize> {
        match self.role {
            Role::Worker { index } => Some(index),
            Role::Supervisor => None,
        }
    }

    /// Pid of the supervisor process. In the supervisor this is its own pid.
    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    /// Aggregate counters for this pool.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Fork the workers, optionally without waiting for them (queue mode).
    ///
    /// The schedule: whenever `max_concurrent` workers are running, block in
    /// [`Self::wait_for_one`] before forking the next. A crash aborts the
    /// schedule. On any abort the already-forked workers are killed and all
    /// resources released before the error is returned.
    pub(crate) fn fork_workers(
        &mut self,
        total: usize,
        max_concurrent: usize,
        wait_for_all: bool,
    ) -> Result<Forked> {
        if self.is_worker() {
            tracing::error!("run is not allowed in a worker");
            return Err(Error::Role("run"));
        }
        if total == 0 {
            return Err(Error::Config("total worker count must be at least 1".into()));
        }
        if max_concurrent == 0 {
            return Err(Error::Config(
                "max concurrent worker count must be at least 1".into(),
            ));
        }
        let max_concurrent = max_concurrent.min(total);

        self.pre_fork(total)?;

        tracing::info!(
            workers = total,
            concurrent = max_concurrent,
            "forking worker processes"
        );
        self.notify(PoolEvent::PreFork);

        let mut running = 0usize;
        let mut schedule_err = None;

        for index in 0..total {
            if running == max_concurrent {
                match self.wait_for_one() {
                    WaitOutcome::Crashed { index, pid } => {
                        schedule_err = Some(Error::ChildCrashed {
                            index,
                            pid: pid.as_raw(),
                        });
                        break;
                    }
                    WaitOutcome::Completed { .. } => running -= 1,
                    WaitOutcome::AllDone => running = 0,
                }
            }

            // Both sides of the fork share the stdio buffers that exist at
            // this point; flush so pending output is not printed twice.
            flush_output();

            // SAFETY: the child touches only shared memory, atomics, and
            // async-signal-safe syscalls before control returns to user
            // code.
            match unsafe { unistd::fork() } {
                Err(errno) => {
                    tracing::error!(worker = index, %errno, "fork failed");
                    schedule_err = Some(Error::sys("fork", errno));
                    break;
                }
                Ok(ForkResult::Child) => {
                    self.role = Role::Worker { index };
                    tracing::debug!(
                        worker = index,
                        pid = unistd::getpid().as_raw(),
                        "worker running"
                    );
                    return Ok(Forked::Worker { index });
                }
                Ok(ForkResult::Parent { child }) => {
                    tracing::debug!(worker = index, pid = child.as_raw(), "forked worker");
                    self.records[index] = WorkerRecord {
                        pid: child,
                        status: WorkerStatus::Running,
                    };
                    self.stats.forked += 1;
                    running += 1;
                    self.notify(PoolEvent::ChildFork);
                }
            }
        }

        if let Some(err) = schedule_err {
            self.kill_all();
            self.post_fork();
            return Err(err);
        }

        self.notify(PoolEvent::PostFork);

        if wait_for_all {
            let waited = self.wait_for_all();
            self.kill_all();
            self.post_fork();
            waited?;
        }

        Ok(Forked::Supervisor)
    }

    /// Repeatedly wait until every worker completed or one crashed. Emits
    /// [`PoolEvent::ChildrenDone`] on clean completion.
    pub(crate) fn wait_for_all(&mut self) -> Result<()> {
        tracing::debug!("waiting for workers to complete");
        loop {
            match self.wait_for_one() {
                WaitOutcome::AllDone => break,
                WaitOutcome::Completed { .. } => continue,
                WaitOutcome::Crashed { index, pid } => {
                    return Err(Error::ChildCrashed {
                        index,
                        pid: pid.as_raw(),
                    });
                }
            }
        }

        // Workers are either exited or alive but idle; either way done.
        tracing::info!("all workers completed");
        self.notify(PoolEvent::ChildrenDone);
        Ok(())
    }

    /// One blocking wait: the next completed or crashed worker, or all-done.
    ///
    /// Completion bytes are checked on every ~10 ms pass; liveness only
    /// every [`CRASH_TEST_PASSES`] passes, since `kill(pid, 0)` per worker
    /// per pass would dominate the loop. Ties resolve by ascending index.
    fn wait_for_one(&mut self) -> WaitOutcome {
        let Some(board) = &self.board else {
            return WaitOutcome::AllDone;
        };

        let mut crash_timer = CRASH_TEST_PASSES;

        loop {
            let mut have_running = false;

            for (index, rec) in self.records.iter_mut().enumerate() {
                if rec.status != WorkerStatus::Running {
                    continue;
                }

                if board.is_done(index) {
                    rec.status = WorkerStatus::Done;
                    self.stats.completed += 1;
                    tracing::debug!(worker = index, pid = rec.pid.as_raw(), "worker completed");
                    return WaitOutcome::Completed {
                        index,
                        pid: rec.pid,
                    };
                }

                if crash_timer == 0 && !process_alive(rec.pid) {
                    rec.status = WorkerStatus::Done;
                    self.stats.crashed += 1;
                    tracing::warn!(
                        worker = index,
                        pid = rec.pid.as_raw(),
                        "worker is no longer running (crashed or failed)"
                    );
                    return WaitOutcome::Crashed {
                        index,
                        pid: rec.pid,
                    };
                }

                have_running = true;
            }

            if !have_running {
                return WaitOutcome::AllDone;
            }

            if crash_timer == 0 {
                crash_timer = CRASH_TEST_PASSES;
            }

            thread::sleep(POLL_INTERVAL);
            crash_timer -= 1;
        }
    }

    /// Kill every worker that is still alive and wait until all are gone.
    pub(crate) fn kill_all(&mut self) {
        if self.records.is_empty() {
            return;
        }

        let mut have_survivors = false;
        for (index, rec) in self.records.iter_mut().enumerate() {
            if rec.status == WorkerStatus::NotRunning {
                continue;
            }
            if process_alive(rec.pid) {
                have_survivors = true;
                tracing::debug!(worker = index, pid = rec.pid.as_raw(), "terminating worker");
                if let Err(errno) = nix::sys::signal::kill(rec.pid, Signal::SIGKILL) {
                    tracing::warn!(
                        worker = index,
                        pid = rec.pid.as_raw(),
                        %errno,
                        "SIGKILL failed"
                    );
                }
            } else {
                rec.status = WorkerStatus::NotRunning;
            }
        }

        if !have_survivors {
            return;
        }

        loop {
            let mut still_alive = false;

            for rec in self.records.iter_mut() {
                if rec.status == WorkerStatus::NotRunning {
                    continue;
                }
                if process_alive(rec.pid) {
                    still_alive = true;
                } else {
                    rec.status = WorkerStatus::NotRunning;
                }
            }

            if !still_alive {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Mark every running worker whose process is gone as done. Used by the
    /// queue variant's periodic crash check; a crashed worker there is
    /// reported but not fatal.
    pub(crate) fn reap_dead_workers(&mut self) -> usize {
        let mut reaped = 0;
        for (index, rec) in self.records.iter_mut().enumerate() {
            if rec.status != WorkerStatus::Running {
                continue;
            }
            if process_alive(rec.pid) {
                continue;
            }
            rec.status = WorkerStatus::Done;
            self.stats.crashed += 1;
            reaped += 1;
            tracing::warn!(worker = index, pid = rec.pid.as_raw(), "worker has crashed");
        }
        reaped
    }

    /// Install the SIGCHLD scope and the completion array, reset records.
    /// On failure everything already acquired is rolled back.
    fn pre_fork(&mut self, total: usize) -> Result<()> {
        self.records.clear();
        self.role = Role::Supervisor;
        self.parent_pid = unistd::getpid();
        self.stats = PoolStats::default();
        // The worker count may change between runs; rebuild the array.
        self.board = None;
        self.sigchld = None;

        let guard = SigchldGuard::install()?;
        let board = match CompletionBoard::new(total) {
            Ok(board) => board,
            Err(err) => {
                guard.restore();
                return Err(err);
            }
        };

        self.sigchld = Some(guard);
        self.board = Some(board);
        self.records.resize_with(total, WorkerRecord::default);
        Ok(())
    }

    /// Restore the SIGCHLD disposition and release the completion array.
    pub(crate) fn post_fork(&mut self) {
        if let Some(guard) = self.sigchld.take() {
            guard.restore();
        }
        self.board = None;
    }

    fn notify(&self, event: PoolEvent) {
        if let Some(observer) = &self.observer {
            observer.on_notify(event);
        }
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Flush stdout and stderr, ignoring errors. Called on both sides of every
/// fork boundary.
fn flush_output() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}
