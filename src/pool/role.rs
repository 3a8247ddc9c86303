//! Process roles, worker records, and the notification hook.

use nix::unistd::Pid;

/// Which side of the fork this process is on.
///
/// Every process starts as the supervisor; a forked child becomes
/// `Worker { index }` before the pool hands control back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Supervisor,
    Worker { index: usize },
}

/// Lifecycle state of one worker slot, as seen by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Before fork, or after the slot was reclaimed.
    #[default]
    NotRunning,
    /// Forked and not yet observed to have completed or died.
    Running,
    /// Completion byte observed, or liveness probe failed. The process may
    /// still be alive (idle).
    Done,
}

/// One worker slot. Lives only in the supervisor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerRecord {
    pub pid: Pid,
    pub status: WorkerStatus,
}

impl Default for WorkerRecord {
    fn default() -> Self {
        Self {
            pid: Pid::from_raw(0),
            status: WorkerStatus::NotRunning,
        }
    }
}

/// Notification sent to the pool observer at defined points of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// Right before forking workers.
    PreFork,
    /// Right after forking one worker.
    ChildFork,
    /// Right after forking all workers.
    PostFork,
    /// Right after all workers completed (they might be alive and idle).
    ChildrenDone,
}

/// Observer hook for external instrumentation.
///
/// All notifications are delivered in the supervisor process. Implementations
/// must not mutate pool state; the pool treats the hook as side-effect free.
pub trait PoolObserver: Send + Sync {
    /// Called at each [`PoolEvent`] point. The default does nothing.
    fn on_notify(&self, event: PoolEvent) {
        let _ = event;
    }
}

/// Aggregate counters for a pool's lifetime, in the spirit of a stats
/// endpoint: how many workers were forked, completed, and crashed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Workers successfully forked.
    pub forked: usize,
    /// Workers whose completion byte was observed.
    pub completed: usize,
    /// Workers observed dead without a completion byte.
    pub crashed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_record_default() {
        let rec = WorkerRecord::default();
        assert_eq!(rec.status, WorkerStatus::NotRunning);
        assert_eq!(rec.pid.as_raw(), 0);
    }

    #[test]
    fn test_observer_default_is_noop() {
        struct Quiet;
        impl PoolObserver for Quiet {}
        Quiet.on_notify(PoolEvent::PreFork);
    }

    #[test]
    fn test_role_equality() {
        assert_eq!(Role::Worker { index: 3 }, Role::Worker { index: 3 });
        assert_ne!(Role::Supervisor, Role::Worker { index: 0 });
    }
}
