//! Error types for forkpool.

use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum Error {
    /// A system call failed. The operation that produced it has been rolled
    /// back as far as possible (signal dispositions restored, mappings
    /// released).
    #[error("{op} failed: {errno}")]
    Sys {
        /// The system call that failed.
        op: &'static str,
        #[source]
        errno: nix::errno::Errno,
    },

    /// A worker was observed no longer alive without having set its
    /// completion byte. Terminal for a pool run; the remaining workers have
    /// already been killed by the time this is returned.
    #[error("worker {index} (pid {pid}) crashed before completing")]
    ChildCrashed { index: usize, pid: i32 },

    /// The request queue's arena and freelist are both exhausted.
    #[error("request queue is full")]
    QueueFull,

    /// The queue lock could not be acquired within the configured budget.
    /// No state was mutated.
    #[error("timed out waiting for the queue lock")]
    LockTimeout,

    /// An operation was invoked from the wrong side of the fork, e.g.
    /// `exit_child` in the supervisor or `post` in a worker. Nothing was
    /// done.
    #[error("{0} is not allowed in this process role")]
    Role(&'static str),

    /// The queue has not been started, or has already been destroyed.
    #[error("the request queue is not active")]
    QueueInactive,

    /// Invalid configuration (zero workers, zero capacity, ...).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn sys(op: &'static str, errno: nix::errno::Errno) -> Self {
        Self::Sys { op, errno }
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, Error>;
