//! forkpool - fork-based worker coordination for Unix.
//!
//! Two cooperating abstractions built on OS process primitives:
//!
//! - [`ProcessPool`]: fork a bounded number of worker processes, run each
//!   to completion with a concurrency cap, and report aggregate success or
//!   failure. Completion is signalled through a shared-memory byte array
//!   polled by the supervisor, not through `waitpid`, so a finished worker
//!   is observed within tens of microseconds and may even stay alive
//!   (idle) after completing.
//! - [`WorkQueue`]: fork a persistent pool of workers and feed them a
//!   stream of fixed-size items through a spinlock-protected FIFO in
//!   shared memory.
//!
//! # Example
//!
//! ```no_run
//! use forkpool::{ProcessPool, Run};
//!
//! fn main() -> forkpool::Result<()> {
//!     let mut pool = ProcessPool::new();
//!     match pool.run(4, 2)? {
//!         Run::Worker { index } => {
//!             println!("worker {index} doing work");
//!             pool.exit_child(true, false)?;
//!             unreachable!("exit_child does not return in a worker");
//!         }
//!         Run::Supervisor => {
//!             // All four workers have completed.
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The library emits `tracing` events; see [`logging`] for an optional
//! subscriber initializer.
//!
//! Unix-only: the coordination protocol is built on `fork`, anonymous
//! shared mappings, and signal 0 liveness probes.

pub mod error;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod shm;

pub use error::{Error, Result};
pub use pool::{PoolEvent, PoolObserver, PoolStats, ProcessPool, Run, WorkerStatus};
pub use queue::{QueueConfig, WorkQueue};
pub use shm::SharedRegion;
