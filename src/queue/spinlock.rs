//! Single-byte spinlock for the shared request queue.
//!
//! The lock is one `AtomicU8` inside the queue header, created and zeroed
//! before any fork, so it never straddles a fork boundary in a locked
//! state the way a pthread mutex could. Acquisition is an atomic swap
//! (test-and-set) with acquire ordering; release is a store-release, so
//! everything written inside a critical section is visible to the next
//! process that takes the lock.
//!
//! Contention is handled Ethernet-style: each failed attempt sleeps a
//! random 0-3 ms before retrying, up to a wall-clock budget. The
//! randomness comes from a per-process xorshift generator seeded by pid,
//! which keeps runs reproducible and avoids sharing generator state
//! across fork.

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Per-process backoff delay generator (xorshift32 seeded by pid).
pub(crate) struct Backoff {
    state: u32,
}

impl Backoff {
    pub fn new() -> Self {
        let pid = std::process::id();
        Self {
            // xorshift needs a non-zero seed.
            state: if pid == 0 { 0x9e37_79b9 } else { pid },
        }
    }

    fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// A delay of 0, 1, 2, or 3 milliseconds.
    pub fn delay(&mut self) -> Duration {
        Duration::from_millis(u64::from(self.next() & 0x3))
    }
}

/// Acquire `lock`, spinning with backoff for at most `budget` wall-clock
/// time. Returns a guard that releases on drop, or [`Error::LockTimeout`]
/// with no state mutated.
pub(crate) fn acquire<'a>(
    lock: &'a AtomicU8,
    budget: Duration,
    backoff: &mut Backoff,
) -> Result<SpinGuard<'a>> {
    let deadline = Instant::now() + budget;

    loop {
        if lock.swap(1, Ordering::Acquire) == 0 {
            return Ok(SpinGuard { lock });
        }
        if Instant::now() >= deadline {
            tracing::error!(budget_ms = budget.as_millis() as u64, "queue lock timed out");
            return Err(Error::LockTimeout);
        }
        thread::sleep(backoff.delay());
    }
}

/// Holds the queue lock; releases it with a store-release on drop.
pub(crate) struct SpinGuard<'a> {
    lock: &'a AtomicU8,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}
