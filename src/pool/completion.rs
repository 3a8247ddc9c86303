//! Shared completion array.
//!
//! One byte per worker in anonymous shared memory. Worker `i` writes
//! `array[i] = 1` exactly once, with release ordering; the supervisor reads
//! with acquire ordering from its poll loop. No other access happens: the
//! supervisor never writes after creation, and workers never touch each
//! other's slots.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::Result;
use crate::shm::SharedRegion;

pub(crate) struct CompletionBoard {
    region: SharedRegion,
    workers: usize,
}

impl CompletionBoard {
    /// Map a zeroed array with one slot per worker.
    pub fn new(workers: usize) -> Result<Self> {
        let region = SharedRegion::zeroed(workers)?;
        Ok(Self { region, workers })
    }

    fn slots(&self) -> &[AtomicU8] {
        // SAFETY: the region is at least `workers` bytes, lives as long as
        // `self`, and AtomicU8 has the same layout as u8.
        unsafe { std::slice::from_raw_parts(self.region.as_ptr().cast::<AtomicU8>(), self.workers) }
    }

    /// Worker side: publish completion of slot `index`.
    pub fn mark_done(&self, index: usize) {
        self.slots()[index].store(1, Ordering::Release);
    }

    /// Supervisor side: has slot `index` published completion?
    pub fn is_done(&self, index: usize) -> bool {
        self.slots()[index].load(Ordering::Acquire) != 0
    }
}
