//! Integration tests for the process work queue.
//!
//! Handlers are plain fn pointers executed in forked workers, so each test
//! passes the address of its shared page through a static that is set
//! before `run` forks. Every test uses its own statics; the tests run
//! concurrently in one binary.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use forkpool::{Error, QueueConfig, SharedRegion, WorkQueue};

#[test]
fn queue_drains_all_items() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    fn handler(item: &u32) {
        let base = PAGE.load(Ordering::Acquire) as *const u8;
        let counter = unsafe { &*base.cast::<AtomicU64>() };
        let delivered = unsafe { std::slice::from_raw_parts(base.add(8).cast::<AtomicU8>(), 1000) };
        delivered[*item as usize].fetch_add(1, Ordering::AcqRel);
        counter.fetch_add(1, Ordering::AcqRel);
    }

    let region = SharedRegion::zeroed(8 + 1000).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(2000));
    queue.run(4, handler).unwrap();

    for value in 0..1000u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();
    // The last items may still be inside their handlers when the list
    // empties; destroy waits for the workers to finish and exit.
    queue.destroy().unwrap();

    let counter = unsafe { &*region.as_ptr().cast::<AtomicU64>() };
    assert_eq!(counter.load(Ordering::Acquire), 1000);

    let delivered =
        unsafe { std::slice::from_raw_parts(region.as_ptr().add(8).cast::<AtomicU8>(), 1000) };
    for (value, count) in delivered.iter().enumerate() {
        assert_eq!(
            count.load(Ordering::Acquire),
            1,
            "value {value} delivered {} times",
            count.load(Ordering::Acquire)
        );
    }

    assert_eq!(queue.posted(), 1000);
}

#[test]
fn queue_overflow_reports_full_and_recovers() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    fn handler(_: &u32) {
        let base = PAGE.load(Ordering::Acquire) as *const u8;
        let gate = unsafe { &*base.cast::<AtomicU8>() };
        while gate.load(Ordering::Acquire) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let processed = unsafe { &*base.add(8).cast::<AtomicU64>() };
        processed.fetch_add(1, Ordering::AcqRel);
    }

    let region = SharedRegion::zeroed(16).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(8));
    queue.run(1, handler).unwrap();

    // The single worker blocks on the gate, so no node is ever freed:
    // eight posts exhaust the arena.
    for value in 0..8u32 {
        queue.post(value).unwrap();
    }
    assert!(matches!(queue.post(8), Err(Error::QueueFull)));

    // The failed post left the queue intact; unblock and drain.
    let gate = unsafe { &*region.as_ptr().cast::<AtomicU8>() };
    gate.store(1, Ordering::Release);
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    let processed = unsafe { &*region.as_ptr().add(8).cast::<AtomicU64>() };
    assert_eq!(processed.load(Ordering::Acquire), 8);
}

#[test]
fn queue_capacity_one_serializes() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    fn handler(_: &u32) {
        let counter =
            unsafe { &*(PAGE.load(Ordering::Acquire) as *const u8).cast::<AtomicU64>() };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    let region = SharedRegion::zeroed(8).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(1));
    queue.run(1, handler).unwrap();

    // With one node the producer must wait out QueueFull between posts.
    for value in 0..20u32 {
        loop {
            match queue.post(value) {
                Ok(()) => break,
                Err(Error::QueueFull) => thread::sleep(Duration::from_millis(1)),
                Err(err) => panic!("unexpected post failure: {err}"),
            }
        }
    }
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    let counter = unsafe { &*region.as_ptr().cast::<AtomicU64>() };
    assert_eq!(counter.load(Ordering::Acquire), 20);
}

#[test]
fn queue_fifo_for_a_single_worker() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);
    const ITEMS: usize = 128;

    fn handler(item: &u32) {
        let base = PAGE.load(Ordering::Acquire) as *const u8;
        let next = unsafe { &*base.cast::<AtomicU32>() };
        let values =
            unsafe { std::slice::from_raw_parts(base.add(4).cast::<AtomicU32>(), ITEMS) };
        let slot = next.fetch_add(1, Ordering::AcqRel) as usize;
        values[slot].store(*item, Ordering::Release);
    }

    let region = SharedRegion::zeroed(4 + 4 * ITEMS).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(ITEMS));
    queue.run(1, handler).unwrap();

    for value in 0..ITEMS as u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    // One consumer: delivery order must match post order exactly.
    let values =
        unsafe { std::slice::from_raw_parts(region.as_ptr().add(4).cast::<AtomicU32>(), ITEMS) };
    for (position, value) in values.iter().enumerate() {
        assert_eq!(value.load(Ordering::Acquire), position as u32);
    }
}

#[test]
fn queue_survives_a_crashed_worker() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    fn handler(item: &u32) {
        if *item == 0 {
            // Simulated crash: die without any completion protocol.
            unsafe { libc::_exit(3) }
        }
        let counter =
            unsafe { &*(PAGE.load(Ordering::Acquire) as *const u8).cast::<AtomicU64>() };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    let region = SharedRegion::zeroed(8).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(64));
    queue.run(2, handler).unwrap();

    queue.post(0).unwrap();
    for value in 1..=10u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    // The surviving worker drained everything else.
    let counter = unsafe { &*region.as_ptr().cast::<AtomicU64>() };
    assert_eq!(counter.load(Ordering::Acquire), 10);
    assert_eq!(queue.stats().crashed, 1);
}

#[test]
fn queue_destroy_is_idempotent() {
    fn handler(_: &u32) {}

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(16));
    queue.run(2, handler).unwrap();

    queue.post(1).unwrap();
    queue.wait_for_completion().unwrap();

    queue.destroy().unwrap();
    queue.destroy().unwrap();

    // A destroyed queue rejects further posts.
    assert!(matches!(queue.post(2), Err(Error::QueueInactive)));
}

#[test]
fn queue_reusable_after_destroy() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    fn handler(_: &u32) {
        let counter =
            unsafe { &*(PAGE.load(Ordering::Acquire) as *const u8).cast::<AtomicU64>() };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    let region = SharedRegion::zeroed(8).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);
    let counter = unsafe { &*region.as_ptr().cast::<AtomicU64>() };

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(32));

    queue.run(2, handler).unwrap();
    for value in 0..5u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    queue.run(2, handler).unwrap();
    for value in 0..7u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    assert_eq!(counter.load(Ordering::Acquire), 12);
}

#[test]
fn queue_two_batches_on_one_run() {
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    fn handler(_: &u32) {
        let counter =
            unsafe { &*(PAGE.load(Ordering::Acquire) as *const u8).cast::<AtomicU64>() };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    let region = SharedRegion::zeroed(8).unwrap();
    PAGE.store(region.as_ptr() as usize, Ordering::Release);

    let mut queue = WorkQueue::<u32>::with_config(QueueConfig::default().with_capacity(64));
    queue.run(3, handler).unwrap();

    for value in 0..20u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();

    for value in 0..10u32 {
        queue.post(value).unwrap();
    }
    queue.wait_for_completion().unwrap();
    queue.destroy().unwrap();

    let counter = unsafe { &*region.as_ptr().cast::<AtomicU64>() };
    assert_eq!(counter.load(Ordering::Acquire), 30);
}
