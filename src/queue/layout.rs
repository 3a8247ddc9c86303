//! Shared-memory layout of the request queue.
//!
//! The mapping starts with a [`Header`] followed by a bump arena of
//! [`Node`] slots. Links are byte offsets from the mapping base rather
//! than pointers; offset 0 is where the header lives, so 0 doubles as the
//! null link. Nodes are carved from the arena at `fill` when the freelist
//! is empty and recycled through the freelist after processing; they are
//! never returned to the arena, so a node's offset stays valid for the
//! queue's lifetime even while a detached node is being read outside the
//! lock.
//!
//! Every header field is an atomic. The list fields are only mutated under
//! the queue spinlock and use relaxed ordering; the lock's release/acquire
//! pair is what publishes them across processes. `stop` is read without
//! the lock by the worker loop.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Queue header, placed at offset 0 of the shared mapping.
#[repr(C)]
pub(crate) struct Header {
    /// The queue spinlock byte.
    pub lock: AtomicU8,
    /// Graceful-stop flag for the worker loops.
    stop: AtomicU8,
    /// Byte offset of the next unallocated arena slot.
    fill: AtomicUsize,
    /// Offset of the first queued node, 0 if the queue is empty.
    head: AtomicUsize,
    /// Offset of the last queued node, 0 if the queue is empty.
    tail: AtomicUsize,
    /// Offset of the freelist top, 0 if the freelist is empty.
    free: AtomicUsize,
}

/// One queue slot: a link plus the user payload by value.
#[repr(C)]
struct Node<T> {
    next: AtomicUsize,
    item: UnsafeCell<MaybeUninit<T>>,
}

/// Typed view over the shared queue mapping. One per process; the mapping
/// itself is owned by the supervisor's [`crate::shm::SharedRegion`].
pub(crate) struct QueueView<T> {
    base: *mut u8,
    len: usize,
    _marker: PhantomData<*mut T>,
}

impl<T: Copy> QueueView<T> {
    /// Offset of the first node slot: the header rounded up to the node's
    /// alignment.
    fn first_node_offset() -> usize {
        size_of::<Header>().next_multiple_of(align_of::<Node<T>>())
    }

    /// Total mapping size for a queue of `capacity` nodes.
    pub fn layout_len(capacity: usize) -> usize {
        Self::first_node_offset() + capacity * size_of::<Node<T>>()
    }

    /// Build a view over `len` bytes at `base`.
    ///
    /// # Safety
    /// `base` must point to a live, zeroed shared mapping of at least
    /// `len >= layout_len(1)` bytes that outlives the view, and `base` must
    /// be at least [`Header`]-aligned (any page-aligned mapping is).
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len,
            _marker: PhantomData,
        }
    }

    /// Initialize a freshly mapped (all-zero) header. Supervisor-only,
    /// before any fork.
    pub fn init(&self) {
        self.header().fill.store(Self::first_node_offset(), Ordering::Relaxed);
    }

    pub fn header(&self) -> &Header {
        // SAFETY: the mapping starts with a Header (see `new`).
        unsafe { &*self.base.cast::<Header>() }
    }

    fn node(&self, offset: usize) -> &Node<T> {
        debug_assert!(offset >= Self::first_node_offset());
        debug_assert!(offset + size_of::<Node<T>>() <= self.len);
        debug_assert!((offset - Self::first_node_offset()) % size_of::<Node<T>>() == 0);
        // SAFETY: offsets are only ever produced by push_back's allocator
        // and stay within the arena; nodes never move.
        unsafe { &*self.base.add(offset).cast::<Node<T>>() }
    }

    /// Whether the worker loops were asked to stop. Read without the lock.
    pub fn stop_requested(&self) -> bool {
        self.header().stop.load(Ordering::Acquire) != 0
    }

    /// Ask the worker loops to stop.
    pub fn request_stop(&self) {
        self.header().stop.store(1, Ordering::Release);
    }

    /// Append `item` at the tail. Caller must hold the queue lock.
    ///
    /// A node comes from the freelist if possible, otherwise from the bump
    /// arena; [`Error::QueueFull`] when both are exhausted.
    pub fn push_back(&self, item: T) -> Result<()> {
        let header = self.header();

        let offset = {
            let free = header.free.load(Ordering::Relaxed);
            if free != 0 {
                header
                    .free
                    .store(self.node(free).next.load(Ordering::Relaxed), Ordering::Relaxed);
                free
            } else {
                let fill = header.fill.load(Ordering::Relaxed);
                if fill + size_of::<Node<T>>() > self.len {
                    return Err(Error::QueueFull);
                }
                header.fill.store(fill + size_of::<Node<T>>(), Ordering::Relaxed);
                fill
            }
        };

        let node = self.node(offset);
        // SAFETY: this node is reachable from neither list nor any worker
        // while we hold the lock; T is Copy, so plain overwrite is fine.
        unsafe { (*node.item.get()).write(item) };
        node.next.store(0, Ordering::Relaxed);

        let tail = header.tail.load(Ordering::Relaxed);
        if tail == 0 {
            debug_assert_eq!(header.head.load(Ordering::Relaxed), 0);
            header.head.store(offset, Ordering::Relaxed);
        } else {
            self.node(tail).next.store(offset, Ordering::Relaxed);
        }
        header.tail.store(offset, Ordering::Relaxed);

        Ok(())
    }

    /// Detach and return the head node's offset, or `None` when empty.
    /// Caller must hold the queue lock. The detached node belongs to the
    /// caller until it is passed to [`Self::push_free`].
    pub fn pop_front(&self) -> Option<usize> {
        let header = self.header();

        let head = header.head.load(Ordering::Relaxed);
        if head == 0 {
            return None;
        }

        let next = self.node(head).next.load(Ordering::Relaxed);
        header.head.store(next, Ordering::Relaxed);
        if next == 0 {
            header.tail.store(0, Ordering::Relaxed);
        }

        Some(head)
    }

    /// The payload of a detached node. Valid until the node is freed; may
    /// be read outside the lock because nodes never move and a detached
    /// node has a single owner.
    pub fn item(&self, offset: usize) -> &T {
        // SAFETY: push_back initialized the payload before the node became
        // reachable.
        unsafe { (*self.node(offset).item.get()).assume_init_ref() }
    }

    /// Return a processed node to the freelist (LIFO). Caller must hold
    /// the queue lock.
    pub fn push_free(&self, offset: usize) {
        let header = self.header();
        self.node(offset)
            .next
            .store(header.free.load(Ordering::Relaxed), Ordering::Relaxed);
        header.free.store(offset, Ordering::Relaxed);
    }

    /// Whether the active list is empty. Caller must hold the queue lock.
    pub fn is_empty(&self) -> bool {
        self.header().head.load(Ordering::Relaxed) == 0
    }
}
