//! Anonymous shared-memory regions.
//!
//! Provides the owned mapping underneath all cross-process state: the
//! completion array and the request queue. Regions are created with
//! `mmap(MAP_SHARED | MAP_ANONYMOUS)` before any fork, so every forked child
//! inherits the same physical pages at the same address.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::error::{Error, Result};

/// An owned anonymous shared mapping.
///
/// The region is readable and writable by the creating process and by every
/// process forked after its creation. The kernel zeroes the pages, so a
/// fresh region is all-zero by construction.
///
/// The mapping is released when the owning value is dropped. Children that
/// terminate through [`libc::_exit`] never run the drop, which is fine: a
/// `munmap` only affects the calling process's address space, and the pages
/// themselves live until the last mapping goes away.
pub struct SharedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl SharedRegion {
    /// Map `len` bytes of zeroed shared memory.
    ///
    /// `len` must be non-zero.
    pub fn zeroed(len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| Error::Config("shared region size must be non-zero".into()))?;

        let mut flags = MapFlags::MAP_SHARED;
        // The pages are populated lazily; no swap reservation needed up front.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            flags |= MapFlags::MAP_NORESERVE;
        }

        // SAFETY: anonymous mapping, no address hint, no file descriptor.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )
        }
        .map_err(|errno| Error::sys("mmap", errno))?;

        tracing::trace!(len, "mapped shared region");
        Ok(Self { ptr, len })
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Always false for a live region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped once.
        if let Err(errno) = unsafe { munmap(self.ptr, self.len) } {
            tracing::error!(len = self.len, %errno, "munmap failed");
        }
    }
}

// SAFETY: the region is a raw byte range; all concurrent access goes through
// atomics or is single-writer by protocol. The pointer itself is freely
// movable between threads.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_zeroed() {
        let region = SharedRegion::zeroed(4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_write_read() {
        let region = SharedRegion::zeroed(64).unwrap();
        unsafe {
            *region.as_ptr() = 42;
            *region.as_ptr().add(63) = 99;
            assert_eq!(*region.as_ptr(), 42);
            assert_eq!(*region.as_ptr().add(63), 99);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            SharedRegion::zeroed(0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_len() {
        let region = SharedRegion::zeroed(123).unwrap();
        assert_eq!(region.len(), 123);
        assert!(!region.is_empty());
    }
}
