//! Anonymous, page-granular memory mappings.
//!
//! This crate wraps the platform primitives (`mmap` on Unix, `VirtualAlloc`
//! on Windows) behind one small type, [`PageMap`]: a read-write anonymous
//! mapping whose length is a whole number of hardware pages and whose base
//! address is page-aligned. The mapping is released when the handle drops.
//!
//! Allocation failure is reported as [`std::io::Error`] so callers can
//! distinguish address-space exhaustion from other OS failures.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows this is typically 64KiB; on Unix it equals the page size.
/// Mapping lengths are internally rounded to whole pages, not to this
/// granularity, but callers sizing large reservations may want it.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An owned anonymous mapping of whole pages.
///
/// The memory is readable and writable, zero-filled by the OS, and unmapped
/// on drop. `PageMap` is `Send + Sync`; synchronizing access to the bytes it
/// exposes is the caller's responsibility.
#[derive(Debug)]
pub struct PageMap {
    inner: os::MapInner,
}

impl PageMap {
    /// Maps at least `len` bytes of anonymous memory, rounded up to a whole
    /// number of pages.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the mapping cannot be established (most
    /// commonly out of memory or address space). A `len` of zero is
    /// rejected with `InvalidInput`.
    pub fn anon(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be nonzero",
            ));
        }
        let page = page_size();
        let rounded = len
            .checked_add(page - 1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping length overflow"))?
            & !(page - 1);
        // SAFETY: rounded is nonzero and page-aligned; the inner mapper owns
        // the region for the lifetime of the returned handle.
        let inner = unsafe { os::MapInner::map_anon(rounded)? };
        Ok(Self { inner })
    }

    /// Base address of the mapping. Always page-aligned and non-null.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the mapping in bytes (a multiple of [`page_size`]).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when the mapping is empty. Kept for API completeness; `anon`
    /// never produces an empty mapping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

// SAFETY: the mapping is plain process memory with no thread affinity; the
// handle only carries a pointer and a length.
unsafe impl Send for PageMap {}
// SAFETY: shared access hands out raw pointers only; no interior state.
unsafe impl Sync for PageMap {}
