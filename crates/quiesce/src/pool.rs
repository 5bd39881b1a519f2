//! Page-backed pool of fixed-size radix nodes.
//!
//! Nodes come from anonymous [`PageMap`]s carved into [`NODE_BYTES`]
//! chunks. Fresh mappings are OS-zeroed and freed chunks are re-zeroed
//! before reuse, so every chunk leaving the pool is a valid empty node.
//! Node memory is never unmapped while the pool lives — pointers into a
//! node stay dereferenceable until the whole pool drops, which is what
//! lets readers chase tree edges under an epoch guard.

use parking_lot::Mutex;
use std::fmt;
use std::ptr::{self, NonNull};
use sys_pages::PageMap;

/// Size of one radix node, leaf or upper. One small page.
pub const NODE_BYTES: usize = 4096;

/// Nodes carved per mapping: 64 KiB slabs, the Windows allocation
/// granularity, so slab mapping wastes nothing on either platform.
const SLAB_NODES: usize = 16;
const SLAB_BYTES: usize = SLAB_NODES * NODE_BYTES;

/// Node allocation failed: the OS refused a new mapping, or the pool's
/// configured budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("radix node allocation failed")
    }
}

impl std::error::Error for AllocError {}

struct PoolInner {
    maps: Vec<PageMap>,
    free: Vec<NonNull<u8>>,
    /// Chunks currently handed out.
    allocated: usize,
}

// SAFETY: the free-list pointers address memory owned by `maps`, which
// moves with the struct; nothing is thread-affine.
unsafe impl Send for PoolInner {}

pub(crate) struct PagePool {
    inner: Mutex<PoolInner>,
    /// Cap on concurrently handed-out chunks; `None` is unbounded.
    budget: Option<usize>,
}

impl PagePool {
    pub(crate) fn new() -> Self {
        Self::with_limit(None)
    }

    /// A pool that fails after `budget` outstanding nodes. For exercising
    /// allocation-failure paths without exhausting real memory.
    pub(crate) fn with_budget(budget: usize) -> Self {
        Self::with_limit(Some(budget))
    }

    fn with_limit(budget: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                maps: Vec::new(),
                free: Vec::new(),
                allocated: 0,
            }),
            budget,
        }
    }

    /// Hands out one zeroed, page-aligned node.
    pub(crate) fn alloc(&self) -> Result<NonNull<u8>, AllocError> {
        let mut inner = self.inner.lock();
        if let Some(budget) = self.budget {
            if inner.allocated >= budget {
                return Err(AllocError);
            }
        }
        if inner.free.is_empty() {
            let map = PageMap::anon(SLAB_BYTES).map_err(|_| AllocError)?;
            let base = map.ptr();
            inner.maps.push(map);
            for i in 0..SLAB_NODES {
                // SAFETY: offsets stay inside the slab; a successful
                // mapping has a non-null, page-aligned base.
                let chunk = unsafe { NonNull::new_unchecked(base.add(i * NODE_BYTES)) };
                inner.free.push(chunk);
            }
        }
        inner.allocated += 1;
        // Carving above guarantees the list is nonempty here.
        inner.free.pop().ok_or(AllocError)
    }

    /// Returns a node to the pool, zeroing it for the next user.
    ///
    /// # Safety
    ///
    /// `node` must have come from this pool's [`alloc`](Self::alloc), must
    /// not be freed twice, and no thread may still hold a pointer into it
    /// (the memory is reused, not quarantined).
    pub(crate) unsafe fn free(&self, node: NonNull<u8>) {
        // SAFETY: per contract, `node` is a live NODE_BYTES chunk of ours.
        unsafe { ptr::write_bytes(node.as_ptr(), 0, NODE_BYTES) };
        let mut inner = self.inner.lock();
        debug_assert!(inner.allocated > 0, "pool freed more than it allocated");
        inner.allocated -= 1;
        inner.free.push(node);
    }

    /// Chunks currently handed out.
    pub(crate) fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_are_aligned_zeroed_and_distinct() {
        let pool = PagePool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        for p in [a, b] {
            assert_eq!(p.as_ptr() as usize % NODE_BYTES, 0);
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), NODE_BYTES) };
            assert!(bytes.iter().all(|&x| x == 0));
        }
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn freed_nodes_come_back_zeroed() {
        let pool = PagePool::new();
        let p = pool.alloc().unwrap();
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xee, NODE_BYTES);
            pool.free(p);
        }
        let q = pool.alloc().unwrap();
        // LIFO reuse hands the same chunk back, scrubbed.
        assert_eq!(p, q);
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), NODE_BYTES) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn growth_spans_multiple_slabs() {
        let pool = PagePool::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..(SLAB_NODES * 2 + 3) {
            let p = pool.alloc().unwrap();
            assert!(seen.insert(p.as_ptr() as usize));
        }
    }

    #[test]
    fn budget_bounds_outstanding_nodes() {
        let pool = PagePool::with_budget(2);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert_eq!(pool.alloc(), Err(AllocError));
        unsafe { pool.free(a) };
        assert!(pool.alloc().is_ok());
    }
}
