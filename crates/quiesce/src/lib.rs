//! Scalable memory reclamation for many-core services.
//!
//! `quiesce` bundles three cooperating pieces, organized around a per-core
//! layout and one shared epoch clock:
//!
//! - **Epoch-based reclamation**: threads pin cheap, nestable [`Guard`]s;
//!   retired objects wait in per-core epoch buckets until every reader
//!   from their epoch has moved on, then drop on a background worker.
//! - **Per-core delta reference counting**: [`Ref<T>`] spreads
//!   `clone`/`drop` traffic across per-core caches of count deltas, so a
//!   hot shared object never bounces a counter cache line between cores.
//!   A token-passing review protocol proves true zeroes without stopping
//!   writers, and [`Ref::eagerify`] switches an object back to plain
//!   eager counting once ownership becomes simple again.
//! - **Compressed concurrent radix array**: [`RadixArray<T>`] is a sparse
//!   fixed-capacity array whose uniform ranges compress into single
//!   slots, with advisory range locking and run discovery; node and value
//!   lifetimes ride on the epoch clock.
//!
//! Everything hangs off a [`Domain`]: the epoch clock, the per-core
//! reclaimer workers, the delta caches, and the review worker.
//!
//! # Quick start
//!
//! ```ignore
//! use quiesce::{Domain, OnZero, Ref};
//!
//! struct Session(u64);
//! impl OnZero for Session {
//!     fn on_zero(&self) {}
//! }
//!
//! let domain = Domain::new();
//! let handle = domain.register();
//!
//! // Epoch-protected reads with deferred frees.
//! {
//!     let guard = handle.pin();
//!     // ... read shared structures; anything retired from here on
//!     // outlives the guard
//! }
//!
//! // Per-core reference counting.
//! let s = Ref::new(&domain, Session(7));
//! let t = s.clone(); // lands in this core's delta cache
//! drop(t);
//! drop(s); // the review worker proves the zero, finalizes, retires
//! ```
//!
//! # Sparse arrays
//!
//! ```ignore
//! use quiesce::{Domain, RadixArray};
//!
//! let domain = Domain::new();
//! let handle = domain.register();
//! let guard = handle.pin();
//!
//! let pages: RadixArray<u64> = RadixArray::new(&domain, 1 << 20);
//! pages.fill(0, 1 << 20, 0x41, &guard)?; // one shared slot, no tree yet
//! let lock = pages.acquire(4096, 8192, &guard)?; // advisory range lock
//! assert_eq!(pages.get(5000, &guard), Some(0x41));
//! drop(lock);
//! # Ok::<(), quiesce::AllocError>(())
//! ```
//!
//! # Threads and teardown
//!
//! [`ThreadHandle`]s are per-thread and not `Send`. Guards must not be
//! held across waits on other guard holders. Dropping the [`Domain`]
//! stops the workers and drains every outstanding retirement; see the
//! teardown notes on [`Domain`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod domain;
mod eager;
mod epoch;
mod gc;
mod percore;
mod pool;
mod radix;
mod refcache;
mod stats;
mod sync;
mod tracing;

// Re-export public API
pub use domain::{
    CoreIdFn, Domain, DomainBuilder, DEFAULT_BATCH_THRESHOLD, DEFAULT_GC_INTERVAL,
    DEFAULT_REVIEW_INTERVAL,
};
pub use epoch::{Guard, ThreadHandle, MAX_DEPTH};
pub use gc::NEPOCH;
pub use pool::{AllocError, NODE_BYTES};
pub use radix::{RadixArray, RadixLock, Run, RunState, Runs};
pub use refcache::{Mode, OnZero, Ref, WeakRef, WAYS_PER_CORE};
pub use stats::StatsSnapshot;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    pub use crate::percore::{pin_core_id, CorePin};
}
