//! Domain-level counters and their read-side snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters of one domain. All increments are relaxed: the
/// counters order nothing, they only report.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) epoch_advances: AtomicU64,
    pub(crate) retired: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
    pub(crate) objects_created: AtomicU64,
    pub(crate) finalized: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) review_enqueues: AtomicU64,
    pub(crate) review_requeued: AtomicU64,
    pub(crate) review_dropped: AtomicU64,
    pub(crate) dirty_marks: AtomicU64,
    pub(crate) eagerify_calls: AtomicU64,
    pub(crate) node_allocs: AtomicU64,
    pub(crate) ext_allocs: AtomicU64,
    pub(crate) ext_retired: AtomicU64,
}

impl Stats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            epoch_advances: self.epoch_advances.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            objects_created: self.objects_created.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            review_enqueues: self.review_enqueues.load(Ordering::Relaxed),
            review_requeued: self.review_requeued.load(Ordering::Relaxed),
            review_dropped: self.review_dropped.load(Ordering::Relaxed),
            dirty_marks: self.dirty_marks.load(Ordering::Relaxed),
            eagerify_calls: self.eagerify_calls.load(Ordering::Relaxed),
            node_allocs: self.node_allocs.load(Ordering::Relaxed),
            ext_allocs: self.ext_allocs.load(Ordering::Relaxed),
            ext_retired: self.ext_retired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a domain's cumulative counters.
///
/// Counters are sampled one by one with relaxed loads, so a snapshot taken
/// while work is in flight is not a consistent cut — individual fields can
/// disagree by a few in-flight operations. Useful for tests, logs, and
/// capacity questions, not for invariant checking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct StatsSnapshot {
    /// Successful global epoch advances.
    pub epoch_advances: u64,
    /// Objects handed to the deferred reclaimer.
    pub retired: u64,
    /// Retired objects whose finalizers have run.
    pub reclaimed: u64,
    /// Cache-counted objects allocated.
    pub objects_created: u64,
    /// Cache-counted objects finalized (zero detected and `on_zero` run).
    pub finalized: u64,
    /// Way conflicts that forced an eviction flush.
    pub evictions: u64,
    /// Delta flushes into global counts, from any path.
    pub flushes: u64,
    /// Objects queued for review after an eviction-driven zero.
    pub review_enqueues: u64,
    /// Review entries sent around for another round.
    pub review_requeued: u64,
    /// Review entries retired without finalizing (count went nonzero, or
    /// an eager finalize beat the review).
    pub review_dropped: u64,
    /// Zero-to-nonzero transitions observed on queued objects.
    pub dirty_marks: u64,
    /// `eagerify` transitions driven to completion.
    pub eagerify_calls: u64,
    /// Radix tree nodes taken from the node pool.
    pub node_allocs: u64,
    /// Shared run boxes allocated by radix fills.
    pub ext_allocs: u64,
    /// Shared run boxes whose last reference was dropped.
    pub ext_retired: u64,
}
