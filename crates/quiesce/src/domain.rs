//! The reclamation domain: one shared root owning the epoch clock, the
//! per-core retirement buckets, the delta cache, and the worker threads.
//!
//! Everything in this crate is domain-scoped — two domains share nothing,
//! and handles from one must not be mixed with structures of another.
//! [`Domain`] is the owning handle: dropping it stops the workers, waits
//! for in-flight reader sections, and drains all deferred work.

use crate::epoch::{EpochClock, ThreadHandle};
use crate::gc::{Reclaimer, Retired, INITIAL_EPOCH};
use crate::percore::default_core_id;
use crate::refcache::{self, DeltaCache, WAYS_PER_CORE};
use crate::stats::{Stats, StatsSnapshot};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often an idle per-core reclaimer wakes to collect.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_millis(10);

/// How often the review thread circulates the token when nothing kicks it.
pub const DEFAULT_REVIEW_INTERVAL: Duration = Duration::from_millis(10);

/// Retirement backlog at which an epoch exit kicks the core's reclaimer.
pub const DEFAULT_BATCH_THRESHOLD: usize = 128;

/// Provider of the calling thread's core id, called on every per-core
/// access. The result is reduced modulo the domain's core count; it may
/// be stale by the time it is used (see [`crate::percore`]).
pub type CoreIdFn = fn() -> usize;

/// Shared state behind a [`Domain`]. Also kept alive by every
/// [`ThreadHandle`] and cache-counted object, so worker shutdown and
/// handle lifetimes are independent.
pub(crate) struct DomainCore {
    pub(crate) clock: EpochClock,
    pub(crate) gc: Reclaimer,
    pub(crate) cache: DeltaCache,
    pub(crate) stats: Stats,
    cores: usize,
    core_id: CoreIdFn,
    /// Next core the review token visits.
    token: Mutex<usize>,
    review_kick: Mutex<bool>,
    review_wake: Condvar,
    shutdown: AtomicBool,
}

impl DomainCore {
    /// The calling thread's core id, reduced to this domain's core count.
    pub(crate) fn current_core(&self) -> usize {
        (self.core_id)() % self.cores
    }

    /// Hands a type-erased object to the current core's retirement bucket
    /// under the current epoch.
    pub(crate) fn retire_erased(&self, item: Retired) {
        let core = self.current_core();
        self.gc.retire_on(core, &self.clock, item);
        self.stats.retired.fetch_add(1, Ordering::Relaxed);
        self.gc.maybe_wake(core);
    }

    /// One full token circulation: every core gets flushed and its review
    /// list scanned, in token order. Concurrent calls serialize on the
    /// token — the provable-zero argument needs review visits of one core
    /// to be totally ordered.
    pub(crate) fn review_round(&self) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_review_round();
        let mut token = self.token.lock();
        for _ in 0..self.cores {
            let core = *token;
            *token = (core + 1) % self.cores;
            refcache::review_core(self, core);
        }
    }

    fn wake_reviewer(&self) {
        *self.review_kick.lock() = true;
        self.review_wake.notify_one();
    }
}

fn reviewer_loop(dc: &DomainCore, interval: Duration) {
    loop {
        {
            let mut kick = dc.review_kick.lock();
            if !*kick && !dc.shutdown.load(Ordering::Relaxed) {
                dc.review_wake.wait_for(&mut kick, interval);
            }
            *kick = false;
        }
        if dc.shutdown.load(Ordering::Relaxed) {
            return;
        }
        dc.review_round();
    }
}

/// A reclamation domain.
///
/// Create one per independent subsystem (usually one per process), then:
///
/// - [`register`](Domain::register) each participating thread and pin
///   around reads of shared structures;
/// - [`retire`](Domain::retire) unlinked objects instead of dropping them;
/// - allocate shared values as [`Ref`](crate::Ref)s for scalable counting.
///
/// By default the domain runs one reclaimer thread per core plus one
/// review thread. Builders can disable them
/// ([`workers(false)`](DomainBuilder::workers)) and drive collection
/// manually with [`run_gc`](Domain::run_gc) /
/// [`review_round`](Domain::review_round), which tests rely on.
///
/// # Teardown
///
/// Dropping the `Domain` is the orderly shutdown: workers stop, the drop
/// waits for all in-flight reader sections to end, then flushes, reviews,
/// and drains until nothing is left. The caller must uphold two things:
/// the dropping thread must not itself hold a pin (the wait would never
/// end), and no new pins may start during the drop. `ThreadHandle`s and
/// `Ref`s may outlive the `Domain` — they keep the shared state alive —
/// but objects still referenced at teardown are never finalized, and
/// anything retired after teardown is only released when the last handle
/// goes away.
pub struct Domain {
    core: Arc<DomainCore>,
    workers: Vec<JoinHandle<()>>,
}

impl Domain {
    /// A domain with default settings: one reclaimer per core, a review
    /// thread, and [`WAYS_PER_CORE`] delta ways.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a domain.
    #[must_use]
    pub fn builder() -> DomainBuilder {
        DomainBuilder::new()
    }

    /// Registers the calling thread, returning its pinning handle.
    ///
    /// Registration is per thread; the handle cannot be sent elsewhere.
    /// Threads that only clone and drop [`Ref`](crate::Ref)s do not need
    /// to register — only ones that read epoch-protected structures.
    #[must_use]
    pub fn register(&self) -> ThreadHandle {
        ThreadHandle::new(Arc::clone(&self.core))
    }

    /// Defers destruction of `obj` until no reader section that could
    /// have observed it remains.
    ///
    /// The object must already be unreachable for new readers (unlinked
    /// from whatever structure published it) — this is the caller's
    /// obligation, not checked here.
    pub fn retire<T: Send + 'static>(&self, obj: Box<T>) {
        self.core.retire_erased(Retired::new(obj));
    }

    /// Raw-pointer variant of [`retire`](Domain::retire): after the grace
    /// period, `drop_fn(ptr)` runs once.
    ///
    /// # Safety
    ///
    /// `ptr` must not be retired twice or freed elsewhere, must be safe to
    /// send to another thread, and `drop_fn(ptr)` must be sound exactly
    /// once.
    pub unsafe fn retire_raw(&self, ptr: *mut (), drop_fn: unsafe fn(*mut ())) {
        // SAFETY: forwarded caller contract.
        self.core.retire_erased(unsafe { Retired::from_raw(ptr, drop_fn) });
    }

    /// Runs one collection pass over every core, then tries to advance
    /// the epoch. Returns the number of objects reclaimed.
    ///
    /// The background reclaimers do this on their own; calling it is for
    /// manual driving (workers disabled) or for forcing progress.
    pub fn run_gc(&self) -> usize {
        let mut reclaimed = 0;
        for core in 0..self.core.cores {
            #[cfg(feature = "tracing")]
            let _span = crate::tracing::internal::trace_collect(core);
            reclaimed += self.core.gc.collect(core, &self.core.clock, &self.core.stats);
        }
        self.try_advance_epoch();
        reclaimed
    }

    /// Attempts one epoch advance; returns the new epoch on success.
    ///
    /// Fails (returns `None`) while any core's oldest active reader or
    /// oldest unfreed bucket is more than two epochs behind.
    pub fn try_advance_epoch(&self) -> Option<u64> {
        let advanced = self.core.clock.try_advance(|c| self.core.gc.nexttofree(c));
        if let Some(epoch) = advanced {
            self.core.stats.epoch_advances.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_epoch_advance(epoch);
        }
        advanced
    }

    /// Runs one full review-token circulation on the calling thread.
    pub fn review_round(&self) {
        self.core.review_round();
    }

    /// Flushes every pending count delta on `core` into the global counts.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not below [`cores()`](Domain::cores).
    pub fn flush_core(&self, core: usize) {
        assert!(core < self.core.cores, "core index out of range");
        refcache::flush_core(&self.core, core);
    }

    /// Kicks every background worker now (memory-pressure hook). A no-op
    /// when the domain was built without workers.
    pub fn request_gc(&self) {
        self.core.gc.wake_all();
        self.core.wake_reviewer();
    }

    /// Point-in-time counters; see [`StatsSnapshot`].
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Number of cores this domain was built for.
    #[must_use]
    pub fn cores(&self) -> usize {
        self.core.cores
    }

    /// The current global epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.core.clock.global()
    }

    pub(crate) fn shared(&self) -> &Arc<DomainCore> {
        &self.core
    }

    /// Post-worker teardown: wait for readers, then alternate flush /
    /// review / drain until a full iteration moves nothing.
    fn drain_for_teardown(&self) {
        let backoff = Backoff::new();
        while self.core.clock.min_active_epoch_all().is_some() {
            backoff.snooze();
        }
        loop {
            for core in 0..self.core.cores {
                refcache::flush_core(&self.core, core);
            }
            self.core.review_round();
            let drained = self.core.gc.drain_all(&self.core.stats);
            if drained == 0 && self.core.cache.review_backlog() == 0 {
                return;
            }
        }
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("cores", &self.core.cores)
            .field("epoch", &self.core.clock.global())
            .finish_non_exhaustive()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.gc.wake_all();
        self.core.wake_reviewer();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.drain_for_teardown();
    }
}

/// Configures and builds a [`Domain`].
#[derive(Debug, Clone)]
pub struct DomainBuilder {
    cores: Option<usize>,
    ways_per_core: usize,
    gc_interval: Duration,
    review_interval: Duration,
    batch_threshold: usize,
    workers: bool,
    core_id: CoreIdFn,
}

impl DomainBuilder {
    fn new() -> Self {
        Self {
            cores: None,
            ways_per_core: WAYS_PER_CORE,
            gc_interval: DEFAULT_GC_INTERVAL,
            review_interval: DEFAULT_REVIEW_INTERVAL,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            workers: true,
            core_id: default_core_id,
        }
    }

    /// Number of per-core slots. Defaults to the machine's available
    /// parallelism. More slots than physical cores wastes memory; fewer
    /// trades contention for footprint.
    ///
    /// # Panics
    ///
    /// Panics if `cores` is zero.
    #[must_use]
    pub fn cores(mut self, cores: usize) -> Self {
        assert!(cores > 0, "a domain needs at least one core");
        self.cores = Some(cores);
        self
    }

    /// Delta-cache ways per core. Must be a power of two.
    #[must_use]
    pub fn ways_per_core(mut self, ways: usize) -> Self {
        assert!(ways.is_power_of_two(), "delta cache ways must be a power of two");
        self.ways_per_core = ways;
        self
    }

    /// Idle collection cadence of the per-core reclaimer threads.
    #[must_use]
    pub const fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Idle circulation cadence of the review thread.
    #[must_use]
    pub const fn review_interval(mut self, interval: Duration) -> Self {
        self.review_interval = interval;
        self
    }

    /// Backlog size at which leaving a reader section kicks the core's
    /// reclaimer instead of waiting for the next tick.
    #[must_use]
    pub const fn batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold;
        self
    }

    /// Whether to spawn the background threads. With `false` the caller
    /// drives everything via [`Domain::run_gc`] and
    /// [`Domain::review_round`] — deterministic, for tests.
    #[must_use]
    pub const fn workers(mut self, workers: bool) -> Self {
        self.workers = workers;
        self
    }

    /// Replaces the OS core-id source, e.g. to force the core an
    /// operation lands on in tests.
    #[must_use]
    pub const fn core_id_provider(mut self, f: CoreIdFn) -> Self {
        self.core_id = f;
        self
    }

    /// Builds the domain and spawns its workers.
    #[must_use]
    pub fn build(self) -> Domain {
        let cores = self
            .cores
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get));
        let core = Arc::new(DomainCore {
            clock: EpochClock::new(cores, INITIAL_EPOCH),
            gc: Reclaimer::new(cores, self.batch_threshold),
            cache: DeltaCache::new(cores, self.ways_per_core),
            stats: Stats::default(),
            cores,
            core_id: self.core_id,
            token: Mutex::new(0),
            review_kick: Mutex::new(false),
            review_wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut workers = Vec::new();
        if self.workers {
            for c in 0..cores {
                let dc = Arc::clone(&core);
                let interval = self.gc_interval;
                workers.push(thread::spawn(move || {
                    dc.gc.worker(c, interval, &dc.clock, &dc.stats, || {
                        dc.shutdown.load(Ordering::Relaxed)
                    });
                }));
            }
            let dc = Arc::clone(&core);
            let interval = self.review_interval;
            workers.push(thread::spawn(move || reviewer_loop(&dc, interval)));
        }
        Domain { core, workers }
    }
}
