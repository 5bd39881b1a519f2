//! Deferred reclamation: per-core retirement buckets and the collection
//! pass.
//!
//! Objects leave lock-free structures first and die later: retirement
//! tags each object with the epoch it was unlinked in, and the collection
//! pass frees a bucket only once no thread can still be inside a section
//! that began at or before that bucket's epoch. Finalizers always run with
//! the core's bookkeeping lock released — a finalizer may itself pin the
//! epoch, take locks, or retire further objects.

use crate::epoch::EpochClock;
use crate::percore::PerCore;
use crate::stats::Stats;
use parking_lot::{Condvar, Mutex};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Depth of the per-core epoch bucket ring. Power of two; epochs map to
/// buckets by `epoch % NEPOCH`, so at any instant a core holds retirements
/// for at most `NEPOCH` consecutive epochs.
pub const NEPOCH: usize = 4;

/// First epoch the clock starts at. A multiple of `NEPOCH`, so the seed
/// tags `INITIAL_EPOCH + i` land on their modulo ring positions, and
/// nonzero so floor arithmetic near startup stays out of saturation.
pub(crate) const INITIAL_EPOCH: u64 = NEPOCH as u64;

/// A type-erased object awaiting deferred destruction.
///
/// Owns its allocation: dropping a `Retired` runs the erased destructor.
/// Double-enqueue of one object is impossible through the safe path — the
/// `Box` moves in.
pub(crate) struct Retired {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// SAFETY: construction requires the payload be `Send` (or the raw caller
// promises it); the pointer is not aliased once enqueued.
unsafe impl Send for Retired {}

unsafe fn drop_box<T>(ptr: *mut ()) {
    // SAFETY: `ptr` came from `Box::into_raw` of a `T` in `Retired::new`.
    drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
}

impl Retired {
    pub(crate) fn new<T: Send>(obj: Box<T>) -> Self {
        Self {
            ptr: Box::into_raw(obj).cast::<()>(),
            drop_fn: drop_box::<T>,
        }
    }

    /// # Safety
    ///
    /// `drop_fn(ptr)` must be sound exactly once, and `ptr` must not be
    /// enqueued anywhere else.
    pub(crate) const unsafe fn from_raw(ptr: *mut (), drop_fn: unsafe fn(*mut ())) -> Self {
        Self { ptr, drop_fn }
    }
}

impl Drop for Retired {
    fn drop(&mut self) {
        // SAFETY: per construction contract; `Retired` is affine, so the
        // destructor runs at most once.
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

struct Bucket {
    /// The epoch whose retirements this bucket currently holds. Advances
    /// by `NEPOCH` each time the bucket is freed.
    epoch: u64,
    items: Vec<Retired>,
}

struct CoreGcInner {
    buckets: [Bucket; NEPOCH],
    /// Oldest epoch this core has not yet freed.
    nexttofree: u64,
    /// Set by wakers so a worker mid-wait doesn't miss the notification.
    kick: bool,
}

struct CoreGc {
    inner: Mutex<CoreGcInner>,
    wake: Condvar,
    /// Outstanding retirements, readable without the lock for the
    /// batch-threshold check on epoch exit.
    pending: AtomicUsize,
}

fn push_retired(state: &CoreGc, inner: &mut CoreGcInner, epoch: u64, item: Retired) {
    let bucket = &mut inner.buckets[(epoch % NEPOCH as u64) as usize];
    assert_eq!(
        bucket.epoch, epoch,
        "retirement epoch {epoch} does not match bucket tag {} (stale epoch)",
        bucket.epoch
    );
    bucket.items.push(item);
    state.pending.fetch_add(1, Ordering::Relaxed);
}

/// All cores' retirement state.
pub(crate) struct Reclaimer {
    cores: PerCore<CoreGc>,
    batch_threshold: usize,
}

impl Reclaimer {
    pub(crate) fn new(cores: usize, batch_threshold: usize) -> Self {
        Self {
            cores: PerCore::new(cores, |_| CoreGc {
                inner: Mutex::new(CoreGcInner {
                    buckets: std::array::from_fn(|i| Bucket {
                        // Seed tags INITIAL_EPOCH..INITIAL_EPOCH + NEPOCH at
                        // their ring positions.
                        epoch: INITIAL_EPOCH + i as u64,
                        items: Vec::new(),
                    }),
                    nexttofree: INITIAL_EPOCH,
                    kick: false,
                }),
                wake: Condvar::new(),
                pending: AtomicUsize::new(0),
            }),
            batch_threshold,
        }
    }

    /// Enqueues `item` on `core`, tagged with the epoch current at the
    /// moment of enqueue.
    ///
    /// The epoch is sampled *inside* the core lock: `collect` re-tags
    /// buckets under the same lock, and the advance rule keeps
    /// `nexttofree` within `NEPOCH - 1` of the global epoch, so the
    /// bucket for the sampled epoch always carries that exact tag.
    pub(crate) fn retire_on(&self, core: usize, clock: &EpochClock, item: Retired) {
        let state = self.cores.get(core);
        let mut inner = state.inner.lock();
        let epoch = clock.global();
        push_retired(state, &mut inner, epoch, item);
    }

    /// Enqueues `item` under an explicit retirement epoch.
    ///
    /// # Panics
    ///
    /// Panics when the targeted bucket's tag disagrees with `epoch` — that
    /// means an epoch leaked from a previous ring lap, and continuing
    /// would free the object at the wrong time.
    #[cfg(test)]
    pub(crate) fn retire_at(&self, core: usize, epoch: u64, item: Retired) {
        let state = self.cores.get(core);
        let mut inner = state.inner.lock();
        push_retired(state, &mut inner, epoch, item);
    }

    pub(crate) fn pending(&self, core: usize) -> usize {
        self.cores.get(core).pending.load(Ordering::Relaxed)
    }

    pub(crate) fn nexttofree(&self, core: usize) -> u64 {
        self.cores.get(core).inner.lock().nexttofree
    }

    /// Frees every eligible bucket on `core`, oldest first.
    ///
    /// A bucket tagged `e` is eligible when `e` is behind the global epoch
    /// and behind every core's oldest active reader. The bucket is
    /// detached and re-tagged `e + NEPOCH` while the lock is held, then
    /// the finalizers run unlocked. Returns the number reclaimed.
    pub(crate) fn collect(&self, core: usize, clock: &EpochClock, stats: &Stats) -> usize {
        let state = self.cores.get(core);
        let mut reclaimed = 0;
        let mut inner = state.inner.lock();
        loop {
            let ntf = inner.nexttofree;
            if ntf >= clock.global() {
                break;
            }
            if let Some(min) = clock.min_active_epoch_all() {
                if ntf >= min {
                    break;
                }
            }
            let bucket = &mut inner.buckets[(ntf % NEPOCH as u64) as usize];
            debug_assert_eq!(bucket.epoch, ntf, "bucket ring out of step with nexttofree");
            let items = mem::take(&mut bucket.items);
            bucket.epoch = ntf + NEPOCH as u64;
            inner.nexttofree = ntf + 1;
            state.pending.fetch_sub(items.len(), Ordering::Relaxed);
            drop(inner);

            // Finalizers run without the core lock: they may retire more
            // objects or pin the epoch without deadlocking against us.
            reclaimed += items.len();
            for item in items {
                drop(item);
            }
            inner = state.inner.lock();
        }
        drop(inner);
        if reclaimed > 0 {
            stats.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }

    /// Wakes `core`'s worker if its backlog crossed the batch threshold.
    pub(crate) fn maybe_wake(&self, core: usize) {
        if self.pending(core) >= self.batch_threshold {
            self.wake(core);
        }
    }

    /// Unconditionally wakes `core`'s worker (memory-pressure path).
    pub(crate) fn wake(&self, core: usize) {
        let state = self.cores.get(core);
        state.inner.lock().kick = true;
        state.wake.notify_one();
    }

    pub(crate) fn wake_all(&self) {
        for core in 0..self.cores.len() {
            self.wake(core);
        }
    }

    /// One worker pass: sleep for `interval` (or until kicked), then
    /// collect. Returns when `stop()` reports true.
    pub(crate) fn worker(
        &self,
        core: usize,
        interval: Duration,
        clock: &EpochClock,
        stats: &Stats,
        stop: impl Fn() -> bool,
    ) {
        loop {
            {
                let state = self.cores.get(core);
                let mut inner = state.inner.lock();
                if !inner.kick && !stop() {
                    state.wake.wait_for(&mut inner, interval);
                }
                inner.kick = false;
            }
            if stop() {
                return;
            }
            self.collect(core, clock, stats);
            if clock.try_advance(|c| self.nexttofree(c)).is_some() {
                stats.epoch_advances.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Teardown drain: frees every bucket on every core regardless of
    /// epoch. Sound only once no reader can exist (last domain handle).
    /// Loops because finalizers may retire further objects.
    pub(crate) fn drain_all(&self, stats: &Stats) -> usize {
        let mut total = 0;
        loop {
            let mut drained = 0;
            for core in 0..self.cores.len() {
                let state = self.cores.get(core);
                let mut inner = state.inner.lock();
                let mut items = Vec::new();
                for bucket in &mut inner.buckets {
                    items.append(&mut bucket.items);
                }
                state.pending.fetch_sub(items.len(), Ordering::Relaxed);
                drop(inner);
                drained += items.len();
                drop(items);
            }
            total += drained;
            if drained == 0 {
                break;
            }
        }
        if total > 0 {
            stats.reclaimed.fetch_add(total as u64, Ordering::Relaxed);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct NoteDrop(Arc<AtomicUsize>);

    impl Drop for NoteDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn bucket_tags_seeded_for_initial_epoch() {
        let clock = EpochClock::new(1, INITIAL_EPOCH);
        let r = Reclaimer::new(1, 64);
        let drops = Arc::new(AtomicUsize::new(0));
        // Current epoch at startup is INITIAL_EPOCH; its bucket tag matches.
        r.retire_on(0, &clock, Retired::new(Box::new(NoteDrop(Arc::clone(&drops)))));
        assert_eq!(r.pending(0), 1);
    }

    #[test]
    #[should_panic(expected = "does not match bucket tag")]
    fn stale_epoch_retirement_is_fatal() {
        let r = Reclaimer::new(1, 64);
        // Bucket 0 is tagged NEPOCH; an aged-out epoch from a previous lap
        // must be rejected loudly.
        r.retire_at(0, (2 * NEPOCH) as u64, Retired::new(Box::new(0u8)));
    }

    #[test]
    fn collect_waits_for_epoch_advance() {
        let clock = EpochClock::new(1, INITIAL_EPOCH);
        let stats = Stats::default();
        let r = Reclaimer::new(1, 64);
        let drops = Arc::new(AtomicUsize::new(0));
        r.retire_on(0, &clock, Retired::new(Box::new(NoteDrop(Arc::clone(&drops)))));

        // Not freeable: the bucket epoch equals the global epoch.
        assert_eq!(r.collect(0, &clock, &stats), 0);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        clock.try_advance(|c| r.nexttofree(c)).unwrap();
        assert_eq!(r.collect(0, &clock, &stats), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(r.pending(0), 0);
    }

    #[test]
    fn drain_all_ignores_epochs() {
        let stats = Stats::default();
        let r = Reclaimer::new(2, 64);
        let drops = Arc::new(AtomicUsize::new(0));
        for core in 0..2 {
            r.retire_at(
                core,
                INITIAL_EPOCH,
                Retired::new(Box::new(NoteDrop(Arc::clone(&drops)))),
            );
        }
        assert_eq!(r.drain_all(&stats), 2);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }
}
