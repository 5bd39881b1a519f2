//! Scalable reference counting: per-core delta caches, review rounds, and
//! the strong/weak handle types.
//!
//! `Ref::clone`/`Ref::drop` touch only the current core's direct-mapped
//! way for the object — no cross-core traffic. The object's global count
//! is reconciled on eviction and once per review round; it can therefore
//! run behind (or transiently below) the true count by at most one round.
//! A zero global count becomes a *provable* zero only after it survives a
//! full token circulation unmodified; the review pass then finalizes:
//! `on_zero()` runs once, and the value's destruction is deferred through
//! the epoch reclaimer so concurrent readers stay safe.
//!
//! ## Header liveness invariants
//!
//! Raw `*mut Header` pointers live in two places and are justified there:
//!
//! - A way only dereferences its cached pointer when the pending delta is
//!   nonzero. A nonzero unflushed delta implies the object has not been
//!   finalized: every way is flushed once per round, so a surviving
//!   positive delta either keeps the global count nonzero or sets the
//!   dirty flag before a review could conclude "stable zero", and after
//!   `eagerify` completes no cached delta can exist at all.
//! - A review queue entry holds the only permission to finalize a
//!   `has_reviewer` object (the eager path hands its memory release to
//!   the queue via the zombie flag), so entries never dangle.

use crate::domain::DomainCore;
use crate::gc::Retired;
use crate::percore::PerCore;
use crate::sync::{LockRank, SpinLock};
use crossbeam::queue::SegQueue;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Direct-mapped delta ways per core. Power of two.
pub const WAYS_PER_CORE: usize = 4096;

/// The finalization hook for cache-counted objects.
///
/// Called exactly once per object, strictly after the last matching
/// decrement, with no strong handles outstanding. The value itself is
/// dropped (and its memory released) by the library afterwards, once no
/// epoch-protected reader can still observe it — `on_zero` is the place
/// for semantic teardown (closing descriptors, waking waiters), not
/// deallocation.
pub trait OnZero {
    fn on_zero(&self);
}

/// Collection mode of one object. One-directional:
/// `Scalable → Transitioning → Eager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Counts are cached per core; zero is detected by review rounds.
    Scalable = 0,
    /// `eagerify` is draining caches; updates flush through immediately.
    Transitioning = 1,
    /// The global count is exact; a decrement to zero finalizes in place.
    Eager = 2,
}

impl Mode {
    #[must_use]
    pub(crate) const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Scalable),
            1 => Some(Self::Transitioning),
            2 => Some(Self::Eager),
            _ => None,
        }
    }
}

pub(crate) const FLAG_HAS_REVIEWER: u8 = 1 << 0;
pub(crate) const FLAG_DIRTY: u8 = 1 << 1;
pub(crate) const FLAG_FINALIZED: u8 = 1 << 2;
/// Eager finalize ran while the object sat on a review queue; the queue
/// entry owns the memory release.
pub(crate) const FLAG_ZOMBIE: u8 = 1 << 3;

/// Spinlock-protected bookkeeping of one object.
pub(crate) struct Book {
    /// Sum of all flushed deltas. Signed: eviction order can push it
    /// below zero transiently.
    pub(crate) global: i64,
    pub(crate) flags: u8,
}

/// Shared head of every cache-counted allocation. `RcBox<T>` starts with
/// this, so a `*mut Header` addresses the whole box.
pub(crate) struct Header {
    pub(crate) book: SpinLock<Book>,
    pub(crate) mode: AtomicU8,
    /// Weak handle count plus one held collectively by the strong side.
    weak: AtomicUsize,
    /// Owning domain. Taken (and the Arc released) when the value is
    /// retired; until then every path reading it holds either a strong
    /// handle or a pre-finalize review entry.
    domain: UnsafeCell<ManuallyDrop<Arc<DomainCore>>>,
    on_zero_fn: unsafe fn(*const Header),
    retire_fn: unsafe fn(*const Header),
}

impl Header {
    pub(crate) fn domain(&self) -> &DomainCore {
        // SAFETY: see the field docs; callers are pre-finalize paths.
        unsafe { &*self.domain.get() }
    }
}

#[repr(C)]
struct RcBox<T> {
    header: Header,
    value: ManuallyDrop<T>,
}

unsafe fn on_zero_thunk<T: OnZero>(h: *const Header) {
    let rcbox = h.cast::<RcBox<T>>();
    // SAFETY: the caller guarantees the box is alive and the value not
    // yet dropped (finalize runs before the deferred destruction).
    unsafe { (*rcbox).value.on_zero() }
}

/// Hands the finalized box to the deferred reclaimer and releases the
/// box's hold on its domain.
unsafe fn retire_thunk<T: OnZero>(h: *const Header) {
    let rcbox = h.cast::<RcBox<T>>().cast_mut();
    // SAFETY: called exactly once, after FINALIZED is set; no other path
    // reads the domain field from here on.
    let domain = unsafe { ManuallyDrop::take(&mut *(*rcbox).header.domain.get()) };
    // SAFETY: the box is unreachable through strong handles; deferred_drop
    // runs once, after a grace period.
    unsafe {
        domain.retire_erased(Retired::from_raw(rcbox.cast::<()>(), deferred_drop::<T>));
    }
}

/// Runs after the grace period: drops the payload, then releases the
/// strong side's collective weak hold.
unsafe fn deferred_drop<T: OnZero>(p: *mut ()) {
    let rcbox = p.cast::<RcBox<T>>();
    // SAFETY: finalize happens once; the value has not been dropped.
    unsafe { ManuallyDrop::drop(&mut (*rcbox).value) };
    // SAFETY: the strong side held one weak count.
    unsafe { weak_release::<T>(rcbox) };
}

/// Drops one weak count; frees the allocation when it was the last.
unsafe fn weak_release<T: OnZero>(rcbox: *mut RcBox<T>) {
    // SAFETY: caller owns one weak count on a live allocation.
    if unsafe { &(*rcbox).header }.weak.fetch_sub(1, Ordering::AcqRel) == 1 {
        // SAFETY: last count; the payload was already dropped (value is
        // ManuallyDrop, so the box drop only releases plain fields).
        drop(unsafe { Box::from_raw(rcbox) });
    }
}

// ============================================================================
// Per-core delta cache
// ============================================================================

pub(crate) struct Way {
    /// Pending delta for `obj`. The spinlock also guards `obj` stores.
    pub(crate) delta: SpinLock<i64>,
    /// Cached object identity. SeqCst store/load: the eagerify snapshot
    /// reads ways without the lock, and the store-buffering pairing with
    /// the mode flag needs sequential consistency (see `eagerify`).
    pub(crate) obj: AtomicPtr<Header>,
}

pub(crate) struct ReviewEntry(pub(crate) NonNull<Header>);

// SAFETY: entries are only dereferenced by the review pass, which the
// has_reviewer protocol keeps alive; the queues move them across threads.
unsafe impl Send for ReviewEntry {}

struct CoreCache {
    ways: Box<[Way]>,
    /// Scanned when the token visits this core.
    review: SegQueue<ReviewEntry>,
    /// Receives eviction-driven zeros; becomes `review` after the scan.
    next: SegQueue<ReviewEntry>,
}

pub(crate) struct DeltaCache {
    cores: PerCore<CoreCache>,
    way_mask: usize,
}

impl DeltaCache {
    pub(crate) fn new(cores: usize, ways_per_core: usize) -> Self {
        assert!(
            ways_per_core.is_power_of_two(),
            "delta cache ways must be a power of two"
        );
        Self {
            cores: PerCore::new(cores, |_| CoreCache {
                ways: (0..ways_per_core)
                    .map(|_| Way {
                        delta: SpinLock::new(LockRank::WaySlot, 0),
                        obj: AtomicPtr::new(ptr::null_mut()),
                    })
                    .collect(),
                review: SegQueue::new(),
                next: SegQueue::new(),
            }),
            way_mask: ways_per_core - 1,
        }
    }

    pub(crate) fn cores(&self) -> usize {
        self.cores.len()
    }

    /// Direct-mapped way index for an object (Fibonacci hash of its
    /// address; headers are at least 16-byte aligned).
    fn way_for(&self, h: *const Header) -> usize {
        let a = (h as usize >> 4) as u64;
        (a.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & self.way_mask
    }

    /// The way `h` maps to on `core`.
    pub(crate) fn way(&self, core: usize, h: *const Header) -> &Way {
        &self.cores.get(core).ways[self.way_for(h)]
    }

    pub(crate) fn review_backlog(&self) -> usize {
        self.cores
            .iter()
            .map(|cc| cc.review.len() + cc.next.len())
            .sum()
    }
}

/// Applies `d` to the object's cached delta on the current core.
///
/// Never blocks: the way spinlock bounds the critical section to a few
/// words, and eviction flushes under the evictee's header spinlock.
pub(crate) fn adjust(dc: &DomainCore, h: &Header, d: i64) {
    if h.mode.load(Ordering::SeqCst) == Mode::Eager as u8 {
        direct_update(dc, h, d);
        return;
    }
    let core = dc.current_core();
    let cc = dc.cache.cores.get(core);
    let way = &cc.ways[dc.cache.way_for(h)];
    let hp: *mut Header = ptr::from_ref(h).cast_mut();

    let mut delta = way.delta.lock();
    let cur = way.obj.load(Ordering::Relaxed);
    if !ptr::eq(cur, hp) {
        if !cur.is_null() && *delta != 0 {
            dc.stats.evictions.fetch_add(1, Ordering::Relaxed);
            // SAFETY: nonzero pending delta implies the evictee is not
            // finalized (module invariant), so the header is alive.
            unsafe { flush_locked(dc, core, cur, &mut delta) };
        }
        way.obj.store(hp, Ordering::SeqCst);
        *delta = 0;
    }
    *delta += d;
    // An eagerify may have started after the fast-path mode check; if the
    // object is no longer scalable the delta must flush through now.
    if h.mode.load(Ordering::SeqCst) != Mode::Scalable as u8 && *delta != 0 {
        // SAFETY: `h` is alive (the caller holds a handle on it).
        unsafe { flush_locked(dc, core, hp, &mut delta) };
    }
}

/// Flushes a way's pending delta into `h`'s global count.
///
/// Called with the way lock held; takes the header lock (way → header is
/// the established order). Clears the delta but leaves the way's `obj`
/// cached — a zero-delta way is never dereferenced again.
///
/// # Safety
///
/// `h` must point to a live, not-finalized header.
pub(crate) unsafe fn flush_locked(dc: &DomainCore, core: usize, h: *mut Header, delta: &mut i64) {
    let d = *delta;
    if d == 0 {
        return;
    }
    *delta = 0;
    // SAFETY: per the function contract.
    let h = unsafe { &*h };
    dc.stats.flushes.fetch_add(1, Ordering::Relaxed);
    let mut book = h.book.lock();
    let old = book.global;
    book.global += d;
    let new = book.global;
    apply_count_edges(dc, core, h, old, new, &mut book);
}

/// Count-edge rules shared by flush and direct updates, run under the
/// header lock after the global count changed from `old` to `new`.
fn apply_count_edges(
    dc: &DomainCore,
    core: usize,
    h: &Header,
    old: i64,
    new: i64,
    book: &mut Book,
) {
    if old == 0 && new != 0 && book.flags & FLAG_HAS_REVIEWER != 0 {
        // Went non-zero after being queued: one more stable round needed.
        book.flags |= FLAG_DIRTY;
        dc.stats.dirty_marks.fetch_add(1, Ordering::Relaxed);
    }
    if new == 0
        && old != 0
        && book.flags & (FLAG_HAS_REVIEWER | FLAG_FINALIZED) == 0
        && h.mode.load(Ordering::Relaxed) == Mode::Scalable as u8
    {
        // Eviction-driven zero: suspect, reviewed the round after next.
        // (A racing eagerify may make the mode read stale; the review
        // pass re-checks the mode and simply drops such entries.)
        book.flags |= FLAG_HAS_REVIEWER;
        dc.stats.review_enqueues.fetch_add(1, Ordering::Relaxed);
        dc.cache.cores.get(core).next.push(ReviewEntry(NonNull::from(h)));
    }
}

/// Exact-mode update: straight to the global count under the header lock.
/// A decrement that lands on zero finalizes synchronously.
fn direct_update(dc: &DomainCore, h: &Header, d: i64) {
    let mut finalize = false;
    let mut queued = false;
    {
        let mut book = h.book.lock();
        let old = book.global;
        book.global += d;
        let new = book.global;
        if old == 0 && new != 0 && book.flags & FLAG_HAS_REVIEWER != 0 {
            book.flags |= FLAG_DIRTY;
            dc.stats.dirty_marks.fetch_add(1, Ordering::Relaxed);
        }
        if d < 0 && new == 0 && book.flags & FLAG_FINALIZED == 0 {
            book.flags |= FLAG_FINALIZED;
            queued = book.flags & FLAG_HAS_REVIEWER != 0;
            finalize = true;
        }
    }
    if finalize {
        // SAFETY: finalize claimed exactly once under the lock; the box
        // is alive (memory release happens below or via the queue entry).
        unsafe { (h.on_zero_fn)(ptr::from_ref(h)) };
        dc.stats.finalized.fetch_add(1, Ordering::Relaxed);
        if queued {
            // A review entry exists; hand it the memory release.
            h.book.lock().flags |= FLAG_ZOMBIE;
        } else {
            // SAFETY: sole finalizer, no queue entry: we own the release.
            unsafe { (h.retire_fn)(ptr::from_ref(h)) };
        }
    }
}

/// Flushes every pending delta on `core` into the global counts.
pub(crate) fn flush_core(dc: &DomainCore, core: usize) {
    let cc = dc.cache.cores.get(core);
    for way in &*cc.ways {
        let mut delta = way.delta.lock();
        let obj = way.obj.load(Ordering::Relaxed);
        if !obj.is_null() && *delta != 0 {
            // SAFETY: nonzero delta implies not finalized (module docs).
            unsafe { flush_locked(dc, core, obj, &mut delta) };
        }
    }
}

/// One token visit: flush every way on `core`, scan its review list,
/// then promote the next-round list.
pub(crate) fn review_core(dc: &DomainCore, core: usize) {
    let cc = dc.cache.cores.get(core);

    // Periodic eviction: after this, every delta that existed on this
    // core when the visit began is in some global count. This is what
    // bounds the skew to one round.
    flush_core(dc, core);

    while let Some(entry) = cc.review.pop() {
        // SAFETY: has_reviewer objects stay alive until their entry is
        // consumed (module docs).
        let h = unsafe { entry.0.as_ref() };
        let mut book = h.book.lock();
        debug_assert!(
            book.flags & FLAG_HAS_REVIEWER != 0,
            "review entry without has_reviewer"
        );
        if book.flags & FLAG_FINALIZED != 0 {
            if book.flags & FLAG_ZOMBIE != 0 {
                // Eager finalize ran while queued; release the memory.
                book.flags &= !(FLAG_HAS_REVIEWER | FLAG_ZOMBIE | FLAG_DIRTY);
                drop(book);
                // SAFETY: the entry owned the release; consumed here.
                unsafe { (h.retire_fn)(entry.0.as_ptr()) };
                dc.stats.review_dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                // on_zero is still running on the eager path; look again
                // next round.
                drop(book);
                cc.next.push(entry);
                dc.stats.review_requeued.fetch_add(1, Ordering::Relaxed);
            }
        } else if book.global != 0 {
            book.flags &= !(FLAG_HAS_REVIEWER | FLAG_DIRTY);
            dc.stats.review_dropped.fetch_add(1, Ordering::Relaxed);
        } else if h.mode.load(Ordering::Relaxed) != Mode::Scalable as u8 {
            // Mid-eagerify zero: not provable, and the caller-held
            // reference will make it nonzero by the next visit.
            drop(book);
            cc.next.push(entry);
            dc.stats.review_requeued.fetch_add(1, Ordering::Relaxed);
        } else if book.flags & FLAG_DIRTY != 0 {
            // Flickered through zero during the round; needs one more.
            book.flags &= !FLAG_DIRTY;
            drop(book);
            cc.next.push(entry);
            dc.stats.review_requeued.fetch_add(1, Ordering::Relaxed);
        } else {
            // Zero, clean, and it survived a full round: provably dead.
            book.flags = (book.flags | FLAG_FINALIZED) & !FLAG_HAS_REVIEWER;
            drop(book);
            // SAFETY: finalize claimed once under the lock; entry
            // consumed here.
            unsafe { (h.on_zero_fn)(entry.0.as_ptr()) };
            unsafe { (h.retire_fn)(entry.0.as_ptr()) };
            dc.stats.finalized.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Objects evicted to zero during this round become next round's work.
    while let Some(entry) = cc.next.pop() {
        cc.review.push(entry);
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A strong handle to a cache-counted `T`.
///
/// Cloning and dropping cost one per-core cache update — no shared-memory
/// contention in scalable mode. The trade-off: the object's death is
/// detected by review rounds, so `on_zero` runs up to two rounds after
/// the last drop (use [`eagerify`](Ref::eagerify) where promptness
/// matters).
pub struct Ref<T: OnZero> {
    ptr: NonNull<RcBox<T>>,
    _marker: PhantomData<RcBox<T>>,
}

// SAFETY: Ref hands out &T and moves counts through per-core caches; the
// payload crosses threads, so it must be Send + Sync.
unsafe impl<T: OnZero + Send + Sync> Send for Ref<T> {}
// SAFETY: as above.
unsafe impl<T: OnZero + Send + Sync> Sync for Ref<T> {}

impl<T: OnZero + Send + Sync + 'static> Ref<T> {
    /// Allocates `value` in `domain` with a true count of one.
    pub fn new(domain: &crate::Domain, value: T) -> Self {
        let rcbox = Box::new(RcBox {
            header: Header {
                book: SpinLock::new(
                    LockRank::Header,
                    Book {
                        global: 1,
                        flags: 0,
                    },
                ),
                mode: AtomicU8::new(Mode::Scalable as u8),
                weak: AtomicUsize::new(1),
                domain: UnsafeCell::new(ManuallyDrop::new(Arc::clone(domain.shared()))),
                on_zero_fn: on_zero_thunk::<T>,
                retire_fn: retire_thunk::<T>,
            },
            value: ManuallyDrop::new(value),
        });
        domain
            .shared()
            .stats
            .objects_created
            .fetch_add(1, Ordering::Relaxed);
        Self {
            ptr: NonNull::from(Box::leak(rcbox)),
            _marker: PhantomData,
        }
    }
}

impl<T: OnZero> Ref<T> {
    pub(crate) fn header(&self) -> &Header {
        // SAFETY: a strong handle keeps the box alive and unfinalized.
        unsafe { &self.ptr.as_ref().header }
    }

    /// The current collection [`Mode`] of this object.
    #[must_use]
    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.header().mode.load(Ordering::Relaxed))
            .unwrap_or(Mode::Scalable)
    }

    /// Snapshot of the reconciled global count. Bookkeeping only: it lags
    /// per-core deltas and may legitimately be zero or negative while the
    /// object is still referenced.
    #[must_use]
    pub fn global_count(&self) -> i64 {
        self.header().book.lock().global
    }

    /// Whether two handles address the same allocation.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Creates a weak handle.
    #[must_use]
    pub fn downgrade(this: &Self) -> WeakRef<T> {
        this.header().weak.fetch_add(1, Ordering::Relaxed);
        WeakRef {
            ptr: this.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: OnZero> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: strong handle ⇒ not finalized ⇒ value not dropped.
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T: OnZero> Clone for Ref<T> {
    fn clone(&self) -> Self {
        let h = self.header();
        adjust(h.domain(), h, 1);
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: OnZero> Drop for Ref<T> {
    fn drop(&mut self) {
        let h = self.header();
        adjust(h.domain(), h, -1);
    }
}

impl<T: OnZero + std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ref").field(&**self).finish()
    }
}

/// A weak handle: keeps the allocation (not the value) alive.
pub struct WeakRef<T: OnZero> {
    ptr: NonNull<RcBox<T>>,
    _marker: PhantomData<RcBox<T>>,
}

// SAFETY: same reasoning as `Ref`.
unsafe impl<T: OnZero + Send + Sync> Send for WeakRef<T> {}
// SAFETY: same reasoning as `Ref`.
unsafe impl<T: OnZero + Send + Sync> Sync for WeakRef<T> {}

impl<T: OnZero> WeakRef<T> {
    fn header(&self) -> &Header {
        // SAFETY: a weak handle keeps the allocation alive.
        unsafe { &self.ptr.as_ref().header }
    }

    /// Attempts to promote to a strong handle.
    ///
    /// Fails once the object has been finalized. On success the count is
    /// bumped directly in the global count (upgrades are rare enough not
    /// to route through the delta cache), with the usual dirty marking if
    /// the object sat on a review list at zero.
    #[must_use]
    pub fn upgrade(&self) -> Option<Ref<T>> {
        let h = self.header();
        {
            let mut book = h.book.lock();
            if book.flags & FLAG_FINALIZED != 0 {
                return None;
            }
            let old = book.global;
            book.global += 1;
            if old == 0 && book.flags & FLAG_HAS_REVIEWER != 0 {
                book.flags |= FLAG_DIRTY;
                h.domain().stats.dirty_marks.fetch_add(1, Ordering::Relaxed);
            }
        }
        Some(Ref {
            ptr: self.ptr,
            _marker: PhantomData,
        })
    }
}

impl<T: OnZero> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        self.header().weak.fetch_add(1, Ordering::Relaxed);
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: OnZero> Drop for WeakRef<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one weak count.
        unsafe { weak_release::<T>(self.ptr.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips() {
        for m in [Mode::Scalable, Mode::Transitioning, Mode::Eager] {
            assert_eq!(Mode::from_u8(m as u8), Some(m));
        }
        assert_eq!(Mode::from_u8(7), None);
    }

    #[test]
    fn way_index_is_stable_and_bounded() {
        let cache = DeltaCache::new(2, 64);
        let h = 0x7f00_1234_5670usize as *const Header;
        let a = cache.way_for(h);
        assert_eq!(a, cache.way_for(h));
        assert!(a < 64);
    }

    #[test]
    fn way_index_spreads_neighbors() {
        let cache = DeltaCache::new(1, 4096);
        // Headers allocated back to back should not all collide.
        let base = 0x6000_0000usize;
        let idx: Vec<_> = (0..8).map(|i| cache.way_for((base + i * 64) as *const Header)).collect();
        let first = idx[0];
        assert!(idx.iter().any(|&i| i != first));
    }
}
