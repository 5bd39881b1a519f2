//! The epoch clock: per-thread handles, nesting guards, and the global
//! advance rule.
//!
//! A thread that may dereference shared structures pins itself with
//! [`ThreadHandle::pin`]; while any pin from an epoch `E` is live, nothing
//! retired at or after `E` is reclaimed. The clock is a single global
//! counter (the "global scheme"): advancing it takes one mutex and scans
//! every core's active-thread list, which is cheap at reclaimer cadence.
//!
//! Handle state packs `(epoch, depth)` into one word — low [`DEPTH_BITS`]
//! bits are the nesting depth, the rest the epoch captured when the depth
//! left zero. Only the owning thread writes its slot; scanners read it
//! under the owning core's list lock.

use crate::domain::DomainCore;
use crate::percore::PerCore;
use crate::sync::{LockRank, SpinLock};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bits of the packed slot word holding the nesting depth.
pub const DEPTH_BITS: u32 = 16;
const DEPTH_MASK: u64 = (1 << DEPTH_BITS) - 1;

/// Maximum nesting depth of epoch-protected sections per thread.
pub const MAX_DEPTH: u64 = DEPTH_MASK;

const fn pack(epoch: u64, depth: u64) -> u64 {
    (epoch << DEPTH_BITS) | depth
}

const fn depth_of(word: u64) -> u64 {
    word & DEPTH_MASK
}

const fn epoch_of(word: u64) -> u64 {
    word >> DEPTH_BITS
}

/// Per-thread registration slot. Owned jointly by the `ThreadHandle` and,
/// while pinned, the origin core's active list.
pub(crate) struct EpochSlot {
    /// Packed `(epoch, depth)`; written only by the owning thread, read by
    /// min-epoch scans under the origin core's list lock.
    state: AtomicU64,
    /// Core whose active list this slot is linked on while pinned. Threads
    /// may migrate mid-epoch; unlink goes back to this core.
    origin: AtomicUsize,
}

struct CoreClock {
    active: SpinLock<Vec<Arc<EpochSlot>>>,
}

/// The process-wide clock: one global counter plus per-core active lists.
pub(crate) struct EpochClock {
    global: CachePadded<AtomicU64>,
    /// Serializes advances; the 2-epoch slack in the advance rule absorbs
    /// the remaining capture/scan races (see `try_advance`).
    advance: Mutex<()>,
    cores: PerCore<CoreClock>,
}

impl EpochClock {
    pub(crate) fn new(cores: usize, initial_epoch: u64) -> Self {
        Self {
            global: CachePadded::new(AtomicU64::new(initial_epoch)),
            advance: Mutex::new(()),
            cores: PerCore::new(cores, |_| CoreClock {
                active: SpinLock::new(LockRank::CoreList, Vec::new()),
            }),
        }
    }

    pub(crate) fn global(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    pub(crate) fn make_slot(&self) -> Arc<EpochSlot> {
        Arc::new(EpochSlot {
            state: AtomicU64::new(0),
            origin: AtomicUsize::new(0),
        })
    }

    /// Oldest epoch with an active thread on `core`, if any.
    pub(crate) fn min_active_epoch(&self, core: usize) -> Option<u64> {
        let list = self.cores.get(core).active.lock();
        list.iter()
            .map(|slot| epoch_of(slot.state.load(Ordering::Relaxed)))
            .min()
    }

    /// Depth 0 → 1 transition: capture the epoch and link onto `core`.
    ///
    /// The capture happens inside the list critical section, so an advance
    /// scan of this core either sees the slot or runs before the capture;
    /// at most one in-flight advance can complete in between, which is the
    /// skew the advance rule's slack of 2 covers.
    fn link(&self, slot: &Arc<EpochSlot>, core: usize) -> u64 {
        let mut list = self.cores.get(core).active.lock();
        let epoch = self.global.load(Ordering::Acquire);
        slot.origin.store(core, Ordering::Relaxed);
        slot.state.store(pack(epoch, 1), Ordering::Relaxed);
        list.push(Arc::clone(slot));
        epoch
    }

    /// Depth 1 → 0 transition: unlink from the slot's origin core.
    fn unlink(&self, slot: &Arc<EpochSlot>) -> usize {
        let core = slot.origin.load(Ordering::Relaxed);
        let mut list = self.cores.get(core).active.lock();
        slot.state.store(0, Ordering::Relaxed);
        list.retain(|s| !Arc::ptr_eq(s, slot));
        core
    }

    /// Tries to advance the global epoch by one.
    ///
    /// Rule: `E` may become `E + 1` only if every core's oldest active
    /// epoch and oldest-unfreed epoch (`nexttofree`, supplied by the
    /// reclaimer) are both at least `E - 2`. Returns the new epoch on
    /// success.
    pub(crate) fn try_advance(&self, nexttofree: impl Fn(usize) -> u64) -> Option<u64> {
        let _adv = self.advance.lock();
        let e = self.global.load(Ordering::Relaxed);
        let floor = e.saturating_sub(2);
        for core in 0..self.cores.len() {
            if let Some(min) = self.min_active_epoch(core) {
                if min < floor {
                    return None;
                }
            }
            if nexttofree(core) < floor {
                return None;
            }
        }
        let next = e + 1;
        self.global.store(next, Ordering::SeqCst);
        Some(next)
    }

    /// Minimum over all cores' oldest active epoch; `None` when idle.
    pub(crate) fn min_active_epoch_all(&self) -> Option<u64> {
        (0..self.cores.len())
            .filter_map(|c| self.min_active_epoch(c))
            .min()
    }
}

/// A registered thread's handle to the epoch clock.
///
/// Obtained from [`Domain::register`](crate::Domain::register). The handle
/// is neither `Send` nor `Sync`: it tracks the registering thread's nesting
/// depth, which only that thread may touch.
pub struct ThreadHandle {
    pub(crate) domain: Arc<DomainCore>,
    pub(crate) slot: Arc<EpochSlot>,
    _not_send: PhantomData<*mut ()>,
}

impl ThreadHandle {
    pub(crate) fn new(domain: Arc<DomainCore>) -> Self {
        let slot = domain.clock.make_slot();
        Self {
            domain,
            slot,
            _not_send: PhantomData,
        }
    }

    /// Enters an epoch-protected section; see [`Guard`].
    ///
    /// Nested pins only bump a depth counter. On the outermost pin the
    /// current core's epoch is captured and the handle is linked onto that
    /// core's active list.
    ///
    /// # Panics
    ///
    /// Panics if the nesting depth would exceed [`MAX_DEPTH`].
    pub fn pin(&self) -> Guard<'_> {
        let word = self.slot.state.load(Ordering::Relaxed);
        let depth = depth_of(word);
        assert!(depth < MAX_DEPTH, "epoch pin nesting overflow");
        if depth == 0 {
            let core = self.domain.current_core();
            self.domain.clock.link(&self.slot, core);
        } else {
            self.slot.state.store(word + 1, Ordering::Relaxed);
        }
        Guard {
            handle: self,
            released: false,
        }
    }

    /// True while any [`Guard`] from this handle is live.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        depth_of(self.slot.state.load(Ordering::Relaxed)) > 0
    }

    fn unpin(&self) {
        let word = self.slot.state.load(Ordering::Relaxed);
        let depth = depth_of(word);
        debug_assert!(depth > 0, "unpin without matching pin");
        if depth == 1 {
            let core = self.domain.clock.unlink(&self.slot);
            // A burst of retirements may have piled up while this reader
            // pinned the epoch; kick that core's reclaimer past threshold.
            self.domain.gc.maybe_wake(core);
        } else {
            self.slot.state.store(word - 1, Ordering::Relaxed);
        }
    }
}

/// An epoch-protected section.
///
/// Created by [`ThreadHandle::pin`]; the section ends when the guard drops
/// or [`release`](Guard::release) is called. Guards are movable (they may
/// be returned from the function that pinned) and deliberately not `Copy`
/// or `Clone`; releasing twice is a no-op.
///
/// Code holding a guard must not block or sleep: a parked guard pins the
/// epoch for every core and stalls reclamation domain-wide. This is a
/// caller obligation the type system does not enforce.
pub struct Guard<'h> {
    handle: &'h ThreadHandle,
    released: bool,
}

impl Guard<'_> {
    /// The epoch this guard's outermost pin captured.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        epoch_of(self.handle.slot.state.load(Ordering::Relaxed))
    }

    /// Ends the section early. Idempotent, so a guard that was moved out
    /// of and later dropped releases exactly once.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.handle.unpin();
        }
    }

    pub(crate) fn domain(&self) -> &Arc<DomainCore> {
        &self.handle.domain
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
