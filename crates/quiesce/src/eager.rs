//! The one-way transition from cached to exact counting.
//!
//! A scalable-mode object detects zero lazily, through review rounds.
//! Objects whose last drop must act promptly (descriptor close, waiter
//! wakeup) are converted instead: flush every core's cached delta for the
//! object, then route all further updates straight to the global count,
//! where a decrement to zero finalizes on the spot.
//!
//! ## Why the orderings are `SeqCst`
//!
//! The transition owner and a concurrent count update race in
//! store-buffering shape: the updater stores its way's `obj` and then
//! loads `mode`; the owner stores `mode = Transitioning` and then loads
//! the way's `obj` snapshot. With sequential consistency at those four
//! accesses at least one side observes the other, so every delta is
//! either flushed by the owner's sweep or pushed through by the updater's
//! own mode re-check. Without it both loads could see stale values and a
//! delta would survive into eager mode, silently skewing the count.

use crate::domain::DomainCore;
use crate::refcache::{flush_locked, Header, Mode, OnZero, Ref};
use crossbeam::utils::Backoff;
use std::ptr;
use std::sync::atomic::Ordering;

/// Drives `h` to eager mode; returns once the mode is `Eager`.
///
/// Callers must hold a strong handle on the object. Concurrent calls are
/// fine: exactly one wins the transition, the rest wait it out.
pub(crate) fn eagerify_header(dc: &DomainCore, h: &Header) {
    if h.mode
        .compare_exchange(
            Mode::Scalable as u8,
            Mode::Transitioning as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_err()
    {
        // Someone else owns (or already finished) the transition.
        let backoff = Backoff::new();
        while h.mode.load(Ordering::SeqCst) != Mode::Eager as u8 {
            backoff.snooze();
        }
        return;
    }

    let hp: *mut Header = ptr::from_ref(h).cast_mut();
    for core in 0..dc.cache.cores() {
        let way = dc.cache.way(core, hp);
        if !ptr::eq(way.obj.load(Ordering::SeqCst), hp) {
            // Never cached here, or already evicted — and eviction flushed.
            continue;
        }
        let mut delta = way.delta.lock();
        if ptr::eq(way.obj.load(Ordering::Relaxed), hp) {
            // SAFETY: the caller's strong handle keeps `h` alive, and a
            // live handle means not finalized.
            unsafe { flush_locked(dc, core, hp, &mut delta) };
        }
    }

    h.mode.store(Mode::Eager as u8, Ordering::SeqCst);
    dc.stats.eagerify_calls.fetch_add(1, Ordering::Relaxed);
    #[cfg(feature = "tracing")]
    crate::tracing::internal::log_eagerify();
}

impl<T: OnZero> Ref<T> {
    /// Converts this object to exact counting.
    ///
    /// Returns once the conversion is complete (including when another
    /// thread performed it): from then on the global count is exact and
    /// the final drop runs `on_zero` synchronously. The transition is
    /// one-way and idempotent.
    pub fn eagerify(&self) {
        let h = self.header();
        eagerify_header(h.domain(), h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::percore::pin_core_id;
    use crate::Domain;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Probe(Arc<AtomicUsize>);

    impl OnZero for Probe {
        fn on_zero(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn eagerify_is_one_way_and_idempotent() {
        let domain = Domain::builder().cores(2).workers(false).build();
        let zeros = Arc::new(AtomicUsize::new(0));
        let obj = Ref::new(&domain, Probe(Arc::clone(&zeros)));
        assert_eq!(obj.mode(), Mode::Scalable);
        obj.eagerify();
        assert_eq!(obj.mode(), Mode::Eager);
        obj.eagerify();
        assert_eq!(obj.mode(), Mode::Eager);
        assert_eq!(domain.stats().eagerify_calls, 1);
    }

    #[test]
    fn eagerify_flushes_remote_cores() {
        let domain = Domain::builder().cores(2).workers(false).build();
        let zeros = Arc::new(AtomicUsize::new(0));
        let obj = Ref::new(&domain, Probe(Arc::clone(&zeros)));

        let extra0 = {
            let _pin = pin_core_id(0);
            obj.clone()
        };
        let extra1 = {
            let _pin = pin_core_id(1);
            obj.clone()
        };
        // Both increments still sit in per-core ways.
        obj.eagerify();
        assert_eq!(obj.global_count(), 3);
        drop(extra0);
        drop(extra1);
        assert_eq!(obj.global_count(), 1);
        assert_eq!(zeros.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn eager_final_drop_finalizes_synchronously() {
        let domain = Domain::builder().cores(2).workers(false).build();
        let zeros = Arc::new(AtomicUsize::new(0));
        let _pin = pin_core_id(0);
        let obj = Ref::new(&domain, Probe(Arc::clone(&zeros)));
        let extra = obj.clone();
        drop(extra);
        obj.eagerify();
        assert_eq!(obj.global_count(), 1);
        assert_eq!(zeros.load(Ordering::Relaxed), 0);
        drop(obj);
        // No review round needed: the eager decrement hit zero directly.
        assert_eq!(zeros.load(Ordering::Relaxed), 1);
    }
}
