//! Busy-wait locks for paths that must never deschedule.
//!
//! Delta-cache ways, refcount headers and per-core active-thread lists are
//! touched from contexts that are forbidden to block (see the crate docs on
//! suspension points), so they use [`SpinLock`] rather than a parking lock.
//! Critical sections under these locks are a handful of loads and stores;
//! anything slow (finalizers, node construction) happens outside them.
//!
//! ## Lock ordering
//!
//! Spinlocks carry a [`LockRank`]; debug builds assert that a thread only
//! acquires ranks in strictly increasing order. The established order is
//!
//! | rank | lock |
//! |------|------|
//! | `WaySlot` | one delta-cache way |
//! | `Header` | one refcount object header |
//! | `CoreList` | one core's active-thread list |
//!
//! Eviction and eagerify hold a way while locking the evicted/target
//! object's header (`WaySlot` → `Header`); nothing acquires a way while
//! holding a header. The reclaimer's parking_lot mutex is released before
//! finalizers run, so it never nests inside these.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Acquisition rank, lowest first. See the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum LockRank {
    WaySlot = 0,
    Header = 1,
    CoreList = 2,
}

#[cfg(debug_assertions)]
mod held {
    use super::LockRank;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn push(rank: LockRank) {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(&top) = h.last() {
                assert!(
                    rank > top,
                    "lock order violation: acquiring {rank:?} while holding {top:?}"
                );
            }
            h.push(rank);
        });
    }

    pub(super) fn pop(rank: LockRank) {
        HELD.with(|h| {
            let popped = h.borrow_mut().pop();
            debug_assert_eq!(popped, Some(rank), "unbalanced spinlock release");
        });
    }
}

/// A test-and-test-and-set spinlock with exponential backoff.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    rank: LockRank,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to `data`.
unsafe impl<T: Send> Send for SpinLock<T> {}
// SAFETY: as above; `&SpinLock` only yields `&T`/`&mut T` through the guard.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) const fn new(rank: LockRank, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            rank,
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is held. Never blocks the scheduler.
    pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
        #[cfg(debug_assertions)]
        held::push(self.rank);
        SpinGuard { lock: self }
    }

    /// Acquires only if immediately free.
    #[cfg(test)]
    pub(crate) fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            #[cfg(debug_assertions)]
            held::push(self.rank);
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard witnesses exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        held::pop(self.lock.rank);
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_are_exact_under_contention() {
        let lock = Arc::new(SpinLock::new(LockRank::Header, 0u64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(LockRank::Header, ());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn increasing_ranks_are_accepted() {
        let way = SpinLock::new(LockRank::WaySlot, ());
        let header = SpinLock::new(LockRank::Header, ());
        let _w = way.lock();
        let _h = header.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn decreasing_ranks_panic() {
        let way = SpinLock::new(LockRank::WaySlot, ());
        let header = SpinLock::new(LockRank::Header, ());
        let _h = header.lock();
        let _w = way.lock();
    }
}
