//! Per-core state containers and the current-core provider.
//!
//! Kernel-style per-CPU data (segment-register-relative storage) is rendered
//! here as an explicit [`PerCore<T>`] container: one cache-line-padded slot
//! per core, indexed by a core id from [`default_core_id`]. All per-core
//! access in this crate goes through this container; nothing assumes the
//! calling thread actually stays on the reported core. Slots that need
//! exclusivity carry their own locks, so a stale core id costs locality,
//! never correctness.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed array of per-core slots, one cache line each.
///
/// Constructed once with the domain's core count; never grows. Indexing is
/// bounds-checked; callers reduce arbitrary core ids with `% len()`.
pub struct PerCore<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerCore<T> {
    /// Builds `cores` slots, calling `init` with each slot's core id.
    ///
    /// # Panics
    ///
    /// Panics if `cores` is zero.
    pub fn new(cores: usize, mut init: impl FnMut(usize) -> T) -> Self {
        assert!(cores > 0, "per-core container needs at least one core");
        let slots = (0..cores).map(|c| CachePadded::new(init(c))).collect();
        Self { slots }
    }

    /// Number of cores this container was built for.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the container has no slots. Construction forbids this;
    /// present for API completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slot for `core`.
    ///
    /// # Panics
    ///
    /// Panics if `core >= len()`.
    #[must_use]
    pub fn get(&self, core: usize) -> &T {
        &self.slots[core]
    }

    /// Iterates slots in core order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &**s)
    }

    /// Iterates `(core, slot)` pairs in core order.
    pub fn iter_enumerated(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().map(|(c, s)| (c, &**s))
    }
}

/// Returns the OS's idea of the current core, unreduced.
///
/// Linux asks `sched_getcpu`; Windows asks `GetCurrentProcessorNumber`;
/// elsewhere (and when the syscall fails) each thread gets a stable
/// sequentially-assigned id. The result may be stale by the time it is
/// used — see the module docs for why that is tolerated.
#[must_use]
pub fn default_core_id() -> usize {
    #[cfg(any(test, feature = "test-util"))]
    if let Some(pinned) = pinned_core() {
        return pinned;
    }
    os_core_id()
}

#[cfg(target_os = "linux")]
fn os_core_id() -> usize {
    // SAFETY: sched_getcpu has no preconditions; a negative return means
    // the vDSO/syscall is unavailable.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        fallback_core_id()
    } else {
        cpu as usize
    }
}

#[cfg(windows)]
fn os_core_id() -> usize {
    // SAFETY: no preconditions.
    unsafe { windows_sys::Win32::System::Threading::GetCurrentProcessorNumber() as usize }
}

#[cfg(not(any(target_os = "linux", windows)))]
fn os_core_id() -> usize {
    fallback_core_id()
}

#[cfg_attr(any(windows, not(target_os = "linux")), allow(dead_code))]
fn fallback_core_id() -> usize {
    use std::cell::Cell;

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static ASSIGNED: Cell<usize> = const { Cell::new(usize::MAX) };
    }
    ASSIGNED.with(|slot| {
        if slot.get() == usize::MAX {
            slot.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        slot.get()
    })
}

#[cfg(any(test, feature = "test-util"))]
thread_local! {
    static PINNED_CORE: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
}

#[cfg(any(test, feature = "test-util"))]
fn pinned_core() -> Option<usize> {
    PINNED_CORE.with(|c| {
        let v = c.get();
        (v != usize::MAX).then_some(v)
    })
}

/// Pins the calling thread's reported core id until the guard drops.
///
/// Test-only: lets deterministic tests decide which core's way and
/// retirement lists an operation lands on.
#[cfg(any(test, feature = "test-util"))]
pub fn pin_core_id(core: usize) -> CorePin {
    let prev = PINNED_CORE.with(|c| c.replace(core));
    CorePin { prev }
}

/// Guard restoring the previous pinned core id.
#[cfg(any(test, feature = "test-util"))]
pub struct CorePin {
    prev: usize,
}

#[cfg(any(test, feature = "test-util"))]
impl Drop for CorePin {
    fn drop(&mut self) {
        PINNED_CORE.with(|c| c.set(self.prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_initialized_in_order() {
        let pc = PerCore::new(4, |c| c * 10);
        assert_eq!(pc.len(), 4);
        for (core, v) in pc.iter_enumerated() {
            assert_eq!(*v, core * 10);
        }
    }

    #[test]
    #[should_panic(expected = "at least one core")]
    fn zero_cores_rejected() {
        let _ = PerCore::new(0, |_| ());
    }

    #[test]
    fn pinning_overrides_core_id() {
        let _pin = pin_core_id(2);
        assert_eq!(default_core_id(), 2);
        {
            let _inner = pin_core_id(0);
            assert_eq!(default_core_id(), 0);
        }
        assert_eq!(default_core_id(), 2);
    }

    #[test]
    fn core_id_is_stable_unpinned() {
        // Whatever the provider reports, two immediate calls on one thread
        // should be usable as indexes after reduction.
        let n = 8;
        let a = default_core_id() % n;
        assert!(a < n);
    }
}
