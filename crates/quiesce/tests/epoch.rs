//! Integration tests for the epoch clock: pinning, nesting, the advance
//! rule, and monotonicity under concurrent drivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quiesce::{Domain, MAX_DEPTH};

fn quiet(cores: usize) -> Domain {
    Domain::builder().cores(cores).workers(false).build()
}

/// Test that an idle domain advances by exactly one per attempt.
#[test]
fn test_idle_advance_steps_by_one() {
    let domain = quiet(2);
    let e0 = domain.epoch();
    assert_eq!(domain.try_advance_epoch(), Some(e0 + 1));
    assert_eq!(domain.epoch(), e0 + 1);
    assert_eq!(domain.try_advance_epoch(), Some(e0 + 2));
    assert_eq!(domain.epoch(), e0 + 2);
}

/// Test that a pinned reader stalls the clock three epochs past its capture.
#[test]
fn test_pinned_reader_caps_the_advance() {
    let domain = quiet(1);
    let handle = domain.register();
    let guard = handle.pin();
    let pinned = guard.epoch();
    assert_eq!(pinned, domain.epoch());

    // E -> E + 1 needs every active reader at E - 2 or newer, so the
    // clock can run exactly three steps ahead of this guard.
    for expect in pinned + 1..=pinned + 3 {
        assert_eq!(domain.try_advance_epoch(), Some(expect));
    }
    assert_eq!(domain.try_advance_epoch(), None);
    assert_eq!(domain.run_gc(), 0);
    assert_eq!(domain.epoch(), pinned + 3);

    drop(guard);
    domain.run_gc();
    assert_eq!(domain.epoch(), pinned + 4);
}

/// Test that nested pins keep the outermost capture.
#[test]
fn test_nested_pins_share_the_outer_epoch() {
    let domain = quiet(1);
    let handle = domain.register();
    assert!(!handle.is_pinned());

    let outer = handle.pin();
    let captured = outer.epoch();
    domain.run_gc();
    assert!(domain.epoch() > captured);

    let inner = handle.pin();
    assert_eq!(inner.epoch(), captured, "nested pin recaptured the epoch");
    drop(inner);
    assert!(handle.is_pinned());
    drop(outer);
    assert!(!handle.is_pinned());
}

/// Test that releasing a guard twice unpins exactly once.
#[test]
fn test_release_is_idempotent() {
    let domain = quiet(1);
    let handle = domain.register();
    let mut guard = handle.pin();
    assert!(handle.is_pinned());

    guard.release();
    assert!(!handle.is_pinned());
    guard.release();
    assert!(!handle.is_pinned());

    // The implicit release on drop must not unpin a fresh section.
    let again = handle.pin();
    drop(guard);
    assert!(handle.is_pinned());
    drop(again);
    assert!(!handle.is_pinned());
}

/// Test that the depth counter saturates with a panic rather than wrapping.
#[test]
#[should_panic(expected = "epoch pin nesting overflow")]
fn test_pin_depth_overflow_panics() {
    let domain = quiet(1);
    let handle = domain.register();
    let mut guards = Vec::new();
    for _ in 0..MAX_DEPTH {
        guards.push(handle.pin());
    }
    let _too_deep = handle.pin();
}

/// Test that every thread observes a non-decreasing epoch and the clock
/// never outruns the oldest reader by more than the advance slack.
#[test]
fn test_epoch_monotonic_under_concurrent_drivers() {
    let domain = Arc::new(quiet(4));
    let stop = Arc::new(AtomicBool::new(false));

    let drivers: Vec<_> = (0..2)
        .map(|_| {
            let domain = Arc::clone(&domain);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last = domain.epoch();
                while !stop.load(Ordering::Relaxed) {
                    domain.run_gc();
                    let now = domain.epoch();
                    assert!(now >= last, "epoch went backwards: {last} -> {now}");
                    last = now;
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let domain = Arc::clone(&domain);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let handle = domain.register();
                while !stop.load(Ordering::Relaxed) {
                    let guard = handle.pin();
                    let pinned = guard.epoch();
                    for _ in 0..8 {
                        let now = domain.epoch();
                        assert!(now >= pinned, "clock ran backwards under a pin");
                        assert!(
                            now <= pinned + 3,
                            "clock outran a pinned reader: pinned {pinned}, global {now}"
                        );
                    }
                    drop(guard);
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::Relaxed);
    for t in drivers.into_iter().chain(readers) {
        t.join().unwrap();
    }
}
