//! Integration tests for deferred reclamation: grace periods, reader
//! protection against use-after-free, background workers, and teardown.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quiesce::Domain;

struct NoteDrop(Arc<AtomicUsize>);

impl Drop for NoteDrop {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Test that a retired object is freed only after the clock moves past
/// its retirement epoch.
#[test]
fn test_retire_frees_after_two_collection_passes() {
    let domain = Domain::builder().cores(1).workers(false).build();
    let drops = Arc::new(AtomicUsize::new(0));
    domain.retire(Box::new(NoteDrop(Arc::clone(&drops))));
    assert_eq!(domain.stats().retired, 1);

    // The first pass only advances the clock past the retirement epoch.
    assert_eq!(domain.run_gc(), 0);
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    assert_eq!(domain.run_gc(), 1);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert_eq!(domain.stats().reclaimed, 1);
}

/// Test that a live guard holds back everything retired in its epoch.
#[test]
fn test_pinned_guard_blocks_reclamation() {
    let domain = Domain::builder().cores(1).workers(false).build();
    let drops = Arc::new(AtomicUsize::new(0));
    let handle = domain.register();

    let guard = handle.pin();
    domain.retire(Box::new(NoteDrop(Arc::clone(&drops))));
    for _ in 0..8 {
        domain.run_gc();
    }
    assert_eq!(drops.load(Ordering::Relaxed), 0, "freed under a live guard");

    drop(guard);
    while domain.stats().reclaimed < 1 {
        domain.run_gc();
    }
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

const MAGIC: u64 = 0x5ca1_ab1e_0ddb_a11;
const POISON: u64 = 0xdead_dead_dead_dead;

struct Node {
    magic: u64,
    seq: usize,
    drops: Arc<AtomicUsize>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.magic = POISON;
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe fn drop_node(p: *mut ()) {
    drop(unsafe { Box::from_raw(p.cast::<Node>()) });
}

/// Test that epoch-protected readers never observe a freed node while a
/// writer continuously unlinks and retires the published one.
#[test]
fn test_readers_never_observe_poisoned_nodes() {
    const SWAPS: usize = 4000;

    let domain = Arc::new(Domain::builder().cores(2).workers(false).build());
    let shared: Arc<AtomicPtr<Node>> = Arc::new(AtomicPtr::new(ptr::null_mut()));
    let stop = Arc::new(AtomicBool::new(false));
    let drops = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let domain = Arc::clone(&domain);
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let handle = domain.register();
                let mut reads = 0u64;
                while !stop.load(Ordering::Acquire) {
                    let guard = handle.pin();
                    let p = shared.load(Ordering::Acquire);
                    if !p.is_null() {
                        // The pin precedes the load, so the node cannot be
                        // freed before the guard drops.
                        let node = unsafe { &*p };
                        assert_eq!(
                            node.magic, MAGIC,
                            "reader saw a poisoned node at seq {}",
                            node.seq
                        );
                        assert!(node.seq < SWAPS);
                        reads += 1;
                    }
                    drop(guard);
                }
                reads
            })
        })
        .collect();

    for seq in 0..SWAPS {
        let fresh = Box::into_raw(Box::new(Node {
            magic: MAGIC,
            seq,
            drops: Arc::clone(&drops),
        }));
        let old = shared.swap(fresh, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: `old` was just unlinked and is never retired twice.
            unsafe { domain.retire_raw(old.cast(), drop_node) };
        }
        if seq % 64 == 0 {
            domain.run_gc();
        }
    }

    stop.store(true, Ordering::Release);
    let mut total_reads = 0;
    for t in readers {
        total_reads += t.join().unwrap();
    }
    assert!(total_reads > 0, "readers never overlapped the writer");

    let last = shared.swap(ptr::null_mut(), Ordering::AcqRel);
    // SAFETY: unlinked above; the teardown drain below frees it.
    unsafe { domain.retire_raw(last.cast(), drop_node) };

    let domain = Arc::into_inner(domain).expect("a reader still holds the domain");
    drop(domain);
    assert_eq!(drops.load(Ordering::Relaxed), SWAPS);
}

/// Test that background workers reclaim without manual driving.
#[test]
fn test_background_workers_reclaim() {
    let domain = Domain::builder()
        .cores(2)
        .gc_interval(Duration::from_millis(2))
        .review_interval(Duration::from_millis(2))
        .batch_threshold(8)
        .build();
    let drops = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        domain.retire(Box::new(NoteDrop(Arc::clone(&drops))));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while drops.load(Ordering::Relaxed) < 32 {
        assert!(Instant::now() < deadline, "workers never freed the batch");
        domain.request_gc();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(domain.stats().reclaimed, 32);
}

/// Test that dropping the domain frees everything still queued, through
/// both the boxed and the raw retirement paths.
#[test]
fn test_drop_drains_pending_retirements() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain = Domain::builder().cores(2).workers(false).build();
    for seq in 0..100 {
        if seq % 2 == 0 {
            domain.retire(Box::new(NoteDrop(Arc::clone(&drops))));
        } else {
            let raw = Box::into_raw(Box::new(Node {
                magic: MAGIC,
                seq,
                drops: Arc::clone(&drops),
            }));
            // SAFETY: freshly leaked, retired exactly once.
            unsafe { domain.retire_raw(raw.cast(), drop_node) };
        }
    }
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(domain);
    assert_eq!(drops.load(Ordering::Relaxed), 100);
}
