//! Compressed concurrent radix array.
//!
//! [`RadixArray<T>`] is a fixed-capacity sparse array whose uniform
//! subranges are stored compressed: one tagged slot word covers a whole
//! aligned range, pointing at one shared external value. Point reads, bulk
//! assignment, run discovery and advisory range locking all operate on the
//! same tree and only ever refine it — compressed slots are expanded on
//! demand by a partial write or a partial-range lock, and never
//! re-compressed.
//!
//! Every slot is one `AtomicUsize`: a 2-bit type tag and the advisory lock
//! bit packed into the low bits of an aligned pointer. The bit layout never
//! escapes [`decode`]/[`encode_ext`]/[`encode_node`]; everything else
//! matches on [`Slot`]. Node storage comes from a [`PagePool`] whose
//! mappings outlive every reader, so traversal needs an epoch guard only to
//! protect the external boxes hanging off the slots — a replaced box is
//! retired through the owning domain's reclaimer and freed a grace period
//! later.
//!
//! Advisory locks set the lock bit on every fringe slot covering the
//! requested range. Expansion spin-waits on locked slots, so a fringe keeps
//! its shape for as long as any lock covers it. That is why a
//! [`RadixLock`] records only its raw `[low, high)` range: release
//! re-derives the identical slot walk from the range alone.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::domain::{Domain, DomainCore};
use crate::epoch::Guard;
use crate::gc::Retired;
use crate::pool::{AllocError, PagePool, NODE_BYTES};

/// Slot words per upper-level node.
pub(crate) const UPPER_FANOUT: usize = NODE_BYTES / mem::size_of::<usize>();

// Slot word layout: pointer payload in the high bits, 2-bit type tag in
// bits 1:0, advisory lock in bit 2. Nodes are page-aligned and external
// boxes are 8-aligned, so the low three payload bits are always zero.
const TAG_NULL: usize = 0b00;
const TAG_EXT: usize = 0b01;
const TAG_NODE: usize = 0b10;
const TAG_MASK: usize = 0b011;
const LOCK_BIT: usize = 0b100;
const PTR_MASK: usize = !0b111;

// Leaf element flags. LATCH is a short-lived mutual-exclusion bit over the
// value bytes; LOCK is the advisory per-element lock and is never touched
// by value access.
const ELEM_SET: usize = 0b001;
const ELEM_LOCK: usize = 0b010;
const ELEM_LATCH: usize = 0b100;

/// Decoded view of one slot word, lock bit excluded.
enum Slot<T> {
    Null,
    Ext(NonNull<ExtBox<T>>),
    Node(NonNull<u8>),
}

fn decode<T>(word: usize) -> Slot<T> {
    let payload = word & PTR_MASK;
    match word & TAG_MASK {
        TAG_NULL => Slot::Null,
        // SAFETY: tagged words are only built by `encode_ext`/`encode_node`
        // from non-null pointers.
        TAG_EXT => Slot::Ext(unsafe { NonNull::new_unchecked(payload as *mut ExtBox<T>) }),
        TAG_NODE => Slot::Node(unsafe { NonNull::new_unchecked(payload as *mut u8) }),
        _ => unreachable!("corrupt radix slot tag"),
    }
}

fn encode_ext<T>(b: NonNull<ExtBox<T>>) -> usize {
    let addr = b.as_ptr() as usize;
    debug_assert_eq!(addr & !PTR_MASK, 0);
    addr | TAG_EXT
}

fn encode_node(n: NonNull<u8>) -> usize {
    let addr = n.as_ptr() as usize;
    debug_assert_eq!(addr & !PTR_MASK, 0);
    addr | TAG_NODE
}

/// A shared uniform value covering one or more whole slots.
///
/// `refs` counts referencing slots plus transient holds (the fill that is
/// publishing it, an expansion staging child slots). The value is immutable
/// once published; overwrites swap slots over to a different box.
#[repr(align(8))]
struct ExtBox<T> {
    refs: AtomicUsize,
    value: T,
}

fn new_ext<T>(dc: &DomainCore, value: T) -> NonNull<ExtBox<T>> {
    dc.stats.ext_allocs.fetch_add(1, Ordering::Relaxed);
    NonNull::from(Box::leak(Box::new(ExtBox {
        refs: AtomicUsize::new(1),
        value,
    })))
}

/// Adds `n` references unless the count has already hit zero. A zero count
/// means the box is doomed and the slot that led here has moved on.
fn try_add_refs<T>(b: NonNull<ExtBox<T>>, n: usize) -> bool {
    // SAFETY: the caller holds an epoch guard, so even a doomed box has not
    // been freed yet.
    let refs = &unsafe { b.as_ref() }.refs;
    refs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
        if r == 0 {
            None
        } else {
            Some(r + n)
        }
    })
    .is_ok()
}

/// Drops `n` references; the transition to zero retires the box through the
/// domain's reclaimer so concurrent epoch-protected readers stay safe.
fn release_ext<T: Send + Sync + 'static>(dc: &DomainCore, b: NonNull<ExtBox<T>>, n: usize) {
    // SAFETY: the caller owns `n` references, so the box is live.
    let prev = unsafe { b.as_ref() }.refs.fetch_sub(n, Ordering::Release);
    debug_assert!(prev >= n, "external box reference underflow");
    if prev == n {
        atomic::fence(Ordering::Acquire);
        dc.stats.ext_retired.fetch_add(1, Ordering::Relaxed);
        // SAFETY: last reference; `drop_ext` runs once, after a grace
        // period.
        let retired = unsafe { Retired::from_raw(b.as_ptr().cast(), drop_ext::<T>) };
        dc.retire_erased(retired);
    }
}

/// Reference release for teardown paths holding exclusive access: the
/// transition to zero drops the box immediately.
///
/// # Safety
///
/// No concurrent reader may hold or be able to reach a pointer to the box.
unsafe fn release_ext_direct<T>(b: NonNull<ExtBox<T>>) {
    // SAFETY: the caller owns a reference.
    if unsafe { b.as_ref() }.refs.fetch_sub(1, Ordering::Release) == 1 {
        atomic::fence(Ordering::Acquire);
        // SAFETY: last reference and exclusive access per the contract.
        drop(unsafe { Box::from_raw(b.as_ptr()) });
    }
}

unsafe fn drop_ext<T>(p: *mut ()) {
    // SAFETY: `p` came from `Box::leak` in `new_ext`; this runs at most
    // once, after every reader from before the final release has unpinned.
    drop(unsafe { Box::from_raw(p.cast::<ExtBox<T>>()) });
}

/// One leaf element: a flags word and the value storage it guards.
struct ElemSlot<T> {
    flags: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Spins until the latch is held; returns the flags observed at
/// acquisition, latch bit excluded.
fn latch_elem<T>(elem: &ElemSlot<T>) -> usize {
    let backoff = Backoff::new();
    loop {
        let f = elem.flags.load(Ordering::Relaxed);
        if f & ELEM_LATCH == 0
            && elem
                .flags
                .compare_exchange_weak(f, f | ELEM_LATCH, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return f;
        }
        backoff.snooze();
    }
}

fn unlatch_elem<T>(elem: &ElemSlot<T>) {
    elem.flags.fetch_and(!ELEM_LATCH, Ordering::Release);
}

fn write_elem<T>(elem: &ElemSlot<T>, value: T) {
    let f = latch_elem(elem);
    // SAFETY: the latch grants exclusive access to the value bytes.
    unsafe {
        let slot = &mut *elem.value.get();
        if f & ELEM_SET != 0 {
            slot.assume_init_drop();
        }
        slot.write(value);
    }
    // Publish SET and clear the latch in one step, keeping the advisory
    // lock bit however it changed while the latch was held.
    let _ = elem.flags.fetch_update(Ordering::Release, Ordering::Relaxed, |cur| {
        Some((cur | ELEM_SET) & !ELEM_LATCH)
    });
}

fn read_elem<T: Clone>(elem: &ElemSlot<T>) -> Option<T> {
    let f = latch_elem(elem);
    let out = if f & ELEM_SET == 0 {
        None
    } else {
        // SAFETY: SET means the bytes are initialized and the latch keeps
        // writers out while we clone.
        Some(unsafe { (*elem.value.get()).assume_init_ref() }.clone())
    };
    unlatch_elem(elem);
    out
}

fn lock_elem<T>(elem: &ElemSlot<T>) {
    let backoff = Backoff::new();
    loop {
        let f = elem.flags.load(Ordering::Relaxed);
        if f & ELEM_LOCK == 0
            && elem
                .flags
                .compare_exchange_weak(f, f | ELEM_LOCK, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        backoff.snooze();
    }
}

fn unlock_elem<T>(elem: &ElemSlot<T>) {
    let prev = elem.flags.fetch_and(!ELEM_LOCK, Ordering::Release);
    assert!(
        prev & ELEM_LOCK != 0,
        "released an element lock that was not held"
    );
}

fn lock_slot(slot: &AtomicUsize) {
    let backoff = Backoff::new();
    loop {
        let w = slot.load(Ordering::Relaxed);
        if w & LOCK_BIT == 0
            && slot
                .compare_exchange_weak(w, w | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        backoff.snooze();
    }
}

fn unlock_slot(slot: &AtomicUsize) {
    let prev = slot.fetch_and(!LOCK_BIT, Ordering::Release);
    assert!(
        prev & LOCK_BIT != 0,
        "released a range lock on a slot that was not locked"
    );
}

/// Fixed-capacity sparse array with compressed uniform subranges.
///
/// Writes ([`fill`](Self::fill)) assign one value across a range, collapsing
/// aligned subranges into shared external boxes. Reads clone values out.
/// [`acquire`](Self::acquire) takes a purely advisory lock over a range;
/// it does not stop `fill`, but concurrent `acquire`s of overlapping ranges
/// serialize. All operations except [`is_set`](Self::is_set) run under an
/// epoch [`Guard`] from the same [`Domain`] the array was created in.
pub struct RadixArray<T> {
    root: AtomicUsize,
    /// `spans[k]` is the index span of a slot at level `k`; `spans[0] == 1`.
    spans: Box<[usize]>,
    height: usize,
    len: usize,
    pool: PagePool,
    domain: Arc<DomainCore>,
    _marker: PhantomData<T>,
}

// SAFETY: shared state is reached only through atomics, the pool mutex, or
// value cells guarded by their latch bits.
unsafe impl<T: Send + Sync> Send for RadixArray<T> {}
unsafe impl<T: Send + Sync> Sync for RadixArray<T> {}

const fn floor_pow2(x: usize) -> usize {
    if x == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - x.leading_zeros())
    }
}

impl<T> RadixArray<T> {
    /// Elements per leaf node for this element type: the largest power of
    /// two of element slots that fit in one node.
    pub const LEAF_FANOUT: usize = floor_pow2(NODE_BYTES / mem::size_of::<ElemSlot<T>>());

    /// Capacity of the array.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Never true; arrays have fixed nonzero capacity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// # Safety
    ///
    /// `node` must be a live upper node of this array.
    unsafe fn upper_slot(&self, node: NonNull<u8>, child: usize) -> &AtomicUsize {
        debug_assert!(child < UPPER_FANOUT);
        // SAFETY: upper nodes are UPPER_FANOUT consecutive slot words.
        unsafe { &*node.as_ptr().cast::<AtomicUsize>().add(child) }
    }

    /// # Safety
    ///
    /// `node` must be a live leaf node of this array.
    unsafe fn leaf_elem(&self, node: NonNull<u8>, i: usize) -> &ElemSlot<T> {
        debug_assert!(i < Self::LEAF_FANOUT);
        // SAFETY: leaves are LEAF_FANOUT consecutive element slots.
        unsafe { &*node.as_ptr().cast::<ElemSlot<T>>().add(i) }
    }

    /// Index of the child slot under a node whose own slot sits at
    /// `slot_level`.
    fn child_of(&self, idx: usize, slot_level: usize) -> usize {
        (idx % self.spans[slot_level]) / self.spans[slot_level - 1]
    }

    /// Coarsest slot level that starts exactly at `idx` and fits inside
    /// `[idx, high)`. Level 0 is a single element.
    fn top_level(&self, idx: usize, high: usize) -> usize {
        let mut level = 0;
        while level < self.height {
            let span = self.spans[level + 1];
            if idx % span != 0 || high - idx < span {
                break;
            }
            level += 1;
        }
        level
    }

    fn clip(&self, base: usize, span: usize) -> usize {
        span.min(self.len - base)
    }

    /// Slot-granular description of the region around `idx`. Follows only
    /// node edges and never dereferences a box.
    fn probe(&self, idx: usize) -> Probe<T> {
        let mut level = self.height;
        let mut slot: &AtomicUsize = &self.root;
        loop {
            let w = slot.load(Ordering::Acquire);
            match decode::<T>(w) {
                Slot::Null => {
                    let base = idx - idx % self.spans[level];
                    return Probe {
                        base,
                        len: self.clip(base, self.spans[level]),
                        kind: ProbeKind::Null,
                    };
                }
                Slot::Ext(b) => {
                    let base = idx - idx % self.spans[level];
                    return Probe {
                        base,
                        len: self.clip(base, self.spans[level]),
                        kind: ProbeKind::Ext(b),
                    };
                }
                Slot::Node(n) => {
                    if level == 1 {
                        // SAFETY: level-1 nodes are leaves.
                        let elem = unsafe { self.leaf_elem(n, idx % Self::LEAF_FANOUT) };
                        let set = elem.flags.load(Ordering::Acquire) & ELEM_SET != 0;
                        return Probe {
                            base: idx,
                            len: 1,
                            kind: ProbeKind::Elem { set },
                        };
                    }
                    // SAFETY: level >= 2 nodes hold slot words.
                    slot = unsafe { self.upper_slot(n, self.child_of(idx, level)) };
                    level -= 1;
                }
            }
        }
    }

    /// Lends out the value of an external probe. Callers hold an epoch
    /// guard spanning `'g`.
    fn probe_state<'g>(&'g self, kind: ProbeKind<T>) -> RunState<'g, T> {
        match kind {
            ProbeKind::Null => RunState::Unset,
            // SAFETY: a replaced box is retired, not freed, until every
            // guard from before the swap ends; `'g` is inside one.
            ProbeKind::Ext(b) => RunState::Uniform(unsafe { &(*b.as_ptr()).value }),
            ProbeKind::Elem { set } => RunState::Element { set },
        }
    }

    /// Walks to the level-`target` slot containing `idx` on a path that
    /// must already exist. Release walks use this: the fringe under a held
    /// lock cannot change shape, so a missing node is a caller protocol
    /// violation.
    fn slot_existing(&self, idx: usize, target: usize) -> &AtomicUsize {
        let mut slot: &AtomicUsize = &self.root;
        let mut level = self.height;
        while level > target {
            match decode::<T>(slot.load(Ordering::Acquire)) {
                // SAFETY: level >= 2 nodes hold slot words.
                Slot::Node(n) => slot = unsafe { self.upper_slot(n, self.child_of(idx, level)) },
                _ => panic!("range lock release found no node where one was locked"),
            }
            level -= 1;
        }
        slot
    }

    fn elem_existing(&self, idx: usize) -> &ElemSlot<T> {
        match decode::<T>(self.slot_existing(idx, 1).load(Ordering::Acquire)) {
            // SAFETY: level-1 nodes are leaves.
            Slot::Node(n) => unsafe { self.leaf_elem(n, idx % Self::LEAF_FANOUT) },
            _ => panic!("range lock release found no leaf where an element was locked"),
        }
    }

    /// Clears every advisory bit covering `[low, high)`, re-deriving the
    /// same fringe walk the acquisition performed.
    fn unlock_range(&self, low: usize, high: usize) {
        let mut pos = low;
        while pos < high {
            let level = self.top_level(pos, high);
            if level == 0 {
                unlock_elem(self.elem_existing(pos));
                pos += 1;
            } else {
                self.unlock_covered(self.slot_existing(pos, level), level);
                pos += self.spans[level];
            }
        }
    }

    fn unlock_covered(&self, slot: &AtomicUsize, slot_level: usize) {
        match decode::<T>(slot.load(Ordering::Acquire)) {
            Slot::Node(n) => {
                if slot_level == 1 {
                    for i in 0..Self::LEAF_FANOUT {
                        // SAFETY: live leaf.
                        unlock_elem(unsafe { self.leaf_elem(n, i) });
                    }
                } else {
                    for i in 0..UPPER_FANOUT {
                        // SAFETY: live upper node.
                        self.unlock_covered(unsafe { self.upper_slot(n, i) }, slot_level - 1);
                    }
                }
            }
            _ => unlock_slot(slot),
        }
    }

    fn drop_slot(&self, word: usize, slot_level: usize) {
        match decode::<T>(word) {
            Slot::Null => {}
            // SAFETY: teardown has exclusive access; the slot's reference
            // is the one being dropped.
            Slot::Ext(b) => unsafe { release_ext_direct(b) },
            Slot::Node(n) => {
                if slot_level == 1 {
                    for i in 0..Self::LEAF_FANOUT {
                        // SAFETY: live leaf with exclusive access.
                        let elem = unsafe { self.leaf_elem(n, i) };
                        if elem.flags.load(Ordering::Relaxed) & ELEM_SET != 0 {
                            // SAFETY: SET bytes are initialized.
                            unsafe { (*elem.value.get()).assume_init_drop() };
                        }
                    }
                } else {
                    for i in 0..UPPER_FANOUT {
                        // SAFETY: live upper node.
                        let child = unsafe { self.upper_slot(n, i) }.load(Ordering::Relaxed);
                        self.drop_slot(child, slot_level - 1);
                    }
                }
                // Node chunks go back when the pool's mappings drop.
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RadixArray<T> {
    /// Creates an array of capacity `len` whose node lifetimes are managed
    /// by `domain`.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or if `T` is so large that fewer than two
    /// elements fit in one node.
    #[must_use]
    pub fn new(domain: &Domain, len: usize) -> Self {
        Self::with_pool(domain, len, PagePool::new())
    }

    /// Like [`RadixArray::new`] with a cap on outstanding nodes, for
    /// exercising allocation failure.
    #[must_use]
    pub fn with_node_budget(domain: &Domain, len: usize, max_nodes: usize) -> Self {
        Self::with_pool(domain, len, PagePool::with_budget(max_nodes))
    }

    fn with_pool(domain: &Domain, len: usize, pool: PagePool) -> Self {
        assert!(len > 0, "radix array capacity must be nonzero");
        assert!(
            Self::LEAF_FANOUT >= 2,
            "element type too large for leaf nodes"
        );
        assert!(
            mem::align_of::<ElemSlot<T>>() <= NODE_BYTES,
            "element alignment exceeds node alignment"
        );
        let mut spans = vec![1, Self::LEAF_FANOUT];
        while spans[spans.len() - 1] < len {
            let widened = spans[spans.len() - 1].saturating_mul(UPPER_FANOUT);
            spans.push(widened);
        }
        let height = spans.len() - 1;
        Self {
            root: AtomicUsize::new(TAG_NULL),
            spans: spans.into_boxed_slice(),
            height,
            len,
            pool,
            domain: Arc::clone(domain.shared()),
            _marker: PhantomData,
        }
    }

    fn check_guard(&self, guard: &Guard<'_>) {
        debug_assert!(
            Arc::ptr_eq(guard.domain(), &self.domain),
            "guard pinned in a different domain"
        );
    }

    fn alloc_node(&self) -> Result<NonNull<u8>, AllocError> {
        let node = self.pool.alloc()?;
        self.domain.stats.node_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Ensures `slot` (at `slot_level`) holds a node, expanding Null or
    /// External contents in place. Spins while the slot's advisory lock bit
    /// is held: locked slots keep their granularity until release. The
    /// caller holds an epoch guard.
    fn expand(&self, slot: &AtomicUsize, slot_level: usize) -> Result<NonNull<u8>, AllocError> {
        let backoff = Backoff::new();
        loop {
            let w = slot.load(Ordering::Acquire);
            if w & LOCK_BIT != 0 {
                backoff.snooze();
                continue;
            }
            match decode::<T>(w) {
                Slot::Node(n) => return Ok(n),
                Slot::Null => {
                    // A zeroed chunk already reads as all-null slots or
                    // all-unset elements.
                    let node = self.alloc_node()?;
                    match slot.compare_exchange(
                        w,
                        encode_node(node),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(node),
                        // SAFETY: lost the race; never published.
                        Err(_) => unsafe { self.pool.free(node) },
                    }
                }
                Slot::Ext(b) if slot_level == 1 => {
                    let node = self.alloc_node()?;
                    // SAFETY: the slot referenced the box when read and the
                    // guard keeps the allocation alive even if the slot has
                    // since moved on.
                    let value = unsafe { &b.as_ref().value };
                    for i in 0..Self::LEAF_FANOUT {
                        // SAFETY: fresh leaf, not shared yet.
                        let elem = unsafe { self.leaf_elem(node, i) };
                        unsafe { (*elem.value.get()).write(value.clone()) };
                        elem.flags.store(ELEM_SET, Ordering::Relaxed);
                    }
                    match slot.compare_exchange(
                        w,
                        encode_node(node),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // The leaf holds clones, not the box; the
                            // slot's reference dies with the swap.
                            release_ext(&self.domain, b, 1);
                            return Ok(node);
                        }
                        Err(_) => {
                            // SAFETY: never published; unwind the staged
                            // clones.
                            unsafe {
                                for i in 0..Self::LEAF_FANOUT {
                                    (*self.leaf_elem(node, i).value.get()).assume_init_drop();
                                }
                                self.pool.free(node);
                            }
                        }
                    }
                }
                Slot::Ext(b) => {
                    // Stage one reference per child before publishing.
                    if !try_add_refs(b, UPPER_FANOUT) {
                        backoff.snooze();
                        continue;
                    }
                    let node = match self.alloc_node() {
                        Ok(node) => node,
                        Err(e) => {
                            release_ext(&self.domain, b, UPPER_FANOUT);
                            return Err(e);
                        }
                    };
                    for i in 0..UPPER_FANOUT {
                        // SAFETY: fresh node, not shared yet.
                        unsafe { self.upper_slot(node, i) }.store(encode_ext(b), Ordering::Relaxed);
                    }
                    match slot.compare_exchange(
                        w,
                        encode_node(node),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            release_ext(&self.domain, b, 1);
                            return Ok(node);
                        }
                        Err(_) => {
                            release_ext(&self.domain, b, UPPER_FANOUT);
                            // SAFETY: never published.
                            unsafe { self.pool.free(node) };
                        }
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Walks to the slot at `target` level containing `idx`, expanding any
    /// Null/External slot on the way down.
    fn descend(&self, idx: usize, target: usize) -> Result<&AtomicUsize, AllocError> {
        debug_assert!(target >= 1);
        let mut slot: &AtomicUsize = &self.root;
        let mut level = self.height;
        while level > target {
            let node = self.expand(slot, level)?;
            // SAFETY: `expand` at level >= 2 returned an upper node.
            slot = unsafe { self.upper_slot(node, self.child_of(idx, level)) };
            level -= 1;
        }
        Ok(slot)
    }

    /// Leaf node containing `idx`, expanding as needed.
    fn leaf_at(&self, idx: usize) -> Result<NonNull<u8>, AllocError> {
        let slot = self.descend(idx, 1)?;
        self.expand(slot, 1)
    }

    /// Assigns `value` to every index in `[low, high)`.
    ///
    /// Aligned subranges collapse to slot words sharing one external box;
    /// the rest goes through element writes. Descends through existing
    /// nodes — an already expanded region stays expanded. Held advisory
    /// locks are preserved by every overwrite, and a fill that would have
    /// to subdivide a locked slot waits for the lock holder first. A lock
    /// holder must therefore not issue such a fill inside its own range.
    ///
    /// On allocation failure the tree stays consistent: every index either
    /// has its old value or the new one, and nothing partially built is
    /// reachable.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn fill(&self, low: usize, high: usize, value: T, guard: &Guard<'_>) -> Result<(), AllocError> {
        self.check_guard(guard);
        assert!(
            low <= high && high <= self.len,
            "fill range {low}..{high} out of bounds for capacity {}",
            self.len
        );
        if low == high {
            return Ok(());
        }
        let mut shared = None;
        let result = self.fill_range(low, high, &value, &mut shared);
        if let Some(b) = shared {
            // Drop the construction reference; if nothing got published the
            // box dies right here.
            release_ext(&self.domain, b, 1);
        }
        result
    }

    fn fill_range(
        &self,
        low: usize,
        high: usize,
        value: &T,
        shared: &mut Option<NonNull<ExtBox<T>>>,
    ) -> Result<(), AllocError> {
        let mut idx = low;
        while idx < high {
            let level = self.top_level(idx, high);
            if level == 0 {
                let leaf = self.leaf_at(idx)?;
                let leaf_base = idx - idx % Self::LEAF_FANOUT;
                let end = (leaf_base + Self::LEAF_FANOUT).min(high);
                for i in idx..end {
                    // SAFETY: `leaf_at` returned the live leaf for `i`.
                    write_elem(unsafe { self.leaf_elem(leaf, i - leaf_base) }, value.clone());
                }
                idx = end;
            } else {
                let slot = self.descend(idx, level)?;
                self.assign_covered(slot, level, value, shared);
                idx += self.spans[level];
            }
        }
        Ok(())
    }

    /// Overwrites one fully covered slot, preserving its advisory lock bit.
    /// Never allocates nodes: covered Node slots are filled through, not
    /// replaced.
    fn assign_covered(
        &self,
        slot: &AtomicUsize,
        slot_level: usize,
        value: &T,
        shared: &mut Option<NonNull<ExtBox<T>>>,
    ) {
        let backoff = Backoff::new();
        loop {
            let w = slot.load(Ordering::Acquire);
            match decode::<T>(w) {
                Slot::Node(n) => {
                    self.fill_node(n, slot_level, value, shared);
                    return;
                }
                old => {
                    let b = self.shared_ext(shared, value);
                    // The construction reference keeps the box live, so a
                    // plain increment suffices.
                    // SAFETY: see above.
                    unsafe { b.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
                    let new = encode_ext(b) | (w & LOCK_BIT);
                    match slot.compare_exchange(w, new, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {
                            if let Slot::Ext(prev) = old {
                                release_ext(&self.domain, prev, 1);
                            }
                            return;
                        }
                        Err(_) => {
                            release_ext(&self.domain, b, 1);
                            backoff.snooze();
                        }
                    }
                }
            }
        }
    }

    /// Writes `value` across every index a node covers.
    fn fill_node(
        &self,
        node: NonNull<u8>,
        slot_level: usize,
        value: &T,
        shared: &mut Option<NonNull<ExtBox<T>>>,
    ) {
        if slot_level == 1 {
            for i in 0..Self::LEAF_FANOUT {
                // SAFETY: live leaf.
                write_elem(unsafe { self.leaf_elem(node, i) }, value.clone());
            }
        } else {
            for i in 0..UPPER_FANOUT {
                // SAFETY: live upper node.
                let child = unsafe { self.upper_slot(node, i) };
                self.assign_covered(child, slot_level - 1, value, shared);
            }
        }
    }

    fn shared_ext(&self, shared: &mut Option<NonNull<ExtBox<T>>>, value: &T) -> NonNull<ExtBox<T>> {
        *shared.get_or_insert_with(|| new_ext(&self.domain, value.clone()))
    }

    /// Reads the value at `idx`, cloning it out. Leaf values can be
    /// overwritten in place, so no borrow into a leaf may outlive the
    /// element latch; uniform runs lend a borrow through
    /// [`run_at`](Self::run_at) instead.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    #[must_use]
    pub fn get(&self, idx: usize, guard: &Guard<'_>) -> Option<T> {
        self.check_guard(guard);
        assert!(
            idx < self.len,
            "index {idx} out of bounds for capacity {}",
            self.len
        );
        let mut level = self.height;
        let mut slot: &AtomicUsize = &self.root;
        loop {
            let w = slot.load(Ordering::Acquire);
            match decode::<T>(w) {
                Slot::Null => return None,
                // SAFETY: the guard defers any free of a box this slot
                // pointed at.
                Slot::Ext(b) => return Some(unsafe { &b.as_ref().value }.clone()),
                Slot::Node(n) => {
                    if level == 1 {
                        // SAFETY: level-1 nodes are leaves.
                        return read_elem(unsafe { self.leaf_elem(n, idx % Self::LEAF_FANOUT) });
                    }
                    // SAFETY: level >= 2 nodes hold slot words.
                    slot = unsafe { self.upper_slot(n, self.child_of(idx, level)) };
                    level -= 1;
                }
            }
        }
    }

    /// Whether `idx` currently holds a value. Needs no guard: the walk
    /// follows only node edges, and node memory is never unmapped while the
    /// array lives.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    #[must_use]
    pub fn is_set(&self, idx: usize) -> bool {
        assert!(
            idx < self.len,
            "index {idx} out of bounds for capacity {}",
            self.len
        );
        match self.probe(idx).kind {
            ProbeKind::Null => false,
            ProbeKind::Ext(_) => true,
            ProbeKind::Elem { set } => set,
        }
    }

    /// The uniform run containing `idx`, at slot granularity.
    ///
    /// The result borrows both the array and the guard, so a lent
    /// [`RunState::Uniform`] value can outlive neither.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    #[must_use]
    pub fn run_at<'g>(&'g self, idx: usize, guard: &'g Guard<'_>) -> Run<'g, T> {
        self.check_guard(guard);
        assert!(
            idx < self.len,
            "index {idx} out of bounds for capacity {}",
            self.len
        );
        let p = self.probe(idx);
        Run {
            base: p.base,
            len: p.len,
            state: self.probe_state(p.kind),
        }
    }

    /// Iterates the runs intersecting `[low, high)` in ascending order.
    ///
    /// Adjacent slots sharing one external box merge into a single run;
    /// absent regions are reported at slot granularity. Runs carry their
    /// true extents, so the first and last may stick out past the queried
    /// bounds.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn runs<'g>(&'g self, low: usize, high: usize, guard: &'g Guard<'_>) -> Runs<'g, T> {
        self.check_guard(guard);
        assert!(
            low <= high && high <= self.len,
            "run range {low}..{high} out of bounds for capacity {}",
            self.len
        );
        Runs {
            array: self,
            _guard: guard,
            pos: low,
            high,
        }
    }

    /// Takes the advisory lock over `[low, high)`.
    ///
    /// Walks in ascending index order at the coarsest granularity the
    /// current compression allows: fully covered Null/External slots lock
    /// in place, Node slots recurse into their children, and partial
    /// coverage of a compressed slot expands it first. Overlapping
    /// acquisitions serialize; disjoint ones never share a bit. Spins,
    /// never blocks. On allocation failure every bit taken so far is
    /// released before the error propagates.
    ///
    /// The lock is advisory: it does not stop [`fill`](Self::fill). Callers
    /// wanting mutual exclusion must route every conflicting writer through
    /// `acquire`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn acquire(
        &self,
        low: usize,
        high: usize,
        guard: &Guard<'_>,
    ) -> Result<RadixLock<'_, T>, AllocError> {
        self.check_guard(guard);
        assert!(
            low <= high && high <= self.len,
            "lock range {low}..{high} out of bounds for capacity {}",
            self.len
        );
        let mut pos = low;
        while pos < high {
            match self.lock_step(pos, high) {
                Ok(step) => pos += step,
                Err(e) => {
                    // Nothing in the failing step was locked yet; unwind
                    // the prefix.
                    self.unlock_range(low, pos);
                    return Err(e);
                }
            }
        }
        Ok(RadixLock {
            array: self,
            low,
            high,
            _not_send: PhantomData,
        })
    }

    /// Locks the fringe under the coarsest slot starting at `pos`; returns
    /// the span covered.
    fn lock_step(&self, pos: usize, high: usize) -> Result<usize, AllocError> {
        let level = self.top_level(pos, high);
        if level == 0 {
            let leaf = self.leaf_at(pos)?;
            // SAFETY: live leaf for `pos`.
            lock_elem(unsafe { self.leaf_elem(leaf, pos % Self::LEAF_FANOUT) });
            Ok(1)
        } else {
            let slot = self.descend(pos, level)?;
            self.lock_covered(slot, level);
            Ok(self.spans[level])
        }
    }

    /// Takes every advisory bit under a fully covered slot. Never
    /// allocates: Null and External slots lock in place, Node slots
    /// recurse.
    fn lock_covered(&self, slot: &AtomicUsize, slot_level: usize) {
        let backoff = Backoff::new();
        loop {
            let w = slot.load(Ordering::Acquire);
            match decode::<T>(w) {
                Slot::Node(n) => {
                    if slot_level == 1 {
                        for i in 0..Self::LEAF_FANOUT {
                            // SAFETY: live leaf.
                            lock_elem(unsafe { self.leaf_elem(n, i) });
                        }
                    } else {
                        for i in 0..UPPER_FANOUT {
                            // SAFETY: live upper node.
                            self.lock_covered(unsafe { self.upper_slot(n, i) }, slot_level - 1);
                        }
                    }
                    return;
                }
                _ => {
                    if w & LOCK_BIT == 0
                        && slot
                            .compare_exchange_weak(
                                w,
                                w | LOCK_BIT,
                                Ordering::Acquire,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                    {
                        return;
                    }
                    backoff.snooze();
                }
            }
        }
    }
}

impl<T> fmt::Debug for RadixArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixArray")
            .field("len", &self.len)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for RadixArray<T> {
    fn drop(&mut self) {
        // Exclusive access: no guard can still reach this array, so
        // teardown drops boxes and elements directly instead of retiring
        // them.
        let root = *self.root.get_mut();
        self.drop_slot(root, self.height);
    }
}

struct Probe<T> {
    base: usize,
    len: usize,
    kind: ProbeKind<T>,
}

enum ProbeKind<T> {
    Null,
    Ext(NonNull<ExtBox<T>>),
    Elem { set: bool },
}

/// A maximal uniform region around one index, discovered without locking.
#[derive(Debug)]
pub struct Run<'g, T> {
    base: usize,
    len: usize,
    state: RunState<'g, T>,
}

/// What a [`Run`] covers.
#[derive(Debug)]
pub enum RunState<'g, T> {
    /// No value anywhere in the run.
    Unset,
    /// Every index in the run shares this value.
    Uniform(&'g T),
    /// A single expanded element; read it with [`RadixArray::get`].
    Element {
        /// Whether the element held a value when probed.
        set: bool,
    },
}

impl<T> Clone for Run<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Run<'_, T> {}

impl<T> Clone for RunState<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RunState<'_, T> {}

impl<'g, T> Run<'g, T> {
    /// First index of the run.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of indices the run covers.
    #[must_use]
    pub fn span(&self) -> usize {
        self.len
    }

    /// `(base, span)` in one call.
    #[must_use]
    pub fn base_span(&self) -> (usize, usize) {
        (self.base, self.len)
    }

    /// The shared value of a uniform run.
    #[must_use]
    pub fn value(&self) -> Option<&'g T> {
        match self.state {
            RunState::Uniform(v) => Some(v),
            RunState::Unset | RunState::Element { .. } => None,
        }
    }

    /// Whether the run held a value when probed.
    #[must_use]
    pub fn is_set(&self) -> bool {
        match self.state {
            RunState::Unset => false,
            RunState::Uniform(_) => true,
            RunState::Element { set } => set,
        }
    }

    /// The run's contents.
    #[must_use]
    pub fn state(&self) -> RunState<'g, T> {
        self.state
    }
}

/// Iterator over the uniform runs intersecting a range.
///
/// Returned by [`RadixArray::runs`].
pub struct Runs<'g, T> {
    array: &'g RadixArray<T>,
    _guard: &'g Guard<'g>,
    pos: usize,
    high: usize,
}

impl<'g, T> Iterator for Runs<'g, T> {
    type Item = Run<'g, T>;

    fn next(&mut self) -> Option<Run<'g, T>> {
        if self.pos >= self.high {
            return None;
        }
        let first = self.array.probe(self.pos);
        let (base, mut len) = (first.base, first.len);
        if let ProbeKind::Ext(b) = first.kind {
            // Merge adjacent slots sharing the same box into one run.
            while base + len < self.array.len {
                let next = self.array.probe(base + len);
                match next.kind {
                    ProbeKind::Ext(b2) if b2 == b => len += next.len,
                    _ => break,
                }
            }
        }
        self.pos = base + len;
        Some(Run {
            base,
            len,
            state: self.array.probe_state(first.kind),
        })
    }
}

/// An advisory lock over a range of a [`RadixArray`].
///
/// Dropping releases every bit taken at acquisition. The fringe of locked
/// slots cannot change granularity while any of its bits are held, so the
/// release walk re-derives the identical slot set from the recorded range.
pub struct RadixLock<'a, T> {
    array: &'a RadixArray<T>,
    low: usize,
    high: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<T> RadixLock<'_, T> {
    /// The locked `[low, high)` range.
    #[must_use]
    pub fn range(&self) -> (usize, usize) {
        (self.low, self.high)
    }
}

impl<T> Drop for RadixLock<'_, T> {
    fn drop(&mut self) {
        self.array.unlock_range(self.low, self.high);
    }
}

impl<T> fmt::Debug for RadixLock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RadixLock({}..{})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Counts live instances across clones.
    struct Tracked(Arc<AtomicUsize>);

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Tracked(Arc::clone(live))
        }
    }

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            self.0.fetch_add(1, Ordering::SeqCst);
            Tracked(Arc::clone(&self.0))
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn quiet_domain() -> Domain {
        Domain::builder().cores(1).workers(false).build()
    }

    #[test]
    fn leaf_fanout_is_a_power_of_two() {
        let fanout = RadixArray::<u64>::LEAF_FANOUT;
        assert!(fanout.is_power_of_two());
        assert!(fanout * mem::size_of::<ElemSlot<u64>>() <= NODE_BYTES);
        assert!(RadixArray::<[u8; 1024]>::LEAF_FANOUT >= 2);
    }

    #[test]
    fn uniform_fill_compresses_to_a_single_box() {
        let domain = quiet_domain();
        let handle = domain.register();
        let arr = RadixArray::new(&domain, RadixArray::<u64>::LEAF_FANOUT);
        let guard = handle.pin();
        arr.fill(0, arr.len(), 7, &guard).unwrap();
        let stats = domain.stats();
        assert_eq!(stats.node_allocs, 0, "aligned whole-array fill needs no nodes");
        assert_eq!(stats.ext_allocs, 1);
        for idx in [0, 1, arr.len() / 2, arr.len() - 1] {
            assert_eq!(arr.get(idx, &guard), Some(7));
            assert!(arr.is_set(idx));
        }
    }

    #[test]
    fn partial_overwrite_expands_and_preserves_both_values() {
        let domain = quiet_domain();
        let handle = domain.register();
        let leaf = RadixArray::<u64>::LEAF_FANOUT;
        let arr = RadixArray::new(&domain, 2 * leaf);
        let guard = handle.pin();
        arr.fill(0, 2 * leaf, 7, &guard).unwrap();
        arr.fill(leaf / 2, leaf + leaf / 2, 9, &guard).unwrap();
        for idx in 0..2 * leaf {
            let want = if (leaf / 2..leaf + leaf / 2).contains(&idx) {
                9
            } else {
                7
            };
            assert_eq!(arr.get(idx, &guard), Some(want), "index {idx}");
        }
        // Both original leaf-span slots were expanded, so the first box
        // lost its last reference.
        assert_eq!(domain.stats().ext_retired, 1);
    }

    #[test]
    fn sparse_elements_round_trip() {
        let domain = quiet_domain();
        let handle = domain.register();
        let arr = RadixArray::new(&domain, 64);
        let guard = handle.pin();
        arr.fill(3, 4, 30u32, &guard).unwrap();
        arr.fill(5, 6, 50, &guard).unwrap();
        assert_eq!(arr.get(3, &guard), Some(30));
        assert_eq!(arr.get(4, &guard), None);
        assert_eq!(arr.get(5, &guard), Some(50));
        assert!(arr.is_set(3));
        assert!(!arr.is_set(4));
        arr.fill(3, 4, 31, &guard).unwrap();
        assert_eq!(arr.get(3, &guard), Some(31));
    }

    #[test]
    fn overwrites_drop_displaced_values() {
        let domain = quiet_domain();
        let handle = domain.register();
        let live = Arc::new(AtomicUsize::new(0));
        let arr = RadixArray::new(&domain, 16);
        {
            let guard = handle.pin();
            arr.fill(0, 1, Tracked::new(&live), &guard).unwrap();
            assert_eq!(live.load(Ordering::SeqCst), 1);
            arr.fill(0, 1, Tracked::new(&live), &guard).unwrap();
            assert_eq!(live.load(Ordering::SeqCst), 1);
        }
        drop(arr);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replaced_boxes_free_after_a_grace_period() {
        let domain = quiet_domain();
        let handle = domain.register();
        let live = Arc::new(AtomicUsize::new(0));
        let len = RadixArray::<Tracked>::LEAF_FANOUT;
        let arr = RadixArray::new(&domain, len);
        {
            let guard = handle.pin();
            arr.fill(0, len, Tracked::new(&live), &guard).unwrap();
            assert_eq!(live.load(Ordering::SeqCst), 1);
            arr.fill(0, len, Tracked::new(&live), &guard).unwrap();
            assert_eq!(domain.stats().ext_retired, 1);
            // The displaced box sits on a retirement list until the epoch
            // clock turns over.
            assert_eq!(live.load(Ordering::SeqCst), 2);
        }
        let mut freed = 0;
        for _ in 0..8 {
            freed += domain.run_gc();
            if freed > 0 {
                break;
            }
        }
        assert_eq!(freed, 1);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(arr);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_discovery_reports_extents_and_merges_shared_boxes() {
        let domain = quiet_domain();
        let handle = domain.register();
        let leaf = RadixArray::<u64>::LEAF_FANOUT;
        let arr = RadixArray::new(&domain, 4 * leaf);
        let guard = handle.pin();
        arr.fill(0, 2 * leaf, 5, &guard).unwrap();

        let run = arr.run_at(10, &guard);
        assert_eq!(run.base_span(), (0, leaf), "run_at is slot granular");
        assert_eq!(run.value(), Some(&5));
        assert!(run.is_set());

        let got: Vec<_> = arr
            .runs(0, 4 * leaf, &guard)
            .map(|r| (r.base(), r.span(), r.is_set()))
            .collect();
        assert_eq!(
            got,
            vec![
                (0, 2 * leaf, true),
                (2 * leaf, leaf, false),
                (3 * leaf, leaf, false),
            ]
        );
    }

    #[test]
    fn unfilled_array_is_one_absent_run() {
        let domain = quiet_domain();
        let handle = domain.register();
        let arr = RadixArray::<u64>::new(&domain, 100);
        let guard = handle.pin();
        let run = arr.run_at(42, &guard);
        assert_eq!(run.base_span(), (0, 100), "span clips to capacity");
        assert!(!run.is_set());
        assert!(run.value().is_none());
        assert_eq!(arr.runs(0, 100, &guard).count(), 1);
    }

    #[test]
    fn adjacent_locks_do_not_contend() {
        let domain = quiet_domain();
        let handle = domain.register();
        let leaf = RadixArray::<u32>::LEAF_FANOUT;
        let arr = RadixArray::<u32>::new(&domain, 4 * leaf);
        let guard = handle.pin();
        // Would spin forever on this thread if the ranges shared a bit.
        let left = arr.acquire(0, leaf, &guard).unwrap();
        let right = arr.acquire(leaf, 2 * leaf, &guard).unwrap();
        assert_eq!(left.range(), (0, leaf));
        drop(left);
        drop(right);
        // Same story below slot granularity: both halves of one leaf.
        let a = arr.acquire(0, 10, &guard).unwrap();
        let b = arr.acquire(10, 20, &guard).unwrap();
        drop(a);
        drop(b);
        let whole = arr.acquire(0, 2 * leaf, &guard).unwrap();
        drop(whole);
    }

    #[test]
    fn fill_preserves_held_locks() {
        let domain = quiet_domain();
        let handle = domain.register();
        let arr = RadixArray::new(&domain, RadixArray::<u32>::LEAF_FANOUT);
        let guard = handle.pin();
        let lock = arr.acquire(0, arr.len(), &guard).unwrap();
        // The whole-array lock sat down on the root slot without
        // materializing anything.
        assert_eq!(domain.stats().node_allocs, 0);
        // Advisory means fill still goes through; the covered overwrite
        // must carry the bit along.
        arr.fill(0, arr.len(), 11, &guard).unwrap();
        assert_eq!(arr.get(3, &guard), Some(11));
        // Release now clears the bit off an External slot even though it
        // was taken on a Null one.
        drop(lock);
        let again = arr.acquire(0, arr.len(), &guard).unwrap();
        drop(again);
    }

    #[test]
    fn failed_acquire_rolls_back_its_prefix() {
        let domain = quiet_domain();
        let handle = domain.register();
        let leaf = RadixArray::<u64>::LEAF_FANOUT;
        // Enough for the root node but not for any leaf.
        let arr = RadixArray::<u64>::with_node_budget(&domain, leaf * UPPER_FANOUT, 1);
        let guard = handle.pin();
        assert_eq!(arr.acquire(1, leaf + 1, &guard).unwrap_err(), AllocError);
        assert_eq!(domain.stats().node_allocs, 1);
        // A range that locks existing slots in place needs no allocation,
        // and nothing is left locked from the failed walk.
        let lock = arr.acquire(0, leaf, &guard).unwrap();
        drop(lock);
    }

    #[test]
    fn failed_fill_leaves_the_tree_consistent() {
        let domain = quiet_domain();
        let handle = domain.register();
        let leaf = RadixArray::<u64>::LEAF_FANOUT;
        let arr = RadixArray::with_node_budget(&domain, leaf * UPPER_FANOUT, 1);
        let guard = handle.pin();
        assert_eq!(arr.fill(1, 2, 99, &guard).unwrap_err(), AllocError);
        assert_eq!(arr.get(1, &guard), None);
        assert!(!arr.is_set(1));
        // An aligned fill over the surviving compressed slot still works.
        arr.fill(0, leaf, 7, &guard).unwrap();
        assert_eq!(arr.get(1, &guard), Some(7));
    }
}
