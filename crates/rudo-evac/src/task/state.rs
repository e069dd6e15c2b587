//! Reference-counted records for arrays processed in chunks.

use std::ptr::NonNull;

use super::atomic::{fence, AtomicUsize, Ordering};
use crate::heap::address::Address;

const ARENA_CHUNK: usize = 64;

/// One array being processed in chunks.
///
/// Every field is atomic: a recycled state may be re-initialized by one worker
/// while a stale reference elsewhere still points at the same memory.
#[derive(Debug)]
pub struct PartialArrayState {
    source: AtomicUsize,
    destination: AtomicUsize,
    length: AtomicUsize,
    index: AtomicUsize,
    refcount: AtomicUsize,
}

impl PartialArrayState {
    fn empty() -> Self {
        Self {
            source: AtomicUsize::new(0),
            destination: AtomicUsize::new(0),
            length: AtomicUsize::new(0),
            index: AtomicUsize::new(0),
            refcount: AtomicUsize::new(0),
        }
    }

    fn init(&self, source: Address, destination: Address, index: usize, length: usize, refs: usize) {
        debug_assert!(index <= length);
        self.source.store(source.as_usize(), Ordering::Relaxed);
        self.destination
            .store(destination.as_usize(), Ordering::Relaxed);
        self.length.store(length, Ordering::Relaxed);
        self.index.store(index, Ordering::Relaxed);
        self.refcount.store(refs, Ordering::Relaxed);
    }

    /// The array being read.
    #[must_use]
    pub fn source(&self) -> Address {
        Address::from_usize(self.source.load(Ordering::Relaxed))
    }

    /// The array being written; equal to `source` when nothing moves.
    #[must_use]
    pub fn destination(&self) -> Address {
        Address::from_usize(self.destination.load(Ordering::Relaxed))
    }

    /// Total element count.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    /// Next unclaimed element. May exceed `length` once the last chunk is claimed.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) const fn index_cell(&self) -> &AtomicUsize {
        &self.index
    }

    /// Current reference count.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Account for `n` tasks about to be pushed. Must precede the pushes.
    pub fn add_references(&self, n: usize) {
        let prev = self.refcount.fetch_add(n, Ordering::Relaxed);
        debug_assert!(prev > 0, "adding references to a dead state");
    }

    /// Drop one reference; true if it was the last.
    #[must_use]
    fn release_reference(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "partial array state refcount underflow");
        if prev == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

/// Pointer-sized handle to a [`PartialArrayState`].
///
/// States live in allocator arenas that are only freed when the owning
/// registry is dropped, so a handle is always safe to dereference while the
/// registry is alive; it is only meaningful while the state's refcount is held.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartialArrayRef(NonNull<PartialArrayState>);

// SAFETY: the pointee is made of atomics and outlives every handle.
unsafe impl Send for PartialArrayRef {}
// SAFETY: see Send impl
unsafe impl Sync for PartialArrayRef {}

impl PartialArrayRef {
    /// The state behind the handle.
    ///
    /// # Safety
    ///
    /// The allocator arena that produced the handle must still be alive.
    #[must_use]
    pub const unsafe fn get<'a>(self) -> &'a PartialArrayState {
        // SAFETY: guaranteed by the caller.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    ///
    /// `raw` must come from [`PartialArrayRef::as_usize`].
    pub(crate) const unsafe fn from_usize(raw: usize) -> Self {
        // SAFETY: guaranteed by the caller.
        Self(unsafe { NonNull::new_unchecked(raw as *mut PartialArrayState) })
    }
}

impl std::fmt::Debug for PartialArrayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PartialArrayRef({:p})", self.0)
    }
}

/// Per-worker arena plus free list of states.
///
/// Only the owning worker touches its allocator. A state released by a worker
/// other than the one that allocated it goes onto the releasing worker's free
/// list. Arena chunks are never freed while the allocator lives; `reset`
/// forgets every state in bulk.
#[derive(Debug, Default)]
pub struct PartialArrayStateAllocator {
    chunks: Vec<Box<[PartialArrayState]>>,
    next_chunk: usize,
    next_slot: usize,
    free: Vec<PartialArrayRef>,
    allocated: usize,
    recycled: usize,
}

impl PartialArrayStateAllocator {
    /// An empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A state for `source`/`destination` with `refcount` initial references.
    pub fn allocate(
        &mut self,
        source: Address,
        destination: Address,
        index: usize,
        length: usize,
        refcount: usize,
    ) -> PartialArrayRef {
        debug_assert!(refcount > 0);
        let handle = if let Some(handle) = self.free.pop() {
            self.recycled += 1;
            handle
        } else {
            self.carve()
        };
        // SAFETY: the handle points into one of our (or a sibling's) arenas.
        unsafe { handle.get() }.init(source, destination, index, length, refcount);
        self.allocated += 1;
        handle
    }

    fn carve(&mut self) -> PartialArrayRef {
        if self.next_chunk == 0 || self.next_slot == ARENA_CHUNK {
            if self.next_chunk == self.chunks.len() {
                self.chunks
                    .push((0..ARENA_CHUNK).map(|_| PartialArrayState::empty()).collect());
            }
            self.next_chunk += 1;
            self.next_slot = 0;
        }
        let state = &self.chunks[self.next_chunk - 1][self.next_slot];
        self.next_slot += 1;
        PartialArrayRef(NonNull::from(state))
    }

    /// Drop one reference; on the last one the state joins this allocator's free list.
    pub fn release(&mut self, state: PartialArrayRef) {
        // SAFETY: the caller holds a reference, so the arena is alive.
        if unsafe { state.get() }.release_reference() {
            self.free.push(state);
        }
    }

    /// Forget every state. All allocators of a registry must be reset together.
    pub fn reset(&mut self) {
        self.free.clear();
        self.next_chunk = 0;
        self.next_slot = 0;
        self.allocated = 0;
        self.recycled = 0;
    }

    /// States handed out since the last reset.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    /// Of those, how many came from the free list.
    #[must_use]
    pub const fn recycled(&self) -> usize {
        self.recycled
    }

    /// States currently on the free list.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Bytes held by arenas.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.chunks.len() * ARENA_CHUNK * size_of::<PartialArrayState>()
    }
}
