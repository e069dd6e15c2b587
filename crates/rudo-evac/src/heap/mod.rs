//! The generational heap the collectors operate on.
//!
//! One contiguous reservation laid out as `[old | eden | survivor0 | survivor1]`,
//! each space a whole number of regions. Every heap word is read and written
//! through `AtomicUsize`, so racing copiers never perform a plain read of memory
//! another thread may be writing.
//!
//! The mutator side (`alloc_*`, `store_*`, `load_*`) exists so tests, benches
//! and embedders can build object graphs; it is not synchronized with a running
//! collection and must not be used while one is in progress.

pub mod address;
pub mod barrier;
pub mod bitmap;
pub mod header;
pub mod klass;
pub mod lab;
pub mod roots;
pub mod space;

use std::sync::atomic::{AtomicUsize, Ordering};

use sys_alloc::Reservation;

use crate::config::HeapConfig;
use crate::error::{EvacError, Result};

use address::{Address, Slot, WORD};
use barrier::{RememberedSet, WriteBarrier};
use bitmap::ParMarkBitmap;
use header::{KlassId, MarkWord, MAX_HEAP_WORDS};
use klass::{array_size, Klass, KlassTable, FILLER_ARRAY_KLASS, FILLER_WORD_KLASS};
use roots::RootSet;
use space::{Space, SpaceId};

/// A reserved, laid-out heap with its side tables.
#[derive(Debug)]
pub struct Heap {
    reservation: Reservation,
    config: HeapConfig,
    old: Space,
    eden: Space,
    survivors: [Space; 2],
    to_index: AtomicUsize,
    klasses: KlassTable,
    bitmap: ParMarkBitmap,
    remset: RememberedSet,
    roots: RootSet,
    region_shift: u32,
}

impl Heap {
    /// Reserve and lay out a heap.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the memory cannot be mapped.
    pub fn new(config: HeapConfig) -> Result<Self> {
        config.validate()?;
        let region = config.region_words;
        let old_words = config.old_words.next_multiple_of(region);
        let eden_words = config.eden_words.next_multiple_of(region);
        let survivor_words = config.survivor_words.next_multiple_of(region);
        let total = old_words + eden_words + 2 * survivor_words;
        if total > MAX_HEAP_WORDS {
            return Err(EvacError::invalid(
                "old_words",
                "heap exceeds the addressable compaction range",
            ));
        }

        let reservation =
            Reservation::reserve(total * WORD, region * WORD).map_err(EvacError::Reserve)?;
        let base = Address::from_ptr(reservation.base());
        let eden_bottom = base.add_words(old_words);
        let s0_bottom = eden_bottom.add_words(eden_words);
        let s1_bottom = s0_bottom.add_words(survivor_words);
        let end = s1_bottom.add_words(survivor_words);

        Ok(Self {
            reservation,
            config,
            old: Space::new(SpaceId::Old, base, eden_bottom),
            eden: Space::new(SpaceId::Eden, eden_bottom, s0_bottom),
            survivors: [
                Space::new(SpaceId::Survivor0, s0_bottom, s1_bottom),
                Space::new(SpaceId::Survivor1, s1_bottom, end),
            ],
            to_index: AtomicUsize::new(1),
            klasses: KlassTable::new(config.max_klasses),
            bitmap: ParMarkBitmap::new(base, total),
            remset: RememberedSet::new(base..eden_bottom, eden_bottom..end),
            roots: RootSet::new(config.max_roots),
            region_shift: (region * WORD).trailing_zeros(),
        })
    }

    /// Register an object type.
    ///
    /// # Errors
    ///
    /// Returns [`EvacError::KlassTableFull`] once `max_klasses` is reached.
    pub fn register_klass(&mut self, klass: Klass) -> Result<KlassId> {
        self.klasses
            .register(klass)
            .ok_or(EvacError::KlassTableFull(self.config.max_klasses))
    }

    /// Look up a klass by id.
    #[must_use]
    pub fn klass(&self, id: KlassId) -> &Klass {
        self.klasses.get(id)
    }

    /// The geometry this heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ---- layout ----

    /// Lowest heap address.
    #[must_use]
    pub fn base(&self) -> Address {
        self.old.bottom()
    }

    /// One past the highest heap address.
    #[must_use]
    pub fn end(&self) -> Address {
        self.survivors[1].end()
    }

    /// Heap size in words.
    #[must_use]
    pub fn capacity_words(&self) -> usize {
        self.end().words_from(self.base())
    }

    /// The old generation.
    #[must_use]
    pub const fn old(&self) -> &Space {
        &self.old
    }

    /// The young allocation space.
    #[must_use]
    pub const fn eden(&self) -> &Space {
        &self.eden
    }

    /// The survivor space holding last cycle's survivors.
    #[must_use]
    pub fn from_space(&self) -> &Space {
        &self.survivors[self.to_index.load(Ordering::Acquire) ^ 1]
    }

    /// The survivor space the next scavenge copies into.
    #[must_use]
    pub fn to_space(&self) -> &Space {
        &self.survivors[self.to_index.load(Ordering::Acquire)]
    }

    /// Swap survivor roles after a successful scavenge.
    pub(crate) fn flip_survivors(&self) {
        self.to_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// A space by id.
    #[must_use]
    pub const fn space(&self, id: SpaceId) -> &Space {
        match id {
            SpaceId::Old => &self.old,
            SpaceId::Eden => &self.eden,
            SpaceId::Survivor0 => &self.survivors[0],
            SpaceId::Survivor1 => &self.survivors[1],
        }
    }

    /// All spaces in ascending address order.
    #[must_use]
    pub const fn spaces(&self) -> [&Space; 4] {
        [
            &self.old,
            &self.eden,
            &self.survivors[0],
            &self.survivors[1],
        ]
    }

    /// Whether `addr` is inside the reservation.
    #[must_use]
    pub fn is_in_reserved(&self, addr: Address) -> bool {
        addr >= self.base() && addr < self.end()
    }

    /// Whether `addr` is in eden or either survivor space.
    #[must_use]
    pub fn is_in_young(&self, addr: Address) -> bool {
        addr >= self.eden.bottom() && addr < self.end()
    }

    /// Whether `addr` is in the old generation.
    #[must_use]
    pub fn is_in_old(&self, addr: Address) -> bool {
        self.old.contains(addr)
    }

    /// Whether a scavenge evacuates objects at `addr` (eden or from-space).
    #[must_use]
    pub fn in_collection_set(&self, addr: Address) -> bool {
        self.eden.contains(addr) || self.from_space().contains(addr)
    }

    // ---- regions ----

    /// Words per region.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.config.region_words
    }

    /// Number of regions in the heap.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.capacity_words() / self.region_words()
    }

    /// Region index of `addr`.
    #[must_use]
    pub fn addr_to_region(&self, addr: Address) -> usize {
        (addr.as_usize() - self.base().as_usize()) >> self.region_shift
    }

    /// First address of region `index`.
    #[must_use]
    pub fn region_to_addr(&self, index: usize) -> Address {
        self.base().add_words(index * self.region_words())
    }

    /// Whether `addr` is the first word of a region.
    #[must_use]
    pub fn is_region_aligned(&self, addr: Address) -> bool {
        addr.words_from(self.base()) % self.region_words() == 0
    }

    // ---- side tables ----

    /// The mark bitmap used by full collections.
    #[must_use]
    pub const fn mark_bitmap(&self) -> &ParMarkBitmap {
        &self.bitmap
    }

    /// The old-to-young remembered set.
    #[must_use]
    pub const fn remembered_set(&self) -> &RememberedSet {
        &self.remset
    }

    /// The barrier run after every reference store.
    #[must_use]
    pub fn barrier(&self) -> &dyn WriteBarrier {
        &self.remset
    }

    /// Strong roots.
    #[must_use]
    pub const fn roots(&self) -> &RootSet {
        &self.roots
    }

    // ---- object model ----

    /// Atomically read an object's header.
    #[must_use]
    pub fn header(&self, obj: Address) -> MarkWord {
        debug_assert!(self.is_in_reserved(obj), "{obj} is not a heap object");
        // SAFETY: obj is a heap address.
        MarkWord::from_raw(unsafe { obj.word() }.load(Ordering::Acquire))
    }

    pub(crate) fn set_header(&self, obj: Address, header: MarkWord) {
        debug_assert!(self.is_in_reserved(obj));
        // SAFETY: obj is a heap address.
        unsafe { obj.word() }.store(header.raw(), Ordering::Release);
    }

    /// Install `new` if the header still equals `expected`.
    ///
    /// Success publishes everything written before the call; failure returns the
    /// winning header with acquire ordering so its copy is visible.
    pub(crate) fn cas_header(
        &self,
        obj: Address,
        expected: MarkWord,
        new: MarkWord,
    ) -> std::result::Result<MarkWord, MarkWord> {
        // SAFETY: obj is a heap address.
        unsafe { obj.word() }
            .compare_exchange(
                expected.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(MarkWord::from_raw)
            .map_err(MarkWord::from_raw)
    }

    /// The klass named by a header snapshot.
    #[must_use]
    pub fn klass_of(&self, header: MarkWord) -> &Klass {
        self.klasses.get(header.klass())
    }

    /// Size in words of `obj`, with the klass derived from `header`.
    ///
    /// `header` must be the snapshot the caller already read; the live header
    /// may have been overwritten by a racing forwarder.
    #[must_use]
    pub fn size_of(&self, obj: Address, header: MarkWord) -> usize {
        self.klass_of(header)
            .fixed_size()
            .unwrap_or_else(|| array_size(self.array_length(obj)))
    }

    /// Whether the header snapshot describes an array of references.
    #[must_use]
    pub fn is_obj_array(&self, header: MarkWord) -> bool {
        self.klass_of(header).is_obj_array()
    }

    /// Length of an array object.
    #[must_use]
    pub fn array_length(&self, array: Address) -> usize {
        // SAFETY: arrays are at least two words long.
        unsafe { array.add_words(1).load_word() }
    }

    /// Slot of reference field `index` of an instance.
    #[must_use]
    pub const fn ref_slot(&self, obj: Address, index: usize) -> Slot {
        Slot::new(obj.add_words(1 + index))
    }

    /// Slot of element `index` of an object array.
    #[must_use]
    pub const fn elem_slot(&self, array: Address, index: usize) -> Slot {
        Slot::new(array.add_words(klass::ARRAY_HEADER_WORDS + index))
    }

    /// Visit every reference slot of `obj`.
    pub fn for_each_ref_slot(&self, obj: Address, header: MarkWord, mut f: impl FnMut(Slot)) {
        let klass = self.klass_of(header);
        let count = if klass.is_obj_array() {
            self.array_length(obj)
        } else {
            klass.ref_count(0)
        };
        let first = obj.add_words(klass.first_ref_offset());
        for i in 0..count {
            f(Slot::new(first.add_words(i)));
        }
    }

    /// Make `[addr, addr + words)` a parsable dead object.
    pub fn fill_with_object(&self, addr: Address, words: usize) {
        debug_assert!(words > 0);
        if words == 1 {
            self.set_header(addr, MarkWord::new(FILLER_WORD_KLASS));
        } else {
            // SAFETY: the range belongs to the caller.
            unsafe { addr.add_words(1).store_word(words - klass::ARRAY_HEADER_WORDS) };
            self.set_header(addr, MarkWord::new(FILLER_ARRAY_KLASS));
        }
    }

    /// Whether the header snapshot is one of the filler klasses.
    #[must_use]
    pub const fn is_filler(header: MarkWord) -> bool {
        let klass = header.klass();
        klass == FILLER_WORD_KLASS || klass == FILLER_ARRAY_KLASS
    }

    /// Walk every object (fillers included) in `[bottom, top)` of a space.
    ///
    /// Headers must be normal or compaction-forwarded.
    pub fn object_iterate(&self, id: SpaceId, mut f: impl FnMut(Address, MarkWord, usize)) {
        let space = self.space(id);
        let top = space.top();
        let mut cur = space.bottom();
        while cur < top {
            let header = self.header(cur);
            let size = self.size_of(cur, header);
            f(cur, header, size);
            cur = cur.add_words(size);
        }
    }

    /// Zero `[from, to)` and hand whole pages back to the OS.
    ///
    /// # Safety
    ///
    /// No other thread may access the range.
    pub(crate) unsafe fn zero_range(&self, from: Address, to: Address) {
        if from >= to {
            return;
        }
        let offset = from.as_usize() - self.base().as_usize();
        let len = to.as_usize() - from.as_usize();
        // SAFETY: exclusivity guaranteed by the caller.
        if unsafe { self.reservation.discard(offset, len) }.is_err() {
            // SAFETY: the range lies inside the reservation.
            unsafe { std::ptr::write_bytes(from.as_usize() as *mut u8, 0, len) };
        }
    }

    /// Empty a space and zero its used part.
    ///
    /// # Safety
    ///
    /// No other thread may access the space.
    pub(crate) unsafe fn clear_space(&self, id: SpaceId) {
        let space = self.space(id);
        unsafe { self.zero_range(space.bottom(), space.top()) };
        space.set_top(space.bottom());
    }

    // ---- mutator ----

    fn alloc_raw(&self, words: usize) -> Option<Address> {
        let obj = self.eden.cas_allocate(words)?;
        for i in 1..words {
            // SAFETY: freshly allocated and not yet published.
            unsafe { obj.add_words(i).store_word(0) };
        }
        Some(obj)
    }

    /// Allocate an instance of `klass` in eden. Fields start null / zero.
    ///
    /// # Panics
    ///
    /// Panics if `klass` is an array klass.
    #[must_use]
    pub fn alloc_instance(&self, klass: KlassId) -> Option<Address> {
        let size = self
            .klass(klass)
            .fixed_size()
            .expect("alloc_instance called with an array klass");
        let obj = self.alloc_raw(size)?;
        self.set_header(obj, MarkWord::new(klass));
        Some(obj)
    }

    /// Allocate an array of `klass` with `length` elements in eden.
    ///
    /// # Panics
    ///
    /// Panics if `klass` is not an array klass.
    #[must_use]
    pub fn alloc_array(&self, klass: KlassId, length: usize) -> Option<Address> {
        assert!(
            self.klass(klass).is_array(),
            "alloc_array called with an instance klass"
        );
        let obj = self.alloc_raw(array_size(length))?;
        // SAFETY: freshly allocated.
        unsafe { obj.add_words(1).store_word(length) };
        self.set_header(obj, MarkWord::new(klass));
        Some(obj)
    }

    /// Allocate directly in the old generation. Used to build old-to-young edges.
    ///
    /// # Panics
    ///
    /// Panics if `klass` is an array klass.
    #[must_use]
    pub fn alloc_old_instance(&self, klass: KlassId) -> Option<Address> {
        let size = self
            .klass(klass)
            .fixed_size()
            .expect("alloc_old_instance called with an array klass");
        let obj = self.old.cas_allocate(size)?;
        for i in 1..size {
            // SAFETY: freshly allocated.
            unsafe { obj.add_words(i).store_word(0) };
        }
        self.set_header(obj, MarkWord::new(klass));
        Some(obj)
    }

    /// Store a reference into `slot`, then run the write barrier.
    pub fn store_slot(&self, slot: Slot, value: Address) {
        // SAFETY: the mutator API only hands out slots of live objects.
        unsafe { slot.store(value) };
        self.barrier().post_write(slot, value);
    }

    /// Load a reference from `slot`.
    #[must_use]
    pub fn load_slot(&self, slot: Slot) -> Address {
        // SAFETY: see store_slot.
        unsafe { slot.load() }
    }

    /// Store into reference field `index` of an instance.
    pub fn store_ref(&self, obj: Address, index: usize, value: Address) {
        debug_assert!(index < self.klass_of(self.header(obj)).ref_count(0));
        self.store_slot(self.ref_slot(obj, index), value);
    }

    /// Load reference field `index` of an instance.
    #[must_use]
    pub fn load_ref(&self, obj: Address, index: usize) -> Address {
        self.load_slot(self.ref_slot(obj, index))
    }

    /// Store into element `index` of an object array.
    pub fn store_elem(&self, array: Address, index: usize, value: Address) {
        debug_assert!(index < self.array_length(array));
        self.store_slot(self.elem_slot(array, index), value);
    }

    /// Load element `index` of an object array.
    #[must_use]
    pub fn load_elem(&self, array: Address, index: usize) -> Address {
        self.load_slot(self.elem_slot(array, index))
    }

    fn data_addr(&self, obj: Address, index: usize) -> Address {
        let klass = self.klass_of(self.header(obj));
        match klass.kind() {
            klass::KlassKind::Instance {
                ref_fields,
                data_words,
            } => {
                debug_assert!(index < data_words as usize);
                obj.add_words(1 + ref_fields as usize + index)
            }
            klass::KlassKind::TypeArray => {
                debug_assert!(index < self.array_length(obj));
                obj.add_words(klass::ARRAY_HEADER_WORDS + index)
            }
            klass::KlassKind::ObjArray => panic!("object arrays have no data words"),
        }
    }

    /// Store raw word `index` of an instance's data or a type array.
    pub fn store_data(&self, obj: Address, index: usize, value: usize) {
        // SAFETY: address derived from the object's layout.
        unsafe { self.data_addr(obj, index).store_word(value) };
    }

    /// Load raw word `index` of an instance's data or a type array.
    #[must_use]
    pub fn load_data(&self, obj: Address, index: usize) -> usize {
        // SAFETY: address derived from the object's layout.
        unsafe { self.data_addr(obj, index).load_word() }
    }

    /// Words allocated across all spaces.
    #[must_use]
    pub fn used_words(&self) -> usize {
        self.spaces().iter().map(|space| space.used_words()).sum()
    }
}
