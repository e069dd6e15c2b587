//! Per-worker copying state for a scavenge.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::preserved::PreservedMarks;
use crate::config::EvacConfig;
use crate::coordinator::TraversalManager;
use crate::heap::address::{Address, Slot};
use crate::heap::header::MarkWord;
use crate::heap::lab::Lab;
use crate::heap::space::Space;
use crate::heap::Heap;
use crate::metrics::WorkerStats;
use crate::task::item::WorkItem;
use crate::task::queue::OverflowTaskQueue;
use crate::task::splitter::PartialArraySplitter;
use crate::task::state::PartialArrayRef;

/// Work item of a scavenge: a slot whose referent must be evacuated.
pub type ScavengeTask = WorkItem<Slot>;

/// One worker's copying and promotion state.
///
/// Owns the worker's task queue, a young and an old LAB, the partial-array
/// splitter and the headers preserved on promotion failure.
#[derive(Debug)]
pub struct PromotionManager {
    id: usize,
    heap: Arc<Heap>,
    config: EvacConfig,
    queue: OverflowTaskQueue<ScavengeTask>,
    splitter: PartialArraySplitter,
    young_lab: Lab,
    old_lab: Lab,
    young_gen_is_full: bool,
    old_gen_is_full: bool,
    promotion_failed: bool,
    preserved: PreservedMarks,
    rng: SmallRng,
    stats: WorkerStats,
}

impl PromotionManager {
    /// A manager for worker `id` around its queue.
    #[must_use]
    pub fn new(
        id: usize,
        heap: Arc<Heap>,
        config: EvacConfig,
        queue: OverflowTaskQueue<ScavengeTask>,
    ) -> Self {
        Self {
            id,
            heap,
            splitter: PartialArraySplitter::new(
                config.array_chunk_size,
                config.effective_task_limit(),
            ),
            config,
            queue,
            young_lab: Lab::new(),
            old_lab: Lab::new(),
            young_gen_is_full: false,
            old_gen_is_full: false,
            promotion_failed: false,
            preserved: PreservedMarks::new(),
            rng: SmallRng::seed_from_u64(id as u64),
            stats: WorkerStats::default(),
        }
    }

    /// The young LAB.
    #[must_use]
    pub const fn young_lab(&self) -> &Lab {
        &self.young_lab
    }

    /// The old LAB.
    #[must_use]
    pub const fn old_lab(&self) -> &Lab {
        &self.old_lab
    }

    /// Headers preserved by this worker's promotion failures.
    #[must_use]
    pub const fn preserved_marks(&self) -> &PreservedMarks {
        &self.preserved
    }

    /// The worker's task queue.
    #[must_use]
    pub const fn queue(&self) -> &OverflowTaskQueue<ScavengeTask> {
        &self.queue
    }

    // ---- pushing ----

    /// Push `slot` if its referent is still to be evacuated.
    fn claim_or_forward(heap: &Heap, queue: &mut OverflowTaskQueue<ScavengeTask>, slot: Slot) {
        // SAFETY: slot is a field of a live copy, a root or a remembered slot.
        let obj = unsafe { slot.load() };
        if !obj.is_null() && heap.in_collection_set(obj) {
            queue.push(WorkItem::Ref(slot));
        }
    }

    /// Push every reference field of `obj`, whose layout `header` describes.
    fn push_contents(&mut self, obj: Address, header: MarkWord) {
        let heap = &*self.heap;
        let queue = &mut self.queue;
        heap.for_each_ref_slot(obj, header, |slot| Self::claim_or_forward(heap, queue, slot));
    }

    /// Start chunked processing of a large array forwarded from `old` to `new`.
    fn push_obj_array(&mut self, old: Address, new: Address) {
        let length = self.heap.array_length(new);
        let initial = self.splitter.start(&mut self.queue, old, new, length);
        self.process_array_range(new, 0, initial);
    }

    fn process_array_range(&mut self, array: Address, start: usize, end: usize) {
        let heap = &*self.heap;
        let queue = &mut self.queue;
        for i in start..end {
            Self::claim_or_forward(heap, queue, heap.elem_slot(array, i));
        }
    }

    fn process_array_chunk(&mut self, state: PartialArrayRef, stolen: bool) {
        let claim = self.splitter.claim(state, &mut self.queue, stolen);
        self.process_array_range(claim.destination, claim.start, claim.end);
    }

    fn push_new_object(&mut self, old: Address, new: Address, header: MarkWord) {
        if self.heap.is_obj_array(header)
            && self.heap.array_length(new) >= self.config.min_array_size_for_chunking
        {
            self.push_obj_array(old, new);
        } else {
            self.push_contents(new, header);
        }
    }

    // ---- allocation ----

    /// LAB first; above half a LAB allocate directly, else flush and refill.
    fn lab_allocate(
        heap: &Heap,
        lab: &mut Lab,
        space: &Space,
        lab_words: usize,
        full: &mut bool,
        refills: &mut usize,
        size: usize,
    ) -> Option<Address> {
        if *full {
            return None;
        }
        if let Some(obj) = lab.allocate(size) {
            return Some(obj);
        }
        if size > lab_words / 2 {
            return space.cas_allocate(size);
        }
        lab.flush(heap);
        if let Some(base) = space.cas_allocate(lab_words) {
            lab.initialize(base, lab_words);
            *refills += 1;
            return lab.allocate(size);
        }
        // Less than a LAB left: take what still fits, then stop trying.
        let obj = space.cas_allocate(size);
        if obj.is_none() {
            *full = true;
        }
        obj
    }

    fn allocate_young(&mut self, size: usize) -> Option<Address> {
        let heap = &*self.heap;
        Self::lab_allocate(
            heap,
            &mut self.young_lab,
            heap.to_space(),
            self.config.young_lab_words,
            &mut self.young_gen_is_full,
            &mut self.stats.young_lab_refills,
            size,
        )
    }

    fn allocate_old(&mut self, size: usize) -> Option<Address> {
        let heap = &*self.heap;
        Self::lab_allocate(
            heap,
            &mut self.old_lab,
            heap.old(),
            self.config.old_lab_words,
            &mut self.old_gen_is_full,
            &mut self.stats.old_lab_refills,
            size,
        )
    }

    /// Give a losing copy back to its LAB, or plug it if it was allocated directly.
    fn undo_allocation(&mut self, new: Address, size: usize, promoted: bool) {
        let lab = if promoted {
            &mut self.old_lab
        } else {
            &mut self.young_lab
        };
        if !lab.unallocate_object(new, size) {
            self.heap.fill_with_object(new, size);
        }
    }

    // ---- copying ----

    /// Evacuate `obj` and return its new address.
    ///
    /// The header is read exactly once; klass, size and age all derive from
    /// that snapshot because a racing copier may overwrite the live header at
    /// any moment. The forwarding CAS decides the single winner.
    pub fn copy_to_survivor_space(&mut self, obj: Address) -> Address {
        debug_assert!(self.heap.in_collection_set(obj));
        let test_mark = self.heap.header(obj);
        if test_mark.is_forwarded() {
            return test_mark.forwardee();
        }

        let size = self.heap.size_of(obj, test_mark);
        let mut promoted = false;
        let mut new_obj = None;
        if test_mark.age() < self.config.tenuring_threshold {
            new_obj = self.allocate_young(size);
        }
        if new_obj.is_none() {
            new_obj = self.allocate_old(size);
            promoted = true;
        }
        let Some(new_obj) = new_obj else {
            return self.oop_promotion_failed(obj, test_mark);
        };

        for i in 1..size {
            // SAFETY: both ranges are `size` words of heap; the destination is ours.
            unsafe { new_obj.add_words(i).store_word(obj.add_words(i).load_word()) };
        }
        let new_header = if promoted {
            test_mark
        } else {
            test_mark.incr_age()
        };
        // Published to other threads by the release half of the CAS below.
        // SAFETY: destination is ours.
        unsafe { new_obj.store_word(new_header.raw()) };

        match self
            .heap
            .cas_header(obj, test_mark, MarkWord::forwarded_to(new_obj))
        {
            Ok(_) => {
                if promoted {
                    self.stats.objects_promoted += 1;
                    self.stats.words_promoted += size;
                } else {
                    self.stats.objects_copied += 1;
                    self.stats.words_copied += size;
                }
                self.push_new_object(obj, new_obj, new_header);
                new_obj
            }
            Err(winner) => {
                self.undo_allocation(new_obj, size, promoted);
                self.stats.copies_lost += 1;
                debug_assert!(winner.is_forwarded());
                winner.forwardee()
            }
        }
    }

    /// No space could take `obj`: forward it to itself so it stays put.
    ///
    /// Exactly one racing thread wins the CAS. The winner preserves the
    /// original header and still scans the object so its referents are
    /// evacuated and the subgraph stays consistent.
    fn oop_promotion_failed(&mut self, obj: Address, obj_mark: MarkWord) -> Address {
        match self
            .heap
            .cas_header(obj, obj_mark, MarkWord::forwarded_to(obj))
        {
            Ok(_) => {
                self.promotion_failed = true;
                self.stats.promotion_failures += 1;
                self.preserved.push(obj, obj_mark);
                self.push_new_object(obj, obj, obj_mark);
                obj
            }
            Err(winner) => {
                debug_assert!(winner.is_forwarded());
                winner.forwardee()
            }
        }
    }

    /// Evacuate the referent of `slot`, update the slot, then run the barrier.
    pub fn copy_and_push_safe_barrier(&mut self, slot: Slot) {
        // SAFETY: see claim_or_forward.
        let obj = unsafe { slot.load() };
        debug_assert!(self.heap.in_collection_set(obj));
        let new_obj = self.copy_to_survivor_space(obj);
        // SAFETY: as above.
        unsafe { slot.store(new_obj) };
        // Runs after the store: the barrier must see the updated slot.
        if !self.heap.is_in_young(slot.address()) && self.heap.is_in_young(new_obj) {
            self.heap.barrier().post_write(slot, new_obj);
        }
    }

    /// Process a root or remembered-set slot.
    pub fn process_root(&mut self, slot: Slot) {
        // SAFETY: root and remembered slots are live.
        let obj = unsafe { slot.load() };
        if !obj.is_null() && self.heap.in_collection_set(obj) {
            self.copy_and_push_safe_barrier(slot);
        }
    }

    fn process_popped_location_depth(&mut self, task: ScavengeTask, stolen: bool) {
        match task {
            WorkItem::Ref(slot) => self.copy_and_push_safe_barrier(slot),
            WorkItem::PartialArray(state) => self.process_array_chunk(state, stolen),
        }
    }

    /// Drain the overflow stack first, so others can steal from the shared
    /// buffer meanwhile, then the buffer down to the drain target or empty.
    pub fn drain_stacks_depth(&mut self, totally: bool) {
        let threshold = if totally { 0 } else { self.config.drain_target };
        loop {
            while let Some(task) = self.queue.pop_overflow() {
                if let Err(task) = self.queue.try_push_to_taskqueue(task) {
                    self.process_popped_location_depth(task, false);
                }
            }
            while let Some(task) = self.queue.pop_local(threshold) {
                self.process_popped_location_depth(task, false);
            }
            if self.queue.overflow_len() == 0 {
                break;
            }
        }
        debug_assert!(!totally || self.queue.is_empty());
    }

    /// Plug both LABs so the spaces are parsable.
    pub fn flush_labs(&mut self) {
        debug_assert!(self.queue.is_empty());
        let heap = &*self.heap;
        self.young_lab.flush(heap);
        self.old_lab.flush(heap);
    }

    /// Undo this worker's self-forwarding.
    pub fn restore_preserved_marks(&mut self) {
        self.preserved.restore(&self.heap);
    }
}

impl TraversalManager for PromotionManager {
    type Item = ScavengeTask;

    fn worker_id(&self) -> usize {
        self.id
    }

    fn drain_stacks(&mut self, totally: bool) {
        self.drain_stacks_depth(totally);
    }

    fn steal(&mut self) -> Option<ScavengeTask> {
        self.queue.steal(&mut self.rng)
    }

    fn process_stolen(&mut self, item: ScavengeTask) {
        self.process_popped_location_depth(item, true);
    }

    fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            queue: *self.queue.stats(),
            partial_array: *self.splitter.stats(),
            ..self.stats
        }
    }

    fn promotion_failed(&self) -> bool {
        self.promotion_failed
    }

    fn reset(&mut self) {
        debug_assert!(self.queue.is_empty(), "promotion manager reset with queued work");
        debug_assert!(self.young_lab.is_flushed() && self.old_lab.is_flushed());
        debug_assert!(self.preserved.is_empty(), "preserved marks not restored");
        self.young_gen_is_full = false;
        self.old_gen_is_full = false;
        self.promotion_failed = false;
        self.young_lab.reset_refills();
        self.old_lab.reset_refills();
        self.splitter.reset();
        self.queue.reset_stats();
        self.stats = WorkerStats::default();
    }
}
