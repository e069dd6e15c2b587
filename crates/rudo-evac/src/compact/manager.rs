//! Per-worker state for the phases of a full collection.

use std::sync::Arc;

use crossbeam::deque::{Steal as RegionSteal, Stealer, Worker};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::shadow::ShadowRegions;
use super::summary::ParallelCompactData;
use crate::config::EvacConfig;
use crate::coordinator::TraversalManager;
use crate::heap::address::{Address, Slot};
use crate::heap::header::MarkWord;
use crate::heap::Heap;
use crate::metrics::WorkerStats;
use crate::task::item::WorkItem;
use crate::task::queue::OverflowTaskQueue;
use crate::task::splitter::PartialArraySplitter;
use crate::task::state::PartialArrayRef;

/// Work item of the mark phase: a marked object whose fields must be scanned.
pub type MarkTask = WorkItem<Address>;

/// One worker's marking queue plus its FIFO of regions ready to be filled.
#[derive(Debug)]
pub struct CompactionManager {
    id: usize,
    heap: Arc<Heap>,
    config: EvacConfig,
    queue: OverflowTaskQueue<MarkTask>,
    splitter: PartialArraySplitter,
    summary: Arc<ParallelCompactData>,
    region_queue: Worker<usize>,
    region_stealers: Arc<[Stealer<usize>]>,
    shadows: Arc<ShadowRegions>,
    /// Next region this worker tries to fill through a shadow.
    next_shadow: usize,
    shadow_end: usize,
    rng: SmallRng,
    stats: WorkerStats,
}

impl CompactionManager {
    /// A manager for worker `id`. `region_queue`'s stealer must be at index
    /// `id` of `region_stealers`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        heap: Arc<Heap>,
        config: EvacConfig,
        queue: OverflowTaskQueue<MarkTask>,
        summary: Arc<ParallelCompactData>,
        region_queue: Worker<usize>,
        region_stealers: Arc<[Stealer<usize>]>,
        shadows: Arc<ShadowRegions>,
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
            summary,
            region_queue,
            region_stealers,
            shadows,
            next_shadow: 0,
            shadow_end: 0,
            rng: SmallRng::seed_from_u64(0x5eed ^ id as u64),
            stats: WorkerStats::default(),
        }
    }

    /// The worker's mark queue.
    #[must_use]
    pub const fn queue(&self) -> &OverflowTaskQueue<MarkTask> {
        &self.queue
    }

    // ---- mark ----

    /// Mark `obj` and queue it for scanning if this thread set its bit.
    pub fn mark_and_push(&mut self, obj: Address) {
        Self::mark_obj(&self.heap, &self.summary, &mut self.stats, &mut self.queue, obj);
    }

    fn mark_obj(
        heap: &Heap,
        summary: &ParallelCompactData,
        stats: &mut WorkerStats,
        queue: &mut OverflowTaskQueue<MarkTask>,
        obj: Address,
    ) {
        if heap.mark_bitmap().is_marked(obj) {
            return;
        }
        let header = heap.header(obj);
        let size = heap.size_of(obj, header);
        if heap.mark_bitmap().mark_obj(obj, size) {
            summary.add_obj(obj, size);
            stats.objects_marked += 1;
            stats.words_marked += size;
            queue.push(WorkItem::Ref(obj));
        }
    }

    /// Mark the referent of a root slot.
    pub fn process_root(&mut self, slot: Slot) {
        // SAFETY: root slots are live.
        let obj = unsafe { slot.load() };
        if !obj.is_null() {
            self.mark_and_push(obj);
        }
    }

    fn follow_contents(&mut self, obj: Address) {
        let header = self.heap.header(obj);
        if self.heap.is_obj_array(header) {
            let length = self.heap.array_length(obj);
            if length >= self.config.min_array_size_for_chunking {
                let initial = self.splitter.start(&mut self.queue, obj, obj, length);
                self.follow_array_range(obj, 0, initial);
                return;
            }
        }
        let (heap, summary) = (&*self.heap, &*self.summary);
        let (stats, queue) = (&mut self.stats, &mut self.queue);
        heap.for_each_ref_slot(obj, header, |slot| {
            Self::mark_slot(heap, summary, stats, queue, slot);
        });
    }

    fn mark_slot(
        heap: &Heap,
        summary: &ParallelCompactData,
        stats: &mut WorkerStats,
        queue: &mut OverflowTaskQueue<MarkTask>,
        slot: Slot,
    ) {
        // SAFETY: slot is a field of a marked object.
        let obj = unsafe { slot.load() };
        if !obj.is_null() {
            Self::mark_obj(heap, summary, stats, queue, obj);
        }
    }

    fn follow_array_range(&mut self, array: Address, start: usize, end: usize) {
        let (heap, summary) = (&*self.heap, &*self.summary);
        for i in start..end {
            let slot = heap.elem_slot(array, i);
            Self::mark_slot(heap, summary, &mut self.stats, &mut self.queue, slot);
        }
    }

    fn follow_array_chunk(&mut self, state: PartialArrayRef, stolen: bool) {
        let claim = self.splitter.claim(state, &mut self.queue, stolen);
        self.follow_array_range(claim.destination, claim.start, claim.end);
    }

    fn process_popped(&mut self, task: MarkTask, stolen: bool) {
        match task {
            WorkItem::Ref(obj) => self.follow_contents(obj),
            WorkItem::PartialArray(state) => self.follow_array_chunk(state, stolen),
        }
    }

    /// Scan queued objects, overflow first.
    pub fn follow_marking_stacks(&mut self, totally: bool) {
        let threshold = if totally { 0 } else { self.config.drain_target };
        loop {
            while let Some(task) = self.queue.pop_overflow() {
                if let Err(task) = self.queue.try_push_to_taskqueue(task) {
                    self.process_popped(task, false);
                }
            }
            while let Some(task) = self.queue.pop_local(threshold) {
                self.process_popped(task, false);
            }
            if self.queue.overflow_len() == 0 {
                break;
            }
        }
    }

    // ---- forward ----

    /// Visit live objects starting in `region` as `(address, size)`, in
    /// address order, until `f` returns false.
    fn objects_starting_in(&self, region: usize, mut f: impl FnMut(Address, usize) -> bool) {
        let bitmap = self.heap.mark_bitmap();
        let end = self.summary.region_to_addr(region + 1);
        let heap_end = self.heap.end();
        let mut cur = self.summary.region_to_addr(region);
        loop {
            let obj = bitmap.find_obj_beg(cur, end);
            if obj >= end {
                break;
            }
            let last = bitmap.find_obj_end(obj, heap_end);
            let size = last.words_from(obj) + 1;
            if !f(obj, size) {
                break;
            }
            cur = obj.add_words(size);
            if cur >= end {
                break;
            }
        }
    }

    /// Install compaction-forwarding headers on the objects of `region` that move.
    ///
    /// Objects in the dense prefix stay where they are and only have their
    /// age reset, which a fill would otherwise do.
    pub fn forward_region(&self, region: usize) {
        let data = self.summary.region(region);
        if data.data_size() == 0 {
            return;
        }
        let heap = &*self.heap;
        if self.summary.in_dense_prefix(region) {
            self.objects_starting_in(region, |obj, _| {
                let header = heap.header(obj);
                if header.age() != 0 {
                    heap.set_header(obj, MarkWord::new(header.klass()));
                }
                true
            });
            return;
        }
        let base = heap.base();
        let mut new_addr = data.destination().add_words(data.partial_obj_size());
        self.objects_starting_in(region, |obj, size| {
            if new_addr != obj {
                let header = heap.header(obj);
                heap.set_header(
                    obj,
                    MarkWord::compaction_forwarded(header.klass(), new_addr.words_from(base)),
                );
            }
            new_addr = new_addr.add_words(size);
            true
        });
    }

    // ---- adjust ----

    /// Where a live object will be after compaction.
    fn new_location(heap: &Heap, obj: Address) -> Address {
        let header = heap.header(obj);
        if header.is_compaction_forwarded() {
            heap.base().add_words(header.compaction_offset())
        } else {
            obj
        }
    }

    fn adjust_slot(heap: &Heap, slot: Slot, new_slot: Slot) {
        // SAFETY: slot is a field of a live object or a root.
        let obj = unsafe { slot.load() };
        if obj.is_null() {
            return;
        }
        let new_obj = Self::new_location(heap, obj);
        if new_obj != obj {
            // SAFETY: as above.
            unsafe { slot.store(new_obj) };
        }
        if heap.is_in_young(new_obj) {
            heap.barrier().post_write(new_slot, new_obj);
        }
    }

    /// Point a root at its referent's new location.
    pub fn adjust_root(&self, slot: Slot) {
        Self::adjust_slot(&self.heap, slot, slot);
    }

    /// Rewrite every reference field of every live object starting in `region`,
    /// and remember old-to-young fields at their post-compaction address.
    pub fn adjust_region(&self, region: usize) {
        if self.summary.region(region).data_size() == 0 {
            return;
        }
        let heap = &*self.heap;
        self.objects_starting_in(region, |obj, _| {
            let new_obj = Self::new_location(heap, obj);
            let header = heap.header(obj);
            heap.for_each_ref_slot(obj, header, |slot| {
                let offset = slot.address().words_from(obj);
                Self::adjust_slot(heap, slot, Slot::new(new_obj.add_words(offset)));
            });
            true
        });
    }

    // ---- compact ----

    /// Queue a region that is ready to be filled.
    pub fn push_region(&self, region: usize) {
        self.region_queue.push(region);
    }

    fn pop_region(&self) -> Option<usize> {
        self.region_queue.pop()
    }

    /// Take an available region from another worker.
    pub fn steal_region(&mut self) -> Option<usize> {
        let n = self.region_stealers.len();
        if n <= 1 {
            return None;
        }
        for _ in 0..2 * n {
            let victim = self.rng.random_range(0..n);
            if victim == self.id {
                continue;
            }
            loop {
                match self.region_stealers[victim].steal() {
                    RegionSteal::Success(region) => return Some(region),
                    RegionSteal::Empty => break,
                    RegionSteal::Retry => {}
                }
            }
        }
        None
    }

    /// Restrict shadow fills to regions `[first, end)`, visiting every
    /// `num_workers`-th one from `first + id`.
    pub fn begin_compaction(&mut self, first: usize, end: usize) {
        self.next_shadow = first + self.id;
        self.shadow_end = end;
    }

    /// Pick a region that still holds data others need, to fill through a shadow.
    pub fn steal_unavailable_region(&mut self) -> Option<usize> {
        let stride = self.region_stealers.len().max(1);
        while self.next_shadow < self.shadow_end {
            let region = self.next_shadow;
            self.next_shadow += stride;
            let data = self.summary.region(region);
            if data.needs_fill() && data.mark_shadow() {
                return Some(region);
            }
        }
        None
    }

    /// Fill every region in the local queue, including regions that become
    /// available while doing so.
    pub fn drain_region_stacks(&mut self) {
        while let Some(region) = self.pop_region() {
            self.fill_region(region);
        }
    }

    /// Whether the local region queue is empty.
    #[must_use]
    pub fn is_region_queue_empty(&self) -> bool {
        self.region_queue.is_empty()
    }

    /// Copy into `region` all live words destined for it.
    pub fn fill_region(&mut self, region: usize) {
        let data = self.summary.region(region);
        debug_assert!(data.needs_fill() && data.destination_count() == 0);
        let dst = self.summary.region_to_addr(region);
        self.fill_into(region, dst);
    }

    /// Fill a region picked by [`Self::steal_unavailable_region`] into a shadow.
    ///
    /// If the region gets claimed while waiting for a free shadow it is filled
    /// directly instead. Otherwise the shadow is published, and copied back
    /// here if the region has meanwhile been emptied; if not, whoever empties
    /// it copies it back.
    pub fn fill_shadow_region(&mut self, region: usize) {
        let summary = Arc::clone(&self.summary);
        let data = summary.region(region);
        let Some(shadow) = self.shadows.pop(data) else {
            data.shadow_to_normal();
            self.fill_region(region);
            return;
        };
        self.fill_into(region, summary.region_to_addr(shadow));
        self.stats.shadow_fills += 1;
        data.set_shadow_region(shadow);
        data.mark_filled();
        if (data.claim() || data.is_claimed()) && data.mark_copied() {
            self.copy_back(region, shadow);
        }
    }

    /// Copy the live words destined for `region` to `dst` onwards.
    ///
    /// Sources are visited in address order starting at the region's first
    /// source. Headers are rewritten to normal with the age reset as objects
    /// land. Each source region other than `region` itself loses one pending
    /// destination.
    fn fill_into(&mut self, region: usize, dst: Address) {
        let summary = Arc::clone(&self.summary);
        let data = summary.region(region);
        let mut dst = dst;
        let dst_end = dst.add_words(data.fill_words());

        if let Some((mut source, mut skip)) = data.first_source() {
            while dst < dst_end {
                let copied = self.copy_from_source(source, skip, dst, dst_end);
                dst = dst.add_words(copied);
                if copied > 0 && source != region {
                    self.release_source(source);
                }
                source += 1;
                skip = 0;
            }
        }
        debug_assert_eq!(dst, dst_end, "region {region} not completely filled");
        self.stats.regions_filled += 1;
    }

    /// Drop one pending destination of `source`. The worker that empties it
    /// queues it for filling, or copies its shadow back if one was filled.
    fn release_source(&self, source: usize) {
        let data = self.summary.region(source);
        if !data.decrement_destination_count() || !data.needs_fill() || !data.claim() {
            return;
        }
        if data.mark_normal() {
            self.push_region(source);
        } else if data.mark_copied() {
            self.copy_back(source, data.shadow_region());
        }
    }

    /// Move the finished contents of `shadow` into `region` and return the
    /// shadow, zeroed, to the free list.
    fn copy_back(&self, region: usize, shadow: usize) {
        let summary = &*self.summary;
        let words = summary.region(region).fill_words();
        let from = summary.region_to_addr(shadow);
        let to = summary.region_to_addr(region);
        for i in 0..words {
            // SAFETY: the region's own data has left it and the shadow is
            // published; this thread alone won the right to copy.
            unsafe { to.add_words(i).store_word(from.add_words(i).load_word()) };
        }
        // SAFETY: the shadow is owned by this thread until pushed back.
        unsafe { self.heap.zero_range(from, from.add_words(words)) };
        self.shadows.push(shadow);
    }

    /// Copy live words of `source`, after skipping `skip` of them, to `dst`
    /// until `dst_end`. Returns the number of words written.
    fn copy_from_source(
        &self,
        source: usize,
        mut skip: usize,
        dst: Address,
        dst_end: Address,
    ) -> usize {
        let heap = &*self.heap;
        let summary = &*self.summary;
        let data = summary.region(source);
        let src_beg = summary.region_to_addr(source);
        let src_end = summary.region_to_addr(source + 1);
        let mut out = dst;

        let mut copy = |from: Address, len: usize, starts_object: bool| -> bool {
            let mut offset = 0;
            if skip >= len {
                skip -= len;
                return true;
            }
            offset += skip;
            skip = 0;
            while offset < len && out < dst_end {
                let word = if starts_object && offset == 0 {
                    let header = heap.header(from);
                    MarkWord::new(header.klass()).raw()
                } else {
                    // SAFETY: live words of a source region not yet overwritten.
                    unsafe { from.add_words(offset).load_word() }
                };
                // SAFETY: dst lies in a region this worker is filling.
                unsafe { out.store_word(word) };
                out = out.add_words(1);
                offset += 1;
            }
            out < dst_end
        };

        let partial = data.partial_obj_size();
        if partial > 0 && !copy(src_beg, partial, false) {
            return out.words_from(dst);
        }
        self.objects_starting_in(source, |obj, size| {
            let len = size.min(src_end.words_from(obj));
            copy(obj, len, true)
        });
        out.words_from(dst)
    }
}

impl TraversalManager for CompactionManager {
    type Item = MarkTask;

    fn worker_id(&self) -> usize {
        self.id
    }

    fn drain_stacks(&mut self, totally: bool) {
        self.follow_marking_stacks(totally);
    }

    fn steal(&mut self) -> Option<MarkTask> {
        self.queue.steal(&mut self.rng)
    }

    fn process_stolen(&mut self, item: MarkTask) {
        self.process_popped(item, true);
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

    fn reset(&mut self) {
        debug_assert!(self.queue.is_empty(), "compaction manager reset with queued work");
        debug_assert!(self.region_queue.is_empty());
        self.splitter.reset();
        self.queue.reset_stats();
        self.stats = WorkerStats::default();
    }
}
