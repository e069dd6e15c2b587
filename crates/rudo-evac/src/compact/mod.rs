//! Parallel mark-compact collection of the whole heap.
//!
//! Phases, each run on every worker of one registry:
//!
//! 1. mark: from the roots, setting bits in the mark bitmap and crediting
//!    each region with its live words;
//! 2. summary (serial): choose a [`CompactionPlan`], pick the dense prefix
//!    of old and give each region a destination;
//! 3. forward: moving objects get a compaction-forwarded header;
//! 4. adjust: every reference, roots included, is redirected and the
//!    remembered set rebuilt;
//! 5. compact: regions are filled once all their own data has left them,
//!    or earlier into a free shadow region that is copied back later;
//! 6. post (serial): new tops, vacated memory zeroed, bitmap cleared.

pub mod manager;
pub mod shadow;
pub mod summary;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::deque::{Stealer, Worker};

use crate::config::EvacConfig;
use crate::coordinator::WorkerRegistry;
use crate::error::Result;
use crate::heap::roots::RootClaimer;
use crate::heap::space::SpaceId;
use crate::heap::Heap;
use crate::metrics::{CollectionKind, CycleReport, GcPhase, PhaseTimer};
use crate::task::terminator::Terminator;
use crate::tracing::next_gc_id;

pub use manager::{CompactionManager, MarkTask};
pub use shadow::ShadowRegions;
pub use summary::{CompactionPlan, ParallelCompactData, RegionData, RegionState, Summary};

/// Drives full collections over a fixed pool of compaction managers.
#[derive(Debug)]
pub struct MarkCompactCollector {
    heap: Arc<Heap>,
    config: EvacConfig,
    summary_data: Arc<ParallelCompactData>,
    registry: WorkerRegistry<CompactionManager>,
    region_stealers: Arc<[Stealer<usize>]>,
    region_terminator: Terminator,
    shadows: Arc<ShadowRegions>,
    last_plan: Option<CompactionPlan>,
}

impl MarkCompactCollector {
    /// Build the registry of compaction managers and the region table.
    ///
    /// # Errors
    ///
    /// Fails if `config` is invalid.
    pub fn new(heap: Arc<Heap>, config: EvacConfig) -> Result<Self> {
        config.validate()?;
        let summary_data = Arc::new(ParallelCompactData::new(&heap));
        let n = config.effective_workers();
        let mut region_queues: Vec<Option<Worker<usize>>> =
            (0..n).map(|_| Some(Worker::new_fifo())).collect();
        let region_stealers: Arc<[Stealer<usize>]> = region_queues
            .iter()
            .flatten()
            .map(Worker::stealer)
            .collect();
        let shadows = Arc::new(ShadowRegions::new());

        let registry = WorkerRegistry::new(&config, |id, queue| {
            let region_queue = region_queues[id]
                .take()
                .unwrap_or_else(Worker::new_fifo);
            CompactionManager::new(
                id,
                Arc::clone(&heap),
                config,
                queue,
                Arc::clone(&summary_data),
                region_queue,
                Arc::clone(&region_stealers),
                Arc::clone(&shadows),
            )
        });
        Ok(Self {
            heap,
            config,
            summary_data,
            registry,
            region_stealers,
            region_terminator: Terminator::new(n),
            shadows,
            last_plan: None,
        })
    }

    /// The heap being collected.
    #[must_use]
    pub const fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EvacConfig {
        &self.config
    }

    /// The worker registry.
    #[must_use]
    pub const fn registry(&self) -> &WorkerRegistry<CompactionManager> {
        &self.registry
    }

    /// The plan chosen by the most recent collection.
    #[must_use]
    pub const fn last_plan(&self) -> Option<CompactionPlan> {
        self.last_plan
    }

    /// Run one full collection. The mutator must be stopped.
    pub fn collect(&mut self) -> CycleReport {
        let gc_id = next_gc_id();
        let _span = crate::tracing::trace_collection(CollectionKind::Full, gc_id);
        self.registry.reset();
        let mut timer = PhaseTimer::new();

        timer.start(GcPhase::Mark);
        {
            let _phase = crate::tracing::trace_phase(GcPhase::Mark, gc_id);
            self.mark();
        }

        timer.start(GcPhase::Summary);
        let summary = {
            let _phase = crate::tracing::trace_phase(GcPhase::Summary, gc_id);
            self.summary_data
                .summarize(&self.heap, self.config.dense_prefix_dead_ratio)
        };

        timer.start(GcPhase::Forward);
        {
            let _phase = crate::tracing::trace_phase(GcPhase::Forward, gc_id);
            self.forward();
        }

        timer.start(GcPhase::Adjust);
        {
            let _phase = crate::tracing::trace_phase(GcPhase::Adjust, gc_id);
            self.adjust();
        }

        timer.start(GcPhase::Compact);
        {
            let _phase = crate::tracing::trace_phase(GcPhase::Compact, gc_id);
            self.compact(&summary);
        }

        timer.start(GcPhase::Post);
        {
            let _phase = crate::tracing::trace_phase(GcPhase::Post, gc_id);
            self.post(&summary);
        }
        self.last_plan = Some(summary.plan);

        let report = self.registry.post_cycle_report();
        let (duration, phases) = timer.finish();
        CycleReport {
            gc_id,
            kind: CollectionKind::Full,
            promotion_failed: false,
            skipped: false,
            duration,
            phases,
            stats: report.stats,
        }
    }

    fn mark(&self) {
        let claimer = RootClaimer::new(self.heap.roots().slots());
        self.registry.run(|id| {
            let mut manager = self.registry.manager(id);
            while let Some(stripe) = claimer.claim() {
                for &slot in stripe {
                    manager.process_root(slot);
                }
                manager.follow_marking_stacks(false);
            }
            self.registry.steal_work(&mut manager);
        });
    }

    /// Hand out regions one at a time to every worker.
    fn for_each_region<F>(&self, f: F)
    where
        F: Fn(&CompactionManager, usize) + Sync,
    {
        let next = AtomicUsize::new(0);
        let count = self.summary_data.region_count();
        self.registry.run(|id| {
            let manager = self.registry.manager(id);
            loop {
                let region = next.fetch_add(1, Ordering::Relaxed);
                if region >= count {
                    break;
                }
                f(&manager, region);
            }
        });
    }

    fn forward(&self) {
        self.for_each_region(|manager, region| manager.forward_region(region));
    }

    fn adjust(&self) {
        self.heap.remembered_set().clear();
        let claimer = RootClaimer::new(self.heap.roots().slots());
        self.registry.run(|id| {
            let manager = self.registry.manager(id);
            while let Some(stripe) = claimer.claim() {
                for &slot in stripe {
                    manager.adjust_root(slot);
                }
            }
        });
        self.for_each_region(|manager, region| manager.adjust_region(region));
    }

    fn compact(&self, summary: &Summary) {
        self.prepare_compaction(summary);
        self.fill_regions();
    }

    /// Collect the free shadow regions, point every worker at the regions it
    /// may shadow, and hand out the regions that are available right away.
    fn prepare_compaction(&self, summary: &Summary) {
        self.shadows.initialize(&self.heap, summary);
        let n = self.registry.num_workers();
        let first = self.summary_data.addr_to_region(summary.dense_prefix_end);
        let end = self
            .summary_data
            .addr_to_region(summary.new_top(SpaceId::Old));
        for id in 0..n {
            self.registry.manager(id).begin_compaction(first, end);
        }
        for (i, &region) in summary.available.iter().enumerate() {
            let data = self.summary_data.region(region);
            if data.claim() && data.mark_normal() {
                self.registry.manager(i % n).push_region(region);
            }
        }
    }

    fn fill_regions(&self) {
        self.region_terminator.reset();
        self.registry.run(|id| {
            let mut manager = self.registry.manager(id);
            loop {
                manager.drain_region_stacks();
                if let Some(region) = manager.steal_region() {
                    manager.fill_region(region);
                    continue;
                }
                if let Some(region) = manager.steal_unavailable_region() {
                    manager.fill_shadow_region(region);
                    continue;
                }
                let has_work = || self.region_stealers.iter().any(|s| !s.is_empty());
                if self.region_terminator.offer_termination(has_work) {
                    break;
                }
            }
        });
        debug_assert!((0..self.summary_data.region_count()).all(|r| {
            let data = self.summary_data.region(r);
            !data.needs_fill()
                || matches!(data.state(), RegionState::Normal | RegionState::Copied)
        }));
    }

    fn post(&self, summary: &Summary) {
        let heap = &*self.heap;
        for space in heap.spaces() {
            let new_top = summary.new_top(space.id());
            let old_top = space.top();
            if new_top < old_top {
                // SAFETY: every worker has finished and the mutator is stopped.
                unsafe { heap.zero_range(new_top, old_top) };
            }
            space.set_top(new_top);
        }
        heap.mark_bitmap().clear_all();
        self.summary_data.clear();
        self.shadows.clear();

        // Survivor data merged into survivor 0 must be in from-space.
        if !heap.to_space().is_empty() && heap.from_space().is_empty() {
            heap.flip_survivors();
        }
        debug_assert!(
            heap.space(SpaceId::Survivor1).is_empty()
                || !matches!(
                    summary.plan,
                    CompactionPlan::InPlace {
                        survivors_merged: true
                    }
                )
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::coordinator::TraversalManager;
    use crate::heap::address::Address;
    use crate::heap::klass::Klass;
    use crate::heap::roots::RootHandle;

    /// Region 0 of old is garbage; a chain of 60 three-word nodes follows
    /// in regions 1 to 3. Only region 0 is available at first.
    fn collector() -> (MarkCompactCollector, RootHandle) {
        let mut heap = Heap::new(
            HeapConfig::default()
                .with_spaces(1024, 512, 256)
                .with_region_words(64),
        )
        .unwrap();
        let node = heap.register_klass(Klass::instance("node", 1, 1)).unwrap();
        let leaf = heap.register_klass(Klass::instance("leaf", 0, 1)).unwrap();
        for _ in 0..32 {
            heap.alloc_old_instance(leaf).unwrap();
        }
        let head = heap.alloc_old_instance(node).unwrap();
        let mut prev = head;
        for i in 1..60 {
            let next = heap.alloc_old_instance(node).unwrap();
            heap.store_data(next, 0, i);
            heap.store_ref(prev, 0, next);
            prev = next;
        }
        let root = heap.roots().add(head).unwrap();
        let gc = MarkCompactCollector::new(Arc::new(heap), EvacConfig::new(2)).unwrap();
        (gc, root)
    }

    /// Used words of old, with heap addresses made relative to the base.
    fn old_contents(heap: &Heap) -> Vec<usize> {
        let base = heap.base().as_usize();
        (0..heap.old().used_words())
            .map(|i| {
                // SAFETY: no collection is running.
                let word = unsafe { heap.old().bottom().add_words(i).load_word() };
                if heap.is_in_reserved(Address::from_usize(word)) {
                    word - base
                } else {
                    word
                }
            })
            .collect()
    }

    #[test]
    fn test_shadow_fill_matches_direct_fill() {
        let (mut direct, direct_root) = collector();
        direct.collect();

        let (gc, root) = collector();
        gc.registry.reset();
        gc.mark();
        let summary = gc
            .summary_data
            .summarize(&gc.heap, gc.config.dense_prefix_dead_ratio);
        assert_eq!(summary.available, vec![0]);
        gc.forward();
        gc.adjust();
        gc.prepare_compaction(&summary);
        let free_shadows = gc.shadows.len();

        // Region 1 still holds data bound for region 0.
        let data = gc.summary_data.region(1);
        assert_eq!(data.destination_count(), 1);
        assert!(data.mark_shadow());
        gc.registry.manager(0).fill_shadow_region(1);
        assert_eq!(data.state(), RegionState::Filled);
        let shadow = gc.summary_data.region_to_addr(data.shadow_region());
        assert!(shadow >= gc.heap.old().top());
        // Region 2's data now sits in the shadow, so it can be overwritten.
        assert_eq!(gc.summary_data.region(2).state(), RegionState::Normal);

        gc.fill_regions();
        assert_eq!(data.state(), RegionState::Copied);
        assert_eq!(gc.shadows.len(), free_shadows);
        for i in 0..gc.summary_data.region_words() {
            // SAFETY: no collection is running.
            assert_eq!(unsafe { shadow.add_words(i).load_word() }, 0);
        }
        assert_eq!(gc.registry.manager(0).stats().shadow_fills, 1);
        let _report = gc.registry.post_cycle_report();
        gc.post(&summary);

        assert_eq!(gc.heap.old().used_words(), 180);
        assert_eq!(old_contents(&gc.heap), old_contents(&direct.heap));
        let head = gc.heap.roots().get(root);
        assert_eq!(head, gc.heap.old().bottom());
        assert_eq!(
            head.words_from(gc.heap.base()),
            direct.heap.roots().get(direct_root).words_from(direct.heap.base())
        );
        let mut cur = head;
        for i in 0..60 {
            assert_eq!(gc.heap.load_data(cur, 0), i);
            cur = gc.heap.load_ref(cur, 0);
        }
        assert!(cur.is_null());
    }

    #[test]
    fn test_unavailable_regions_split_between_workers() {
        let (gc, _root) = collector();
        gc.registry.reset();
        gc.mark();
        let summary = gc.summary_data.summarize(&gc.heap, 0);
        gc.forward();
        gc.adjust();
        gc.prepare_compaction(&summary);

        // Region 0 was handed out directly; worker 1 starts at region 1.
        assert_eq!(gc.registry.manager(0).steal_unavailable_region(), None);
        let mut second = gc.registry.manager(1);
        assert_eq!(second.steal_unavailable_region(), Some(1));
        assert_eq!(second.steal_unavailable_region(), None);
        assert_eq!(gc.summary_data.region(1).state(), RegionState::Shadow);
        second.fill_shadow_region(1);
        drop(second);

        gc.fill_regions();
        gc.post(&summary);
        assert_eq!(gc.heap.old().used_words(), 180);
    }
}
