//! Parallel copying collection of the young generation.
//!
//! Live objects in eden and from-space are copied to to-space, or promoted to
//! old once their age reaches the tenuring threshold. Roots and remembered
//! old-space slots seed the traversal; workers claim them in stripes, copy,
//! and then steal from one another until the terminator declares the phase
//! over.
//!
//! If an object fits nowhere it is forwarded to itself and left in place. The
//! scavenge still completes, every live reference is updated, and afterwards
//! the original headers are restored and eden/from are kept. The report's
//! `promotion_failed` asks the caller for a full collection.

pub mod manager;
pub mod preserved;

use std::sync::Arc;

use crate::config::EvacConfig;
use crate::coordinator::WorkerRegistry;
use crate::error::Result;
use crate::heap::address::Address;
use crate::heap::roots::RootClaimer;
use crate::heap::space::SpaceId;
use crate::heap::Heap;
use crate::metrics::{CollectionKind, CycleReport, GcPhase, PhaseTimer};
use crate::tracing::{next_gc_id, GcId};

pub use manager::{PromotionManager, ScavengeTask};
pub use preserved::PreservedMarks;

/// Drives young collections over a fixed pool of promotion managers.
#[derive(Debug)]
pub struct Scavenger {
    heap: Arc<Heap>,
    config: EvacConfig,
    registry: WorkerRegistry<PromotionManager>,
}

impl Scavenger {
    /// Build the registry of promotion managers.
    ///
    /// # Errors
    ///
    /// Fails if `config` is invalid.
    pub fn new(heap: Arc<Heap>, config: EvacConfig) -> Result<Self> {
        config.validate()?;
        let registry = WorkerRegistry::new(&config, |id, queue| {
            PromotionManager::new(id, Arc::clone(&heap), config, queue)
        });
        Ok(Self {
            heap,
            config,
            registry,
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
    pub const fn registry(&self) -> &WorkerRegistry<PromotionManager> {
        &self.registry
    }

    /// Run one scavenge.
    ///
    /// The mutator must be stopped. Returns a skipped report without touching
    /// the heap if to-space still holds objects from a failed scavenge.
    pub fn collect(&mut self) -> CycleReport {
        let gc_id = next_gc_id();
        let _span = crate::tracing::trace_collection(CollectionKind::Scavenge, gc_id);
        if !self.heap.to_space().is_empty() {
            crate::tracing::log_skipped(gc_id, "to-space is not empty");
            return CycleReport::skipped(gc_id, CollectionKind::Scavenge);
        }

        self.registry.reset();
        let mut timer = PhaseTimer::new();

        timer.start(GcPhase::Evacuate);
        {
            let _phase = crate::tracing::trace_phase(GcPhase::Evacuate, gc_id);
            self.evacuate();
        }

        let report = self.registry.post_cycle_report();
        if report.promotion_failed {
            timer.start(GcPhase::RestorePreserved);
            let _phase = crate::tracing::trace_phase(GcPhase::RestorePreserved, gc_id);
            self.log_failures(gc_id);
            self.restore_after_failure();
        } else {
            // SAFETY: the mutator is stopped and every worker has finished.
            unsafe {
                self.heap.clear_space(SpaceId::Eden);
                self.heap.clear_space(self.heap.from_space().id());
            }
            self.heap.flip_survivors();
        }

        let (duration, phases) = timer.finish();
        CycleReport {
            gc_id,
            kind: CollectionKind::Scavenge,
            promotion_failed: report.promotion_failed,
            skipped: false,
            duration,
            phases,
            stats: report.stats,
        }
    }

    fn evacuate(&self) {
        let mut slots = self.heap.roots().slots();
        slots.extend(self.heap.remembered_set().take_slots());
        let claimer = RootClaimer::new(slots);

        self.registry.run(|id| {
            let mut manager = self.registry.manager(id);
            while let Some(stripe) = claimer.claim() {
                for &slot in stripe {
                    manager.process_root(slot);
                }
                manager.drain_stacks_depth(false);
            }
            self.registry.steal_work(&mut manager);
            manager.flush_labs();
        });
    }

    fn log_failures(&self, gc_id: GcId) {
        for id in 0..self.registry.num_workers() {
            let manager = self.registry.manager(id);
            let failures = manager.preserved_marks().len();
            if failures > 0 {
                crate::tracing::log_promotion_failure(gc_id, id, failures);
            }
        }
    }

    /// Put self-forwarded objects back and plug the originals of copied ones.
    fn restore_after_failure(&self) {
        self.registry
            .run(|id| self.registry.manager(id).restore_preserved_marks());
        self.plug_forwarded(SpaceId::Eden);
        self.plug_forwarded(self.heap.from_space().id());
    }

    /// Replace every forwarded original in `id` with a filler of its size.
    ///
    /// The copy still carries the klass, and word 1 of the original (an
    /// array's length) was never overwritten.
    fn plug_forwarded(&self, id: SpaceId) {
        let heap = &*self.heap;
        let space = heap.space(id);
        let top = space.top();
        let mut cur: Address = space.bottom();
        while cur < top {
            let header = heap.header(cur);
            let size = if header.is_forwarded() {
                debug_assert!(!header.is_self_forwarded(cur));
                let copy = header.forwardee();
                let size = heap.size_of(cur, heap.header(copy));
                heap.fill_with_object(cur, size);
                size
            } else {
                heap.size_of(cur, header)
            };
            cur = cur.add_words(size);
        }
    }
}
