//! A work-stealing evacuation engine for generational garbage collectors.
//!
//! `rudo-evac` traverses, copies and compacts an object graph with a fixed
//! pool of worker threads. It provides two collections over one heap:
//!
//! - a **scavenge** ([`Scavenger`]) that copies live young objects into a
//!   survivor space or promotes them to the old generation, falling back to
//!   self-forwarding when nothing fits;
//! - a **full collection** ([`MarkCompactCollector`]) that marks the whole
//!   heap and slides live data down region by region.
//!
//! # Features
//!
//! - **Chunked arrays**: large object arrays are split into a bounded number
//!   of stealable partial-array tasks
//! - **Lock-free work stealing**: per-worker Chase-Lev queues with an overflow
//!   stack and a race-free termination protocol
//! - **First copier wins**: forwarding is a single header CAS; losers give
//!   their allocation back
//! - **Promotion failure is survivable**: the scavenge completes and asks for
//!   a full collection
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use rudo_evac::{Collector, EvacConfig, Heap, HeapConfig, Klass};
//!
//! let mut heap = Heap::new(HeapConfig::default().with_spaces(1 << 16, 1 << 14, 1 << 12))?;
//! let node = heap.register_klass(Klass::instance("node", 1, 1))?;
//! let mut gc = Collector::new(heap, EvacConfig::new(2))?;
//! let heap = Arc::clone(gc.heap());
//!
//! let a = heap.alloc_instance(node).unwrap();
//! let b = heap.alloc_instance(node).unwrap();
//! heap.store_ref(a, 0, b);
//! heap.store_data(b, 0, 42);
//! let root = heap.roots().add(a).unwrap();
//!
//! let report = gc.scavenge();
//! assert!(!report.promotion_failed);
//!
//! let a = heap.roots().get(root);
//! assert!(heap.to_space().is_empty());
//! assert_eq!(heap.load_data(heap.load_ref(a, 0), 0), 42);
//! # Ok::<(), rudo_evac::EvacError>(())
//! ```
//!
//! # Thread Safety
//!
//! Collections require the mutator to be stopped. The mutator API on
//! [`Heap`] exists to build graphs for tests and embedders and is not
//! synchronized with a running collection.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("rudo-evac packs forwarding addresses into 64-bit headers");

pub mod compact;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod heap;
pub mod metrics;
pub mod scavenge;
pub mod task;
pub mod tracing;

use std::sync::Arc;

pub use compact::{CompactionManager, CompactionPlan, MarkCompactCollector};
pub use config::{EvacConfig, HeapConfig};
pub use coordinator::{PostCycleReport, TraversalManager, WorkerRegistry};
pub use error::{EvacError, Result};
pub use heap::address::{Address, Slot};
pub use heap::barrier::{RememberedSet, WriteBarrier};
pub use heap::header::{KlassId, MarkWord};
pub use heap::klass::{Klass, KlassKind};
pub use heap::roots::{RootHandle, RootSet};
pub use heap::space::{Space, SpaceId};
pub use heap::Heap;
pub use metrics::{CollectionKind, CycleReport, EvacStats, GcPhase, WorkerStats};
pub use scavenge::{PromotionManager, Scavenger};

/// A heap with both collectors attached.
#[derive(Debug)]
pub struct Collector {
    heap: Arc<Heap>,
    scavenger: Scavenger,
    full: MarkCompactCollector,
}

impl Collector {
    /// Take ownership of a heap whose klasses are registered.
    ///
    /// # Errors
    ///
    /// Fails if `config` is invalid.
    pub fn new(heap: Heap, config: EvacConfig) -> Result<Self> {
        let heap = Arc::new(heap);
        Ok(Self {
            scavenger: Scavenger::new(Arc::clone(&heap), config)?,
            full: MarkCompactCollector::new(Arc::clone(&heap), config)?,
            heap,
        })
    }

    /// The shared heap.
    #[must_use]
    pub const fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The young collector.
    #[must_use]
    pub const fn scavenger(&self) -> &Scavenger {
        &self.scavenger
    }

    /// The full collector.
    #[must_use]
    pub const fn mark_compact(&self) -> &MarkCompactCollector {
        &self.full
    }

    /// Run a scavenge only.
    pub fn scavenge(&mut self) -> CycleReport {
        self.scavenger.collect()
    }

    /// Run a full collection only.
    pub fn full_collect(&mut self) -> CycleReport {
        self.full.collect()
    }

    /// Scavenge, following up with a full collection if the scavenge was
    /// skipped or hit promotion failure. Returns every report in order.
    pub fn collect(&mut self) -> Vec<CycleReport> {
        let young = self.scavenge();
        let needs_full = young.skipped || young.promotion_failed;
        let mut reports = vec![young];
        if needs_full {
            reports.push(self.full_collect());
        }
        reports
    }
}
