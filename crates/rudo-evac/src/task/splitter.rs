//! Starting and claiming chunked array work.

use super::item::{TaskRef, WorkItem};
use super::queue::OverflowTaskQueue;
use super::state::{PartialArrayRef, PartialArrayStateAllocator};
use super::stepper::PartialArrayTaskStepper;
use crate::heap::address::Address;
use crate::metrics::PartialArrayStats;

/// A claimed index range of a chunked array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claim {
    /// Array read by the chunk, captured before the state was released.
    pub source: Address,
    /// Array written by the chunk, captured before the state was released.
    pub destination: Address,
    /// First element index.
    pub start: usize,
    /// One past the last element index.
    pub end: usize,
}

/// Glues the stepper, a state allocator and the owner's task queue together.
#[derive(Debug)]
pub struct PartialArraySplitter {
    allocator: PartialArrayStateAllocator,
    stepper: PartialArrayTaskStepper,
    stats: PartialArrayStats,
}

impl PartialArraySplitter {
    /// A splitter claiming `chunk_size` elements at a time.
    #[must_use]
    pub fn new(chunk_size: usize, task_limit: u32) -> Self {
        Self {
            allocator: PartialArrayStateAllocator::new(),
            stepper: PartialArrayTaskStepper::new(chunk_size, task_limit),
            stats: PartialArrayStats::default(),
        }
    }

    /// Elements per chunk.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.stepper.chunk_size()
    }

    /// Begin chunked processing of an array of `length` elements.
    ///
    /// Returns the end of the initial range `[0, end)`, which the caller must
    /// process itself; the rest is pushed as partial-array tasks.
    pub fn start<R: TaskRef>(
        &mut self,
        queue: &mut OverflowTaskQueue<WorkItem<R>>,
        source: Address,
        destination: Address,
        length: usize,
    ) -> usize {
        let step = self.stepper.start(length);
        if step.ncreate > 0 {
            self.stats.split += 1;
            self.stats.pushed += step.ncreate as usize;
            let state = self.allocator.allocate(
                source,
                destination,
                step.index,
                length,
                step.ncreate as usize,
            );
            for _ in 0..step.ncreate {
                queue.push(WorkItem::PartialArray(state));
            }
        } else {
            debug_assert_eq!(step.index, length);
        }
        step.index
    }

    /// Claim the next chunk of `state`, consuming the reference held by the
    /// popped task and pushing any follow-up tasks.
    pub fn claim<R: TaskRef>(
        &mut self,
        state: PartialArrayRef,
        queue: &mut OverflowTaskQueue<WorkItem<R>>,
        stolen: bool,
    ) -> Claim {
        if stolen {
            self.stats.stolen += 1;
        }
        self.stats.processed += 1;

        // SAFETY: the popped task holds a reference, so the state is live.
        let shared = unsafe { state.get() };
        let source = shared.source();
        let destination = shared.destination();
        let step = self.stepper.next(shared);
        if step.ncreate > 0 {
            shared.add_references(step.ncreate as usize);
            for _ in 0..step.ncreate {
                queue.push(WorkItem::PartialArray(state));
            }
            self.stats.pushed += step.ncreate as usize;
        }
        self.allocator.release(state);

        Claim {
            source,
            destination,
            start: step.index,
            end: step.index + self.stepper.chunk_size(),
        }
    }

    /// Counters since the last reset.
    #[must_use]
    pub const fn stats(&self) -> &PartialArrayStats {
        &self.stats
    }

    /// The backing allocator.
    #[must_use]
    pub const fn allocator(&self) -> &PartialArrayStateAllocator {
        &self.allocator
    }

    /// Forget all states and zero the counters. Every splitter of a registry
    /// must be reset together.
    pub fn reset(&mut self) {
        self.allocator.reset();
        self.stats = PartialArrayStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::address::Slot;
    use crate::task::queue::TaskQueueSet;
    use std::sync::Arc;

    fn queue() -> OverflowTaskQueue<WorkItem<Slot>> {
        OverflowTaskQueue::new(0, Arc::new(TaskQueueSet::new(1, 64)))
    }

    #[test]
    fn test_claims_partition_the_array() {
        let mut splitter = PartialArraySplitter::new(100, 4);
        let mut queue = queue();
        let array = Address::from_usize(0x1000);

        let mut covered = vec![false; 1050];
        let first = splitter.start(&mut queue, array, array, 1050);
        assert_eq!(first, 50);
        covered[..first].iter_mut().for_each(|c| *c = true);

        while let Some(item) = queue.pop_local(0) {
            let WorkItem::PartialArray(state) = item else {
                panic!("unexpected {item:?}");
            };
            let claim = splitter.claim(state, &mut queue, false);
            assert_eq!(claim.source, array);
            for c in &mut covered[claim.start..claim.end] {
                assert!(!*c, "overlap at {}", claim.start);
                *c = true;
            }
        }
        assert!(covered.iter().all(|c| *c));
        assert_eq!(splitter.stats().processed, 10);
        assert_eq!(splitter.stats().pushed, 10);
        assert_eq!(splitter.allocator().free_len(), 1);
    }

    #[test]
    fn test_short_array_is_not_split() {
        let mut splitter = PartialArraySplitter::new(100, 4);
        let mut queue = queue();
        let array = Address::from_usize(0x1000);
        assert_eq!(splitter.start(&mut queue, array, array, 70), 70);
        assert!(queue.is_empty());
        assert_eq!(splitter.stats().split, 0);
    }
}
