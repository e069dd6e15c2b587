//! Free list of shadow regions.
//!
//! A shadow region is an empty region, above both the current and the new top
//! of its space, that a worker fills in place of a region still holding live
//! data. The finished words are copied back once the real region has been
//! emptied, so workers do not have to wait for region dependencies to resolve.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::summary::{RegionData, Summary};
use crate::heap::Heap;

const POLL: Duration = Duration::from_millis(1);

/// Regions currently free to serve as shadows, shared by all workers of a
/// compaction.
#[derive(Debug, Default)]
pub struct ShadowRegions {
    free: Mutex<Vec<usize>>,
    returned: Condvar,
}

impl ShadowRegions {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with every whole region lying above both the current
    /// and the new top of its space.
    pub fn initialize(&self, heap: &Heap, summary: &Summary) {
        let mut free = self.free.lock();
        free.clear();
        for space in heap.spaces() {
            let from = summary.new_top(space.id()).max(space.top());
            let mut first = heap.addr_to_region(from);
            if !heap.is_region_aligned(from) {
                first += 1;
            }
            debug_assert!(heap.is_region_aligned(space.end()));
            free.extend(first..heap.addr_to_region(space.end()));
        }
    }

    /// Take a shadow for `region`, waiting for one to be returned if none is
    /// free. Gives up with `None` once `region` itself has been claimed, as
    /// it can then be filled directly.
    pub fn pop(&self, region: &RegionData) -> Option<usize> {
        let mut free = self.free.lock();
        loop {
            if let Some(shadow) = free.pop() {
                return Some(shadow);
            }
            if region.is_claimed() {
                return None;
            }
            self.returned.wait_for(&mut free, POLL);
        }
    }

    /// Give `shadow` back and wake one waiting worker.
    pub fn push(&self, shadow: usize) {
        self.free.lock().push(shadow);
        self.returned.notify_one();
    }

    /// Number of free shadows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    /// Whether no shadow is free.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    /// Drop every shadow.
    pub fn clear(&self) {
        self.free.lock().clear();
    }
}
