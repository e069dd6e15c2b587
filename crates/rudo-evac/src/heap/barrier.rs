//! Post-write barrier and the old-to-young remembered set.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use super::address::{Address, Slot};

/// Hook run immediately after a reference store.
pub trait WriteBarrier: Send + Sync {
    /// `new_value` has just been written to `slot`.
    fn post_write(&self, slot: Slot, new_value: Address);
}

/// Records old-generation slots that hold young references.
///
/// Recording is lock-free; duplicates are removed when the set is drained.
#[derive(Debug)]
pub struct RememberedSet {
    old: Range<usize>,
    young: Range<usize>,
    slots: SegQueue<Slot>,
    recorded: AtomicUsize,
}

impl RememberedSet {
    /// A set for an old generation at `old` and a young generation at `young`.
    #[must_use]
    pub fn new(old: Range<Address>, young: Range<Address>) -> Self {
        Self {
            old: old.start.as_usize()..old.end.as_usize(),
            young: young.start.as_usize()..young.end.as_usize(),
            slots: SegQueue::new(),
            recorded: AtomicUsize::new(0),
        }
    }

    /// Record `slot` unconditionally.
    pub fn record(&self, slot: Slot) {
        self.slots.push(slot);
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of entries, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total recordings since creation.
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Drain every recorded slot, sorted and deduplicated.
    #[must_use]
    pub fn take_slots(&self) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(self.slots.len());
        while let Some(slot) = self.slots.pop() {
            slots.push(slot);
        }
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Drop every entry.
    pub fn clear(&self) {
        while self.slots.pop().is_some() {}
    }
}

impl WriteBarrier for RememberedSet {
    fn post_write(&self, slot: Slot, new_value: Address) {
        if self.old.contains(&slot.address().as_usize())
            && self.young.contains(&new_value.as_usize())
        {
            self.record(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> RememberedSet {
        let a = Address::from_usize;
        RememberedSet::new(a(0x1000)..a(0x2000), a(0x2000)..a(0x3000))
    }

    #[test]
    fn test_only_old_to_young_recorded() {
        let remset = set();
        let old_slot = Slot::new(Address::from_usize(0x1008));
        let young_slot = Slot::new(Address::from_usize(0x2008));

        remset.post_write(old_slot, Address::from_usize(0x2100));
        remset.post_write(old_slot, Address::from_usize(0x1100));
        remset.post_write(young_slot, Address::from_usize(0x2100));
        remset.post_write(old_slot, Address::NULL);

        assert_eq!(remset.len(), 1);
    }

    #[test]
    fn test_take_slots_dedups() {
        let remset = set();
        let barrier: &dyn WriteBarrier = &remset;
        for offset in [0x30, 0x10, 0x30, 0x20, 0x10] {
            barrier.post_write(
                Slot::new(Address::from_usize(0x1000 + offset)),
                Address::from_usize(0x2500),
            );
        }
        let slots = remset.take_slots();
        let raw: Vec<usize> = slots.iter().map(|s| s.address().as_usize()).collect();
        assert_eq!(raw, vec![0x1010, 0x1020, 0x1030]);
        assert!(remset.is_empty());
        assert_eq!(remset.total_recorded(), 5);
    }
}
