//! Strong roots held outside the heap.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::address::{Address, Slot};

/// Index of a root slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

impl RootHandle {
    /// Position in the root set.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Fixed-capacity table of root slots.
///
/// Each entry is an ordinary [`Slot`], so collectors update roots exactly like
/// heap fields. A null entry is an unused or removed root.
#[derive(Debug)]
pub struct RootSet {
    slots: Box<[AtomicUsize]>,
    len: AtomicUsize,
    free: Mutex<Vec<usize>>,
}

impl RootSet {
    /// An empty set with room for `capacity` roots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            len: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Register `obj` as a root. Returns `None` when the table is full.
    pub fn add(&self, obj: Address) -> Option<RootHandle> {
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                let index = self.len.fetch_add(1, Ordering::Relaxed);
                if index >= self.slots.len() {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return None;
                }
                index
            }
        };
        self.slots[index].store(obj.as_usize(), Ordering::Release);
        Some(RootHandle(index))
    }

    /// Current referent of a root. Reflects moves made by the last collection.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Address {
        Address::from_usize(self.slots[handle.0].load(Ordering::Acquire))
    }

    /// Point a root at another object.
    pub fn set(&self, handle: RootHandle, obj: Address) {
        self.slots[handle.0].store(obj.as_usize(), Ordering::Release);
    }

    /// Unregister a root.
    pub fn remove(&self, handle: RootHandle) {
        self.slots[handle.0].store(0, Ordering::Release);
        self.free.lock().push(handle.0);
    }

    /// Drop every root.
    pub fn clear(&self) {
        for slot in &*self.slots {
            slot.store(0, Ordering::Relaxed);
        }
        self.free.lock().clear();
        self.len.store(0, Ordering::Release);
    }

    /// Number of slots ever handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether no root was ever added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot views of all handed-out entries, nulls included.
    #[must_use]
    pub fn slots(&self) -> Vec<Slot> {
        self.slots[..self.len()]
            .iter()
            .map(|cell| Slot::new(Address::from_ptr(cell)))
            .collect()
    }
}

/// Root slots handed out per claim.
pub const ROOT_STRIPE: usize = 64;

/// Hands out stripes of root slots so workers scan roots in parallel.
#[derive(Debug)]
pub struct RootClaimer {
    slots: Vec<Slot>,
    next: AtomicUsize,
}

impl RootClaimer {
    /// A claimer over `slots`.
    #[must_use]
    pub const fn new(slots: Vec<Slot>) -> Self {
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// The next unclaimed stripe, or `None` once all are taken.
    pub fn claim(&self) -> Option<&[Slot]> {
        let start = self.next.fetch_add(ROOT_STRIPE, Ordering::Relaxed);
        if start >= self.slots.len() {
            return None;
        }
        let end = (start + ROOT_STRIPE).min(self.slots.len());
        Some(&self.slots[start..end])
    }

    /// Total number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_set() {
        let roots = RootSet::new(2);
        let a = roots.add(Address::from_usize(0x100)).unwrap();
        let b = roots.add(Address::from_usize(0x200)).unwrap();
        assert!(roots.add(Address::from_usize(0x300)).is_none());
        assert_eq!(roots.len(), 2);

        roots.set(a, Address::from_usize(0x400));
        assert_eq!(roots.get(a), Address::from_usize(0x400));
        assert_eq!(roots.get(b), Address::from_usize(0x200));
    }

    #[test]
    fn test_remove_reuses_slot() {
        let roots = RootSet::new(1);
        let a = roots.add(Address::from_usize(0x100)).unwrap();
        roots.remove(a);
        assert!(roots.get(a).is_null());
        let b = roots.add(Address::from_usize(0x200)).unwrap();
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn test_slots_alias_entries() {
        let roots = RootSet::new(4);
        let a = roots.add(Address::from_usize(0x100)).unwrap();
        let slots = roots.slots();
        assert_eq!(slots.len(), 1);
        unsafe { slots[0].store(Address::from_usize(0x180)) };
        assert_eq!(roots.get(a), Address::from_usize(0x180));
    }

    #[test]
    fn test_claimer_hands_out_each_slot_once() {
        let slots: Vec<Slot> = (1..=150)
            .map(|i| Slot::new(Address::from_usize(i * 8)))
            .collect();
        let claimer = RootClaimer::new(slots.clone());
        let mut seen = Vec::new();
        while let Some(stripe) = claimer.claim() {
            assert!(stripe.len() <= ROOT_STRIPE);
            seen.extend_from_slice(stripe);
        }
        assert_eq!(seen, slots);
        assert!(claimer.claim().is_none());
    }
}
