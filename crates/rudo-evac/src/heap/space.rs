//! Contiguous bump-allocated spaces.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::address::{Address, WORD};

/// Which part of the heap a space is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpaceId {
    /// Old generation.
    Old,
    /// Young generation allocation space.
    Eden,
    /// First survivor space.
    Survivor0,
    /// Second survivor space.
    Survivor1,
}

/// A `[bottom, end)` range with an atomic allocation top.
#[derive(Debug)]
pub struct Space {
    id: SpaceId,
    bottom: Address,
    end: Address,
    top: AtomicUsize,
}

impl Space {
    pub(crate) const fn new(id: SpaceId, bottom: Address, end: Address) -> Self {
        Self {
            id,
            bottom,
            end,
            top: AtomicUsize::new(bottom.as_usize()),
        }
    }

    /// Which space this is.
    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    /// First word of the space.
    #[must_use]
    pub const fn bottom(&self) -> Address {
        self.bottom
    }

    /// One past the last word of the space.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.end
    }

    /// Current allocation top.
    #[must_use]
    pub fn top(&self) -> Address {
        Address::from_usize(self.top.load(Ordering::Acquire))
    }

    pub(crate) fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    /// Total size in words.
    #[must_use]
    pub const fn capacity_words(&self) -> usize {
        (self.end.as_usize() - self.bottom.as_usize()) / WORD
    }

    /// Words below top.
    #[must_use]
    pub fn used_words(&self) -> usize {
        self.top().words_from(self.bottom)
    }

    /// Words above top.
    #[must_use]
    pub fn free_words(&self) -> usize {
        self.end.words_from(self.top())
    }

    /// Whether nothing has been allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Whether `addr` lies inside the reserved range of the space.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    /// Whether `addr` lies below top, i.e. in allocated memory.
    #[must_use]
    pub fn is_in_used(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.top()
    }

    /// Allocate `words` words with a CAS on top. Safe to call from any thread.
    #[must_use]
    pub fn cas_allocate(&self, words: usize) -> Option<Address> {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = top.checked_add(words * WORD)?;
            if new_top > self.end.as_usize() {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Address::from_usize(top)),
                Err(current) => top = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn space(words: usize) -> Space {
        let bottom = Address::from_usize(0x10_0000);
        Space::new(SpaceId::Eden, bottom, bottom.add_words(words))
    }

    #[test]
    fn test_cas_allocate_bumps() {
        let space = space(16);
        let a = space.cas_allocate(4).unwrap();
        let b = space.cas_allocate(4).unwrap();
        assert_eq!(a, space.bottom());
        assert_eq!(b, a.add_words(4));
        assert_eq!(space.used_words(), 8);
        assert_eq!(space.free_words(), 8);
        assert!(space.cas_allocate(9).is_none());
        assert!(space.cas_allocate(8).is_some());
        assert!(space.cas_allocate(1).is_none());
    }

    #[test]
    fn test_cas_allocate_concurrent_is_disjoint() {
        let space = Arc::new(space(4 * 1000));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let space = Arc::clone(&space);
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(addr) = space.cas_allocate(4) {
                    got.push(addr);
                }
                got
            }));
        }
        let mut all: Vec<Address> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(space.free_words(), 0);
    }
}
