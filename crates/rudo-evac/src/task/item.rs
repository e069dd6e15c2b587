//! Work items and their pointer-sized queue encoding.
//!
//! Queue buffers are arrays of `AtomicUsize` so thieves can read a slot racing
//! with the owner without undefined behaviour. Everything that crosses a queue
//! is therefore packed into a `usize` here and nowhere else.

use std::fmt;

use super::state::PartialArrayRef;
use crate::heap::address::{Address, Slot};

const PARTIAL_ARRAY_TAG: usize = 0b1;

/// Something a queue can carry as one word.
pub trait QueueItem: Copy + Send {
    /// Pack into a word.
    fn into_raw(self) -> usize;

    /// Unpack a word.
    ///
    /// # Safety
    ///
    /// `raw` must have been produced by [`QueueItem::into_raw`] of the same type.
    unsafe fn from_raw(raw: usize) -> Self;
}

impl QueueItem for usize {
    fn into_raw(self) -> usize {
        self
    }

    unsafe fn from_raw(raw: usize) -> Self {
        raw
    }
}

/// A word-aligned reference kind a traversal pushes: slots for copying,
/// objects for marking.
pub trait TaskRef: Copy + Eq + fmt::Debug + Send {
    /// The word-aligned address.
    fn to_address(self) -> Address;
    /// Rebuild from the address.
    fn from_address(addr: Address) -> Self;
}

impl TaskRef for Address {
    fn to_address(self) -> Address {
        self
    }

    fn from_address(addr: Address) -> Self {
        addr
    }
}

impl TaskRef for Slot {
    fn to_address(self) -> Address {
        self.address()
    }

    fn from_address(addr: Address) -> Self {
        Self::new(addr)
    }
}

/// A unit of traversal work.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum WorkItem<R> {
    /// A reference to process.
    Ref(R),
    /// One pending chunk of a partially processed array.
    PartialArray(PartialArrayRef),
}

impl<R: fmt::Debug> fmt::Debug for WorkItem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(r) => write!(f, "Ref({r:?})"),
            Self::PartialArray(state) => write!(f, "{state:?}"),
        }
    }
}

impl<R: TaskRef> QueueItem for WorkItem<R> {
    fn into_raw(self) -> usize {
        match self {
            Self::Ref(r) => {
                let raw = r.to_address().as_usize();
                debug_assert!(raw & PARTIAL_ARRAY_TAG == 0, "unaligned reference {raw:#x}");
                raw
            }
            Self::PartialArray(state) => state.as_usize() | PARTIAL_ARRAY_TAG,
        }
    }

    unsafe fn from_raw(raw: usize) -> Self {
        if raw & PARTIAL_ARRAY_TAG == 0 {
            Self::Ref(R::from_address(Address::from_usize(raw)))
        } else {
            // SAFETY: tagged words are only produced from live handles.
            Self::PartialArray(unsafe { PartialArrayRef::from_usize(raw & !PARTIAL_ARRAY_TAG) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::state::PartialArrayStateAllocator;

    #[test]
    fn test_ref_and_partial_array_decode() {
        let mut alloc = PartialArrayStateAllocator::new();
        let state = alloc.allocate(Address::from_usize(64), Address::from_usize(64), 0, 10, 1);

        let slot = Slot::new(Address::from_usize(0x1238));
        let items = [WorkItem::Ref(slot), WorkItem::PartialArray(state)];
        for item in items {
            let raw = item.into_raw();
            assert_eq!(unsafe { WorkItem::<Slot>::from_raw(raw) }, item);
        }
        assert_ne!(items[1].into_raw() & PARTIAL_ARRAY_TAG, 0);
    }
}
