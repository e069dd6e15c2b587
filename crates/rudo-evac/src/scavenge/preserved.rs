//! Headers saved when an object is self-forwarded.

use crate::heap::address::Address;
use crate::heap::header::MarkWord;
use crate::heap::Heap;

/// Original headers of objects that failed promotion, restored after the scavenge.
#[derive(Debug, Default)]
pub struct PreservedMarks {
    marks: Vec<(Address, MarkWord)>,
}

impl PreservedMarks {
    /// An empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self { marks: Vec::new() }
    }

    /// Remember `header` as the original header of `obj`.
    pub fn push(&mut self, obj: Address, header: MarkWord) {
        debug_assert!(header.is_normal());
        self.marks.push((obj, header));
    }

    /// Number of saved headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    /// Whether nothing is saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Write every saved header back and empty the stack.
    pub fn restore(&mut self, heap: &Heap) {
        for (obj, header) in self.marks.drain(..) {
            debug_assert!(heap.header(obj).is_self_forwarded(obj));
            heap.set_header(obj, header);
        }
    }
}
