//! Local allocation buffers owned by a single worker.

use super::address::Address;
use super::Heap;

/// A bump-pointer buffer carved from a space.
///
/// A LAB is owned by exactly one traversal manager and is never shared, so
/// its bump pointer is a plain field. `flush` plugs the unused tail with a
/// filler object so the space stays parsable.
#[derive(Debug)]
pub struct Lab {
    bottom: Address,
    top: Address,
    end: Address,
    refills: usize,
}

impl Default for Lab {
    fn default() -> Self {
        Self::new()
    }
}

impl Lab {
    /// An empty, flushed buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bottom: Address::NULL,
            top: Address::NULL,
            end: Address::NULL,
            refills: 0,
        }
    }

    /// Start allocating from `[start, start + words)`.
    pub fn initialize(&mut self, start: Address, words: usize) {
        debug_assert!(self.is_flushed(), "LAB initialized without a flush");
        self.bottom = start;
        self.top = start;
        self.end = start.add_words(words);
        self.refills += 1;
    }

    /// Bump-allocate `words` words.
    #[must_use]
    pub fn allocate(&mut self, words: usize) -> Option<Address> {
        if self.is_flushed() || self.free_words() < words {
            return None;
        }
        let obj = self.top;
        self.top = obj.add_words(words);
        Some(obj)
    }

    /// Give back the most recent allocation. Returns false if `obj` was not it.
    pub fn unallocate_object(&mut self, obj: Address, words: usize) -> bool {
        if !self.is_flushed() && obj.add_words(words) == self.top && obj >= self.bottom {
            self.top = obj;
            true
        } else {
            false
        }
    }

    /// Fill the unused tail and detach from the space.
    pub fn flush(&mut self, heap: &Heap) {
        if self.is_flushed() {
            return;
        }
        let free = self.free_words();
        if free > 0 {
            heap.fill_with_object(self.top, free);
        }
        self.bottom = Address::NULL;
        self.top = Address::NULL;
        self.end = Address::NULL;
    }

    /// Whether the buffer is detached.
    #[must_use]
    pub fn is_flushed(&self) -> bool {
        self.end.is_null()
    }

    /// Words still available.
    #[must_use]
    pub fn free_words(&self) -> usize {
        if self.is_flushed() {
            0
        } else {
            self.end.words_from(self.top)
        }
    }

    /// Start of the current buffer.
    #[must_use]
    pub const fn bottom(&self) -> Address {
        self.bottom
    }

    /// Whether `addr` was handed out by the current buffer.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.top
    }

    /// How many buffers this LAB has been initialized with.
    #[must_use]
    pub const fn refills(&self) -> usize {
        self.refills
    }

    pub(crate) fn reset_refills(&mut self) {
        self.refills = 0;
    }
}
