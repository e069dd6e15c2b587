//! Parallel mark bitmap with begin and end bits.
//!
//! One begin bit and one end bit per heap word. Marking an object sets the
//! begin bit on its first word and the end bit on its last, so a marked
//! object's extent can be recovered from the bitmap alone.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::address::Address;

const BITS: usize = u64::BITS as usize;

/// Mark bits for every word of the heap.
#[derive(Debug)]
pub struct ParMarkBitmap {
    base: Address,
    words: usize,
    begin: Box<[AtomicU64]>,
    end: Box<[AtomicU64]>,
    marked_words: AtomicUsize,
}

impl ParMarkBitmap {
    /// A cleared bitmap covering `words` words from `base`.
    #[must_use]
    pub fn new(base: Address, words: usize) -> Self {
        let len = words.div_ceil(BITS);
        let alloc = |_| AtomicU64::new(0);
        Self {
            base,
            words,
            begin: (0..len).map(alloc).collect(),
            end: (0..len).map(alloc).collect(),
            marked_words: AtomicUsize::new(0),
        }
    }

    /// Number of heap words covered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.words
    }

    /// Total size of all objects marked since the last clear.
    #[must_use]
    pub fn marked_words(&self) -> usize {
        self.marked_words.load(Ordering::Relaxed)
    }

    fn bit_of(&self, addr: Address) -> usize {
        let bit = addr.words_from(self.base);
        debug_assert!(bit <= self.words, "{addr} outside the bitmap");
        bit
    }

    fn addr_of(&self, bit: usize) -> Address {
        self.base.add_words(bit)
    }

    /// Mark the object at `addr` spanning `words` words.
    ///
    /// Returns true only for the thread that set the begin bit.
    pub fn mark_obj(&self, addr: Address, words: usize) -> bool {
        debug_assert!(words > 0);
        let bit = self.bit_of(addr);
        let mask = 1u64 << (bit % BITS);
        let prev = self.begin[bit / BITS].fetch_or(mask, Ordering::AcqRel);
        if prev & mask != 0 {
            return false;
        }
        let last = bit + words - 1;
        self.end[last / BITS].fetch_or(1u64 << (last % BITS), Ordering::Relaxed);
        self.marked_words.fetch_add(words, Ordering::Relaxed);
        true
    }

    /// Whether an object starts at `addr` and has been marked.
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        let bit = self.bit_of(addr);
        self.begin[bit / BITS].load(Ordering::Acquire) & (1u64 << (bit % BITS)) != 0
    }

    /// Whether a marked object ends at `addr`.
    #[must_use]
    pub fn is_obj_end(&self, addr: Address) -> bool {
        let bit = self.bit_of(addr);
        self.end[bit / BITS].load(Ordering::Relaxed) & (1u64 << (bit % BITS)) != 0
    }

    fn find(bits: &[AtomicU64], from: usize, to: usize) -> usize {
        let mut bit = from;
        while bit < to {
            let word = bits[bit / BITS].load(Ordering::Relaxed) >> (bit % BITS);
            if word != 0 {
                return (bit + word.trailing_zeros() as usize).min(to);
            }
            bit = (bit / BITS + 1) * BITS;
        }
        to
    }

    /// First marked object start in `[beg, end)`, or `end` if there is none.
    #[must_use]
    pub fn find_obj_beg(&self, beg: Address, end: Address) -> Address {
        self.addr_of(Self::find(&self.begin, self.bit_of(beg), self.bit_of(end)))
    }

    /// First marked object end in `[beg, end)`, or `end` if there is none.
    #[must_use]
    pub fn find_obj_end(&self, beg: Address, end: Address) -> Address {
        self.addr_of(Self::find(&self.end, self.bit_of(beg), self.bit_of(end)))
    }

    /// Clear every bit for words in `[beg, end)`.
    pub fn clear_range(&self, beg: Address, end: Address) {
        let (from, to) = (self.bit_of(beg), self.bit_of(end));
        let mut bit = from;
        while bit < to {
            let idx = bit / BITS;
            let lo = bit % BITS;
            let hi = (to - idx * BITS).min(BITS);
            let mask = if hi - lo == BITS {
                u64::MAX
            } else {
                ((1u64 << (hi - lo)) - 1) << lo
            };
            self.begin[idx].fetch_and(!mask, Ordering::Relaxed);
            self.end[idx].fetch_and(!mask, Ordering::Relaxed);
            bit = (idx + 1) * BITS;
        }
    }

    /// Clear the whole bitmap.
    pub fn clear_all(&self) {
        for word in self.begin.iter().chain(self.end.iter()) {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_words.store(0, Ordering::Relaxed);
    }

    /// Bytes of side storage used by the bitmap.
    #[must_use]
    pub fn footprint(&self) -> usize {
        (self.begin.len() + self.end.len()) * size_of::<AtomicU64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const BASE: Address = Address::from_usize(0x10000);

    #[test]
    fn test_mark_sets_begin_and_end() {
        let bitmap = ParMarkBitmap::new(BASE, 512);
        let obj = BASE.add_words(10);
        assert!(bitmap.mark_obj(obj, 5));
        assert!(!bitmap.mark_obj(obj, 5));
        assert!(bitmap.is_marked(obj));
        assert!(!bitmap.is_marked(obj.add_words(1)));
        assert!(bitmap.is_obj_end(obj.add_words(4)));
        assert_eq!(bitmap.marked_words(), 5);
    }

    #[test]
    fn test_find_obj_beg_crosses_words() {
        let bitmap = ParMarkBitmap::new(BASE, 512);
        let end = BASE.add_words(512);
        assert_eq!(bitmap.find_obj_beg(BASE, end), end);

        bitmap.mark_obj(BASE.add_words(200), 3);
        assert_eq!(bitmap.find_obj_beg(BASE, end), BASE.add_words(200));
        assert_eq!(
            bitmap.find_obj_beg(BASE.add_words(201), end),
            end,
            "search starts after the only mark"
        );
        assert_eq!(
            bitmap.find_obj_beg(BASE, BASE.add_words(150)),
            BASE.add_words(150)
        );
        assert_eq!(bitmap.find_obj_end(BASE, end), BASE.add_words(202));
    }

    #[test]
    fn test_clear_range_is_exact() {
        let bitmap = ParMarkBitmap::new(BASE, 256);
        for i in [0, 63, 64, 100, 200] {
            bitmap.mark_obj(BASE.add_words(i), 1);
        }
        bitmap.clear_range(BASE.add_words(63), BASE.add_words(101));
        assert!(bitmap.is_marked(BASE));
        assert!(!bitmap.is_marked(BASE.add_words(63)));
        assert!(!bitmap.is_marked(BASE.add_words(64)));
        assert!(!bitmap.is_marked(BASE.add_words(100)));
        assert!(bitmap.is_marked(BASE.add_words(200)));
    }

    #[test]
    fn test_concurrent_mark_single_winner() {
        let bitmap = Arc::new(ParMarkBitmap::new(BASE, 512));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || {
                    (0..128)
                        .filter(|i| bitmap.mark_obj(BASE.add_words(i * 4), 4))
                        .count()
                })
            })
            .collect();
        let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(wins, 128);
        assert_eq!(bitmap.marked_words(), 512);
    }
}
