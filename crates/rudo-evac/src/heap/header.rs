//! The one-word object header.
//!
//! ```text
//!  63            32 31                    6 5   2 1 0
//! +----------------+-----------------------+-----+---+
//! |    klass id    |        unused         | age |01 |  normal
//! +----------------+-----------------------+-----+---+
//! |             forwardee address (8-aligned)    |11 |  forwarded
//! +----------------+-----------------------------+---+
//! |    klass id    |  new word offset from base  |10 |  compaction-forwarded
//! +----------------+-----------------------------+---+
//! ```
//!
//! A scavenge forwarding overwrites the klass id; the copy carries the original
//! header. Compaction forwarding keeps the klass so sizes stay derivable while
//! objects are being moved.

use super::address::Address;

/// Index into the klass table.
pub type KlassId = u32;

/// Oldest representable object age.
pub const MAX_AGE: u8 = 15;

const TAG_MASK: usize = 0b11;
const TAG_NORMAL: usize = 0b01;
const TAG_FORWARDED: usize = 0b11;
const TAG_COMPACTED: usize = 0b10;

const AGE_SHIFT: u32 = 2;
const AGE_MASK: usize = 0xF;

const OFFSET_SHIFT: u32 = 2;
const OFFSET_BITS: u32 = 30;
const OFFSET_MASK: usize = (1 << OFFSET_BITS) - 1;

const KLASS_SHIFT: u32 = 32;

/// Largest heap, in words, whose offsets fit a compaction-forwarded header.
pub const MAX_HEAP_WORDS: usize = 1 << OFFSET_BITS;

/// A snapshot of an object header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(usize);

impl MarkWord {
    /// A fresh header for an object of `klass` with age 0.
    #[must_use]
    pub const fn new(klass: KlassId) -> Self {
        Self(((klass as usize) << KLASS_SHIFT) | TAG_NORMAL)
    }

    /// Reinterpret a raw header word.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw header word.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// A header that is neither forwarded nor compaction-forwarded.
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 & TAG_MASK == TAG_NORMAL
    }

    /// The object has been copied (or self-forwarded) by a scavenge.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        self.0 & TAG_MASK == TAG_FORWARDED
    }

    /// The object will move during the current compaction.
    #[must_use]
    pub const fn is_compaction_forwarded(self) -> bool {
        self.0 & TAG_MASK == TAG_COMPACTED
    }

    /// The klass id. Not available once scavenge-forwarded.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn klass(self) -> KlassId {
        debug_assert!(!self.is_forwarded());
        (self.0 >> KLASS_SHIFT) as KlassId
    }

    /// Number of scavenges survived.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn age(self) -> u8 {
        debug_assert!(self.is_normal());
        ((self.0 >> AGE_SHIFT) & AGE_MASK) as u8
    }

    /// This header with the given age.
    #[must_use]
    pub const fn with_age(self, age: u8) -> Self {
        debug_assert!(self.is_normal());
        let age = if age > MAX_AGE { MAX_AGE } else { age };
        Self((self.0 & !(AGE_MASK << AGE_SHIFT)) | ((age as usize) << AGE_SHIFT))
    }

    /// This header one scavenge older, saturating at [`MAX_AGE`].
    #[must_use]
    pub const fn incr_age(self) -> Self {
        self.with_age(self.age() + 1)
    }

    /// A scavenge forwarding header pointing at `forwardee`.
    #[must_use]
    pub const fn forwarded_to(forwardee: Address) -> Self {
        debug_assert!(forwardee.is_word_aligned());
        Self(forwardee.as_usize() | TAG_FORWARDED)
    }

    /// Where a forwarded object went.
    #[must_use]
    pub const fn forwardee(self) -> Address {
        debug_assert!(self.is_forwarded());
        Address::from_usize(self.0 & !TAG_MASK)
    }

    /// Whether `obj` was forwarded to itself (promotion failure).
    #[must_use]
    pub const fn is_self_forwarded(self, obj: Address) -> bool {
        self.is_forwarded() && self.0 & !TAG_MASK == obj.as_usize()
    }

    /// A compaction header recording the new location as a word offset from the heap base.
    #[must_use]
    pub const fn compaction_forwarded(klass: KlassId, word_offset: usize) -> Self {
        debug_assert!(word_offset <= OFFSET_MASK);
        Self(((klass as usize) << KLASS_SHIFT) | (word_offset << OFFSET_SHIFT) | TAG_COMPACTED)
    }

    /// The word offset stored in a compaction-forwarded header.
    #[must_use]
    pub const fn compaction_offset(self) -> usize {
        debug_assert!(self.is_compaction_forwarded());
        (self.0 >> OFFSET_SHIFT) & OFFSET_MASK
    }
}

impl std::fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_forwarded() {
            write!(f, "MarkWord(forwarded -> {})", self.forwardee())
        } else if self.is_compaction_forwarded() {
            write!(
                f,
                "MarkWord(klass={}, compacting to +{})",
                self.klass(),
                self.compaction_offset()
            )
        } else {
            write!(f, "MarkWord(klass={}, age={})", self.klass(), self.age())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_header() {
        let header = MarkWord::new(42);
        assert!(header.is_normal());
        assert!(!header.is_forwarded());
        assert_eq!(header.klass(), 42);
        assert_eq!(header.age(), 0);
    }

    #[test]
    fn test_age_saturates() {
        let mut header = MarkWord::new(7);
        for _ in 0..40 {
            header = header.incr_age();
        }
        assert_eq!(header.age(), MAX_AGE);
        assert_eq!(header.klass(), 7);
        assert_eq!(header.with_age(3).age(), 3);
    }

    #[test]
    fn test_forwarding() {
        let to = Address::from_usize(0x7f00_0000_1238);
        let header = MarkWord::forwarded_to(to);
        assert!(header.is_forwarded());
        assert_eq!(header.forwardee(), to);
        assert!(header.is_self_forwarded(to));
        assert!(!header.is_self_forwarded(to.add_words(1)));
    }

    #[test]
    fn test_compaction_forwarding_keeps_klass() {
        let header = MarkWord::compaction_forwarded(u32::MAX, OFFSET_MASK);
        assert!(header.is_compaction_forwarded());
        assert_eq!(header.klass(), u32::MAX);
        assert_eq!(header.compaction_offset(), OFFSET_MASK);
    }
}
