//! Raw heap addresses and reference slots.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes per heap word.
pub const WORD: usize = std::mem::size_of::<usize>();

/// A byte address. Zero is the null reference.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Wrap a raw address.
    #[must_use]
    pub const fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    /// Wrap a pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// The raw address.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Whether this is the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the address is word aligned.
    #[must_use]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD == 0
    }

    /// The address `words` words above this one.
    #[must_use]
    pub const fn add_words(self, words: usize) -> Self {
        Self(self.0 + words * WORD)
    }

    /// The address `words` words below this one.
    #[must_use]
    pub const fn sub_words(self, words: usize) -> Self {
        Self(self.0 - words * WORD)
    }

    /// Number of words from `base` up to this address.
    #[must_use]
    pub const fn words_from(self, base: Self) -> usize {
        debug_assert!(self.0 >= base.0);
        (self.0 - base.0) / WORD
    }

    /// The heap word at this address.
    ///
    /// # Safety
    ///
    /// The address must be word aligned and point into live heap memory (or a
    /// root slot) for as long as the returned reference is used.
    #[must_use]
    pub(crate) unsafe fn word<'a>(self) -> &'a AtomicUsize {
        debug_assert!(!self.is_null() && self.is_word_aligned());
        // SAFETY: guaranteed by the caller.
        unsafe { &*(self.0 as *const AtomicUsize) }
    }

    /// Relaxed load of the word at this address.
    ///
    /// # Safety
    ///
    /// See [`Address::word`].
    #[must_use]
    pub(crate) unsafe fn load_word(self) -> usize {
        unsafe { self.word() }.load(Ordering::Relaxed)
    }

    /// Relaxed store of the word at this address.
    ///
    /// # Safety
    ///
    /// See [`Address::word`].
    pub(crate) unsafe fn store_word(self, value: usize) {
        unsafe { self.word() }.store(value, Ordering::Relaxed);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The location of a reference: a heap field, an array element or a root.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Slot(Address);

impl Slot {
    /// Wrap the address of a reference-holding word.
    #[must_use]
    pub const fn new(addr: Address) -> Self {
        Self(addr)
    }

    /// The address of the slot itself.
    #[must_use]
    pub const fn address(self) -> Address {
        self.0
    }

    /// Load the reference stored in the slot.
    ///
    /// # Safety
    ///
    /// The slot must be live heap memory or a root slot.
    #[must_use]
    pub(crate) unsafe fn load(self) -> Address {
        Address(unsafe { self.0.load_word() })
    }

    /// Store a reference into the slot.
    ///
    /// # Safety
    ///
    /// The slot must be live heap memory or a root slot.
    pub(crate) unsafe fn store(self, value: Address) {
        unsafe { self.0.store_word(value.0) };
    }
}
