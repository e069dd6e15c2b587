//! Aligned anonymous memory reservations.
//!
//! The evacuation heap needs one contiguous, zero-initialized range whose base is
//! aligned to the region size so that region indices can be computed with a
//! shift. [`Reservation`] over-maps by the alignment and trims the view to the
//! aligned window; the whole mapping is released on drop.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A zero-initialized, read-write range of virtual memory with an aligned base.
pub struct Reservation {
    inner: os::MapInner,
    base: *mut u8,
    len: usize,
}

impl Reservation {
    /// Reserves `len` bytes whose base address is a multiple of `align`.
    ///
    /// `align` must be a power of two. Alignments below the allocation
    /// granularity are rounded up to it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power-of-two
    /// alignment, and the OS error if the mapping fails.
    pub fn reserve(len: usize, align: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        if !align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation alignment must be a power of two",
            ));
        }

        let align = align.max(allocation_granularity());
        let len = round_up(len, page_size());
        let map_len = len.checked_add(align).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "reservation length overflows")
        })?;

        // SAFETY: anonymous private mapping, no hint address.
        let inner = unsafe { os::MapInner::map_anon(map_len)? };
        let raw = inner.ptr() as usize;
        let base = round_up(raw, align);
        debug_assert!(base + len <= raw + map_len);

        Ok(Self {
            inner,
            base: base as *mut u8,
            len,
        })
    }

    /// Returns the aligned base of the reservation.
    #[must_use]
    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    /// Returns the usable length in bytes (rounded up to the page size).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the reservation has no usable bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the length of the underlying mapping, including alignment slack.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if `addr` lies inside the usable window.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.len
    }

    /// Zeroes `len` bytes starting at `offset`, handing whole pages back to the
    /// OS where the platform guarantees they read back as zero.
    ///
    /// # Safety
    ///
    /// No other thread may access the range while it is being discarded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is outside the reservation, or the OS
    /// error if releasing pages fails.
    pub unsafe fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range outside reservation",
            ));
        }
        if len == 0 {
            return Ok(());
        }

        let start = self.base as usize + offset;
        let end = start + len;
        let page = page_size();
        let inner_start = round_up(start, page);
        let inner_end = end & !(page - 1);

        if inner_start >= inner_end {
            // SAFETY: range checked above, caller guarantees exclusivity.
            unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
            return Ok(());
        }

        // SAFETY: both edges lie inside the reservation; caller guarantees exclusivity.
        unsafe {
            std::ptr::write_bytes(start as *mut u8, 0, inner_start - start);
            std::ptr::write_bytes(inner_end as *mut u8, 0, end - inner_end);
            os::release_pages(inner_start as *mut u8, inner_end - inner_start)
        }
    }
}

// SAFETY: the reservation owns its mapping; concurrent access to the memory is
// governed by the heap built on top of it.
unsafe impl Send for Reservation {}
// SAFETY: see Send impl
unsafe impl Sync for Reservation {}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
