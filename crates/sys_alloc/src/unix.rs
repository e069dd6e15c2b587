use std::io::{self, Error};
use std::ptr;
use std::sync::OnceLock;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// The system page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: `sysconf` has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(raw).unwrap_or(4096)
    })
}

pub struct MapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MapInner {
    /// Maps `len` bytes of private anonymous memory without reserving swap.
    ///
    /// # Safety
    ///
    /// This function calls `mmap`.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

/// Gives page-aligned memory back to the OS; it reads back as zero.
///
/// # Safety
///
/// `ptr..ptr + len` must be page aligned and inside a live private anonymous mapping.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub unsafe fn release_pages(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::madvise(ptr.cast::<libc::c_void>(), len, libc::MADV_DONTNEED) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Zeroes the range; `MADV_DONTNEED` does not guarantee zero-fill outside Linux.
///
/// # Safety
///
/// `ptr..ptr + len` must be inside a live mapping.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub unsafe fn release_pages(ptr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { ptr::write_bytes(ptr, 0, len) };
    Ok(())
}

unsafe impl Send for MapInner {}
unsafe impl Sync for MapInner {}
