use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct MapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MapInner {
    /// Reserves and commits `len` bytes of zeroed read-write memory.
    ///
    /// # Safety
    ///
    /// This function calls `VirtualAlloc`.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // MEM_RELEASE requires dwSize to be 0
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

/// Zeroes the range. `MEM_RESET` would leave stale contents readable.
///
/// # Safety
///
/// `ptr..ptr + len` must be inside a live mapping.
pub unsafe fn release_pages(ptr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { ptr::write_bytes(ptr, 0, len) };
    Ok(())
}

unsafe impl Send for MapInner {}
unsafe impl Sync for MapInner {}
