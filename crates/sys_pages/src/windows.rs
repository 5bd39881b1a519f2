use std::io::{self, Error};
#[cfg(not(miri))]
use std::mem;
#[cfg(not(miri))]
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the allocation granularity `VirtualAlloc` aligns base addresses
/// to (typically 64KiB, larger than the page size).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    // SAFETY: GetSystemInfo fills a plain struct and cannot fail.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    // SAFETY: GetSystemInfo fills a plain struct and cannot fail.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

#[derive(Debug)]
pub struct MapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MapInner {
    /// Maps `len` bytes of zero-filled anonymous memory.
    ///
    /// # Safety
    ///
    /// `len` must be nonzero and a multiple of the page size.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            // Miri has no VirtualAlloc; model the mapping with std::alloc at
            // allocation granularity so alignment expectations still hold.
            use std::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(len, allocation_granularity())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            // SAFETY: layout has nonzero size (checked by the caller contract).
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            // SAFETY: reserving and committing fresh pages at an OS-chosen
            // address has no preconditions beyond a sane length.
            let ptr =
                unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
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
        if self.len == 0 {
            return;
        }
        #[cfg(miri)]
        {
            use std::alloc::{dealloc, Layout};
            // SAFETY: matches the alloc_zeroed in map_anon.
            unsafe {
                let layout =
                    Layout::from_size_align_unchecked(self.len, allocation_granularity());
                dealloc(self.ptr.cast::<u8>(), layout);
            }
        }
        #[cfg(not(miri))]
        // SAFETY: ptr is the base VirtualAlloc returned; MEM_RELEASE frees
        // the whole reservation (len must be 0 for that mode).
        unsafe {
            VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}
