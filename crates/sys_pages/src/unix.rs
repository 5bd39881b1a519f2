use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

#[derive(Debug)]
pub struct MapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MapInner {
    /// Maps `len` bytes of zero-filled anonymous memory.
    ///
    /// # Safety
    ///
    /// `len` must be nonzero and a multiple of the page size.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        // SAFETY: an anonymous private mapping at a kernel-chosen address;
        // the fd/offset pair is ignored for MAP_ANON.
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
            // SAFETY: ptr/len describe exactly the region map_anon returned.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
