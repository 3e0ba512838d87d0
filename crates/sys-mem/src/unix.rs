use std::ffi::CStr;
use std::io::{self, Error};
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const MAP_STACK: libc::c_int = libc::MAP_STACK;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const MAP_STACK: libc::c_int = 0;

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

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(
        len: usize,
        shared: bool,
        no_reserve: bool,
        stack: bool,
    ) -> io::Result<MmapInner> {
        let visibility = if shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        let no_reserve = if no_reserve { MAP_NORESERVE } else { 0 };
        let stack = if stack { MAP_STACK } else { 0 };

        let flags = visibility | libc::MAP_ANON | no_reserve | stack;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(MmapInner { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    // The kernel keeps the name pointer, not a copy of the bytes on older
    // kernels, so the caller must hand us a 'static string.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn set_name(&self, name: &'static CStr) -> io::Result<()> {
        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                self.ptr as libc::c_ulong,
                self.len as libc::c_ulong,
                name.as_ptr() as libc::c_ulong,
            )
        };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn set_name(&self, _name: &'static CStr) -> io::Result<()> {
        Err(Error::from_raw_os_error(libc::ENOTSUP))
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
