//! Anonymous memory mappings obtained directly from the operating system.
//!
//! Everything in this crate bypasses the process allocator: the mappings it
//! hands out are usable while `malloc` is disabled or its internal locks are
//! held by a suspended thread. Consumers are storage that must stay available
//! during such windows: arena slabs, a shared control page inherited across
//! `fork`, and the stack of a raw `clone(2)` thread.

use std::ffi::CStr;
use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

pub use os::page_size;

/// A handle to an anonymous memory mapping.
///
/// The mapping is unmapped when the handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Labels the mapping in the kernel's visible memory map.
    ///
    /// On Linux this uses `PR_SET_VMA_ANON_NAME`, which makes the mapping
    /// show up as `[anon:<name>]` in `/proc/<pid>/maps`. Kernels without the
    /// facility return an error, which callers may ignore; the mapping still
    /// works, it just stays nameless.
    pub fn set_name(&self, name: &'static CStr) -> io::Result<()> {
        self.inner.set_name(name)
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating an anonymous memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    shared: bool,
    no_reserve: bool,
    stack: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            shared: false,
            no_reserve: false,
            stack: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Makes the mapping shared instead of private.
    ///
    /// A shared anonymous mapping is inherited across `fork` with both
    /// processes seeing the same pages, which is what the collector's
    /// cross-process control words need.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Sets whether to skip swap-space reservation.
    ///
    /// On Linux, this adds `MAP_NORESERVE`. Large arena reservations use it
    /// so address space can be claimed without committing backing store.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Marks the mapping as a thread stack.
    ///
    /// On Linux, this adds `MAP_STACK`. Required for memory handed to
    /// `clone(2)` as the child's stack.
    pub fn stack(mut self, stack: bool) -> Self {
        self.stack = stack;
        self
    }

    /// Creates the anonymous memory map.
    ///
    /// # Safety
    ///
    /// The mapping itself is owned by the returned `Mmap`, but this crate is
    /// low-level: callers hand the raw pointer to `clone` stacks, arena
    /// carving, and cross-process atomics, all of which must uphold their own
    /// aliasing and lifetime rules. Creation is marked unsafe to keep that
    /// responsibility visible at the call site.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner =
            unsafe { os::MmapInner::map_anon(self.len, self.shared, self.no_reserve, self.stack)? };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        // Verification: Write to memory
        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_shared_map_survives_write() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .shared(true)
                .map_anon()
                .expect("failed to map shared")
        };

        unsafe {
            ptr::write_volatile(mmap.ptr(), 7);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 7);
        }
    }

    #[test]
    fn test_stack_map() {
        // A stack mapping is just memory from the caller's point of view.
        let len = 16 * page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .stack(true)
                .map_anon()
                .expect("failed to map stack")
        };
        assert_eq!(mmap.len(), len);

        // The top of a downward-growing stack is the end of the mapping.
        let top = mmap.ptr() as usize + mmap.len();
        assert_eq!(top % page_size(), 0);
    }

    #[test]
    fn test_set_name_best_effort() {
        let mmap = unsafe {
            MmapOptions::new()
                .len(page_size())
                .map_anon()
                .expect("failed to map")
        };

        // Older kernels lack PR_SET_VMA_ANON_NAME; either outcome is fine,
        // the call just must not crash or corrupt the mapping.
        let _ = mmap.set_name(c"sys_mem_test");
        unsafe {
            ptr::write_volatile(mmap.ptr(), 1);
        }
    }
}
