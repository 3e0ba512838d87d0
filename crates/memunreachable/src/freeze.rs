//! Scoped freeze of the process allocator.

use crate::ffi;

/// Holds every allocator-internal mutex for the lifetime of the value.
///
/// While a `ScopedDisableMalloc` exists, no thread can mutate allocator
/// state: the coordinator wraps the capture hand-off in one, and the
/// collector child enters another before walking its copy-on-write heap
/// image. Nothing inside the scope may allocate from the managed heap.
#[must_use = "the allocator is only frozen while the scope is alive"]
pub struct ScopedDisableMalloc;

impl ScopedDisableMalloc {
    pub fn new() -> Self {
        ffi::disable_allocator();
        Self
    }
}

impl Default for ScopedDisableMalloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedDisableMalloc {
    fn drop(&mut self) {
        ffi::enable_allocator();
    }
}
