//! Bindings to the process allocator's debug interface.
//!
//! The allocator collaborates through three calls: a freeze/unfreeze pair
//! that drains its internal mutexes, and an enumeration walk over the
//! allocations inside one of its regions. On Bionic these are real symbols;
//! elsewhere they degrade to no-ops so the crate builds and its unit tests
//! run, at the cost of heap enumeration reporting nothing.

use std::ffi::c_void;

#[cfg(target_os = "android")]
mod sys {
    use std::ffi::c_void;

    extern "C" {
        pub fn malloc_disable();
        pub fn malloc_enable();
        pub fn malloc_iterate(
            base: usize,
            size: usize,
            callback: Option<unsafe extern "C" fn(usize, usize, *mut c_void)>,
            arg: *mut c_void,
        ) -> libc::c_int;
    }
}

/// Acquires every allocator-internal mutex; no thread can mutate allocator
/// state until [`enable_allocator`] is called.
pub fn disable_allocator() {
    #[cfg(target_os = "android")]
    unsafe {
        sys::malloc_disable();
    }
}

/// Releases the mutexes taken by [`disable_allocator`].
pub fn enable_allocator() {
    #[cfg(target_os = "android")]
    unsafe {
        sys::malloc_enable();
    }
}

unsafe extern "C" fn iterate_trampoline<F: FnMut(usize, usize)>(
    base: usize,
    size: usize,
    arg: *mut c_void,
) {
    // SAFETY: `arg` is the closure passed to `iterate_allocations`, alive for
    // the duration of the enumeration call.
    let callback = unsafe { &mut *arg.cast::<F>() };
    callback(base, size);
}

/// Enumerates the allocations inside `[begin, begin + len)`, invoking
/// `callback(base, size)` for each. Returns `false` if the allocator
/// rejected the walk.
///
/// The closure crosses the boundary as a function pointer plus an opaque
/// argument, so the allocator needs no knowledge of Rust closures.
pub fn iterate_allocations<F: FnMut(usize, usize)>(
    begin: usize,
    len: usize,
    mut callback: F,
) -> bool {
    #[cfg(target_os = "android")]
    {
        let ret = unsafe {
            sys::malloc_iterate(
                begin,
                len,
                Some(iterate_trampoline::<F>),
                (&mut callback as *mut F).cast::<c_void>(),
            )
        };
        ret == 0
    }
    #[cfg(not(target_os = "android"))]
    {
        let _ = (begin, len);
        // Reference the trampoline so both cfg halves stay honest about the
        // closure's ABI; an allocator without enumeration yields no entries.
        let _: unsafe extern "C" fn(usize, usize, *mut c_void) = iterate_trampoline::<F>;
        let _ = &mut callback;
        true
    }
}
