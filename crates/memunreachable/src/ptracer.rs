//! Capture-thread spawn that never touches the process allocator.
//!
//! The coordinator starts the capture thread while the allocator is frozen,
//! so the standard thread API (which allocates) is off the table. Instead a
//! thread-like child is created with raw `clone(2)` on a premapped stack:
//! everything that allocates happens at construction time, before the freeze
//! scope is entered, and `start` is a single syscall.
//!
//! The child shares this process's memory, filesystem context, and file
//! descriptors but not its thread group, which is also what makes it a
//! legal ptracer of the original threads (a same-group sibling is not).

use std::io;

const STACK_BYTES: usize = 1024 * 1024;

struct ThreadState {
    func: Box<dyn FnMut() -> i32 + Send>,
}

extern "C" fn thread_trampoline(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: `arg` is the ThreadState boxed by `new`, kept alive by the
    // parent until after `join`.
    let state = unsafe { &mut *arg.cast::<ThreadState>() };
    (state.func)()
}

/// A `clone(2)`-based thread whose start path performs no allocation.
pub struct PtracerThread {
    stack: sys_mem::Mmap,
    state: Box<ThreadState>,
    child: Option<i32>,
}

impl PtracerThread {
    /// Maps the stack and boxes the closure. Call before entering the
    /// freeze scope.
    pub fn new<F>(func: F) -> io::Result<Self>
    where
        F: FnMut() -> i32 + Send + 'static,
    {
        // SAFETY: the mapping is used only as this thread's stack.
        let stack = unsafe {
            sys_mem::MmapOptions::new()
                .len(STACK_BYTES)
                .stack(true)
                .map_anon()?
        };
        Ok(Self {
            stack,
            state: Box::new(ThreadState {
                func: Box::new(func),
            }),
            child: None,
        })
    }

    /// Starts the thread. Allocation-free; safe to call inside the freeze
    /// scope.
    pub fn start(&mut self) -> io::Result<()> {
        if self.child.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "capture thread already started",
            ));
        }

        let stack_top = (self.stack.ptr() as usize + self.stack.len()) & !0xf;
        let flags = libc::CLONE_VM | libc::CLONE_FS | libc::CLONE_FILES | libc::CLONE_UNTRACED;

        // SAFETY: the stack mapping stays alive until join, and the state
        // pointer outlives the child for the same reason.
        let ret = unsafe {
            libc::clone(
                thread_trampoline,
                stack_top as *mut libc::c_void,
                flags,
                std::ptr::addr_of_mut!(*self.state).cast::<libc::c_void>(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.child = Some(ret);
        Ok(())
    }

    /// The child's pid, once started.
    pub fn tid(&self) -> Option<i32> {
        self.child
    }

    /// Waits for the thread to finish and returns its exit status.
    pub fn join(&mut self) -> io::Result<i32> {
        let child = self.child.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "capture thread not running")
        })?;
        Self::reap(child)
    }

    fn reap(child: i32) -> io::Result<i32> {
        let mut status: libc::c_int = 0;
        loop {
            // __WALL: the clone child carries no termination signal, so a
            // plain waitpid would miss it.
            let ret = unsafe { libc::waitpid(child, &mut status, libc::__WALL) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if libc::WIFEXITED(status) {
                return Ok(libc::WEXITSTATUS(status));
            }
            if libc::WIFSIGNALED(status) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "capture thread killed by signal",
                ));
            }
        }
    }
}

impl Drop for PtracerThread {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            // Abandoned (e.g. hand-off timeout): kill and reap so the stack
            // mapping can be unmapped safely.
            unsafe {
                libc::kill(child, libc::SIGKILL);
            }
            let _ = Self::reap(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn returns_exit_status() {
        let mut thread = PtracerThread::new(|| 42).unwrap();
        thread.start().unwrap();
        assert_eq!(thread.join().unwrap(), 42);
    }

    #[test]
    fn shares_memory_with_parent() {
        let value = Arc::new(AtomicUsize::new(0));
        let child_value = Arc::clone(&value);
        let mut thread = PtracerThread::new(move || {
            child_value.store(0xfeed, Ordering::SeqCst);
            0
        })
        .unwrap();
        thread.start().unwrap();
        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(value.load(Ordering::SeqCst), 0xfeed);
    }

    #[test]
    fn join_without_start_fails() {
        let mut thread = PtracerThread::new(|| 0).unwrap();
        assert!(thread.join().is_err());
    }

    #[test]
    fn double_start_fails() {
        let mut thread = PtracerThread::new(|| 0).unwrap();
        thread.start().unwrap();
        assert!(thread.start().is_err());
        thread.join().unwrap();
    }

    #[test]
    fn drop_kills_an_unjoined_thread() {
        let mut thread = PtracerThread::new(|| {
            loop {
                unsafe { libc::pause() };
            }
        })
        .unwrap();
        thread.start().unwrap();
        drop(thread);
        // Reaching here without hanging is the assertion.
    }
}
