//! The collection protocol: freeze, capture, fork, walk, report.
//!
//! The coordinator freezes the allocator, starts the capture thread, and
//! waits on the semaphore. The capture thread attaches every sibling, reads
//! registers and mappings, releases the original thread, posts the
//! semaphore, and forks. The child walks its copy-on-write heap image and
//! streams the results back over the leak pipe; the parent of the fork
//! simply returns, releasing the remaining threads on the way out.
//!
//! The fork is what keeps the two halves honest: the mark phase needs the
//! heap quiescent, but running it among frozen threads would deadlock on the
//! allocator. The child's copy-on-write image stays frozen forever while the
//! child allocates freely against its own copy of the allocator state.

use std::sync::Arc;
use std::time::Duration;

use nix::unistd::ForkResult;

use crate::arena::{Arena, ArenaVec};
use crate::capture::{ThreadCapture, ThreadInfo};
use crate::classify::classify_mappings;
use crate::error::{CollectError, Result};
use crate::ffi;
use crate::freeze::ScopedDisableMalloc;
use crate::maps::{read_process_mappings, Mapping};
use crate::pipe::LeakPipe;
use crate::ptracer::PtracerThread;
use crate::report::{self, Leak, UnreachableMemoryInfo, CONTENTS_LEN};
use crate::sem::Semaphore;
use crate::walker::{HeapWalker, Region};

/// How long the original thread waits for the capture thread to signal that
/// the allocator may be unfrozen.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(100);

/// Child exit statuses, read back by the coordinator through `join`.
const EXIT_OK: i32 = 0;
const EXIT_CAPTURE_OR_FORK: i32 = 1;
const EXIT_COLLECT: i32 = 2;
const EXIT_PIPE: i32 = 3;

/// Per-collection state of the heap-walker child.
struct MemUnreachable {
    pid: i32,
    arena: Arena,
    walker: HeapWalker,
}

impl MemUnreachable {
    fn new(pid: i32, arena: &Arena) -> Self {
        Self {
            pid,
            arena: arena.clone(),
            walker: HeapWalker::new(arena),
        }
    }

    /// Feeds the walker: allocations from the heap and anonymous mappings,
    /// roots from globals, live stack extents, and register files.
    fn collect_allocations(&mut self, threads: &[ThreadInfo], mappings: &[Mapping]) -> bool {
        tracing::info!("searching process {} for allocations", self.pid);

        let classified = classify_mappings(&self.arena, mappings);

        for mapping in &classified.heap {
            tracing::debug!("heap mapping {:?}", mapping);
            let walker = &mut self.walker;
            let ok = ffi::iterate_allocations(
                mapping.begin,
                mapping.end - mapping.begin,
                |base, size| {
                    walker.allocation(base, base + size);
                },
            );
            if !ok {
                tracing::error!("allocator enumeration failed for {:?}", mapping);
                return false;
            }
        }

        for mapping in &classified.anon {
            tracing::debug!("anon mapping {:?}", mapping);
            self.walker.allocation(mapping.begin, mapping.end);
        }

        for mapping in &classified.globals {
            tracing::debug!("globals mapping {:?}", mapping);
            self.walker.root(mapping.begin, mapping.end);
        }

        for thread in threads {
            for mapping in &classified.stacks {
                if thread.stack_pointer >= mapping.begin && thread.stack_pointer <= mapping.end {
                    tracing::debug!(
                        "stack {:x}-{:x} of thread {}",
                        thread.stack_pointer,
                        mapping.end,
                        thread.tid
                    );
                    self.walker.root(thread.stack_pointer, mapping.end);
                }
            }
            self.walker.root_bytes(thread.regs.as_bytes());
        }

        tracing::info!("searching done");
        true
    }

    fn allocations(&self) -> usize {
        self.walker.allocations()
    }

    fn allocation_bytes(&self) -> usize {
        self.walker.allocation_bytes()
    }

    /// Marks, sweeps, and packages up to `limit` leaks with their contents.
    fn unreachable_leaks(&mut self, limit: usize) -> (ArenaVec<Leak>, usize, usize) {
        tracing::info!("sweeping process {} for unreachable memory", self.pid);

        let leaked = self.walker.leaked(limit);

        let mut leaks = ArenaVec::with_capacity(&self.arena, leaked.regions.len());
        for region in &leaked.regions {
            let mut leak = Leak {
                begin: region.begin,
                size: region.size(),
                contents: [0; CONTENTS_LEN],
            };
            read_leak_contents(region, &mut leak.contents);
            leaks.push(leak);
        }

        tracing::info!("sweeping done");
        (leaks, leaked.num_leaks, leaked.leak_bytes)
    }
}

/// Copies the first bytes of a leak out of the (our own) address space.
///
/// Goes through `process_vm_readv` rather than a plain load so that a region
/// gone unreadable leaves a zero-filled prefix instead of a fault.
fn read_leak_contents(region: &Region, out: &mut [u8; CONTENTS_LEN]) {
    let len = region.size().min(CONTENTS_LEN);
    let mut local = [std::io::IoSliceMut::new(&mut out[..len])];
    let remote = [nix::sys::uio::RemoteIoVec {
        base: region.begin,
        len,
    }];
    let _ = nix::sys::uio::process_vm_readv(nix::unistd::getpid(), &mut local, &remote);
}

/// Performs one collection and returns the report.
///
/// See the module docs for the protocol. The returned info is complete or
/// the call fails; truncation to `limit` affects only `leaks`, never the
/// totals.
pub fn get_unreachable_memory(limit: usize) -> Result<UnreachableMemoryInfo> {
    let parent_pid = unsafe { libc::getpid() };
    let parent_tid = unsafe { libc::gettid() } as i32;

    // Everything that allocates happens here, before the freeze: the arena
    // root, the pipe, the semaphore, and the capture thread's stack.
    let arena = Arena::new().map_err(CollectError::Setup)?;
    let continue_parent_sem = Arc::new(Semaphore::new(0));
    let pipe = Arc::new(LeakPipe::new()?);

    let mut thread = {
        let arena = arena.clone();
        let sem = Arc::clone(&continue_parent_sem);
        let pipe = Arc::clone(&pipe);
        PtracerThread::new(move || {
            collection_thread(parent_pid, parent_tid, limit, &arena, &sem, &pipe)
        })
        .map_err(CollectError::SpawnCapture)?
    };

    {
        // Freeze the allocator for a consistent view of memory.
        let _disable_malloc = ScopedDisableMalloc::new();

        thread.start().map_err(CollectError::SpawnCapture)?;

        if let Some(tid) = thread.tid() {
            allow_ptrace_from(tid);
        }

        // The capture thread posts once every sibling is frozen and this
        // thread has been released; only then is it safe to unfreeze, which
        // the capture thread needs for the at-fork handlers.
        if !continue_parent_sem.wait(HANDOFF_TIMEOUT) {
            tracing::error!("timed out waiting for capture thread hand-off");
            return Err(CollectError::HandoffTimeout);
        }
    }

    let status = thread.join().map_err(CollectError::Setup)?;
    if status != EXIT_OK {
        tracing::error!("capture thread failed with status {}", status);
        return Err(CollectError::CaptureThreadFailed(status));
    }

    let receiver = pipe.open_receiver()?;
    let info = UnreachableMemoryInfo {
        num_allocations: receiver.receive()?,
        allocation_bytes: receiver.receive()?,
        num_leaks: receiver.receive()?,
        leak_bytes: receiver.receive()?,
        leaks: receiver.receive_vector()?,
    };

    tracing::info!("unreachable memory detection done");
    report::log_summary(&info);

    Ok(info)
}

/// Collects and logs each leak, optionally hex-dumping its first bytes.
pub fn log_unreachable_memory(log_contents: bool, limit: usize) -> Result<()> {
    let info = get_unreachable_memory(limit)?;
    for leak in &info.leaks {
        report::log_leak(leak, log_contents);
    }
    Ok(())
}

/// Body of the capture thread. Returns the thread's exit status.
fn collection_thread(
    parent_pid: i32,
    parent_tid: i32,
    limit: usize,
    arena: &Arena,
    sem: &Semaphore,
    pipe: &LeakPipe,
) -> i32 {
    tracing::info!("collecting thread info for process {}...", parent_pid);

    let mut thread_capture = ThreadCapture::new(parent_pid, arena);
    let mut thread_info = ArenaVec::new(arena);

    if thread_capture.capture_all().is_err() {
        return EXIT_CAPTURE_OR_FORK;
    }
    if thread_capture.captured_info(&mut thread_info).is_err() {
        return EXIT_CAPTURE_OR_FORK;
    }

    let mappings = match read_process_mappings(parent_pid, arena) {
        Ok(mappings) => mappings,
        Err(e) => {
            tracing::error!("failed to read mappings of {}: {}", parent_pid, e);
            return EXIT_CAPTURE_OR_FORK;
        }
    };

    // fork needs a working allocator: the at-fork handlers take the same
    // locks the freeze scope holds. All siblings are paused in ptrace, so
    // memory stays consistent; unfreeze the original thread specifically so
    // it can drop the freeze, where it will block joining this thread.
    thread_capture.release_one(parent_tid);
    sem.post();

    match unsafe { nix::unistd::fork() } {
        Err(e) => {
            tracing::error!("fork failed: {}", e);
            EXIT_CAPTURE_OR_FORK
        }
        Ok(ForkResult::Child) => {
            let status = collect_in_child(parent_pid, limit, arena, pipe, &thread_info, &mappings);
            // No atexit handlers, no Drop glue: this is a borrowed image.
            unsafe { libc::_exit(status) }
        }
        Ok(ForkResult::Parent { .. }) => {
            // Nothing left to do here; dropping the capture releases every
            // still-paused sibling.
            tracing::info!("collection thread done");
            EXIT_OK
        }
    }
}

/// Body of the heap-walker child. Examines the copy-on-write snapshot using
/// the thread and mapping data captured by the parent.
fn collect_in_child(
    parent_pid: i32,
    limit: usize,
    arena: &Arena,
    pipe: &LeakPipe,
    thread_info: &[ThreadInfo],
    mappings: &[Mapping],
) -> i32 {
    let _disable_malloc = ScopedDisableMalloc::new();

    let sender = match pipe.open_sender() {
        Ok(sender) => sender,
        Err(_) => return EXIT_CAPTURE_OR_FORK,
    };

    let mut unreachable = MemUnreachable::new(parent_pid, arena);
    if !unreachable.collect_allocations(thread_info, mappings) {
        return EXIT_COLLECT;
    }
    let num_allocations = unreachable.allocations();
    let allocation_bytes = unreachable.allocation_bytes();

    let (leaks, num_leaks, leak_bytes) = unreachable.unreachable_leaks(limit);

    let ok = sender.send(&num_allocations).is_ok()
        && sender.send(&allocation_bytes).is_ok()
        && sender.send(&num_leaks).is_ok()
        && sender.send(&leak_bytes).is_ok()
        && sender.send_vector(&*leaks).is_ok();
    if !ok {
        return EXIT_PIPE;
    }

    EXIT_OK
}

/// Lets `tid` ptrace us even under a restrictive yama scope. Best effort;
/// kernels without yama reject the prctl and need no exception.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn allow_ptrace_from(tid: i32) {
    unsafe {
        libc::prctl(
            libc::PR_SET_PTRACER,
            tid as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn allow_ptrace_from(_tid: i32) {}
