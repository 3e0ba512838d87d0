//! Freezes sibling threads and snapshots their register files.
//!
//! Every thread of the target process is attached with `PTRACE_SEIZE` +
//! `PTRACE_INTERRUPT` and held stopped until released. Between the return of
//! [`ThreadCapture::capture_all`] and a thread's release, that thread's
//! memory and registers are quiescent and may be read freely.
//!
//! Runs inside the freeze window: thread enumeration goes through raw
//! `getdents64` instead of the directory APIs, which would allocate.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::arena::{Arena, ArenaVec};
use crate::error::{CollectError, Result};
use crate::maps::{proc_path, FdGuard};

/// Upper bound on a register-file image. The largest `NT_PRSTATUS` set on
/// supported architectures is well under this.
pub const REGS_BUF_LEN: usize = 512;

const NT_PRSTATUS: libc::c_int = 1;

/// An opaque copy of one thread's general-purpose register file.
///
/// Aligned so the architecture's register struct can be read back out of it.
#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub struct RegisterBlob {
    bytes: [u8; REGS_BUF_LEN],
    len: usize,
}

impl RegisterBlob {
    /// The captured bytes; scanned verbatim as a root.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Registers and stack position of one captured thread.
#[derive(Clone, Copy)]
pub struct ThreadInfo {
    pub tid: i32,
    pub regs: RegisterBlob,
    /// The thread's stack pointer; lies within one of the stack mappings.
    pub stack_pointer: usize,
}

/// Owns the paused state of the target's threads.
///
/// Threads captured by [`capture_all`](Self::capture_all) stay stopped until
/// [`release_one`](Self::release_one) / [`release_all`](Self::release_all);
/// dropping the capture releases everything still held.
pub struct ThreadCapture {
    pid: i32,
    arena: Arena,
    captured: ArenaVec<i32>,
}

impl ThreadCapture {
    pub fn new(pid: i32, arena: &Arena) -> Self {
        Self {
            pid,
            arena: arena.clone(),
            captured: ArenaVec::new(arena),
        }
    }

    /// Attaches every thread of the target process.
    ///
    /// Enumeration is repeated until a scan finds nothing new, so threads
    /// spawned mid-sweep are still caught (they are stopped, hence cannot
    /// spawn more). Threads that exit during the race are skipped; any other
    /// attach failure aborts the capture.
    pub fn capture_all(&mut self) -> Result<()> {
        loop {
            let mut tids = ArenaVec::new(&self.arena);
            self.list_threads(&mut tids)?;

            let mut new_threads = false;
            for &tid in &tids {
                if self.captured.contains(&tid) {
                    continue;
                }
                if self.capture_thread(tid)? {
                    self.captured.push(tid);
                    new_threads = true;
                }
            }
            if !new_threads {
                return Ok(());
            }
        }
    }

    /// Reads each captured thread's register file and stack pointer.
    pub fn captured_info(&mut self, out: &mut ArenaVec<ThreadInfo>) -> Result<()> {
        for i in 0..self.captured.len() {
            let tid = self.captured[i];
            if let Some(info) = Self::thread_info(tid)? {
                out.push(info);
            }
        }
        Ok(())
    }

    fn thread_info(tid: i32) -> Result<Option<ThreadInfo>> {
        let mut regs = RegisterBlob {
            bytes: [0; REGS_BUF_LEN],
            len: 0,
        };
        let mut iov = libc::iovec {
            iov_base: regs.bytes.as_mut_ptr().cast(),
            iov_len: REGS_BUF_LEN,
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid,
                NT_PRSTATUS as usize as *mut libc::c_void,
                std::ptr::addr_of_mut!(iov),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            if errno == Errno::ESRCH {
                return Ok(None);
            }
            tracing::error!("failed to read registers of thread {}: {}", tid, errno);
            return Err(CollectError::ThreadCapture { tid, source: errno });
        }
        regs.len = iov.iov_len;

        let Some(stack_pointer) = stack_pointer(&regs) else {
            tracing::error!("register set of thread {} is truncated", tid);
            return Err(CollectError::ThreadCapture {
                tid,
                source: Errno::EINVAL,
            });
        };

        Ok(Some(ThreadInfo {
            tid,
            regs,
            stack_pointer,
        }))
    }

    /// Resumes one thread, typically the original thread so it can drop the
    /// allocator locks before the collector forks.
    pub fn release_one(&mut self, tid: i32) {
        if let Some(pos) = self.captured.iter().position(|&t| t == tid) {
            Self::detach(tid);
            let last = self.captured.len() - 1;
            self.captured.swap(pos, last);
            self.captured.pop();
        }
    }

    /// Resumes every thread still captured.
    pub fn release_all(&mut self) {
        while let Some(tid) = self.captured.pop() {
            Self::detach(tid);
        }
    }

    fn detach(tid: i32) {
        // A thread that exited while stopped reports ESRCH; nothing to undo.
        let _ = ptrace::detach(Pid::from_raw(tid), None);
    }

    /// Seizes and interrupts `tid`, waiting until it reports stopped.
    ///
    /// Returns `Ok(false)` if the thread exited before it could be held.
    fn capture_thread(&self, tid: i32) -> Result<bool> {
        let pid = Pid::from_raw(tid);

        match ptrace::seize(pid, ptrace::Options::empty()) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(false),
            Err(e) => {
                tracing::error!("failed to attach to thread {}: {}", tid, e);
                return Err(CollectError::ThreadCapture { tid, source: e });
            }
        }

        match ptrace::interrupt(pid) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(false),
            Err(e) => {
                tracing::error!("failed to interrupt thread {}: {}", tid, e);
                return Err(CollectError::ThreadCapture { tid, source: e });
            }
        }

        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::PtraceEvent(..)) => {
                    return Ok(true);
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(false),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) | Err(Errno::ESRCH) => return Ok(false),
                Err(e) => {
                    tracing::error!("failed to wait for thread {} to stop: {}", tid, e);
                    return Err(CollectError::ThreadCapture { tid, source: e });
                }
            }
        }
    }

    /// Lists the target's thread ids from its per-task directory.
    fn list_threads(&self, out: &mut ArenaVec<i32>) -> Result<()> {
        let mut path = [0u8; 64];
        let path = proc_path(self.pid, "/task", &mut path);

        let fd = unsafe { libc::open(path, libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC) };
        if fd < 0 {
            let errno = Errno::last();
            tracing::error!("failed to open task directory of {}: {}", self.pid, errno);
            return Err(CollectError::ThreadCapture {
                tid: self.pid,
                source: errno,
            });
        }
        let fd = FdGuard(fd);

        // getdents64 wants an 8-aligned buffer; entries start with a u64.
        let mut storage = [0u64; 1024];
        loop {
            let n = unsafe {
                libc::syscall(
                    libc::SYS_getdents64,
                    fd.0,
                    storage.as_mut_ptr(),
                    std::mem::size_of_val(&storage),
                )
            };
            if n < 0 {
                let errno = Errno::last();
                tracing::error!("failed to list threads of {}: {}", self.pid, errno);
                return Err(CollectError::ThreadCapture {
                    tid: self.pid,
                    source: errno,
                });
            }
            if n == 0 {
                return Ok(());
            }

            let buf = unsafe {
                std::slice::from_raw_parts(storage.as_ptr().cast::<u8>(), n as usize)
            };
            let mut off = 0;
            while off < buf.len() {
                // struct linux_dirent64: ino u64, off i64, reclen u16,
                // type u8, then the NUL-terminated name.
                let reclen = u16::from_ne_bytes([buf[off + 16], buf[off + 17]]) as usize;
                let name = &buf[off + 19..off + reclen];
                if let Some(tid) = parse_tid(name) {
                    out.push(tid);
                }
                off += reclen;
            }
        }
    }
}

impl Drop for ThreadCapture {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn parse_tid(name: &[u8]) -> Option<i32> {
    let mut value: i32 = 0;
    let mut digits = 0;
    for &b in name {
        match b {
            0 => break,
            b'0'..=b'9' => {
                value = value.checked_mul(10)?.checked_add((b - b'0') as i32)?;
                digits += 1;
            }
            _ => return None,
        }
    }
    (digits > 0).then_some(value)
}

#[cfg(target_arch = "x86_64")]
fn stack_pointer(regs: &RegisterBlob) -> Option<usize> {
    if regs.len < std::mem::size_of::<libc::user_regs_struct>() {
        return None;
    }
    // SAFETY: the blob is 8-aligned and holds a full NT_PRSTATUS image.
    let user_regs = unsafe { &*regs.bytes.as_ptr().cast::<libc::user_regs_struct>() };
    Some(user_regs.rsp as usize)
}

#[cfg(target_arch = "aarch64")]
fn stack_pointer(regs: &RegisterBlob) -> Option<usize> {
    if regs.len < std::mem::size_of::<libc::user_regs_struct>() {
        return None;
    }
    // SAFETY: the blob is 8-aligned and holds a full NT_PRSTATUS image.
    let user_regs = unsafe { &*regs.bytes.as_ptr().cast::<libc::user_regs_struct>() };
    Some(user_regs.sp as usize)
}

#[cfg(target_arch = "x86")]
fn stack_pointer(regs: &RegisterBlob) -> Option<usize> {
    if regs.len < std::mem::size_of::<libc::user_regs_struct>() {
        return None;
    }
    // SAFETY: the blob is aligned and holds a full NT_PRSTATUS image.
    let user_regs = unsafe { &*regs.bytes.as_ptr().cast::<libc::user_regs_struct>() };
    Some(user_regs.esp as usize)
}

#[cfg(target_arch = "arm")]
fn stack_pointer(regs: &RegisterBlob) -> Option<usize> {
    if regs.len < std::mem::size_of::<libc::user_regs>() {
        return None;
    }
    // SAFETY: the blob is aligned and holds a full NT_PRSTATUS image.
    let user_regs = unsafe { &*regs.bytes.as_ptr().cast::<libc::user_regs>() };
    Some(user_regs.arm_sp as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tid_accepts_numbers_only() {
        assert_eq!(parse_tid(b"1234\0"), Some(1234));
        assert_eq!(parse_tid(b"7\0garbage"), Some(7));
        assert_eq!(parse_tid(b".\0"), None);
        assert_eq!(parse_tid(b"..\0"), None);
        assert_eq!(parse_tid(b"12a\0"), None);
        assert_eq!(parse_tid(b"\0"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lists_own_threads() {
        let arena = Arena::new().unwrap();
        let capture = ThreadCapture::new(std::process::id() as i32, &arena);
        let mut tids = ArenaVec::new(&arena);
        capture.list_threads(&mut tids).unwrap();
        let self_tid = unsafe { libc::gettid() } as i32;
        assert!(tids.contains(&self_tid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn captures_and_releases_a_child_process() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::ForkResult;

        // A quiet single-threaded victim.
        let child = match unsafe { nix::unistd::fork() }.expect("fork") {
            ForkResult::Child => {
                loop {
                    unsafe { libc::pause() };
                }
            }
            ForkResult::Parent { child } => child,
        };

        let arena = Arena::new().unwrap();
        {
            let mut capture = ThreadCapture::new(child.as_raw(), &arena);
            capture.capture_all().expect("capture_all");

            let mut info = ArenaVec::new(&arena);
            capture.captured_info(&mut info).expect("captured_info");
            assert_eq!(info.len(), 1);
            assert_eq!(info[0].tid, child.as_raw());
            assert_ne!(info[0].stack_pointer, 0);
            assert!(!info[0].regs.as_bytes().is_empty());

            capture.release_all();
        }

        kill(child, Signal::SIGKILL).unwrap();
        let _ = waitpid(child, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn capturing_a_dead_process_fails_or_finds_nothing() {
        let arena = Arena::new().unwrap();
        // PID 1 cannot be attached by an unprivileged test; a bogus high pid
        // has no task directory at all.
        let mut capture = ThreadCapture::new(i32::MAX - 1, &arena);
        assert!(capture.capture_all().is_err());
    }
}
