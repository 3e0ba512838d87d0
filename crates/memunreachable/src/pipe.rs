//! Typed message channel between the collector child and the parent.
//!
//! Built from an OS pipe plus a one-page shared anonymous mapping. The pipe
//! carries the data; the shared page carries two claim words so that across
//! the whole process family each end is bound exactly once. Receive treats
//! end-of-stream as peer death, which is how a crashed child fails the
//! collection instead of hanging it.

use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use parking_lot::Mutex;

use crate::error::{CollectError, Result};

/// Marker for types whose byte image can cross the pipe unmodified.
///
/// # Safety
///
/// Implementors must be plain old data: `Copy`, no padding-dependent
/// invariants, and valid for any bit pattern the peer may send. Both ends
/// run in the same process image, so layout and endianness always agree.
pub unsafe trait Plain: Copy {}

unsafe impl Plain for usize {}

fn zeroed<T: Plain>() -> T {
    // SAFETY: Plain types are valid for any bit pattern, including zeroes.
    unsafe { mem::zeroed() }
}

struct PipeFds {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

/// The unbound channel, created before `fork` so both sides inherit it.
pub struct LeakPipe {
    fds: Mutex<PipeFds>,
    ctrl: sys_mem::Mmap,
}

const SENDER_CLAIM: usize = 0;
const RECEIVER_CLAIM: usize = 1;

impl LeakPipe {
    pub fn new() -> Result<Self> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(CollectError::Pipe)?;

        // SAFETY: fresh shared page, used only through the atomics below.
        let ctrl = unsafe {
            sys_mem::MmapOptions::new()
                .len(sys_mem::page_size())
                .shared(true)
                .map_anon()
                .map_err(|e| {
                    CollectError::Pipe(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
                })?
        };

        Ok(Self {
            fds: Mutex::new(PipeFds {
                read: Some(read),
                write: Some(write),
            }),
            ctrl,
        })
    }

    fn claim(&self, which: usize) -> Result<()> {
        // SAFETY: the control page outlives the pipe and holds one AtomicU32
        // per claim slot; the shared mapping makes the CAS visible to every
        // process that inherited it.
        let word = unsafe { &*self.ctrl.ptr().cast::<AtomicU32>().add(which) };
        word.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                tracing::error!("leak pipe end {} bound twice", which);
                CollectError::Pipe(Errno::EBUSY)
            })?;
        Ok(())
    }

    /// Binds the sending side, taking ownership of the write end.
    pub fn open_sender(&self) -> Result<LeakPipeSender> {
        self.claim(SENDER_CLAIM)?;
        let fd = self
            .fds
            .lock()
            .write
            .take()
            .ok_or(CollectError::Pipe(Errno::EBADF))?;
        Ok(LeakPipeSender { fd })
    }

    /// Binds the receiving side, taking ownership of the read end.
    ///
    /// Also closes this process's copy of the write end, so that once every
    /// sending process exits the receiver observes end-of-stream.
    pub fn open_receiver(&self) -> Result<LeakPipeReceiver> {
        self.claim(RECEIVER_CLAIM)?;
        let mut fds = self.fds.lock();
        fds.write = None;
        let fd = fds.read.take().ok_or(CollectError::Pipe(Errno::EBADF))?;
        Ok(LeakPipeReceiver { fd })
    }
}

/// Owns the write end; lives in the collector child.
pub struct LeakPipeSender {
    fd: OwnedFd,
}

impl LeakPipeSender {
    fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < bytes.len() {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    bytes[sent..].as_ptr().cast(),
                    bytes.len() - sent,
                )
            };
            if n < 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                tracing::error!("leak pipe write failed: {}", errno);
                return Err(CollectError::Pipe(errno));
            }
            sent += n as usize;
        }
        Ok(())
    }

    /// Sends the byte image of `value`.
    pub fn send<T: Plain>(&self, value: &T) -> Result<()> {
        // SAFETY: Plain guarantees the byte image is the whole message.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
        };
        self.send_bytes(bytes)
    }

    /// Sends a length header followed by the elements' byte image.
    pub fn send_vector<T: Plain>(&self, values: &[T]) -> Result<()> {
        self.send(&values.len())?;
        // SAFETY: see send.
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), mem::size_of_val(values))
        };
        self.send_bytes(bytes)
    }
}

/// Owns the read end; lives in the parent.
pub struct LeakPipeReceiver {
    fd: OwnedFd,
}

impl LeakPipeReceiver {
    fn receive_bytes(&self, buf: &mut [u8]) -> Result<()> {
        let mut received = 0;
        while received < buf.len() {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf[received..].as_mut_ptr().cast(),
                    buf.len() - received,
                )
            };
            if n < 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                tracing::error!("leak pipe read failed: {}", errno);
                return Err(CollectError::Pipe(errno));
            }
            if n == 0 {
                tracing::error!("leak pipe closed before the full message arrived");
                return Err(CollectError::ChildExited);
            }
            received += n as usize;
        }
        Ok(())
    }

    /// Receives one `T` by byte image.
    pub fn receive<T: Plain>(&self) -> Result<T> {
        let mut value = zeroed::<T>();
        // SAFETY: writing size_of::<T> bytes into a Plain T is always valid.
        let buf = unsafe {
            std::slice::from_raw_parts_mut((&mut value as *mut T).cast::<u8>(), mem::size_of::<T>())
        };
        self.receive_bytes(buf)?;
        Ok(value)
    }

    /// Receives a length header, then that many elements.
    pub fn receive_vector<T: Plain>(&self) -> Result<Vec<T>> {
        let len: usize = self.receive()?;
        len.checked_mul(mem::size_of::<T>())
            .ok_or(CollectError::Pipe(Errno::EPROTO))?;
        let mut values = vec![zeroed::<T>(); len];
        // SAFETY: the vector's buffer is len * size_of::<T> writable bytes.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                values.as_mut_ptr().cast::<u8>(),
                mem::size_of_val(values.as_slice()),
            )
        };
        self.receive_bytes(buf)?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    #[repr(C)]
    struct Record {
        begin: usize,
        size: usize,
    }
    unsafe impl Plain for Record {}

    #[test]
    fn header_and_vector_round_trip() {
        let pipe = LeakPipe::new().unwrap();
        let sender = pipe.open_sender().unwrap();
        let receiver = pipe.open_receiver().unwrap();

        let writer = std::thread::spawn(move || {
            sender.send(&7usize).unwrap();
            sender
                .send_vector(&[
                    Record { begin: 0x1000, size: 32 },
                    Record { begin: 0x2000, size: 64 },
                ])
                .unwrap();
        });

        assert_eq!(receiver.receive::<usize>().unwrap(), 7);
        let records: Vec<Record> = receiver.receive_vector().unwrap();
        assert_eq!(
            records,
            vec![
                Record { begin: 0x1000, size: 32 },
                Record { begin: 0x2000, size: 64 },
            ]
        );
        writer.join().unwrap();
    }

    #[test]
    fn empty_vector_round_trip() {
        let pipe = LeakPipe::new().unwrap();
        let sender = pipe.open_sender().unwrap();
        let receiver = pipe.open_receiver().unwrap();
        sender.send_vector::<Record>(&[]).unwrap();
        let records: Vec<Record> = receiver.receive_vector().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn each_end_binds_exactly_once() {
        let pipe = LeakPipe::new().unwrap();
        let _sender = pipe.open_sender().unwrap();
        assert!(matches!(
            pipe.open_sender(),
            Err(CollectError::Pipe(Errno::EBUSY))
        ));
        let _receiver = pipe.open_receiver().unwrap();
        assert!(pipe.open_receiver().is_err());
    }

    #[test]
    fn peer_death_reads_as_child_exited() {
        let pipe = LeakPipe::new().unwrap();
        let sender = pipe.open_sender().unwrap();
        let receiver = pipe.open_receiver().unwrap();
        drop(sender);
        assert!(matches!(
            receiver.receive::<usize>(),
            Err(CollectError::ChildExited)
        ));
    }

    #[test]
    fn partial_message_then_death_fails() {
        let pipe = LeakPipe::new().unwrap();
        let sender = pipe.open_sender().unwrap();
        let receiver = pipe.open_receiver().unwrap();
        // Send a length header promising more than will ever arrive.
        sender.send(&1000usize).unwrap();
        drop(sender);
        assert!(matches!(
            receiver.receive_vector::<Record>(),
            Err(CollectError::ChildExited)
        ));
    }
}
