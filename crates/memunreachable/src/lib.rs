//! An unreachable-memory detector for the running process.
//!
//! `memunreachable` is a debugging probe: it finds heap allocations that are
//! no longer reachable from any live root (CPU registers, thread stacks,
//! mapped globals) and reports them, without ever reclaiming anything. It is
//! aimed at programs that do not otherwise run a tracing collector.
//!
//! # How a collection works
//!
//! 1. The allocator is frozen and a capture thread is spawned via raw
//!    `clone(2)` (thread creation would allocate).
//! 2. The capture thread ptrace-stops every sibling thread, snapshots their
//!    register files and stack pointers, and reads the process memory map.
//! 3. It releases the original thread, posts a semaphore, and forks. The
//!    fork hands the child a consistent copy-on-write image of the frozen
//!    heap; the child can allocate freely against its own copy.
//! 4. The child classifies mappings, seeds a conservative heap walker with
//!    every known allocation, marks from globals, stacks, and registers,
//!    sweeps, and streams the result back over a pipe.
//!
//! The scan is conservative: any pointer-width word whose value lands inside
//! a known allocation keeps that allocation alive, interior pointers
//! included. Reachability is overapproximated; nothing is ever reclaimed, so
//! the worst case is an unreported leak, never a false reclaim.
//!
//! # Quick start
//!
//! ```ignore
//! // Log up to 100 leaks, with a hex dump of each.
//! memunreachable::log_unreachable_memory(true, 100)?;
//!
//! // Or inspect the report programmatically.
//! let info = memunreachable::get_unreachable_memory(100)?;
//! for leak in &info.leaks {
//!     println!("{:#x}: {} bytes", leak.begin, leak.size);
//! }
//! ```
//!
//! # Platform
//!
//! Linux and Android. The allocator's enumeration and freeze hooks
//! (`malloc_iterate`, `malloc_disable`, `malloc_enable`) are only live on
//! Bionic; elsewhere collections run but see no heap allocations.

#![warn(missing_docs)]

mod capture;
mod classify;
mod collector;
mod error;
mod ffi;
mod freeze;
mod maps;
mod pipe;
mod ptracer;
mod report;
mod sem;

/// Arena storage internals.
///
/// Public for integration tests and embedders that need allocator-free
/// containers; most users never touch this directly.
pub mod arena;

/// Heap-walker internals.
///
/// Public for integration tests and for embedders that already hold their
/// own allocation lists. Normal use goes through [`get_unreachable_memory`].
pub mod walker;

pub use collector::{get_unreachable_memory, log_unreachable_memory};
pub use error::{CollectError, Result};
pub use report::{Leak, UnreachableMemoryInfo, CONTENTS_LEN};
