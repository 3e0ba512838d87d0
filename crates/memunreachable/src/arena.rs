//! Slab arena backing every per-collection container.
//!
//! While the process allocator is frozen, any touch of the global heap would
//! deadlock or observe torn state, so all temporary storage built during a
//! collection (mappings, thread info, the allocation index, leak lists)
//! lives here. Slabs come straight from [`sys_mem`] mappings and the whole
//! arena is released wholesale when the last handle drops.
//!
//! Slabs are tagged `[anon:leak_detector_malloc]` in the kernel map so the
//! mapping classifier can keep the arena itself out of the root set.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

const DEFAULT_SLAB_BYTES: usize = 4 * 1024 * 1024;
const ARENA_TAG: &std::ffi::CStr = c"leak_detector_malloc";

/// One mapped slab. The node itself lives at the base of the mapping it
/// describes, so the chain needs no storage outside the arena.
struct SlabNode {
    map: sys_mem::Mmap,
    next: Option<NonNull<SlabNode>>,
}

struct ArenaState {
    head: Option<NonNull<SlabNode>>,
    cursor: usize,
    end: usize,
}

struct ArenaInner {
    state: Mutex<ArenaState>,
}

// Raw slab pointers are only reached through the mutex.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

/// A handle to a slab arena.
///
/// Handles are cheap to clone and may be shared across threads and across
/// `fork`; each collection uses a fresh arena root. Allocation never frees:
/// memory is reclaimed all at once when the last handle is dropped.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl Arena {
    /// Creates an arena with its first slab already mapped.
    ///
    /// Construct before entering the freeze window so the initial mapping
    /// and the handle's refcount block come from a healthy heap; everything
    /// after that is served from slabs.
    pub fn new() -> std::io::Result<Self> {
        let arena = Self {
            inner: Arc::new(ArenaInner {
                state: Mutex::new(ArenaState {
                    head: None,
                    cursor: 0,
                    end: 0,
                }),
            }),
        };
        let mut state = arena.inner.state.lock();
        Self::grow(&mut state, DEFAULT_SLAB_BYTES)?;
        drop(state);
        Ok(arena)
    }

    /// Allocates `layout` from the arena.
    ///
    /// Never returns null. If the operating system refuses a new slab the
    /// process is aborted: the collection runs inside a freeze window where
    /// unwinding is not survivable.
    pub fn alloc(&self, layout: Layout) -> NonNull<u8> {
        let mut state = self.inner.state.lock();

        let aligned = align_up(state.cursor, layout.align());
        if aligned.checked_add(layout.size()).is_some_and(|e| e <= state.end) {
            state.cursor = aligned + layout.size();
            // SAFETY: aligned lies within a live slab mapping.
            return unsafe { NonNull::new_unchecked(aligned as *mut u8) };
        }

        let needed = layout.size() + layout.align() + std::mem::size_of::<SlabNode>();
        let slab_bytes = needed.max(DEFAULT_SLAB_BYTES);
        if let Err(e) = Self::grow(&mut state, slab_bytes) {
            tracing::error!("arena slab allocation of {} bytes failed: {}", slab_bytes, e);
            std::process::abort();
        }

        let aligned = align_up(state.cursor, layout.align());
        debug_assert!(aligned + layout.size() <= state.end);
        state.cursor = aligned + layout.size();
        // SAFETY: the slab just grown covers [aligned, aligned + size).
        unsafe { NonNull::new_unchecked(aligned as *mut u8) }
    }

    fn grow(state: &mut ArenaState, min_bytes: usize) -> std::io::Result<()> {
        let page = sys_mem::page_size();
        let len = align_up(min_bytes, page);

        // SAFETY: plain private anonymous mapping, owned by the node below.
        let map = unsafe {
            sys_mem::MmapOptions::new()
                .len(len)
                .no_reserve(true)
                .map_anon()?
        };
        // Best effort: kernels without PR_SET_VMA_ANON_NAME leave the slab
        // nameless and the classifier sees it as a plain anonymous mapping.
        let _ = map.set_name(ARENA_TAG);

        let base = map.ptr();
        let node = base.cast::<SlabNode>();
        // SAFETY: the mapping is fresh, writable, and large enough for the
        // node header; `map` ownership moves into the slab itself.
        unsafe {
            ptr::write(
                node,
                SlabNode {
                    map,
                    next: state.head,
                },
            );
        }
        state.head = NonNull::new(node);
        state.cursor = base as usize + std::mem::size_of::<SlabNode>();
        state.end = base as usize + len;
        Ok(())
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut head = state.head.take();
        while let Some(node) = head {
            // SAFETY: the node was written by `grow` and is read exactly once;
            // the bits are moved out before the mapping beneath them is
            // unmapped by dropping `slab.map`.
            let slab = unsafe { ptr::read(node.as_ptr()) };
            head = slab.next;
            drop(slab.map);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Arena")
            .field("remaining", &(state.end - state.cursor))
            .finish()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A growable vector whose storage comes from an [`Arena`].
///
/// Functionally a pared-down `Vec<T>`: push, insert, truncate, and slice
/// access. Growth abandons the old block (the arena never frees), which is
/// the right trade for short-lived per-collection containers.
pub struct ArenaVec<T> {
    arena: Arena,
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ArenaVec<T> {}
unsafe impl<T: Sync> Sync for ArenaVec<T> {}

impl<T> ArenaVec<T> {
    /// Creates an empty vector tied to `arena`.
    pub fn new(arena: &Arena) -> Self {
        Self {
            arena: arena.clone(),
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
            _marker: PhantomData,
        }
    }

    /// Creates a vector with room for `cap` elements.
    pub fn with_capacity(arena: &Arena, cap: usize) -> Self {
        let mut v = Self::new(arena);
        if cap > 0 {
            v.reserve_exact(cap);
        }
        v
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if no elements are live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends an element.
    pub fn push(&mut self, value: T) {
        if self.len == self.cap {
            self.reserve_exact(grow_cap(self.cap));
        }
        // SAFETY: len < cap after the reserve above.
        unsafe {
            ptr::write(self.ptr.as_ptr().add(self.len), value);
        }
        self.len += 1;
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: index len was initialized and is now out of the live range.
        Some(unsafe { ptr::read(self.ptr.as_ptr().add(self.len)) })
    }

    /// Inserts `value` at `index`, shifting the tail right.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&mut self, index: usize, value: T) {
        assert!(index <= self.len, "insert index out of bounds");
        if self.len == self.cap {
            self.reserve_exact(grow_cap(self.cap));
        }
        // SAFETY: capacity holds len + 1; the tail move stays in bounds.
        unsafe {
            let p = self.ptr.as_ptr().add(index);
            ptr::copy(p, p.add(1), self.len - index);
            ptr::write(p, value);
        }
        self.len += 1;
    }

    /// Shortens the vector to `len` elements, dropping the tail.
    pub fn truncate(&mut self, len: usize) {
        while self.len > len {
            let _ = self.pop();
        }
    }

    /// Drops all elements. The backing storage stays with the arena.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    fn reserve_exact(&mut self, new_cap: usize) {
        if new_cap <= self.cap {
            return;
        }
        let layout = Layout::array::<T>(new_cap).expect("capacity overflow");
        let new_ptr = self.arena.alloc(layout).cast::<T>();
        if self.len > 0 {
            // SAFETY: both blocks are arena-owned and disjoint; the old block
            // is simply abandoned afterwards.
            unsafe {
                ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
            }
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
    }
}

impl<T: Copy> ArenaVec<T> {
    /// Appends all elements of `other`.
    pub fn extend_from_slice(&mut self, other: &[T]) {
        if self.len + other.len() > self.cap {
            self.reserve_exact(grow_cap(self.cap).max(self.len + other.len()));
        }
        // SAFETY: capacity was just ensured; source and destination are
        // distinct allocations.
        unsafe {
            ptr::copy_nonoverlapping(
                other.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                other.len(),
            );
        }
        self.len += other.len();
    }
}

fn grow_cap(cap: usize) -> usize {
    if cap == 0 {
        4
    } else {
        cap * 2
    }
}

impl<T> Deref for ArenaVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: [ptr, ptr + len) holds initialized elements.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for ArenaVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: see Deref.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for ArenaVec<T> {
    fn drop(&mut self) {
        // SAFETY: drops each live element once; storage is reclaimed with
        // the arena, not here.
        unsafe {
            ptr::drop_in_place(std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len));
        }
    }
}

impl<'a, T> IntoIterator for &'a ArenaVec<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ArenaVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment() {
        let arena = Arena::new().unwrap();
        for align in [1usize, 2, 4, 8, 16, 64, 4096] {
            let p = arena.alloc(Layout::from_size_align(3, align).unwrap());
            assert_eq!(p.as_ptr() as usize % align, 0, "align {align}");
        }
    }

    #[test]
    fn alloc_larger_than_slab() {
        let arena = Arena::new().unwrap();
        let layout = Layout::from_size_align(3 * DEFAULT_SLAB_BYTES, 8).unwrap();
        let p = arena.alloc(layout);
        // The whole block must be writable.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xab, layout.size());
        }
    }

    #[test]
    fn vec_push_and_growth() {
        let arena = Arena::new().unwrap();
        let mut v = ArenaVec::new(&arena);
        for i in 0..10_000usize {
            v.push(i);
        }
        assert_eq!(v.len(), 10_000);
        assert_eq!(v[0], 0);
        assert_eq!(v[9_999], 9_999);
        assert_eq!(v.iter().sum::<usize>(), 9_999 * 10_000 / 2);
    }

    #[test]
    fn vec_insert_keeps_order() {
        let arena = Arena::new().unwrap();
        let mut v = ArenaVec::new(&arena);
        v.push(1);
        v.push(3);
        v.insert(1, 2);
        v.insert(0, 0);
        assert_eq!(&*v, &[0, 1, 2, 3]);
    }

    #[test]
    fn vec_drops_elements() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let arena = Arena::new().unwrap();
        let mut v = ArenaVec::new(&arena);
        for _ in 0..7 {
            v.push(Counted);
        }
        v.truncate(3);
        assert_eq!(DROPS.load(Ordering::SeqCst), 4);
        drop(v);
        assert_eq!(DROPS.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn vec_of_vecs() {
        let arena = Arena::new().unwrap();
        let mut outer: ArenaVec<ArenaVec<u8>> = ArenaVec::new(&arena);
        for i in 0..4u8 {
            let mut inner = ArenaVec::new(&arena);
            inner.extend_from_slice(&[i; 16]);
            outer.push(inner);
        }
        assert_eq!(outer[3][15], 3);
    }

    #[test]
    fn arena_shared_across_threads() {
        let arena = Arena::new().unwrap();
        let handle = arena.clone();
        let join = std::thread::spawn(move || {
            let mut v = ArenaVec::new(&handle);
            for i in 0..100usize {
                v.push(i * 2);
            }
            v.iter().sum::<usize>()
        });
        let mut local = ArenaVec::new(&arena);
        local.push(1usize);
        assert_eq!(join.join().unwrap(), 9_900);
        assert_eq!(local[0], 1);
    }

    #[test]
    fn sort_is_in_place() {
        let arena = Arena::new().unwrap();
        let mut v = ArenaVec::new(&arena);
        for i in [5usize, 1, 4, 2, 3] {
            v.push(i);
        }
        v.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(&*v, &[5, 4, 3, 2, 1]);
    }
}
