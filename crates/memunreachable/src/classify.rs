//! Partitions the process memory map into root and allocation sources.
//!
//! Writable data mappings of a shared object carry the object's pathname and
//! follow its executable mapping in the file, so the classifier tracks the
//! most recent executable mapping's name while walking the list in order.

use crate::arena::{Arena, ArenaVec};
use crate::maps::Mapping;

/// Arena slabs are tagged with this pseudo-name; they must be neither a root
/// nor an allocation, or the collector would scan its own bookkeeping.
pub const ARENA_MAPPING_NAME: &str = "[anon:leak_detector_malloc]";

/// The memory map partitioned by role.
pub struct ClassifiedMappings {
    /// Mappings backing the managed heap; enumerated for allocations.
    pub heap: ArenaVec<Mapping>,
    /// Unnamed allocator-owned regions treated as single allocations.
    ///
    /// Under the current rules named anonymous mappings fold into `globals`
    /// (distinguishing a named `mmap` from a named `.data` region is not
    /// possible from the map alone), so this list stays empty; the walk over
    /// it is kept because the partition is part of the collection contract.
    pub anon: ArenaVec<Mapping>,
    /// Writable globals, `.data`/`.rodata`, and managed-runtime heaps; roots.
    pub globals: ArenaVec<Mapping>,
    /// Thread stacks; roots, clipped to each thread's live extent.
    pub stacks: ArenaVec<Mapping>,
}

/// Applies the classification rules to `mappings`, in file order.
pub fn classify_mappings(arena: &Arena, mappings: &[Mapping]) -> ClassifiedMappings {
    let mut out = ClassifiedMappings {
        heap: ArenaVec::new(arena),
        anon: ArenaVec::new(arena),
        globals: ArenaVec::new(arena),
        stacks: ArenaVec::new(arena),
    };

    let mut current_lib: Option<Mapping> = None;

    for mapping in mappings {
        if mapping.execute {
            current_lib = Some(*mapping);
            continue;
        }

        if !mapping.read {
            continue;
        }

        let name = mapping.name();
        if name == "[anon:.bss]" {
            // named .bss section
            out.globals.push(*mapping);
        } else if current_lib.as_ref().is_some_and(|lib| lib.name() == name) {
            // .rodata or .data section
            out.globals.push(*mapping);
        } else if name == "[anon:libc_malloc]" {
            // named malloc mapping
            out.heap.push(*mapping);
        } else if name.starts_with("/dev/ashmem/dalvik") {
            // named managed-runtime heap mapping
            out.globals.push(*mapping);
        } else if name.starts_with("[stack") {
            // named stack mapping
            out.stacks.push(*mapping);
        } else if name.is_empty() {
            out.globals.push(*mapping);
        } else if name.starts_with("[anon:") && name != ARENA_MAPPING_NAME {
            // Named anonymous mappings cannot be told apart from named .bss
            // or .data regions, so they count as globals rather than
            // allocations; memory behind them is never reported leaked.
            out.globals.push(*mapping);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(mappings: &[Mapping]) -> ClassifiedMappings {
        let arena = Arena::new().unwrap();
        classify_mappings(&arena, mappings)
    }

    fn rw(begin: usize, end: usize, name: &str) -> Mapping {
        Mapping::new(begin, end, true, true, false, name)
    }

    #[test]
    fn executable_mappings_are_skipped_but_remembered() {
        let c = classify(&[
            Mapping::new(0x1000, 0x2000, true, false, true, "/system/lib/libfoo.so"),
            rw(0x2000, 0x3000, "/system/lib/libfoo.so"),
        ]);
        assert_eq!(c.globals.len(), 1);
        assert_eq!(c.globals[0].begin, 0x2000);
        assert!(c.heap.is_empty() && c.stacks.is_empty());
    }

    #[test]
    fn library_data_without_preceding_text_is_dropped() {
        let c = classify(&[rw(0x2000, 0x3000, "/system/lib/libfoo.so")]);
        assert!(c.globals.is_empty());
        assert!(c.heap.is_empty());
    }

    #[test]
    fn unreadable_mappings_are_dropped() {
        let c = classify(&[Mapping::new(0x1000, 0x2000, false, false, false, "")]);
        assert!(c.globals.is_empty());
    }

    #[test]
    fn named_bss_is_global() {
        let c = classify(&[rw(0x1000, 0x2000, "[anon:.bss]")]);
        assert_eq!(c.globals.len(), 1);
    }

    #[test]
    fn malloc_arena_is_heap() {
        let c = classify(&[rw(0x1000, 0x2000, "[anon:libc_malloc]")]);
        assert_eq!(c.heap.len(), 1);
        assert!(c.globals.is_empty());
    }

    #[test]
    fn dalvik_ashmem_is_global() {
        let c = classify(&[rw(0x1000, 0x2000, "/dev/ashmem/dalvik-main space")]);
        assert_eq!(c.globals.len(), 1);
    }

    #[test]
    fn stack_mappings_are_stacks() {
        let c = classify(&[
            rw(0x1000, 0x2000, "[stack]"),
            rw(0x3000, 0x4000, "[stack:421]"),
        ]);
        assert_eq!(c.stacks.len(), 2);
    }

    #[test]
    fn nameless_mapping_is_global() {
        let c = classify(&[rw(0x1000, 0x2000, "")]);
        assert_eq!(c.globals.len(), 1);
    }

    #[test]
    fn named_anon_is_global_except_collector_arena() {
        let c = classify(&[
            rw(0x1000, 0x2000, "[anon:scudo:primary]"),
            rw(0x3000, 0x4000, ARENA_MAPPING_NAME),
        ]);
        assert_eq!(c.globals.len(), 1);
        assert_eq!(c.globals[0].begin, 0x1000);
    }

    #[test]
    fn unknown_named_mapping_is_dropped() {
        let c = classify(&[rw(0x1000, 0x2000, "/dev/binder")]);
        assert!(c.globals.is_empty() && c.heap.is_empty());
        assert!(c.anon.is_empty() && c.stacks.is_empty());
    }
}
