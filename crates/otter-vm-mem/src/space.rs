//! Space and allocator tags shared by accounting and allocation

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Accounting bucket for a piece of memory.
///
/// Every allocation and accounting call is tagged with exactly one.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpaceType {
    /// Regular movable heap objects
    Object = 0,
    /// Objects too large for regular regions, never moved
    HumongousObject = 1,
    /// Heap objects pinned in place
    NonMovableObject = 2,
    /// VM bookkeeping served by the internal allocator
    Internal = 3,
    /// Interpreter frames
    Frames = 4,
    /// Native thread stacks
    NativeStacks = 5,
    /// Generated machine code
    Code = 6,
    /// Compiler scratch memory
    Compiler = 7,
}

/// Number of space types
pub const SPACE_TYPE_COUNT: usize = 8;

impl SpaceType {
    /// All space types in index order
    pub const ALL: [SpaceType; SPACE_TYPE_COUNT] = [
        SpaceType::Object,
        SpaceType::HumongousObject,
        SpaceType::NonMovableObject,
        SpaceType::Internal,
        SpaceType::Frames,
        SpaceType::NativeStacks,
        SpaceType::Code,
        SpaceType::Compiler,
    ];

    /// Dense index for counter arrays
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            SpaceType::Object => "object",
            SpaceType::HumongousObject => "humongous object",
            SpaceType::NonMovableObject => "non-movable object",
            SpaceType::Internal => "internal",
            SpaceType::Frames => "frames",
            SpaceType::NativeStacks => "native stacks",
            SpaceType::Code => "code",
            SpaceType::Compiler => "compiler",
        }
    }

    /// True for spaces holding managed heap objects
    #[inline]
    pub const fn is_heap_space(self) -> bool {
        matches!(
            self,
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject
        )
    }
}

/// Selects between the shared small tier and the calling thread's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocScope {
    /// Shared small-tier allocator
    Global,
    /// Calling thread's private small-tier allocator
    Local,
}

/// Kind of tier allocator a pool is lent to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorType {
    /// Small fixed-slot allocator
    RunSlots,
    /// Large first-fit allocator
    FreeList,
    /// One object per pool
    Humongous,
    /// Forwarding to the global allocator
    MallocProxy,
}

/// Identity of one tier-allocator instance.
///
/// The pool manager records the owner of every pool so that `free` can route
/// a pointer back to the instance that handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(NonZeroUsize);

static NEXT_OWNER_ID: AtomicUsize = AtomicUsize::new(1);

impl OwnerId {
    /// Allocate a fresh, process-unique owner id
    pub fn next() -> Self {
        let raw = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        // Counter starts at 1 and would need 2^64 owners to wrap.
        match NonZeroUsize::new(raw) {
            Some(id) => OwnerId(id),
            None => panic!("owner id space exhausted"),
        }
    }

    /// Raw value
    #[inline]
    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Result of a reverse address lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorInfo {
    /// Tier kind owning the address
    pub allocator_type: AllocatorType,
    /// Tier instance owning the address
    pub owner: OwnerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_type_indices_are_dense() {
        for (i, space) in SpaceType::ALL.iter().enumerate() {
            assert_eq!(space.index(), i);
        }
    }

    #[test]
    fn test_heap_spaces() {
        assert!(SpaceType::Object.is_heap_space());
        assert!(SpaceType::HumongousObject.is_heap_space());
        assert!(!SpaceType::Internal.is_heap_space());
        assert!(!SpaceType::Compiler.is_heap_space());
    }

    #[test]
    fn test_owner_ids_unique() {
        let a = OwnerId::next();
        let b = OwnerId::next();
        assert_ne!(a, b);
        assert!(a.get() > 0);
    }
}
