//! Memory pools and the pool manager
//!
//! A pool is a page-aligned chunk of raw memory. The pool manager owns every
//! pool and lends each one to exactly one tier-allocator instance until the
//! tier gives it back. The manager also answers the reverse question "which
//! tier instance owns this address?", which is how `free` finds its way home.
//!
//! Page allocation uses `std::alloc` with a page-aligned `Layout`.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::config::PoolManagerConfig;
use crate::space::{AllocatorInfo, AllocatorType, OwnerId, SPACE_TYPE_COUNT, SpaceType};

/// Pool granularity and alignment: 4KB.
pub const PAGE_SIZE: usize = 4096;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A chunk of raw memory lent by a `PoolManager`.
///
/// Deliberately not `Clone`: a pool has exactly one holder at a time.
#[derive(Debug)]
pub struct MemoryPool {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: A MemoryPool is a unique handle to memory nobody else references
// through the handle; moving it between threads moves the ownership.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Wrap raw memory as a pool.
    ///
    /// # Safety
    /// `base` must point to `size` bytes of writable memory that stays valid
    /// until the pool is handed back to the manager that created it.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// Base pointer
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// First address of the pool
    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last address of the pool
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// True if `addr` lies inside the pool
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }
}

/// Supplier of raw pools and reverse address lookup.
pub trait PoolManager: Send + Sync {
    /// Hand out a pool of at least `size` bytes tagged with its future owner.
    ///
    /// Returns `None` when memory is exhausted.
    fn alloc_pool(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        owner: OwnerId,
    ) -> Option<MemoryPool>;

    /// Take a pool back.
    fn free_pool(&self, pool: MemoryPool);

    /// Which tier instance owns `addr`, if any pool covers it.
    fn allocator_info_for_addr(&self, addr: usize) -> Option<AllocatorInfo>;

    /// Lowest address ever handed out (0 if none)
    fn min_object_address(&self) -> usize;

    /// One past the highest address ever handed out (0 if none)
    fn max_object_address(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct PoolRecord {
    size: usize,
    space_type: SpaceType,
    info: AllocatorInfo,
}

struct PoolRegistry {
    /// Live pools keyed by base address
    pools: BTreeMap<usize, PoolRecord>,
    /// Bytes currently lent out
    reserved: usize,
    /// Live pool count per space type
    per_space: [usize; SPACE_TYPE_COUNT],
    min_addr: usize,
    max_addr: usize,
}

/// Pool manager backed by the global allocator.
pub struct HeapPoolManager {
    limit: usize,
    registry: Mutex<PoolRegistry>,
}

impl HeapPoolManager {
    /// Create a pool manager with the default budget
    pub fn new() -> Self {
        Self::with_config(PoolManagerConfig::default())
    }

    /// Create a pool manager with a custom budget
    pub fn with_config(config: PoolManagerConfig) -> Self {
        Self {
            limit: config.limit_bytes,
            registry: Mutex::new(PoolRegistry {
                pools: BTreeMap::new(),
                reserved: 0,
                per_space: [0; SPACE_TYPE_COUNT],
                min_addr: usize::MAX,
                max_addr: 0,
            }),
        }
    }

    /// Number of pools currently lent out for `space_type`
    pub fn pool_count(&self, space_type: SpaceType) -> usize {
        self.registry.lock().per_space[space_type.index()]
    }

    /// Bytes currently lent out
    pub fn reserved_bytes(&self) -> usize {
        self.registry.lock().reserved
    }

    /// Budget in bytes
    pub fn limit_bytes(&self) -> usize {
        self.limit
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, PAGE_SIZE).ok()
    }
}

impl Default for HeapPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager for HeapPoolManager {
    fn alloc_pool(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        owner: OwnerId,
    ) -> Option<MemoryPool> {
        if size == 0 {
            return None;
        }
        let size = size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);

        let mut registry = self.registry.lock();
        if registry.reserved.checked_add(size)? > self.limit {
            #[cfg(feature = "gc_logging")]
            tracing::warn!(
                target: "otter::mem",
                requested = size,
                reserved = registry.reserved,
                limit = self.limit,
                "Pool budget exhausted"
            );
            return None;
        }

        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        let start = base.as_ptr() as usize;

        registry.pools.insert(
            start,
            PoolRecord {
                size,
                space_type,
                info: AllocatorInfo {
                    allocator_type,
                    owner,
                },
            },
        );
        registry.reserved += size;
        registry.per_space[space_type.index()] += 1;
        registry.min_addr = registry.min_addr.min(start);
        registry.max_addr = registry.max_addr.max(start + size);

        // SAFETY: freshly allocated, `size` bytes, released only in free_pool/drop.
        Some(unsafe { MemoryPool::from_raw_parts(base, size) })
    }

    fn free_pool(&self, pool: MemoryPool) {
        let mut registry = self.registry.lock();
        let Some(record) = registry.pools.remove(&pool.start()) else {
            panic!(
                "free_pool: {:#x} (+{:#x}) was not handed out by this pool manager",
                pool.start(),
                pool.size()
            );
        };
        debug_assert_eq!(record.size, pool.size());
        registry.reserved -= record.size;
        registry.per_space[record.space_type.index()] -= 1;
        drop(registry);

        if let Some(layout) = Self::layout(record.size) {
            // SAFETY: allocated in alloc_pool with this exact layout.
            unsafe { alloc::dealloc(pool.base().as_ptr(), layout) };
        }
    }

    fn allocator_info_for_addr(&self, addr: usize) -> Option<AllocatorInfo> {
        let registry = self.registry.lock();
        let (&start, record) = registry.pools.range(..=addr).next_back()?;
        (addr < start + record.size).then_some(record.info)
    }

    fn min_object_address(&self) -> usize {
        let registry = self.registry.lock();
        if registry.min_addr == usize::MAX {
            0
        } else {
            registry.min_addr
        }
    }

    fn max_object_address(&self) -> usize {
        self.registry.lock().max_addr
    }
}

impl Drop for HeapPoolManager {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        for (start, record) in std::mem::take(&mut registry.pools) {
            if let Some(layout) = Self::layout(record.size) {
                // SAFETY: every registered pool came from alloc_zeroed with this layout.
                unsafe { alloc::dealloc(start as *mut u8, layout) };
            }
        }
    }
}
