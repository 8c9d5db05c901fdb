//! Size-class tier allocators
//!
//! Each tier carves allocations out of pools it borrowed from the pool
//! manager. Tiers lock their own state; the internal allocator only
//! serializes pool growth on top of that.
//!
//! - `run_slots`: small objects, fixed power-of-two slots in 4KB runs
//! - `free_list`: large objects, first-fit with coalescing
//! - `humongous`: one object per pool
//! - `malloc_proxy`: forwards to the global allocator, no pools

pub mod free_list;
pub mod humongous;
pub mod malloc_proxy;
pub mod run_slots;

use std::ptr::NonNull;

use crate::pool::MemoryPool;
use crate::space::AllocatorType;

pub use free_list::FreeListAllocator;
pub use humongous::HumongousObjAllocator;
pub use malloc_proxy::MallocProxyAllocator;
pub use run_slots::RunSlotsAllocator;

/// Contract every tier allocator fulfils.
pub trait TierAllocator: Send + Sync {
    /// Tier kind, recorded by the pool manager for reverse lookup
    fn allocator_type(&self) -> AllocatorType;

    /// Allocate `size` bytes aligned to `align` from the pools already owned.
    ///
    /// Returns `None` when no owned pool has room; the caller grows the tier.
    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Bytes actually reserved for a request; what `free` later reports.
    fn usable_size(&self, size: usize, align: usize) -> usize;

    /// Release an allocation made by this instance. Returns the bytes released.
    fn free(&self, ptr: NonNull<u8>) -> usize;

    /// Take ownership of a pool. Gives the pool back if it can not be used.
    fn add_memory_pool(&self, pool: MemoryPool) -> Result<(), MemoryPool>;

    /// Smallest pool that lets a request of `size` bytes succeed
    fn min_pool_size(&self, size: usize) -> usize;

    /// Largest request this tier serves
    fn max_size(&self) -> usize;

    /// Number of pools currently owned
    fn pool_count(&self) -> usize;

    /// Give back every pool, live allocations or not.
    fn visit_and_remove_all_pools(&self, visitor: &mut dyn FnMut(MemoryPool));

    /// Give back pools that hold no live allocation.
    fn visit_and_remove_free_pools(&self, visitor: &mut dyn FnMut(MemoryPool));

    /// Visit every live allocation.
    fn iterate_over_objects(&self, visitor: &mut dyn FnMut(NonNull<u8>));

    /// Visit live allocations whose address lies in `[lo, hi)`.
    fn iterate_over_objects_in_range(
        &self,
        visitor: &mut dyn FnMut(NonNull<u8>),
        lo: usize,
        hi: usize,
    ) {
        self.iterate_over_objects(&mut |ptr| {
            let addr = ptr.as_ptr() as usize;
            if addr >= lo && addr < hi {
                visitor(ptr);
            }
        });
    }

    /// Free every live allocation `is_dead` reports. Returns bytes released.
    fn collect(&self, is_dead: &mut dyn FnMut(NonNull<u8>) -> bool) -> usize {
        let mut dead = Vec::new();
        self.iterate_over_objects(&mut |ptr| {
            if is_dead(ptr) {
                dead.push(ptr);
            }
        });
        dead.into_iter().map(|ptr| self.free(ptr)).sum()
    }
}

/// Round a request up to the 8-byte minimum granule.
#[inline]
pub(crate) fn granule(size: usize) -> usize {
    crate::pool::align_up(size.max(1), 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{HeapPoolManager, PoolManager};
    use crate::space::SpaceType;

    #[test]
    fn test_iterate_over_objects_in_range_bounds() {
        let manager = HeapPoolManager::new();
        let allocator = RunSlotsAllocator::new();
        let pool = manager
            .alloc_pool(
                allocator.min_pool_size(0),
                SpaceType::Internal,
                AllocatorType::RunSlots,
                allocator.owner(),
            )
            .unwrap();
        allocator.add_memory_pool(pool).unwrap();

        let mut addrs: Vec<usize> = (0..8)
            .map(|_| allocator.alloc(32, 8).unwrap().as_ptr() as usize)
            .collect();
        addrs.sort_unstable();

        // Lower bound inclusive, upper bound exclusive
        let (lo, hi) = (addrs[2], addrs[6]);
        let mut seen = Vec::new();
        allocator.iterate_over_objects_in_range(
            &mut |ptr| seen.push(ptr.as_ptr() as usize),
            lo,
            hi,
        );
        seen.sort_unstable();
        assert_eq!(seen, addrs[2..6]);

        let mut none = 0;
        allocator.iterate_over_objects_in_range(&mut |_| none += 1, hi, hi);
        assert_eq!(none, 0);

        allocator.visit_and_remove_all_pools(&mut |pool| manager.free_pool(pool));
    }
}
