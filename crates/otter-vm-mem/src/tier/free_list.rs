//! Large-object tier: first-fit free list per pool.
//!
//! Free blocks are kept in an offset-ordered map so neighbours coalesce on
//! free. Alignment padding in front of a block stays on the free list.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{TierAllocator, granule};
use crate::pool::{MemoryPool, align_up};
use crate::space::{AllocatorType, OwnerId};

/// Largest request served by this tier
pub const FREE_LIST_MAX_SIZE: usize = 64 * 1024;

/// Pools requested for this tier are at least 1MB
pub const FREE_LIST_MIN_POOL_SIZE: usize = 1024 * 1024;

struct FreeListPool {
    pool: MemoryPool,
    /// Free blocks: offset -> length
    free: BTreeMap<usize, usize>,
    /// Live blocks: address -> length
    used: BTreeMap<usize, usize>,
}

impl FreeListPool {
    fn new(pool: MemoryPool) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, pool.size());
        Self {
            pool,
            free,
            used: BTreeMap::new(),
        }
    }

    fn try_alloc(&mut self, len: usize, align: usize) -> Option<usize> {
        let start = self.pool.start();
        let (off, flen, pad) = self.free.iter().find_map(|(&off, &flen)| {
            let pad = align_up(start + off, align) - (start + off);
            (pad + len <= flen).then_some((off, flen, pad))
        })?;

        self.free.remove(&off);
        if pad > 0 {
            self.free.insert(off, pad);
        }
        let tail = flen - pad - len;
        if tail > 0 {
            self.free.insert(off + pad + len, tail);
        }

        let addr = start + off + pad;
        self.used.insert(addr, len);
        Some(addr)
    }

    fn release(&mut self, addr: usize) -> Option<usize> {
        let released = self.used.remove(&addr)?;
        let mut off = addr - self.pool.start();
        let mut len = released;

        if let Some((&prev_off, &prev_len)) = self.free.range(..off).next_back() {
            if prev_off + prev_len == off {
                self.free.remove(&prev_off);
                off = prev_off;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(off + len)) {
            len += next_len;
        }
        self.free.insert(off, len);
        Some(released)
    }
}

/// Large-object tier allocator.
pub struct FreeListAllocator {
    owner: OwnerId,
    pools: Mutex<BTreeMap<usize, FreeListPool>>,
}

impl FreeListAllocator {
    /// Create an empty allocator with a fresh owner id
    pub fn new() -> Self {
        Self {
            owner: OwnerId::next(),
            pools: Mutex::new(BTreeMap::new()),
        }
    }

    /// Identity recorded against this instance's pools
    #[inline]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TierAllocator for FreeListAllocator {
    fn allocator_type(&self) -> AllocatorType {
        AllocatorType::FreeList
    }

    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let len = granule(size);
        if len > FREE_LIST_MAX_SIZE {
            return None;
        }
        let align = align.max(8);
        let mut pools = self.pools.lock();
        pools
            .values_mut()
            .find_map(|pool| pool.try_alloc(len, align))
            .and_then(|addr| NonNull::new(addr as *mut u8))
    }

    fn usable_size(&self, size: usize, _align: usize) -> usize {
        granule(size)
    }

    fn free(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let mut pools = self.pools.lock();
        let pool = match pools.range_mut(..=addr).next_back() {
            Some((_, pool)) if pool.pool.contains(addr) => pool,
            _ => panic!("FreeListAllocator::free: {addr:#x} not owned by this allocator"),
        };
        match pool.release(addr) {
            Some(len) => len,
            None => {
                debug_assert!(false, "free of unknown block {addr:#x}");
                0
            }
        }
    }

    fn add_memory_pool(&self, pool: MemoryPool) -> Result<(), MemoryPool> {
        if pool.size() == 0 {
            return Err(pool);
        }
        self.pools.lock().insert(pool.start(), FreeListPool::new(pool));
        Ok(())
    }

    fn min_pool_size(&self, _size: usize) -> usize {
        FREE_LIST_MIN_POOL_SIZE
    }

    fn max_size(&self) -> usize {
        FREE_LIST_MAX_SIZE
    }

    fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    fn visit_and_remove_all_pools(&self, visitor: &mut dyn FnMut(MemoryPool)) {
        let pools = std::mem::take(&mut *self.pools.lock());
        for (_, pool) in pools {
            visitor(pool.pool);
        }
    }

    fn visit_and_remove_free_pools(&self, visitor: &mut dyn FnMut(MemoryPool)) {
        let free: Vec<FreeListPool> = {
            let mut pools = self.pools.lock();
            let bases: Vec<usize> = pools
                .iter()
                .filter(|(_, pool)| pool.used.is_empty())
                .map(|(&base, _)| base)
                .collect();
            bases
                .into_iter()
                .filter_map(|base| pools.remove(&base))
                .collect()
        };
        for pool in free {
            visitor(pool.pool);
        }
    }

    fn iterate_over_objects(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        let live: Vec<usize> = self
            .pools
            .lock()
            .values()
            .flat_map(|pool| pool.used.keys().copied())
            .collect();
        for addr in live {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                visitor(ptr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{HeapPoolManager, PoolManager};
    use crate::space::SpaceType;

    fn allocator_with_pool(manager: &HeapPoolManager) -> FreeListAllocator {
        let allocator = FreeListAllocator::new();
        let pool = manager
            .alloc_pool(
                allocator.min_pool_size(0),
                SpaceType::Internal,
                AllocatorType::FreeList,
                allocator.owner(),
            )
            .unwrap();
        allocator.add_memory_pool(pool).unwrap();
        allocator
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let manager = HeapPoolManager::new();
        let allocator = allocator_with_pool(&manager);

        let a = allocator.alloc(1000, 8).unwrap();
        let b = allocator.alloc(1000, 256).unwrap();
        assert_eq!(b.as_ptr() as usize % 256, 0);
        assert_ne!(a, b);
        allocator.visit_and_remove_all_pools(&mut |pool| manager.free_pool(pool));
    }

    #[test]
    fn test_coalescing_restores_single_block() {
        let manager = HeapPoolManager::new();
        let allocator = allocator_with_pool(&manager);

        let ptrs: Vec<_> = (0..8).map(|_| allocator.alloc(4096, 8).unwrap()).collect();
        // Free in an interleaved order so both merge directions are exercised
        for i in [1, 3, 5, 7, 0, 2, 4, 6] {
            assert_eq!(allocator.free(ptrs[i]), 4096);
        }

        // After full coalescing the whole pool is one block again
        let big = allocator.alloc(FREE_LIST_MAX_SIZE, 8).unwrap();
        assert_eq!(big, ptrs[0]);
        allocator.free(big);
        allocator.visit_and_remove_all_pools(&mut |pool| manager.free_pool(pool));
    }

    #[test]
    fn test_rejects_oversized() {
        let manager = HeapPoolManager::new();
        let allocator = allocator_with_pool(&manager);
        assert!(allocator.alloc(FREE_LIST_MAX_SIZE + 1, 8).is_none());
        allocator.visit_and_remove_all_pools(&mut |pool| manager.free_pool(pool));
    }

    #[test]
    fn test_free_pool_reclamation() {
        let manager = HeapPoolManager::new();
        let allocator = allocator_with_pool(&manager);
        let ptr = allocator.alloc(512, 8).unwrap();

        let mut returned = 0;
        allocator.visit_and_remove_free_pools(&mut |pool| {
            returned += 1;
            manager.free_pool(pool);
        });
        assert_eq!(returned, 0);

        allocator.free(ptr);
        allocator.visit_and_remove_free_pools(&mut |pool| {
            returned += 1;
            manager.free_pool(pool);
        });
        assert_eq!(returned, 1);
        assert_eq!(manager.reserved_bytes(), 0);
    }
}
