//! Humongous tier: every allocation gets a pool of its own.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{TierAllocator, granule};
use crate::pool::{MemoryPool, PAGE_SIZE, align_up};
use crate::space::{AllocatorType, OwnerId};

struct HumongousPool {
    pool: MemoryPool,
    /// (address, length) of the object living in the pool
    object: Option<(usize, usize)>,
}

/// Humongous-object tier allocator.
pub struct HumongousObjAllocator {
    owner: OwnerId,
    pools: Mutex<BTreeMap<usize, HumongousPool>>,
}

impl HumongousObjAllocator {
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

impl Default for HumongousObjAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TierAllocator for HumongousObjAllocator {
    fn allocator_type(&self) -> AllocatorType {
        AllocatorType::Humongous
    }

    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let len = granule(size);
        let mut pools = self.pools.lock();
        // Smallest empty pool that fits
        let (addr, slot) = pools
            .values_mut()
            .filter(|p| p.object.is_none())
            .filter_map(|p| {
                let addr = align_up(p.pool.start(), align.max(8));
                (addr + len <= p.pool.end()).then_some((addr, p))
            })
            .min_by_key(|(_, p)| p.pool.size())?;
        slot.object = Some((addr, len));
        NonNull::new(addr as *mut u8)
    }

    fn usable_size(&self, size: usize, _align: usize) -> usize {
        granule(size)
    }

    fn free(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let mut pools = self.pools.lock();
        let pool = match pools.range_mut(..=addr).next_back() {
            Some((_, pool)) if pool.pool.contains(addr) => pool,
            _ => panic!("HumongousObjAllocator::free: {addr:#x} not owned by this allocator"),
        };
        match pool.object.take() {
            Some((obj, len)) if obj == addr => len,
            other => {
                pool.object = other;
                debug_assert!(false, "free of unknown humongous object {addr:#x}");
                0
            }
        }
    }

    fn add_memory_pool(&self, pool: MemoryPool) -> Result<(), MemoryPool> {
        if pool.size() == 0 {
            return Err(pool);
        }
        self.pools.lock().insert(
            pool.start(),
            HumongousPool { pool, object: None },
        );
        Ok(())
    }

    fn min_pool_size(&self, size: usize) -> usize {
        align_up(granule(size), PAGE_SIZE)
    }

    fn max_size(&self) -> usize {
        usize::MAX
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
        let free: Vec<HumongousPool> = {
            let mut pools = self.pools.lock();
            let bases: Vec<usize> = pools
                .iter()
                .filter(|(_, pool)| pool.object.is_none())
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
            .filter_map(|pool| pool.object.map(|(addr, _)| addr))
            .collect();
        for addr in live {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                visitor(ptr);
            }
        }
    }
}
