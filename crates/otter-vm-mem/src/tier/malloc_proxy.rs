//! Forwarding allocator used when the internal allocator runs in malloc mode.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{TierAllocator, granule};
use crate::pool::MemoryPool;
use crate::space::AllocatorType;

/// Forwards every request to the global allocator and remembers the layout.
pub struct MallocProxyAllocator {
    layouts: Mutex<FxHashMap<usize, Layout>>,
}

impl MallocProxyAllocator {
    /// Create an empty proxy
    pub fn new() -> Self {
        Self {
            layouts: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of live allocations
    pub fn live_count(&self) -> usize {
        self.layouts.lock().len()
    }
}

impl Default for MallocProxyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TierAllocator for MallocProxyAllocator {
    fn allocator_type(&self) -> AllocatorType {
        AllocatorType::MallocProxy
    }

    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(granule(size), align.max(8)).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.layouts.lock().insert(ptr.as_ptr() as usize, layout);
        Some(ptr)
    }

    fn usable_size(&self, size: usize, _align: usize) -> usize {
        granule(size)
    }

    fn free(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let Some(layout) = self.layouts.lock().remove(&addr) else {
            panic!("MallocProxyAllocator::free: {addr:#x} not allocated by this proxy");
        };
        // SAFETY: allocated in alloc() with this layout and not yet released.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        layout.size()
    }

    fn add_memory_pool(&self, pool: MemoryPool) -> Result<(), MemoryPool> {
        Err(pool)
    }

    fn min_pool_size(&self, _size: usize) -> usize {
        0
    }

    fn max_size(&self) -> usize {
        usize::MAX
    }

    fn pool_count(&self) -> usize {
        0
    }

    fn visit_and_remove_all_pools(&self, _visitor: &mut dyn FnMut(MemoryPool)) {}

    fn visit_and_remove_free_pools(&self, _visitor: &mut dyn FnMut(MemoryPool)) {}

    fn iterate_over_objects(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        let live: Vec<usize> = self.layouts.lock().keys().copied().collect();
        for addr in live {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                visitor(ptr);
            }
        }
    }
}

impl Drop for MallocProxyAllocator {
    fn drop(&mut self) {
        for (addr, layout) in self.layouts.get_mut().drain() {
            // SAFETY: every entry is a live allocation made with this layout.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_round_trip() {
        let proxy = MallocProxyAllocator::new();
        let ptr = proxy.alloc(24, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(proxy.live_count(), 1);
        assert_eq!(proxy.free(ptr), 24);
        assert_eq!(proxy.live_count(), 0);
        assert_eq!(proxy.pool_count(), 0);
    }
}
