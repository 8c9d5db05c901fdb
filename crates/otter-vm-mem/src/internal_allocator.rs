//! Internal allocator for VM bookkeeping structures
//!
//! Requests are dispatched by aligned size to one of three tiers:
//! - small (`<= small_max_size`): run-slots, shared or thread-local
//! - large (`<= large_max_size`): free list
//! - humongous: one pool per object
//!
//! The fast path calls the tier directly. When the tier is out of room the
//! caller takes that tier's growth mutex, retries once (another thread may
//! have grown it already), then borrows a pool from the pool manager and
//! loops. Pool manager exhaustion surfaces as `None`, never as a panic.
//!
//! `free` does not trust the calling thread: the pool manager's reverse
//! lookup names the tier instance that owns the address, and the pointer is
//! handed back to exactly that instance.

use std::cell::RefCell;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{InternalAllocatorConfig, InternalAllocatorKind};
use crate::error::Result;
use crate::mem_stats::MemStats;
use crate::pool::{MemoryPool, PAGE_SIZE, PoolManager, align_up};
use crate::space::{AllocScope, AllocatorType, OwnerId, SPACE_TYPE_COUNT, SpaceType};
use crate::tier::{
    FreeListAllocator, HumongousObjAllocator, MallocProxyAllocator, RunSlotsAllocator,
    TierAllocator,
};

static NEXT_ALLOCATOR_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// This thread's local small-tier allocators, keyed by internal allocator id
    static LOCAL_ALLOCATORS: RefCell<FxHashMap<usize, Arc<RunSlotsAllocator>>> =
        RefCell::new(FxHashMap::default());
}

/// Tier a request lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Small,
    Large,
    Humongous,
}

impl Tier {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Tier::Small => 0,
            Tier::Large => 1,
            Tier::Humongous => 2,
        }
    }
}

enum Backend {
    Tiered {
        small: RunSlotsAllocator,
        large: FreeListAllocator,
        humongous: HumongousObjAllocator,
        /// Serializes pool growth, one lock per tier
        grow: [Mutex<()>; Tier::COUNT],
    },
    Malloc(MallocProxyAllocator),
}

/// Allocator for the VM's own data structures.
pub struct InternalAllocator {
    id: usize,
    config: InternalAllocatorConfig,
    backend: Backend,
    /// Thread-local small tiers by owner id, for cross-thread `free`
    locals: RwLock<FxHashMap<OwnerId, Arc<RunSlotsAllocator>>>,
    /// Accounting space of live allocations not booked as `Internal`
    spaces: Mutex<FxHashMap<usize, SpaceType>>,
    pool_manager: Arc<dyn PoolManager>,
    mem_stats: Arc<MemStats>,
}

impl InternalAllocator {
    /// Build an allocator borrowing pools from `pool_manager`.
    pub fn new(
        config: InternalAllocatorConfig,
        pool_manager: Arc<dyn PoolManager>,
        mem_stats: Arc<MemStats>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = match config.kind {
            InternalAllocatorKind::Tiered => Backend::Tiered {
                small: RunSlotsAllocator::new(),
                large: FreeListAllocator::new(),
                humongous: HumongousObjAllocator::new(),
                grow: Default::default(),
            },
            InternalAllocatorKind::Malloc => Backend::Malloc(MallocProxyAllocator::new()),
        };

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::mem",
            kind = ?config.kind,
            small_max = config.small_max_size,
            large_max = config.large_max_size,
            "Internal allocator created"
        );

        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            config,
            backend,
            locals: RwLock::new(FxHashMap::default()),
            spaces: Mutex::new(FxHashMap::default()),
            pool_manager,
            mem_stats,
        })
    }

    /// Backend mode
    pub fn kind(&self) -> InternalAllocatorKind {
        self.config.kind
    }

    /// Accounting sink
    pub fn mem_stats(&self) -> &Arc<MemStats> {
        &self.mem_stats
    }

    fn tier_for(&self, aligned: usize) -> Tier {
        if aligned <= self.config.small_max_size {
            Tier::Small
        } else if aligned <= self.config.large_max_size {
            Tier::Large
        } else {
            Tier::Humongous
        }
    }

    // --- Allocation ---

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns `None` for `size == 0` and when memory is exhausted.
    pub fn alloc(&self, size: usize, align: usize, scope: AllocScope) -> Option<NonNull<u8>> {
        self.alloc_with_space(size, align, scope, SpaceType::Internal)
    }

    /// `alloc`, accounted against `space_type` instead of `Internal`.
    ///
    /// `free` books the release against the same space.
    pub fn alloc_with_space(
        &self,
        size: usize,
        align: usize,
        scope: AllocScope,
        space_type: SpaceType,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            #[cfg(feature = "gc_logging")]
            tracing::debug!(target: "otter::mem", "Zero-size internal allocation rejected");
            return None;
        }
        let align = align.max(1);
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let aligned = size.checked_add(align - 1)? & !(align - 1);
        if aligned > isize::MAX as usize {
            return None;
        }

        let (ptr, usable) = match &self.backend {
            Backend::Malloc(proxy) => (proxy.alloc(size, align)?, proxy.usable_size(size, align)),
            Backend::Tiered {
                small,
                large,
                humongous,
                grow,
            } => {
                let tier = self.tier_for(aligned);
                let local;
                let (allocator, owner, grow): (&dyn TierAllocator, OwnerId, Option<&Mutex<()>>) =
                    match (tier, scope) {
                        (Tier::Small, AllocScope::Local) => match self.local_allocator() {
                            // Only the owning thread grows its local tier
                            Some(found) => {
                                local = found;
                                (&*local as &dyn TierAllocator, local.owner(), None)
                            }
                            None => {
                                debug_assert!(
                                    false,
                                    "local allocation on a thread without a local internal allocator"
                                );
                                (small as &dyn TierAllocator, small.owner(), Some(&grow[tier.index()]))
                            }
                        },
                        (Tier::Small, AllocScope::Global) => {
                            (small as &dyn TierAllocator, small.owner(), Some(&grow[tier.index()]))
                        }
                        (Tier::Large, _) => {
                            (large as &dyn TierAllocator, large.owner(), Some(&grow[tier.index()]))
                        }
                        (Tier::Humongous, _) => {
                            (humongous as &dyn TierAllocator, humongous.owner(), Some(&grow[tier.index()]))
                        }
                    };
                let ptr = self.alloc_in_tier(allocator, owner, grow, size, align)?;
                (ptr, allocator.usable_size(size, align))
            }
        };

        if space_type != SpaceType::Internal {
            self.spaces.lock().insert(ptr.as_ptr() as usize, space_type);
        }
        self.mem_stats.record_allocate_raw(usable, space_type);
        Some(ptr)
    }

    fn alloc_in_tier(
        &self,
        tier: &dyn TierAllocator,
        owner: OwnerId,
        grow: Option<&Mutex<()>>,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        if let Some(ptr) = tier.alloc(size, align) {
            return Some(ptr);
        }

        let _guard = grow.map(|lock| lock.lock());
        // Humongous pools are page aligned; stricter alignment needs slack
        let request = match tier.allocator_type() {
            AllocatorType::Humongous if align > PAGE_SIZE => align_up(size, align).saturating_add(align),
            _ => align_up(size, align),
        };
        loop {
            if let Some(ptr) = tier.alloc(size, align) {
                return Some(ptr);
            }

            let pool_size = tier.min_pool_size(request);
            let Some(pool) = self.pool_manager.alloc_pool(
                pool_size,
                SpaceType::Internal,
                tier.allocator_type(),
                owner,
            ) else {
                #[cfg(feature = "gc_logging")]
                tracing::warn!(
                    target: "otter::mem",
                    tier = ?tier.allocator_type(),
                    size,
                    pool_size,
                    "Internal allocator out of memory"
                );
                return None;
            };

            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "otter::mem",
                tier = ?tier.allocator_type(),
                pool_size = pool.size(),
                "Internal allocator grew tier"
            );

            if let Err(pool) = tier.add_memory_pool(pool) {
                self.pool_manager.free_pool(pool);
                return None;
            }
        }
    }

    // --- Release ---

    /// Release memory from `alloc` or `alloc_with_space`. Null is a no-op.
    ///
    /// # Panics
    /// If `ptr` was not handed out by this allocator.
    pub fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let space = self.take_space(ptr);
        let freed = self.release(ptr);
        self.mem_stats.record_free_raw(freed, space);
    }

    /// `free`, checking in debug builds that `ptr` was accounted against
    /// `space_type`.
    ///
    /// # Panics
    /// If `ptr` was not handed out by this allocator.
    pub fn free_with_space(&self, ptr: *mut u8, space_type: SpaceType) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let space = self.take_space(ptr);
        debug_assert_eq!(space, space_type, "{ptr:p} was allocated in {space:?}");
        let freed = self.release(ptr);
        self.mem_stats.record_free_raw(freed, space);
    }

    /// Space `ptr` was accounted against; forgets the entry.
    ///
    /// Must run before the block goes back to its tier, where another
    /// thread may reuse the address.
    fn take_space(&self, ptr: NonNull<u8>) -> SpaceType {
        self.spaces
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .unwrap_or(SpaceType::Internal)
    }

    /// Hand `ptr` back to the tier instance owning it. Returns bytes released.
    fn release(&self, ptr: NonNull<u8>) -> usize {
        match &self.backend {
            Backend::Malloc(proxy) => proxy.free(ptr),
            Backend::Tiered {
                small,
                large,
                humongous,
                ..
            } => {
                let addr = ptr.as_ptr() as usize;
                let Some(info) = self.pool_manager.allocator_info_for_addr(addr) else {
                    panic!("InternalAllocator::free: no pool covers {addr:#x}");
                };
                match info.allocator_type {
                    AllocatorType::RunSlots if info.owner == small.owner() => small.free(ptr),
                    AllocatorType::RunSlots => {
                        let local = self.locals.read().get(&info.owner).cloned();
                        match local {
                            Some(local) => local.free(ptr),
                            None => panic!(
                                "InternalAllocator::free: {addr:#x} belongs to unknown small-tier owner {}",
                                info.owner.get()
                            ),
                        }
                    }
                    AllocatorType::FreeList if info.owner == large.owner() => large.free(ptr),
                    AllocatorType::Humongous if info.owner == humongous.owner() => {
                        humongous.free(ptr)
                    }
                    other => panic!(
                        "InternalAllocator::free: {addr:#x} belongs to a {other:?} pool of another allocator"
                    ),
                }
            }
        }
    }

    /// Free `objects` from `tier`, booking each against its own space.
    /// Returns bytes released.
    fn release_objects(&self, tier: &dyn TierAllocator, objects: Vec<NonNull<u8>>) -> usize {
        let mut per_space = [0usize; SPACE_TYPE_COUNT];
        for ptr in objects {
            let space = self.take_space(ptr);
            per_space[space.index()] += tier.free(ptr);
        }
        for (space, bytes) in SpaceType::ALL.into_iter().zip(per_space) {
            if bytes > 0 {
                self.mem_stats.record_free_raw(bytes, space);
            }
        }
        per_space.iter().sum()
    }

    // --- Typed helpers ---

    /// Allocate and initialize a `T`.
    pub fn new_object<T>(&self, value: T) -> Option<NonNull<T>> {
        let ptr = self
            .alloc(size_of::<T>().max(1), align_of::<T>(), AllocScope::Global)?
            .cast::<T>();
        // SAFETY: fresh allocation sized and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        Some(ptr)
    }

    /// Drop and release an object from `new_object`.
    ///
    /// # Safety
    /// `ptr` must come from `new_object` on this allocator and not be used
    /// afterwards.
    pub unsafe fn delete_object<T>(&self, ptr: NonNull<T>) {
        // SAFETY: caller guarantees ptr holds a live T from new_object.
        unsafe { std::ptr::drop_in_place(ptr.as_ptr()) };
        self.free(ptr.as_ptr().cast());
    }

    const fn array_header<T>() -> usize {
        align_up(size_of::<usize>(), align_of::<T>())
    }

    /// Allocate `len` default-initialized `T`s behind a length header.
    ///
    /// The returned pointer addresses the first element.
    pub fn new_array<T: Default>(&self, len: usize) -> Option<NonNull<T>> {
        let header = Self::array_header::<T>();
        let size = len.checked_mul(size_of::<T>())?.checked_add(header)?;
        let align = align_of::<T>().max(align_of::<usize>());
        let base = self.alloc(size, align, AllocScope::Global)?;

        // SAFETY: the block holds `header + len * size_of::<T>()` bytes, the
        // header is usize aligned and elements start at an offset aligned for T.
        unsafe {
            base.as_ptr().cast::<usize>().write(len);
            let elements = base.as_ptr().add(header).cast::<T>();
            for i in 0..len {
                elements.add(i).write(T::default());
            }
            Some(NonNull::new_unchecked(elements))
        }
    }

    /// Drop and release an array from `new_array`.
    ///
    /// # Safety
    /// `ptr` must come from `new_array::<T>` on this allocator and not be
    /// used afterwards.
    pub unsafe fn delete_array<T>(&self, ptr: NonNull<T>) {
        let header = Self::array_header::<T>();
        // SAFETY: new_array placed the length `header` bytes before ptr.
        unsafe {
            let base = ptr.as_ptr().cast::<u8>().sub(header);
            let len = base.cast::<usize>().read();
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len));
            self.free(base);
        }
    }

    /// Raw storage for `len` `T`s: uninitialized, no header. Release with `free`.
    pub fn alloc_array<T>(&self, len: usize) -> Option<NonNull<T>> {
        let size = len.checked_mul(size_of::<T>())?;
        self.alloc(size, align_of::<T>(), AllocScope::Global)
            .map(NonNull::cast)
    }

    // --- Thread-local small tier ---

    fn local_allocator(&self) -> Option<Arc<RunSlotsAllocator>> {
        LOCAL_ALLOCATORS.with(|locals| locals.borrow().get(&self.id).cloned())
    }

    /// Give the calling thread its own small tier. Idempotent.
    ///
    /// Returns the owner id of the thread's local allocator, or `None` in
    /// malloc mode where there is no small tier.
    pub fn set_up_local_internal_allocator(&self) -> Option<OwnerId> {
        if matches!(self.backend, Backend::Malloc(_)) {
            return None;
        }
        if let Some(existing) = self.local_allocator() {
            return Some(existing.owner());
        }

        let local = Arc::new(RunSlotsAllocator::new());
        let owner = local.owner();
        self.locals.write().insert(owner, Arc::clone(&local));
        LOCAL_ALLOCATORS.with(|locals| locals.borrow_mut().insert(self.id, local));

        #[cfg(feature = "gc_logging")]
        tracing::trace!(target: "otter::mem", owner = owner.get(), "Local internal allocator set up");
        Some(owner)
    }

    /// Return every pool of the calling thread's small tier and drop it.
    ///
    /// Allocations still live in the local tier are released with it and
    /// accounted as freed.
    pub fn finalize_local_internal_allocator(&self) {
        let Some(local) = LOCAL_ALLOCATORS.with(|locals| locals.borrow_mut().remove(&self.id))
        else {
            return;
        };

        let mut live = Vec::new();
        local.iterate_over_objects(&mut |ptr| live.push(ptr));
        let _released = self.release_objects(&*local, live);
        local.visit_and_remove_all_pools(&mut |pool| self.pool_manager.free_pool(pool));
        self.locals.write().remove(&local.owner());

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "otter::mem",
            owner = local.owner().get(),
            bytes = _released,
            "Local internal allocator finalized"
        );
    }

    /// Number of registered thread-local small tiers
    pub fn local_allocator_count(&self) -> usize {
        self.locals.read().len()
    }

    // --- Pools and objects ---

    fn for_each_tier(&self, f: &mut dyn FnMut(&dyn TierAllocator)) {
        match &self.backend {
            Backend::Malloc(proxy) => f(proxy),
            Backend::Tiered {
                small,
                large,
                humongous,
                ..
            } => {
                f(small);
                f(large);
                f(humongous);
            }
        }
        let locals: Vec<Arc<RunSlotsAllocator>> = self.locals.read().values().cloned().collect();
        for local in &locals {
            f(&**local);
        }
    }

    /// Remove every pool from every tier, live allocations or not.
    pub fn visit_and_remove_all_pools(&self, visitor: &mut dyn FnMut(MemoryPool)) {
        self.for_each_tier(&mut |tier| tier.visit_and_remove_all_pools(visitor));
    }

    /// Remove pools without live allocations from every tier.
    pub fn visit_and_remove_free_pools(&self, visitor: &mut dyn FnMut(MemoryPool)) {
        self.for_each_tier(&mut |tier| tier.visit_and_remove_free_pools(visitor));
    }

    /// Visit every live allocation in every tier.
    pub fn iterate_over_objects(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        self.for_each_tier(&mut |tier| tier.iterate_over_objects(visitor));
    }

    /// Release every live allocation `is_dead` reports and return the
    /// emptied pools to the pool manager. Returns bytes released.
    ///
    /// Each allocation is booked against the space it was allocated in.
    pub fn collect(&self, is_dead: &mut dyn FnMut(NonNull<u8>) -> bool) -> usize {
        let mut freed = 0;
        self.for_each_tier(&mut |tier| {
            let mut dead = Vec::new();
            tier.iterate_over_objects(&mut |ptr| {
                if is_dead(ptr) {
                    dead.push(ptr);
                }
            });
            freed += self.release_objects(tier, dead);
        });
        self.visit_and_remove_free_pools(&mut |pool| self.pool_manager.free_pool(pool));

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::mem", bytes = freed, "Internal allocator collected");
        freed
    }

    /// Pools held across all tiers
    pub fn pool_count(&self) -> usize {
        let mut count = 0;
        self.for_each_tier(&mut |tier| count += tier.pool_count());
        count
    }
}

impl Drop for InternalAllocator {
    fn drop(&mut self) {
        #[cfg(feature = "gc_logging")]
        {
            let live = self.mem_stats.footprint(SpaceType::Internal);
            if live > 0 {
                tracing::warn!(
                    target: "otter::mem",
                    bytes = live,
                    "Internal allocator dropped with live allocations"
                );
            }
        }
        #[cfg(feature = "gc_logging")]
        let pools = self.pool_count();
        self.visit_and_remove_all_pools(&mut |pool| self.pool_manager.free_pool(pool));
        self.locals.get_mut().clear();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::mem", pools, "Internal allocator returned its pools");
    }
}

// --- Process-wide slot ---

static RUNTIME_ALLOCATOR: RwLock<Option<Arc<InternalAllocator>>> = RwLock::new(None);

/// Publish `allocator` as the process-wide internal allocator.
///
/// Replaces any allocator published before; the old one is returned.
pub fn init_internal_allocator_from_runtime(
    allocator: Arc<InternalAllocator>,
) -> Option<Arc<InternalAllocator>> {
    RUNTIME_ALLOCATOR.write().replace(allocator)
}

/// The process-wide internal allocator, if published
pub fn get_internal_allocator_from_runtime() -> Option<Arc<InternalAllocator>> {
    RUNTIME_ALLOCATOR.read().clone()
}

/// Withdraw the process-wide internal allocator at shutdown
pub fn clear_internal_allocator_from_runtime() -> Option<Arc<InternalAllocator>> {
    RUNTIME_ALLOCATOR.write().take()
}
