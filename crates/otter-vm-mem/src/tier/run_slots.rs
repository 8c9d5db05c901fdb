//! Small-object tier.
//!
//! Pools are split into 4KB runs. A run is formatted on demand for one slot
//! class and hands out fixed-size slots found via a free bitmap scan. A run
//! whose last slot is freed goes back to the unformatted state; a pool whose
//! runs are all unformatted is free and can be returned.
//!
//! ## Layout
//!
//! ```text
//! Pool (>= 256KB):
//! ┌────────────┬────────────┬─────┬────────────┐
//! │ Run 0 (4K) │ Run 1 (4K) │ ... │ Run N (4K) │
//! └────────────┴────────────┴─────┴────────────┘
//!
//! Run metadata stored separately:
//!   - class: slot class index, None while unformatted
//!   - free_bits: bit N = 1 means slot N is free
//! ```

use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{TierAllocator, granule};
use crate::pool::{MemoryPool, PAGE_SIZE};
use crate::space::{AllocatorType, OwnerId};

/// Largest request served by this tier
pub const RUN_SLOTS_MAX_SIZE: usize = 256;

/// Pools requested for this tier are at least 256KB
pub const RUN_SLOTS_MIN_POOL_SIZE: usize = 256 * 1024;

/// Run size: one page.
const RUN_SIZE: usize = PAGE_SIZE;

/// Slot classes. Slots are aligned to their own size inside a run.
const SLOT_CLASSES: &[usize] = &[8, 16, 32, 64, 128, 256];

const NUM_SLOT_CLASSES: usize = 6; // must match SLOT_CLASSES.len()

#[inline]
fn slot_class_index(size: usize) -> Option<usize> {
    SLOT_CLASSES.iter().position(|&sc| sc >= size)
}

struct Run {
    class: Option<usize>,
    free_bits: Vec<u64>,
    live: usize,
}

impl Run {
    fn unformatted() -> Self {
        Self {
            class: None,
            free_bits: Vec::new(),
            live: 0,
        }
    }

    fn slot_count(&self) -> usize {
        self.class.map_or(0, |c| RUN_SIZE / SLOT_CLASSES[c])
    }

    fn format(&mut self, class: usize) {
        let num_slots = RUN_SIZE / SLOT_CLASSES[class];
        let num_words = num_slots.div_ceil(64);
        let mut free_bits = vec![u64::MAX; num_words];
        let remainder = num_slots % 64;
        if remainder != 0 {
            free_bits[num_words - 1] = (1u64 << remainder) - 1;
        }
        self.class = Some(class);
        self.free_bits = free_bits;
        self.live = 0;
    }

    fn reset(&mut self) {
        *self = Self::unformatted();
    }

    fn take_slot(&mut self) -> Option<usize> {
        for (word_idx, word) in self.free_bits.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }
            let bit_idx = word.trailing_zeros() as usize;
            *word &= !(1u64 << bit_idx);
            self.live += 1;
            return Some(word_idx * 64 + bit_idx);
        }
        None
    }

    /// Returns false if the slot was already free.
    fn release_slot(&mut self, slot: usize) -> bool {
        let word = &mut self.free_bits[slot / 64];
        let bit = 1u64 << (slot % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.live -= 1;
        true
    }

    fn is_slot_live(&self, slot: usize) -> bool {
        self.free_bits[slot / 64] & (1u64 << (slot % 64)) == 0
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.class.is_some() && self.live == self.slot_count()
    }
}

struct RunSlotsPool {
    pool: MemoryPool,
    runs: Vec<Run>,
}

impl RunSlotsPool {
    fn is_free(&self) -> bool {
        self.runs.iter().all(|run| run.class.is_none())
    }
}

struct RunSlotsState {
    /// Pools keyed by base address
    pools: BTreeMap<usize, RunSlotsPool>,
    /// Per class: (pool base, run index) of runs with at least one free slot
    partial: [Vec<(usize, usize)>; NUM_SLOT_CLASSES],
}

/// Small-object tier allocator.
pub struct RunSlotsAllocator {
    owner: OwnerId,
    state: Mutex<RunSlotsState>,
}

impl RunSlotsAllocator {
    /// Create an empty allocator with a fresh owner id
    pub fn new() -> Self {
        Self {
            owner: OwnerId::next(),
            state: Mutex::new(RunSlotsState {
                pools: BTreeMap::new(),
                partial: Default::default(),
            }),
        }
    }

    /// Identity recorded against this instance's pools
    #[inline]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    fn class_for(size: usize, align: usize) -> Option<usize> {
        slot_class_index(granule(size).max(align))
    }
}

impl Default for RunSlotsAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TierAllocator for RunSlotsAllocator {
    fn allocator_type(&self) -> AllocatorType {
        AllocatorType::RunSlots
    }

    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let class = Self::class_for(size, align)?;
        let slot_size = SLOT_CLASSES[class];

        let mut state = self.state.lock();
        let RunSlotsState { pools, partial } = &mut *state;

        // Reuse a partially filled run first
        if let Some(&(base, run_idx)) = partial[class].last() {
            let run = &mut pools.get_mut(&base)?.runs[run_idx];
            let slot = run.take_slot()?;
            if run.is_full() {
                partial[class].pop();
            }
            let addr = base + run_idx * RUN_SIZE + slot * slot_size;
            return NonNull::new(addr as *mut u8);
        }

        // Format an unused run
        for (&base, pool) in pools.iter_mut() {
            let Some(run_idx) = pool.runs.iter().position(|run| run.class.is_none()) else {
                continue;
            };
            let run = &mut pool.runs[run_idx];
            run.format(class);
            let slot = run.take_slot()?;
            if !run.is_full() {
                partial[class].push((base, run_idx));
            }
            let addr = base + run_idx * RUN_SIZE + slot * slot_size;
            return NonNull::new(addr as *mut u8);
        }

        None
    }

    fn usable_size(&self, size: usize, align: usize) -> usize {
        Self::class_for(size, align).map_or(0, |class| SLOT_CLASSES[class])
    }

    fn free(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.state.lock();
        let RunSlotsState { pools, partial } = &mut *state;

        let Some((&base, pool)) = pools.range_mut(..=addr).next_back() else {
            panic!("RunSlotsAllocator::free: {addr:#x} not owned by this allocator");
        };
        assert!(
            pool.pool.contains(addr),
            "RunSlotsAllocator::free: {addr:#x} not owned by this allocator"
        );

        let run_idx = (addr - base) / RUN_SIZE;
        let run = &mut pool.runs[run_idx];
        let Some(class) = run.class else {
            panic!("RunSlotsAllocator::free: {addr:#x} lies in an unused run");
        };
        let slot_size = SLOT_CLASSES[class];
        let offset = addr - (base + run_idx * RUN_SIZE);
        debug_assert_eq!(offset % slot_size, 0, "free of interior pointer {addr:#x}");

        let was_full = run.is_full();
        if !run.release_slot(offset / slot_size) {
            debug_assert!(false, "double free of {addr:#x}");
            return 0;
        }

        if run.live == 0 {
            run.reset();
            partial[class].retain(|&entry| entry != (base, run_idx));
        } else if was_full {
            partial[class].push((base, run_idx));
        }
        slot_size
    }

    fn add_memory_pool(&self, pool: MemoryPool) -> Result<(), MemoryPool> {
        if pool.size() < RUN_SIZE || pool.start() % RUN_SIZE != 0 {
            return Err(pool);
        }
        let runs = (0..pool.size() / RUN_SIZE).map(|_| Run::unformatted()).collect();
        self.state
            .lock()
            .pools
            .insert(pool.start(), RunSlotsPool { pool, runs });
        Ok(())
    }

    fn min_pool_size(&self, _size: usize) -> usize {
        RUN_SLOTS_MIN_POOL_SIZE
    }

    fn max_size(&self) -> usize {
        RUN_SLOTS_MAX_SIZE
    }

    fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    fn visit_and_remove_all_pools(&self, visitor: &mut dyn FnMut(MemoryPool)) {
        let pools = {
            let mut state = self.state.lock();
            state.partial.iter_mut().for_each(Vec::clear);
            std::mem::take(&mut state.pools)
        };
        for (_, pool) in pools {
            visitor(pool.pool);
        }
    }

    fn visit_and_remove_free_pools(&self, visitor: &mut dyn FnMut(MemoryPool)) {
        let free = {
            let mut state = self.state.lock();
            let bases: Vec<usize> = state
                .pools
                .iter()
                .filter(|(_, pool)| pool.is_free())
                .map(|(&base, _)| base)
                .collect();
            bases
                .into_iter()
                .filter_map(|base| state.pools.remove(&base))
                .collect::<Vec<_>>()
        };
        for pool in free {
            visitor(pool.pool);
        }
    }

    fn iterate_over_objects(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        let mut live = Vec::new();
        {
            let state = self.state.lock();
            for (&base, pool) in &state.pools {
                for (run_idx, run) in pool.runs.iter().enumerate() {
                    let Some(class) = run.class else { continue };
                    let run_start = base + run_idx * RUN_SIZE;
                    for slot in 0..run.slot_count() {
                        if run.is_slot_live(slot) {
                            live.push(run_start + slot * SLOT_CLASSES[class]);
                        }
                    }
                }
            }
        }
        // Visit outside the lock so the visitor may free
        for addr in live {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                visitor(ptr);
            }
        }
    }
}
