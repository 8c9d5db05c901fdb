//! # Otter VM Memory Layer
//!
//! Low-level memory management and GC instrumentation underneath the
//! collector.
//!
//! ## Components
//!
//! - **Internal allocator**: size-tiered allocator for VM bookkeeping, pools
//!   borrowed from a pool manager, optional per-thread small tier
//! - **MemStats**: lock-free per-space allocation accounting
//! - **GcStats / GcInstanceStats**: pause, duration and throughput statistics
//! - **CardTable**: per-card write-barrier state for generational collection
//!
//! Logging goes through `tracing` (target `otter::mem`) when the
//! `gc_logging` feature is enabled.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod card_table;
pub mod config;
pub mod error;
pub mod gc_stats;
pub mod histogram;
pub mod instance_stats;
pub mod internal_allocator;
pub mod mem_stats;
pub mod pool;
pub mod space;
pub mod tier;

pub use card_table::{Card, CardStatus, CardTable, MemRange, VisitFlags};
pub use config::{
    CardTableConfig, GcStatsConfig, InternalAllocatorConfig, InternalAllocatorKind, MemConfig,
    PoolManagerConfig,
};
pub use error::{MemError, Result};
pub use gc_stats::{CollectionKind, GcScopedPauseStats, GcScopedStats, GcStats, PauseType};
pub use histogram::Histogram;
pub use instance_stats::{GcInstanceStats, GcType, MemoryStat, ObjectsStat, TimeStat};
pub use internal_allocator::{
    InternalAllocator, clear_internal_allocator_from_runtime, get_internal_allocator_from_runtime,
    init_internal_allocator_from_runtime,
};
pub use mem_stats::{
    ClassFootprintStats, HeapStatsSource, MemStats, MemStatsSnapshot, NoAdditionalStats,
    StatsExtension,
};
pub use pool::{HeapPoolManager, MemoryPool, PAGE_SIZE, PoolManager};
pub use space::{AllocScope, AllocatorInfo, AllocatorType, OwnerId, SpaceType};
