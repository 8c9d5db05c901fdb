//! Allocation accounting
//!
//! Lock-free counters of bytes and objects allocated and freed, per space
//! type. Each counter is an independent atomic padded to its own cache line;
//! loads use `Acquire`, updates use `Release`. No ordering is promised between
//! distinct counters, so an aggregate read while mutators run may mix old and
//! new values. That is fine for monitoring data.
//!
//! Counters only grow, except the allocated-object count which moving
//! collections shrink (the copies are re-accounted by the destination's own
//! allocation calls) and the last-young-moved counter which is reset at each
//! cycle boundary. Alive counts and footprints are derived, never stored.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::space::{SPACE_TYPE_COUNT, SpaceType};

type Counter = CachePadded<AtomicU64>;

#[inline]
fn counter() -> Counter {
    CachePadded::new(AtomicU64::new(0))
}

#[inline]
fn load(counter: &Counter) -> u64 {
    counter.load(Ordering::Acquire)
}

#[inline]
fn add(counter: &Counter, value: u64) {
    counter.fetch_add(value, Ordering::Release);
}

#[inline]
fn sub_saturating(counter: &Counter, value: u64) {
    let _ = counter.fetch_update(Ordering::Release, Ordering::Acquire, |current| {
        Some(current.saturating_sub(value))
    });
}

/// Extra statistics appended to `MemStats::statistics`.
pub trait StatsExtension: Send + Sync {
    /// Domain-specific detail, already formatted. Empty if there is nothing to add.
    fn additional_statistics(&self) -> String;
}

/// Extension that adds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAdditionalStats;

impl StatsExtension for NoAdditionalStats {
    fn additional_statistics(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ClassFootprint {
    allocated_bytes: u64,
    freed_bytes: u64,
    allocated_objects: u64,
    freed_objects: u64,
}

/// Extension tracking footprint per class name.
#[derive(Default)]
pub struct ClassFootprintStats {
    classes: Mutex<FxHashMap<String, ClassFootprint>>,
}

impl ClassFootprintStats {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object of `class` allocated with `size` bytes
    pub fn record_allocate(&self, class: &str, size: usize) {
        let mut classes = self.classes.lock();
        let entry = classes.entry(class.to_string()).or_default();
        entry.allocated_bytes += size as u64;
        entry.allocated_objects += 1;
    }

    /// Record an object of `class` with `size` bytes freed
    pub fn record_free(&self, class: &str, size: usize) {
        let mut classes = self.classes.lock();
        let entry = classes.entry(class.to_string()).or_default();
        entry.freed_bytes += size as u64;
        entry.freed_objects += 1;
    }

    /// Live bytes of `class`
    pub fn footprint(&self, class: &str) -> u64 {
        self.classes
            .lock()
            .get(class)
            .map_or(0, |c| c.allocated_bytes.saturating_sub(c.freed_bytes))
    }
}

impl StatsExtension for ClassFootprintStats {
    fn additional_statistics(&self) -> String {
        let classes = self.classes.lock();
        let mut names: Vec<&String> = classes.keys().collect();
        names.sort();

        let mut out = String::new();
        if names.is_empty() {
            return out;
        }
        let _ = writeln!(out, "Footprint per class:");
        for name in names {
            let c = &classes[name];
            let _ = writeln!(
                out,
                "  {name}: {} bytes in {} objects",
                c.allocated_bytes.saturating_sub(c.freed_bytes),
                c.allocated_objects.saturating_sub(c.freed_objects)
            );
        }
        out
    }
}

/// Heap-manager view consumed by `MemStats::final_statistics`.
pub trait HeapStatsSource {
    /// Bytes currently reserved for the heap
    fn total_memory(&self) -> usize;
    /// Heap size limit
    fn max_memory(&self) -> usize;
    /// Reserved but unused heap bytes
    fn free_memory(&self) -> usize;
    /// The collector's own statistics dump
    fn gc_statistics(&self) -> String;
    /// Native bytes registered with the collector
    fn native_bytes_registered(&self) -> usize;
}

/// Point-in-time copy of the counters the GC statistics diff against.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStatsSnapshot {
    /// Regular objects freed
    pub objects_freed: u64,
    /// Bytes freed in object and non-movable spaces
    pub freed_bytes: u64,
    /// Humongous objects freed
    pub humongous_objects_freed: u64,
    /// Bytes freed in the humongous space
    pub humongous_freed_bytes: u64,
    /// Objects moved out of the young generation
    pub young_moved_objects: u64,
    /// Bytes moved out of the young generation
    pub young_moved_bytes: u64,
    /// Objects moved inside the tenured generation
    pub tenured_moved_objects: u64,
    /// Bytes moved inside the tenured generation
    pub tenured_moved_bytes: u64,
}

/// Allocation accounting for one VM.
pub struct MemStats {
    allocated_bytes: [Counter; SPACE_TYPE_COUNT],
    freed_bytes: [Counter; SPACE_TYPE_COUNT],
    peak_footprint: [Counter; SPACE_TYPE_COUNT],
    objects_allocated: Counter,
    objects_freed: Counter,
    humongous_objects_allocated: Counter,
    humongous_objects_freed: Counter,
    young_moved_objects: Counter,
    young_moved_bytes: Counter,
    tenured_moved_objects: Counter,
    tenured_moved_bytes: Counter,
    last_young_moved_bytes: Counter,
    extension: Arc<dyn StatsExtension>,
}

impl MemStats {
    /// Counters with no extension
    pub fn new() -> Self {
        Self::with_extension(Arc::new(NoAdditionalStats))
    }

    /// Counters whose text dump ends with `extension`'s statistics
    pub fn with_extension(extension: Arc<dyn StatsExtension>) -> Self {
        Self {
            allocated_bytes: std::array::from_fn(|_| counter()),
            freed_bytes: std::array::from_fn(|_| counter()),
            peak_footprint: std::array::from_fn(|_| counter()),
            objects_allocated: counter(),
            objects_freed: counter(),
            humongous_objects_allocated: counter(),
            humongous_objects_freed: counter(),
            young_moved_objects: counter(),
            young_moved_bytes: counter(),
            tenured_moved_objects: counter(),
            tenured_moved_bytes: counter(),
            last_young_moved_bytes: counter(),
            extension,
        }
    }

    // --- Recording ---

    /// Record one object of `size` bytes allocated in `space`
    #[inline]
    pub fn record_allocate_object(&self, size: usize, space: SpaceType) {
        self.record_allocate_objects(1, size, space);
    }

    /// Record `count` objects totalling `total_size` bytes allocated in `space`
    pub fn record_allocate_objects(&self, count: usize, total_size: usize, space: SpaceType) {
        add(&self.allocated_bytes[space.index()], total_size as u64);
        if space == SpaceType::HumongousObject {
            add(&self.humongous_objects_allocated, count as u64);
        } else {
            add(&self.objects_allocated, count as u64);
        }
        self.peak_footprint[space.index()].fetch_max(self.footprint(space), Ordering::Release);
    }

    /// Record one object of `size` bytes freed from `space`
    #[inline]
    pub fn record_free_object(&self, size: usize, space: SpaceType) {
        self.record_free_objects(1, size, space);
    }

    /// Record `count` objects totalling `total_size` bytes freed from `space`
    pub fn record_free_objects(&self, count: usize, total_size: usize, space: SpaceType) {
        add(&self.freed_bytes[space.index()], total_size as u64);
        if space == SpaceType::HumongousObject {
            add(&self.humongous_objects_freed, count as u64);
        } else {
            add(&self.objects_freed, count as u64);
        }
    }

    /// Record `size` raw bytes allocated in `space`.
    ///
    /// Only the byte counters move; object counts stay heap-only.
    pub fn record_allocate_raw(&self, size: usize, space: SpaceType) {
        add(&self.allocated_bytes[space.index()], size as u64);
        self.peak_footprint[space.index()].fetch_max(self.footprint(space), Ordering::Release);
    }

    /// Record `size` raw bytes freed from `space`
    pub fn record_free_raw(&self, size: usize, space: SpaceType) {
        add(&self.freed_bytes[space.index()], size as u64);
    }

    /// Record objects evacuated from the young generation.
    ///
    /// Humongous objects never move.
    pub fn record_young_moved_objects(&self, count: usize, size: usize, space: SpaceType) {
        debug_assert_ne!(space, SpaceType::HumongousObject, "humongous objects never move");
        add(&self.young_moved_objects, count as u64);
        add(&self.young_moved_bytes, size as u64);
        add(&self.last_young_moved_bytes, size as u64);
        sub_saturating(&self.objects_allocated, count as u64);
    }

    /// Record objects compacted inside the tenured generation.
    ///
    /// Humongous objects never move.
    pub fn record_tenured_moved_objects(&self, count: usize, size: usize, space: SpaceType) {
        debug_assert_ne!(space, SpaceType::HumongousObject, "humongous objects never move");
        add(&self.tenured_moved_objects, count as u64);
        add(&self.tenured_moved_bytes, size as u64);
        sub_saturating(&self.objects_allocated, count as u64);
    }

    /// Reset the per-cycle young-moved byte counter
    pub fn clear_last_young_objects_moved_bytes(&self) {
        self.last_young_moved_bytes.store(0, Ordering::Release);
    }

    // --- Queries ---

    /// Bytes ever allocated in `space`
    #[inline]
    pub fn allocated_bytes(&self, space: SpaceType) -> u64 {
        load(&self.allocated_bytes[space.index()])
    }

    /// Bytes ever freed from `space`
    #[inline]
    pub fn freed_bytes(&self, space: SpaceType) -> u64 {
        load(&self.freed_bytes[space.index()])
    }

    /// Live bytes in `space`
    #[inline]
    pub fn footprint(&self, space: SpaceType) -> u64 {
        self.allocated_bytes(space)
            .saturating_sub(self.freed_bytes(space))
    }

    /// Highest footprint `space` has reached
    pub fn max_footprint(&self, space: SpaceType) -> u64 {
        load(&self.peak_footprint[space.index()])
    }

    /// Live bytes across every space
    pub fn total_footprint(&self) -> u64 {
        SpaceType::ALL.iter().map(|&space| self.footprint(space)).sum()
    }

    /// Live bytes across the heap spaces
    pub fn footprint_heap(&self) -> u64 {
        SpaceType::ALL
            .iter()
            .filter(|space| space.is_heap_space())
            .map(|&space| self.footprint(space))
            .sum()
    }

    /// Regular objects allocated
    pub fn total_objects_allocated(&self) -> u64 {
        load(&self.objects_allocated)
    }

    /// Regular objects freed
    pub fn total_objects_freed(&self) -> u64 {
        load(&self.objects_freed)
    }

    /// Humongous objects allocated
    pub fn total_humongous_objects_allocated(&self) -> u64 {
        load(&self.humongous_objects_allocated)
    }

    /// Humongous objects freed
    pub fn total_humongous_objects_freed(&self) -> u64 {
        load(&self.humongous_objects_freed)
    }

    /// Regular objects alive
    pub fn objects_count_alive(&self) -> u64 {
        self.total_objects_allocated()
            .saturating_sub(self.total_objects_freed())
    }

    /// Humongous objects alive
    pub fn humongous_objects_count_alive(&self) -> u64 {
        self.total_humongous_objects_allocated()
            .saturating_sub(self.total_humongous_objects_freed())
    }

    /// Objects moved out of the young generation
    pub fn total_young_moved_objects(&self) -> u64 {
        load(&self.young_moved_objects)
    }

    /// Bytes moved out of the young generation
    pub fn total_young_moved_bytes(&self) -> u64 {
        load(&self.young_moved_bytes)
    }

    /// Objects compacted inside the tenured generation
    pub fn total_tenured_moved_objects(&self) -> u64 {
        load(&self.tenured_moved_objects)
    }

    /// Bytes compacted inside the tenured generation
    pub fn total_tenured_moved_bytes(&self) -> u64 {
        load(&self.tenured_moved_bytes)
    }

    /// Young bytes moved since the last `clear_last_young_objects_moved_bytes`
    pub fn last_young_objects_moved_bytes(&self) -> u64 {
        load(&self.last_young_moved_bytes)
    }

    /// Copy the counters GC statistics diff against
    pub fn snapshot(&self) -> MemStatsSnapshot {
        MemStatsSnapshot {
            objects_freed: self.total_objects_freed(),
            freed_bytes: self.freed_bytes(SpaceType::Object)
                + self.freed_bytes(SpaceType::NonMovableObject),
            humongous_objects_freed: self.total_humongous_objects_freed(),
            humongous_freed_bytes: self.freed_bytes(SpaceType::HumongousObject),
            young_moved_objects: self.total_young_moved_objects(),
            young_moved_bytes: self.total_young_moved_bytes(),
            tenured_moved_objects: self.total_tenured_moved_objects(),
            tenured_moved_bytes: self.total_tenured_moved_bytes(),
        }
    }

    // --- Text dumps ---

    fn write_space(out: &mut String, title: &str, allocated: u64, freed: u64, peak: u64) {
        let _ = writeln!(out, "{title}:");
        let _ = writeln!(
            out,
            "  footprint: {} bytes (peak {peak})",
            allocated.saturating_sub(freed)
        );
        let _ = writeln!(out, "  allocated: {allocated} bytes, freed: {freed} bytes");
    }

    /// Heap, raw and compiler totals followed by the extension's statistics
    pub fn statistics(&self) -> String {
        let mut out = String::new();

        let heap_spaces = SpaceType::ALL.iter().filter(|space| space.is_heap_space());
        let (allocated, freed, peak) = heap_spaces.fold((0, 0, 0), |(a, f, p), &space| {
            (
                a + self.allocated_bytes(space),
                f + self.freed_bytes(space),
                p + self.max_footprint(space),
            )
        });
        Self::write_space(&mut out, "Heap", allocated, freed, peak);
        let _ = writeln!(
            out,
            "  objects: {} allocated, {} freed, {} alive",
            self.total_objects_allocated(),
            self.total_objects_freed(),
            self.objects_count_alive()
        );
        let _ = writeln!(
            out,
            "  humongous objects: {} allocated, {} freed, {} alive",
            self.total_humongous_objects_allocated(),
            self.total_humongous_objects_freed(),
            self.humongous_objects_count_alive()
        );
        let _ = writeln!(
            out,
            "  moved: young {} objects / {} bytes, tenured {} objects / {} bytes",
            self.total_young_moved_objects(),
            self.total_young_moved_bytes(),
            self.total_tenured_moved_objects(),
            self.total_tenured_moved_bytes()
        );

        Self::write_space(
            &mut out,
            "Raw memory",
            self.allocated_bytes(SpaceType::Internal),
            self.freed_bytes(SpaceType::Internal),
            self.max_footprint(SpaceType::Internal),
        );
        Self::write_space(
            &mut out,
            "Compiler",
            self.allocated_bytes(SpaceType::Compiler),
            self.freed_bytes(SpaceType::Compiler),
            self.max_footprint(SpaceType::Compiler),
        );

        out.push_str(&self.extension.additional_statistics());
        out
    }

    /// `statistics` plus the heap manager and collector view, for VM shutdown
    pub fn final_statistics(&self, heap: &dyn HeapStatsSource) -> String {
        let mut out = self.statistics();
        let _ = writeln!(out, "Heap manager:");
        let _ = writeln!(
            out,
            "  total: {} bytes, max: {} bytes, free: {} bytes",
            heap.total_memory(),
            heap.max_memory(),
            heap.free_memory()
        );
        let _ = writeln!(
            out,
            "  native bytes registered: {}",
            heap.native_bytes_registered()
        );
        out.push_str(&heap.gc_statistics());
        out
    }
}

impl Default for MemStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_then_free_restores_footprint() {
        let stats = MemStats::new();
        for &space in SpaceType::ALL.iter() {
            let before = stats.footprint(space);
            stats.record_allocate_object(48, space);
            assert_eq!(stats.footprint(space), before + 48);
            stats.record_free_object(48, space);
            assert_eq!(stats.footprint(space), before);
        }
        assert_eq!(stats.total_footprint(), 0);
    }

    #[test]
    fn test_humongous_counted_separately() {
        let stats = MemStats::new();
        stats.record_allocate_objects(3, 300, SpaceType::Object);
        stats.record_allocate_objects(2, 2_000_000, SpaceType::HumongousObject);

        assert_eq!(stats.total_objects_allocated(), 3);
        assert_eq!(stats.total_humongous_objects_allocated(), 2);

        stats.record_free_object(100, SpaceType::Object);
        stats.record_free_object(1_000_000, SpaceType::HumongousObject);
        assert_eq!(stats.objects_count_alive(), 2);
        assert_eq!(stats.humongous_objects_count_alive(), 1);
        assert_eq!(stats.footprint_heap(), 200 + 1_000_000);
    }

    #[test]
    fn test_raw_bytes_leave_object_counts_alone() {
        let stats = MemStats::new();
        stats.record_allocate_objects(3, 96, SpaceType::Object);
        let before = stats.snapshot();

        stats.record_allocate_raw(64, SpaceType::Internal);
        stats.record_allocate_raw(128, SpaceType::Compiler);
        assert_eq!(stats.footprint(SpaceType::Internal), 64);
        assert_eq!(stats.max_footprint(SpaceType::Compiler), 128);
        stats.record_free_raw(64, SpaceType::Internal);
        stats.record_free_raw(128, SpaceType::Compiler);

        assert_eq!(stats.total_objects_allocated(), 3);
        assert_eq!(stats.total_objects_freed(), 0);
        assert_eq!(stats.objects_count_alive(), 3);
        assert_eq!(stats.footprint(SpaceType::Internal), 0);
        let after = stats.snapshot();
        assert_eq!(after.objects_freed, before.objects_freed);
        assert_eq!(after.freed_bytes, before.freed_bytes);
    }

    #[test]
    fn test_moved_objects_adjust_alive_count() {
        let stats = MemStats::new();
        stats.record_allocate_objects(10, 1000, SpaceType::Object);
        stats.record_young_moved_objects(4, 400, SpaceType::Object);
        stats.record_tenured_moved_objects(1, 100, SpaceType::Object);

        assert_eq!(stats.total_objects_allocated(), 5);
        assert_eq!(stats.total_young_moved_bytes(), 400);
        assert_eq!(stats.total_tenured_moved_bytes(), 100);
        assert_eq!(stats.last_young_objects_moved_bytes(), 400);

        stats.clear_last_young_objects_moved_bytes();
        assert_eq!(stats.last_young_objects_moved_bytes(), 0);
        assert_eq!(stats.total_young_moved_bytes(), 400);
    }

    #[test]
    fn test_peak_footprint() {
        let stats = MemStats::new();
        stats.record_allocate_object(100, SpaceType::Internal);
        stats.record_allocate_object(50, SpaceType::Internal);
        stats.record_free_object(150, SpaceType::Internal);
        stats.record_allocate_object(10, SpaceType::Internal);
        assert_eq!(stats.max_footprint(SpaceType::Internal), 150);
        assert_eq!(stats.footprint(SpaceType::Internal), 10);
    }

    #[test]
    fn test_statistics_include_extension() {
        let classes = Arc::new(ClassFootprintStats::new());
        let stats = MemStats::with_extension(classes.clone());

        classes.record_allocate("String", 32);
        classes.record_allocate("String", 32);
        classes.record_free("String", 32);
        stats.record_allocate_object(64, SpaceType::Object);

        assert_eq!(classes.footprint("String"), 32);
        let text = stats.statistics();
        assert!(text.contains("Heap:"));
        assert!(text.contains("Raw memory:"));
        assert!(text.contains("Compiler:"));
        assert!(text.contains("String: 32 bytes in 1 objects"));
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(MemStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_allocate_object(8, SpaceType::Object);
                        stats.record_free_object(8, SpaceType::Object);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.total_objects_allocated(), 4000);
        assert_eq!(stats.total_objects_freed(), 4000);
        assert_eq!(stats.footprint(SpaceType::Object), 0);
    }

    struct FakeHeap;

    impl HeapStatsSource for FakeHeap {
        fn total_memory(&self) -> usize {
            1024
        }
        fn max_memory(&self) -> usize {
            4096
        }
        fn free_memory(&self) -> usize {
            512
        }
        fn gc_statistics(&self) -> String {
            "gc: 3 cycles\n".to_string()
        }
        fn native_bytes_registered(&self) -> usize {
            77
        }
    }

    #[test]
    fn test_final_statistics() {
        let stats = MemStats::new();
        let text = stats.final_statistics(&FakeHeap);
        assert!(text.contains("total: 1024 bytes, max: 4096 bytes, free: 512 bytes"));
        assert!(text.contains("native bytes registered: 77"));
        assert!(text.ends_with("gc: 3 cycles\n"));
    }
}
