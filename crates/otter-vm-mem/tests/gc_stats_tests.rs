//! GC statistics integration tests
//!
//! Full cycles driven through the public API against real accounting.

use std::sync::Arc;
use std::time::Duration;

use otter_vm_mem::{
    CollectionKind, GcInstanceStats, GcScopedPauseStats, GcScopedStats, GcStats, GcStatsConfig,
    GcType, HeapStatsSource, MemStats, MemoryStat, ObjectsStat, PauseType, SpaceType, TimeStat,
};

fn gc(gc_type: GcType) -> (Arc<MemStats>, GcStats, GcInstanceStats) {
    let mem = Arc::new(MemStats::new());
    let stats = GcStats::new(mem.clone(), gc_type, GcStatsConfig::default());
    (mem, stats, GcInstanceStats::new(gc_type))
}

#[test]
fn test_young_then_full_cycle() {
    let (mem, stats, instance) = gc(GcType::Generational);
    mem.record_allocate_objects(100, 6400, SpaceType::Object);

    // Young cycle: 40 die, 10 survive and are evacuated
    stats.start_collect_stats(CollectionKind::Young);
    stats.add_pause(Duration::from_millis(2), Some(&instance), PauseType::Common);
    mem.record_free_objects(40, 2560, SpaceType::Object);
    mem.record_young_moved_objects(10, 640, SpaceType::Object);
    stats.stop_collect_stats(Some(&instance));
    stats.record_duration(Duration::from_millis(3), Some(&instance));
    stats.reset_last_pause();

    assert_eq!(stats.objects_freed(), 40);
    assert_eq!(stats.young_moved_bytes(), 640);
    assert_eq!(mem.last_young_objects_moved_bytes(), 640);
    assert_eq!(instance.objects_stat(ObjectsStat::YoungFreedObjects).sum(), 40);
    assert_eq!(instance.objects_stat(ObjectsStat::MovedObjects).sum(), 10);
    assert_eq!(instance.memory_stat(MemoryStat::MovedBytes).sum(), 640);
    assert_eq!(instance.time_stat(TimeStat::YoungPausedTime).count(), 1);
    assert_eq!(instance.time_stat(TimeStat::YoungTotalTime).count(), 1);

    // Full cycle with concurrent marking pauses
    stats.start_collect_stats(CollectionKind::All);
    // Young-moved counter restarts each cycle
    assert_eq!(mem.last_young_objects_moved_bytes(), 0);
    stats.add_pause(Duration::from_millis(1), Some(&instance), PauseType::InitialMark);
    stats.add_pause(Duration::from_millis(5), Some(&instance), PauseType::Remark);
    mem.record_free_objects(20, 1280, SpaceType::Object);
    mem.record_allocate_object(1 << 21, SpaceType::HumongousObject);
    mem.record_free_object(1 << 21, SpaceType::HumongousObject);
    stats.stop_collect_stats(Some(&instance));
    stats.record_duration(Duration::from_millis(10), Some(&instance));

    assert_eq!(stats.phase_pause(PauseType::InitialMark), Duration::from_millis(1));
    assert_eq!(stats.phase_pause(PauseType::Remark), Duration::from_millis(5));
    assert_eq!(stats.phase_pause(PauseType::Common), Duration::ZERO);
    stats.reset_last_pause();

    assert_eq!(stats.objects_freed(), 20);
    assert_eq!(stats.large_objects_freed(), 1);
    assert_eq!(stats.large_objects_freed_bytes(), 1 << 21);
    assert_eq!(stats.young_moved_objects(), 0);
    assert_eq!(
        instance.memory_stat(MemoryStat::AllFreedBytes).sum(),
        1280 + (1 << 21)
    );
    assert_eq!(instance.time_stat(TimeStat::AllPausedTime).count(), 2);

    assert_eq!(stats.gc_count(), 2);
    assert_eq!(stats.total_duration(), Duration::from_millis(13));
    assert_eq!(stats.last_duration(), Duration::from_millis(10));
    assert_eq!(stats.total_pause(), Duration::from_millis(8));

    let dump = instance.dump();
    assert!(dump.contains("Young space (gen-gc):"));
    assert!(dump.contains("All spaces (gen-gc):"));
}

#[test]
fn test_cycle_without_freed_bytes_not_published() {
    let (mem, stats, instance) = gc(GcType::StopTheWorld);
    mem.record_allocate_objects(5, 500, SpaceType::Object);
    {
        let _scope = GcScopedStats::new(&stats, Some(&instance), CollectionKind::All);
    }
    assert_eq!(stats.gc_count(), 1);
    assert_eq!(instance.objects_stat(ObjectsStat::AllFreedObjects).count(), 0);
    assert_eq!(instance.memory_stat(MemoryStat::AllFreedBytes).count(), 0);
    // Duration is always recorded
    assert_eq!(instance.time_stat(TimeStat::AllTotalTime).count(), 1);
    assert!(instance.all_spaces_dump().contains("total:"));
    assert!(!instance.all_spaces_dump().contains("freed"));
}

#[test]
fn test_scoped_guards_run_on_early_exit() {
    let (mem, stats, instance) = gc(GcType::G1);

    fn collect(
        stats: &GcStats,
        instance: &GcInstanceStats,
        mem: &MemStats,
        bail: bool,
    ) -> Option<()> {
        let _cycle = GcScopedStats::new(stats, Some(instance), CollectionKind::Young);
        let _pause = GcScopedPauseStats::new(stats, Some(instance), PauseType::Common);
        mem.record_free_objects(1, 32, SpaceType::Object);
        if bail {
            return None;
        }
        Some(())
    }

    assert!(collect(&stats, &instance, &mem, true).is_none());
    stats.reset_last_pause();
    assert!(collect(&stats, &instance, &mem, false).is_some());

    assert_eq!(stats.gc_count(), 2);
    assert_eq!(instance.memory_stat(MemoryStat::YoungFreedBytes).count(), 2);
    assert_eq!(instance.memory_stat(MemoryStat::YoungFreedBytes).sum(), 64);
}

#[test]
fn test_mutator_lock_from_many_threads() {
    let (_mem, stats, _instance) = gc(GcType::G1);
    let stats = Arc::new(stats);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let stats = Arc::clone(&stats);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    stats.start_mutator_lock();
                    stats.stop_mutator_lock();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Balanced calls leave no region open
    stats.start_mutator_lock();
    std::thread::sleep(Duration::from_millis(2));
    let before = stats.total_mutator_pause();
    stats.stop_mutator_lock();
    assert!(stats.total_mutator_pause() >= before + Duration::from_millis(2));
}

#[test]
fn test_statistics_text() {
    let (mem, stats, _instance) = gc(GcType::G1);
    stats.start_collect_stats(CollectionKind::All);
    mem.record_free_objects(3, 96, SpaceType::Object);
    stats.stop_collect_stats(None);
    stats.record_duration(Duration::from_millis(1), None);

    let text = stats.statistics();
    assert!(text.starts_with("GC statistics (g1-gc):"));
    assert!(text.contains("cycles: 1"));
    assert!(text.contains("last cycle freed: 3 objects (96 bytes)"));
    assert!(text.contains("throughput:"));
    assert!(stats.throughput() <= 100.0);
}

struct Heap<'a> {
    stats: &'a GcStats,
}

impl HeapStatsSource for Heap<'_> {
    fn total_memory(&self) -> usize {
        64 * 1024 * 1024
    }
    fn max_memory(&self) -> usize {
        256 * 1024 * 1024
    }
    fn free_memory(&self) -> usize {
        32 * 1024 * 1024
    }
    fn gc_statistics(&self) -> String {
        self.stats.statistics()
    }
    fn native_bytes_registered(&self) -> usize {
        0
    }
}

#[test]
fn test_final_statistics_embed_gc_dump() {
    let (mem, stats, _instance) = gc(GcType::G1);
    mem.record_allocate_object(128, SpaceType::Object);
    let text = mem.final_statistics(&Heap { stats: &stats });
    assert!(text.starts_with("Heap:"));
    assert!(text.contains("Heap manager:"));
    assert!(text.contains("GC statistics (g1-gc):"));
}
