//! GC pause and duration statistics
//!
//! One `GcStats` lives alongside each collector. A cycle runs through:
//!
//! 1. `start_collect_stats` snapshots the `MemStats` counters
//! 2. the collector works, calling `add_pause` per pause
//! 3. `stop_collect_stats` diffs the counters and publishes freed/moved
//!    figures to the collector's `GcInstanceStats`
//! 4. `record_duration` updates duration totals and the period histogram
//! 5. `reset_last_pause` clears the per-cycle pause slots
//!
//! `GcScopedStats` and `GcScopedPauseStats` wrap steps 1/3/4 and single
//! pauses in drop guards. Everything except the mutator-lock pair is
//! single-writer (the thread driving the cycle); readers may run anywhere.
//! Sequencing mistakes trip debug assertions only.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::GcStatsConfig;
use crate::histogram::Histogram;
use crate::instance_stats::{GcInstanceStats, GcType, MemoryStat, ObjectsStat, TimeStat};
use crate::mem_stats::{MemStats, MemStatsSnapshot};

/// Pause category within one cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseType {
    /// Generic pause; may be accumulated from several call sites
    Common = 0,
    /// Pause that starts concurrent marking
    InitialMark = 1,
    /// Pause that finishes concurrent marking
    Remark = 2,
}

impl PauseType {
    /// Number of pause types
    pub const COUNT: usize = 3;

    /// All pause types in index order
    pub const ALL: [PauseType; Self::COUNT] =
        [PauseType::Common, PauseType::InitialMark, PauseType::Remark];

    /// Dense index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            PauseType::Common => "common",
            PauseType::InitialMark => "initial mark",
            PauseType::Remark => "remark",
        }
    }
}

/// Which generations a cycle collects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Young generation only
    Young,
    /// Every generation
    #[default]
    All,
}

#[inline]
fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleResult {
    objects_freed: u64,
    freed_bytes: u64,
    large_objects_freed: u64,
    large_freed_bytes: u64,
    young_moved_objects: u64,
    young_moved_bytes: u64,
}

struct CycleState {
    kind: CollectionKind,
    snapshot: MemStatsSnapshot,
    last: CycleResult,
    /// Non-common pause types already recorded this cycle
    pause_seen: [bool; PauseType::COUNT],
    prev_pause: PauseType,
}

struct MutatorPause {
    depth: u32,
    started: Option<Instant>,
    total: Duration,
}

struct PeriodCounter {
    histogram: Histogram,
    period: u64,
    count: u64,
}

/// Pause, duration and throughput statistics of one collector.
pub struct GcStats {
    gc_type: GcType,
    mem_stats: Arc<MemStats>,
    histogram_period: Duration,
    start_time: Instant,
    last_pause: [AtomicU64; PauseType::COUNT],
    total_pause: AtomicU64,
    last_duration: AtomicU64,
    total_duration: AtomicU64,
    gc_count: AtomicU64,
    cycle: Mutex<CycleState>,
    mutator: Mutex<MutatorPause>,
    periods: Mutex<PeriodCounter>,
}

impl GcStats {
    /// Statistics for a collector of `gc_type` reading `mem_stats`
    pub fn new(mem_stats: Arc<MemStats>, gc_type: GcType, config: GcStatsConfig) -> Self {
        Self {
            gc_type,
            mem_stats,
            histogram_period: config.histogram_period.max(Duration::from_nanos(1)),
            start_time: Instant::now(),
            last_pause: Default::default(),
            total_pause: AtomicU64::new(0),
            last_duration: AtomicU64::new(0),
            total_duration: AtomicU64::new(0),
            gc_count: AtomicU64::new(0),
            cycle: Mutex::new(CycleState {
                kind: CollectionKind::All,
                snapshot: MemStatsSnapshot::default(),
                last: CycleResult::default(),
                pause_seen: [false; PauseType::COUNT],
                prev_pause: PauseType::Common,
            }),
            mutator: Mutex::new(MutatorPause {
                depth: 0,
                started: None,
                total: Duration::ZERO,
            }),
            periods: Mutex::new(PeriodCounter {
                histogram: Histogram::new(),
                period: 0,
                count: 0,
            }),
        }
    }

    /// Collector family
    pub fn gc_type(&self) -> GcType {
        self.gc_type
    }

    // --- Cycle ---

    /// Open a cycle collecting `kind`.
    pub fn start_collect_stats(&self, kind: CollectionKind) {
        self.mem_stats.clear_last_young_objects_moved_bytes();
        let mut cycle = self.cycle.lock();
        cycle.kind = kind;
        cycle.snapshot = self.mem_stats.snapshot();
    }

    /// Close the cycle opened by `start_collect_stats`.
    ///
    /// Freed and moved figures are published to `instance` only if the
    /// cycle freed any bytes.
    pub fn stop_collect_stats(&self, instance: Option<&GcInstanceStats>) {
        let now = self.mem_stats.snapshot();
        let mut cycle = self.cycle.lock();
        let before = cycle.snapshot;
        let result = CycleResult {
            objects_freed: now.objects_freed.saturating_sub(before.objects_freed),
            freed_bytes: now.freed_bytes.saturating_sub(before.freed_bytes),
            large_objects_freed: now
                .humongous_objects_freed
                .saturating_sub(before.humongous_objects_freed),
            large_freed_bytes: now
                .humongous_freed_bytes
                .saturating_sub(before.humongous_freed_bytes),
            young_moved_objects: now
                .young_moved_objects
                .saturating_sub(before.young_moved_objects),
            young_moved_bytes: now
                .young_moved_bytes
                .saturating_sub(before.young_moved_bytes),
        };
        cycle.last = result;
        let kind = cycle.kind;
        drop(cycle);

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "otter::mem",
            gc = %self.gc_type,
            ?kind,
            objects = result.objects_freed,
            bytes = result.freed_bytes,
            large_objects = result.large_objects_freed,
            large_bytes = result.large_freed_bytes,
            "GC cycle stats"
        );

        let Some(instance) = instance else { return };
        if result.freed_bytes + result.large_freed_bytes == 0 {
            return;
        }
        let objects = result.objects_freed + result.large_objects_freed;
        let bytes = result.freed_bytes + result.large_freed_bytes;
        match kind {
            CollectionKind::Young => {
                instance.add_objects_value(objects, ObjectsStat::YoungFreedObjects);
                instance.add_memory_value(bytes, MemoryStat::YoungFreedBytes);
            }
            CollectionKind::All => {
                instance.add_objects_value(objects, ObjectsStat::AllFreedObjects);
                instance.add_memory_value(bytes, MemoryStat::AllFreedBytes);
            }
        }
        if result.young_moved_objects > 0 {
            instance.add_objects_value(result.young_moved_objects, ObjectsStat::MovedObjects);
            instance.add_memory_value(result.young_moved_bytes, MemoryStat::MovedBytes);
        }
    }

    /// Account a finished cycle that took `duration`.
    pub fn record_duration(&self, duration: Duration, instance: Option<&GcInstanceStats>) {
        self.record_duration_at(duration, instance, self.start_time.elapsed());
    }

    /// `record_duration` as if `since_start` had passed since creation.
    pub(crate) fn record_duration_at(
        &self,
        duration: Duration,
        instance: Option<&GcInstanceStats>,
        since_start: Duration,
    ) {
        let period = u64::try_from(since_start.as_nanos() / self.histogram_period.as_nanos())
            .unwrap_or(u64::MAX);
        {
            let mut periods = self.periods.lock();
            if period != periods.period {
                let finished = periods.count;
                periods.histogram.add_count(finished, u64::from(finished > 0));
                periods.count = 0;
                periods.period = period;
            }
            periods.count += 1;
        }

        self.last_duration.store(nanos(duration), Ordering::Release);
        self.total_duration
            .fetch_add(nanos(duration), Ordering::Release);
        self.gc_count.fetch_add(1, Ordering::Release);

        if let Some(instance) = instance {
            let stat = match self.cycle.lock().kind {
                CollectionKind::Young => TimeStat::YoungTotalTime,
                CollectionKind::All => TimeStat::AllTotalTime,
            };
            instance.add_time_value(duration, stat);
        }
    }

    /// Record a pause of `pause_type`.
    ///
    /// `Common` may be added repeatedly, but not after another type in the
    /// same cycle. Every other type is added at most once per cycle.
    pub fn add_pause(
        &self,
        pause: Duration,
        instance: Option<&GcInstanceStats>,
        pause_type: PauseType,
    ) {
        let kind = {
            let mut cycle = self.cycle.lock();
            debug_assert!(
                cycle.prev_pause == PauseType::Common || pause_type != PauseType::Common,
                "common pause interleaved with {} pause",
                cycle.prev_pause.name()
            );
            if pause_type != PauseType::Common {
                debug_assert!(
                    !cycle.pause_seen[pause_type.index()],
                    "{} pause recorded twice in one cycle",
                    pause_type.name()
                );
                cycle.pause_seen[pause_type.index()] = true;
            }
            cycle.prev_pause = pause_type;
            cycle.kind
        };

        self.last_pause[pause_type.index()].fetch_add(nanos(pause), Ordering::Release);
        self.total_pause.fetch_add(nanos(pause), Ordering::Release);

        if let Some(instance) = instance
            && !pause.is_zero()
        {
            let stat = match kind {
                CollectionKind::Young => TimeStat::YoungPausedTime,
                CollectionKind::All => TimeStat::AllPausedTime,
            };
            instance.add_time_value(pause, stat);
        }
    }

    /// Clear per-cycle pause slots for the next cycle
    pub fn reset_last_pause(&self) {
        for slot in &self.last_pause {
            slot.store(0, Ordering::Release);
        }
        let mut cycle = self.cycle.lock();
        cycle.pause_seen = [false; PauseType::COUNT];
        cycle.prev_pause = PauseType::Common;
    }

    // --- Mutator lock ---

    /// Enter a region where mutators are stopped. Reentrant.
    pub fn start_mutator_lock(&self) {
        let mut mutator = self.mutator.lock();
        if mutator.depth == 0 {
            mutator.started = Some(Instant::now());
        }
        mutator.depth += 1;
    }

    /// Leave a region entered with `start_mutator_lock`.
    ///
    /// The outermost exit commits the elapsed time. Unmatched calls are ignored.
    pub fn stop_mutator_lock(&self) {
        let mut mutator = self.mutator.lock();
        if mutator.depth == 0 {
            return;
        }
        mutator.depth -= 1;
        if mutator.depth == 0
            && let Some(started) = mutator.started.take()
        {
            mutator.total += started.elapsed();
        }
    }

    // --- Queries ---

    /// Pause of `pause_type` in the current cycle
    pub fn phase_pause(&self, pause_type: PauseType) -> Duration {
        Duration::from_nanos(self.last_pause[pause_type.index()].load(Ordering::Acquire))
    }

    /// All pauses ever recorded
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.total_pause.load(Ordering::Acquire))
    }

    /// Duration of the last recorded cycle
    pub fn last_duration(&self) -> Duration {
        Duration::from_nanos(self.last_duration.load(Ordering::Acquire))
    }

    /// Sum of every cycle's duration
    pub fn total_duration(&self) -> Duration {
        Duration::from_nanos(self.total_duration.load(Ordering::Acquire))
    }

    /// Time spent inside committed mutator-lock regions
    pub fn total_mutator_pause(&self) -> Duration {
        self.mutator.lock().total
    }

    /// Regular objects freed by the last cycle
    pub fn objects_freed(&self) -> u64 {
        self.cycle.lock().last.objects_freed
    }

    /// Bytes of regular objects freed by the last cycle
    pub fn objects_freed_bytes(&self) -> u64 {
        self.cycle.lock().last.freed_bytes
    }

    /// Humongous objects freed by the last cycle
    pub fn large_objects_freed(&self) -> u64 {
        self.cycle.lock().last.large_objects_freed
    }

    /// Bytes of humongous objects freed by the last cycle
    pub fn large_objects_freed_bytes(&self) -> u64 {
        self.cycle.lock().last.large_freed_bytes
    }

    /// Objects moved out of the young generation by the last cycle
    pub fn young_moved_objects(&self) -> u64 {
        self.cycle.lock().last.young_moved_objects
    }

    /// Bytes moved out of the young generation by the last cycle
    pub fn young_moved_bytes(&self) -> u64 {
        self.cycle.lock().last.young_moved_bytes
    }

    /// Cycles recorded
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Cycles per finished histogram period.
    ///
    /// The period currently running is not included.
    pub fn period_histogram(&self) -> Histogram {
        self.periods.lock().histogram.clone()
    }

    /// Percentage of wall time since creation not spent in GC pauses
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 100.0;
        }
        let paused = self.total_pause().as_secs_f64().min(elapsed);
        (1.0 - paused / elapsed) * 100.0
    }

    /// Human readable summary
    pub fn statistics(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "GC statistics ({}):", self.gc_type);
        let _ = writeln!(out, "  cycles: {}", self.gc_count());
        let _ = writeln!(
            out,
            "  duration: last {:?}, total {:?}",
            self.last_duration(),
            self.total_duration()
        );
        let _ = write!(out, "  pause: total {:?}", self.total_pause());
        for pause_type in PauseType::ALL {
            let _ = write!(out, ", {} {:?}", pause_type.name(), self.phase_pause(pause_type));
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "  mutator pause: {:?}", self.total_mutator_pause());
        let _ = writeln!(
            out,
            "  last cycle freed: {} objects ({} bytes), {} large objects ({} bytes)",
            self.objects_freed(),
            self.objects_freed_bytes(),
            self.large_objects_freed(),
            self.large_objects_freed_bytes()
        );
        let _ = writeln!(
            out,
            "  last cycle young moved: {} objects ({} bytes)",
            self.young_moved_objects(),
            self.young_moved_bytes()
        );
        let _ = writeln!(out, "  throughput: {:.2}%", self.throughput());
        let _ = writeln!(out, "  cycles per period: {}", self.period_histogram());
        out
    }
}

/// Drop guard bracketing one GC cycle.
///
/// Runs `start_collect_stats` on creation and `stop_collect_stats` plus
/// `record_duration` on drop, on every exit path.
pub struct GcScopedStats<'a> {
    stats: &'a GcStats,
    instance: Option<&'a GcInstanceStats>,
    started: Instant,
}

impl<'a> GcScopedStats<'a> {
    /// Open a cycle collecting `kind`
    pub fn new(
        stats: &'a GcStats,
        instance: Option<&'a GcInstanceStats>,
        kind: CollectionKind,
    ) -> Self {
        stats.start_collect_stats(kind);
        Self {
            stats,
            instance,
            started: Instant::now(),
        }
    }
}

impl Drop for GcScopedStats<'_> {
    fn drop(&mut self) {
        self.stats.stop_collect_stats(self.instance);
        self.stats
            .record_duration(self.started.elapsed(), self.instance);
    }
}

/// Drop guard timing one pause.
pub struct GcScopedPauseStats<'a> {
    stats: &'a GcStats,
    instance: Option<&'a GcInstanceStats>,
    pause_type: PauseType,
    started: Instant,
}

impl<'a> GcScopedPauseStats<'a> {
    /// Start timing a pause of `pause_type`
    pub fn new(
        stats: &'a GcStats,
        instance: Option<&'a GcInstanceStats>,
        pause_type: PauseType,
    ) -> Self {
        Self {
            stats,
            instance,
            pause_type,
            started: Instant::now(),
        }
    }
}

impl Drop for GcScopedPauseStats<'_> {
    fn drop(&mut self) {
        self.stats
            .add_pause(self.started.elapsed(), self.instance, self.pause_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceType;

    fn stats() -> (Arc<MemStats>, GcStats) {
        let mem = Arc::new(MemStats::new());
        let gc = GcStats::new(mem.clone(), GcType::G1, GcStatsConfig::default());
        (mem, gc)
    }

    #[test]
    fn test_cycle_deltas() {
        let (mem, gc) = stats();
        mem.record_allocate_objects(10, 1000, SpaceType::Object);
        mem.record_free_objects(2, 200, SpaceType::Object);

        gc.start_collect_stats(CollectionKind::All);
        mem.record_free_objects(3, 300, SpaceType::Object);
        mem.record_free_objects(1, 50, SpaceType::NonMovableObject);
        mem.record_allocate_object(1 << 20, SpaceType::HumongousObject);
        mem.record_free_object(1 << 20, SpaceType::HumongousObject);
        mem.record_young_moved_objects(2, 64, SpaceType::Object);
        gc.stop_collect_stats(None);

        assert_eq!(gc.objects_freed(), 4);
        assert_eq!(gc.objects_freed_bytes(), 350);
        assert_eq!(gc.large_objects_freed(), 1);
        assert_eq!(gc.large_objects_freed_bytes(), 1 << 20);
        assert_eq!(gc.young_moved_objects(), 2);
        assert_eq!(gc.young_moved_bytes(), 64);
    }

    #[test]
    fn test_publish_only_when_bytes_freed() {
        let (mem, gc) = stats();
        let instance = GcInstanceStats::new(GcType::G1);

        gc.start_collect_stats(CollectionKind::Young);
        gc.stop_collect_stats(Some(&instance));
        assert_eq!(instance.objects_stat(ObjectsStat::YoungFreedObjects).count(), 0);

        gc.start_collect_stats(CollectionKind::Young);
        mem.record_free_objects(5, 500, SpaceType::Object);
        gc.stop_collect_stats(Some(&instance));
        let freed = instance.memory_stat(MemoryStat::YoungFreedBytes);
        assert_eq!(freed.count(), 1);
        assert_eq!(freed.sum(), 500);
        assert_eq!(instance.memory_stat(MemoryStat::AllFreedBytes).count(), 0);
    }

    #[test]
    fn test_pauses() {
        let (_mem, gc) = stats();
        gc.add_pause(Duration::from_millis(1), None, PauseType::Common);
        gc.add_pause(Duration::from_millis(2), None, PauseType::Common);
        gc.add_pause(Duration::from_millis(4), None, PauseType::Remark);

        assert_eq!(gc.phase_pause(PauseType::Common), Duration::from_millis(3));
        assert_eq!(gc.phase_pause(PauseType::Remark), Duration::from_millis(4));
        assert_eq!(gc.total_pause(), Duration::from_millis(7));

        gc.reset_last_pause();
        assert_eq!(gc.phase_pause(PauseType::Common), Duration::ZERO);
        assert_eq!(gc.total_pause(), Duration::from_millis(7));

        // A new cycle may record remark again
        gc.add_pause(Duration::from_millis(1), None, PauseType::Remark);
        assert_eq!(gc.total_pause(), Duration::from_millis(8));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "common pause interleaved")]
    fn test_common_after_other_pause_asserts() {
        let (_mem, gc) = stats();
        gc.add_pause(Duration::from_millis(1), None, PauseType::InitialMark);
        gc.add_pause(Duration::from_millis(1), None, PauseType::Common);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "recorded twice")]
    fn test_non_common_pause_once_per_cycle() {
        let (_mem, gc) = stats();
        gc.add_pause(Duration::from_millis(1), None, PauseType::Remark);
        gc.add_pause(Duration::from_millis(1), None, PauseType::Remark);
    }

    #[test]
    fn test_mutator_lock_reentrancy() {
        let (_mem, gc) = stats();
        gc.stop_mutator_lock();
        assert_eq!(gc.total_mutator_pause(), Duration::ZERO);

        gc.start_mutator_lock();
        gc.start_mutator_lock();
        std::thread::sleep(Duration::from_millis(5));
        gc.stop_mutator_lock();
        // Still inside the outer region
        assert_eq!(gc.total_mutator_pause(), Duration::ZERO);
        gc.stop_mutator_lock();
        assert!(gc.total_mutator_pause() >= Duration::from_millis(5));
    }

    #[test]
    fn test_period_histogram() {
        let (_mem, gc) = stats();
        let ms = Duration::from_millis;
        // Period 0: three cycles, period 1: none, period 2: one cycle
        gc.record_duration_at(ms(1), None, ms(100));
        gc.record_duration_at(ms(1), None, ms(200));
        gc.record_duration_at(ms(1), None, ms(900));
        gc.record_duration_at(ms(1), None, ms(2500));
        // Period 3 flushes the single cycle of period 2
        gc.record_duration_at(ms(1), None, ms(3100));

        let histogram = gc.period_histogram();
        assert_eq!(histogram.count_of(3), 1);
        assert_eq!(histogram.count_of(1), 1);
        assert_eq!(histogram.sample_count(), 2);
        assert_eq!(gc.gc_count(), 5);
        assert_eq!(gc.total_duration(), ms(5));
        assert_eq!(gc.last_duration(), ms(1));
    }

    #[test]
    fn test_scoped_guards() {
        let (mem, gc) = stats();
        let instance = GcInstanceStats::new(GcType::G1);
        {
            let _cycle = GcScopedStats::new(&gc, Some(&instance), CollectionKind::All);
            {
                let _pause = GcScopedPauseStats::new(&gc, Some(&instance), PauseType::Common);
                mem.record_free_objects(1, 64, SpaceType::Object);
            }
        }
        assert_eq!(gc.gc_count(), 1);
        assert_eq!(gc.objects_freed_bytes(), 64);
        assert_eq!(instance.time_stat(TimeStat::AllTotalTime).count(), 1);
        assert_eq!(instance.memory_stat(MemoryStat::AllFreedBytes).sum(), 64);
        assert!(gc.statistics().starts_with("GC statistics (g1-gc):"));
    }
}
