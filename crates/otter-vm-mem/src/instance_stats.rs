//! Per-collector aggregate statistics
//!
//! One `GcInstanceStats` lives per collector type for the whole VM lifetime.
//! Samples are split into a young-generation bucket and an all-generations
//! bucket; each accumulator keeps count, sum, min and max.

use std::fmt::{self, Write};
use std::time::Duration;

use parking_lot::Mutex;

/// Collector family a statistics object describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcType {
    /// Allocation only, never collects
    Epsilon,
    /// Single-generation stop-the-world mark-sweep
    StopTheWorld,
    /// Young/tenured generational collector
    Generational,
    /// Region-based collector with concurrent marking
    G1,
}

impl GcType {
    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            GcType::Epsilon => "epsilon",
            GcType::StopTheWorld => "stw",
            GcType::Generational => "gen-gc",
            GcType::G1 => "g1-gc",
        }
    }
}

impl fmt::Display for GcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Time samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStat {
    /// Pause time of young collections
    YoungPausedTime,
    /// Pause time of full collections
    AllPausedTime,
    /// Wall time of young collections
    YoungTotalTime,
    /// Wall time of full collections
    AllTotalTime,
}

/// Object-count samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectsStat {
    /// Objects freed by young collections
    YoungFreedObjects,
    /// Objects freed by full collections
    AllFreedObjects,
    /// Objects moved
    MovedObjects,
}

/// Byte samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStat {
    /// Bytes freed by young collections
    YoungFreedBytes,
    /// Bytes freed by full collections
    AllFreedBytes,
    /// Bytes moved
    MovedBytes,
}

/// Count, sum, min and max of a sample stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatAccumulator {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl StatAccumulator {
    /// Add one sample
    pub fn add(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    /// Samples taken
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of samples
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Smallest sample (0 when empty)
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Largest sample (0 when empty)
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Mean sample, 0.0 when empty
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulators {
    young_paused_time: StatAccumulator,
    all_paused_time: StatAccumulator,
    young_total_time: StatAccumulator,
    all_total_time: StatAccumulator,
    young_freed_objects: StatAccumulator,
    all_freed_objects: StatAccumulator,
    moved_objects: StatAccumulator,
    young_freed_bytes: StatAccumulator,
    all_freed_bytes: StatAccumulator,
    moved_bytes: StatAccumulator,
}

impl Accumulators {
    fn time(&mut self, stat: TimeStat) -> &mut StatAccumulator {
        match stat {
            TimeStat::YoungPausedTime => &mut self.young_paused_time,
            TimeStat::AllPausedTime => &mut self.all_paused_time,
            TimeStat::YoungTotalTime => &mut self.young_total_time,
            TimeStat::AllTotalTime => &mut self.all_total_time,
        }
    }

    fn objects(&mut self, stat: ObjectsStat) -> &mut StatAccumulator {
        match stat {
            ObjectsStat::YoungFreedObjects => &mut self.young_freed_objects,
            ObjectsStat::AllFreedObjects => &mut self.all_freed_objects,
            ObjectsStat::MovedObjects => &mut self.moved_objects,
        }
    }

    fn memory(&mut self, stat: MemoryStat) -> &mut StatAccumulator {
        match stat {
            MemoryStat::YoungFreedBytes => &mut self.young_freed_bytes,
            MemoryStat::AllFreedBytes => &mut self.all_freed_bytes,
            MemoryStat::MovedBytes => &mut self.moved_bytes,
        }
    }
}

fn write_time(out: &mut String, label: &str, acc: &StatAccumulator) {
    if acc.count() == 0 {
        return;
    }
    let _ = writeln!(
        out,
        "  {label}: avg {:?}, min {:?}, max {:?}, total {:?}, count {}",
        Duration::from_nanos(acc.avg() as u64),
        Duration::from_nanos(acc.min()),
        Duration::from_nanos(acc.max()),
        Duration::from_nanos(acc.sum()),
        acc.count()
    );
}

fn write_value(out: &mut String, label: &str, unit: &str, acc: &StatAccumulator) {
    if acc.count() == 0 {
        return;
    }
    let _ = writeln!(
        out,
        "  {label}: avg {:.2}{unit}, min {}{unit}, max {}{unit}, total {}{unit}, count {}",
        acc.avg(),
        acc.min(),
        acc.max(),
        acc.sum(),
        acc.count()
    );
}

/// Lifetime statistics of one collector.
pub struct GcInstanceStats {
    gc_type: GcType,
    acc: Mutex<Accumulators>,
}

impl GcInstanceStats {
    /// Empty statistics for a collector of `gc_type`
    pub fn new(gc_type: GcType) -> Self {
        Self {
            gc_type,
            acc: Mutex::new(Accumulators::default()),
        }
    }

    /// Collector family
    pub fn gc_type(&self) -> GcType {
        self.gc_type
    }

    /// Add a time sample
    pub fn add_time_value(&self, value: Duration, stat: TimeStat) {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        self.acc.lock().time(stat).add(nanos);
    }

    /// Add an object-count sample
    pub fn add_objects_value(&self, value: u64, stat: ObjectsStat) {
        self.acc.lock().objects(stat).add(value);
    }

    /// Add a byte sample
    pub fn add_memory_value(&self, value: u64, stat: MemoryStat) {
        self.acc.lock().memory(stat).add(value);
    }

    /// Snapshot of a time accumulator (nanoseconds)
    pub fn time_stat(&self, stat: TimeStat) -> StatAccumulator {
        *self.acc.lock().time(stat)
    }

    /// Snapshot of an object-count accumulator
    pub fn objects_stat(&self, stat: ObjectsStat) -> StatAccumulator {
        *self.acc.lock().objects(stat)
    }

    /// Snapshot of a byte accumulator
    pub fn memory_stat(&self, stat: MemoryStat) -> StatAccumulator {
        *self.acc.lock().memory(stat)
    }

    /// Young-generation section, empty if no young sample was taken
    pub fn young_space_dump(&self) -> String {
        let acc = *self.acc.lock();
        let mut body = String::new();
        write_time(&mut body, "paused", &acc.young_paused_time);
        write_time(&mut body, "total", &acc.young_total_time);
        write_value(&mut body, "freed objects", "", &acc.young_freed_objects);
        write_value(&mut body, "freed bytes", "B", &acc.young_freed_bytes);
        write_value(&mut body, "moved objects", "", &acc.moved_objects);
        write_value(&mut body, "moved bytes", "B", &acc.moved_bytes);
        if body.is_empty() {
            return body;
        }
        format!("Young space ({}):\n{body}", self.gc_type)
    }

    /// All-generations section, empty if no full-collection sample was taken
    pub fn all_spaces_dump(&self) -> String {
        let acc = *self.acc.lock();
        let mut body = String::new();
        write_time(&mut body, "paused", &acc.all_paused_time);
        write_time(&mut body, "total", &acc.all_total_time);
        write_value(&mut body, "freed objects", "", &acc.all_freed_objects);
        write_value(&mut body, "freed bytes", "B", &acc.all_freed_bytes);
        if body.is_empty() {
            return body;
        }
        format!("All spaces ({}):\n{body}", self.gc_type)
    }

    /// Both sections
    pub fn dump(&self) -> String {
        let mut out = self.young_space_dump();
        out.push_str(&self.all_spaces_dump());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator() {
        let mut acc = StatAccumulator::default();
        assert_eq!(acc.avg(), 0.0);
        acc.add(10);
        acc.add(2);
        acc.add(6);
        assert_eq!(acc.count(), 3);
        assert_eq!(acc.sum(), 18);
        assert_eq!(acc.min(), 2);
        assert_eq!(acc.max(), 10);
        assert!((acc.avg() - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_dump() {
        let stats = GcInstanceStats::new(GcType::G1);
        assert!(stats.dump().is_empty());
    }

    #[test]
    fn test_sections_only_when_sampled() {
        let stats = GcInstanceStats::new(GcType::Generational);
        stats.add_objects_value(12, ObjectsStat::YoungFreedObjects);
        stats.add_memory_value(4096, MemoryStat::YoungFreedBytes);

        let young = stats.young_space_dump();
        assert!(young.starts_with("Young space (gen-gc):"));
        assert!(young.contains("freed objects: avg 12.00"));
        assert!(young.contains("freed bytes: avg 4096.00B"));
        assert!(!young.contains("paused"));
        assert!(stats.all_spaces_dump().is_empty());

        stats.add_time_value(Duration::from_millis(3), TimeStat::AllPausedTime);
        let all = stats.all_spaces_dump();
        assert!(all.starts_with("All spaces (gen-gc):"));
        assert!(all.contains("paused: avg 3ms"));
        assert_eq!(stats.dump(), format!("{young}{all}"));
    }
}
