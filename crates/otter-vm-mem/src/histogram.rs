//! Value histogram

use std::collections::BTreeMap;
use std::fmt;

/// Occurrence count per distinct value, kept in value order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: BTreeMap<u64, u64>,
}

impl Histogram {
    /// Create an empty histogram
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `value`
    pub fn add(&mut self, value: u64) {
        self.add_count(value, 1);
    }

    /// Record `count` occurrences of `value`
    pub fn add_count(&mut self, value: u64, count: u64) {
        if count > 0 {
            *self.buckets.entry(value).or_insert(0) += count;
        }
    }

    /// Occurrences of `value`
    pub fn count_of(&self, value: u64) -> u64 {
        self.buckets.get(&value).copied().unwrap_or(0)
    }

    /// Total occurrences recorded
    pub fn sample_count(&self) -> u64 {
        self.buckets.values().sum()
    }

    /// Sum of all recorded values
    pub fn sum(&self) -> u64 {
        self.buckets.iter().map(|(value, count)| value * count).sum()
    }

    /// Mean value, 0.0 when empty
    pub fn average(&self) -> f64 {
        let samples = self.sample_count();
        if samples == 0 {
            0.0
        } else {
            self.sum() as f64 / samples as f64
        }
    }

    /// Smallest recorded value
    pub fn min(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    /// Largest recorded value
    pub fn max(&self) -> Option<u64> {
        self.buckets.keys().next_back().copied()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// `(value, occurrences)` pairs in ascending value order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.buckets.iter().map(|(&value, &count)| (value, count))
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some(min), Some(max)) = (self.min(), self.max()) else {
            return write!(f, "empty");
        };
        write!(
            f,
            "avg {:.2}, min {min}, max {max}, samples {} [",
            self.average(),
            self.sample_count()
        )?;
        for (i, (value, count)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}:{count}")?;
        }
        write!(f, "]")
    }
}
