//! Splitting caller input into partitions.
//!
//! Partitions are pure functions of the input length and the parallelism: a
//! replayed partition is rebuilt from the same index range rather than resumed,
//! which is what makes re-execution after a worker failure safe.

use core::ops::Range;

/// A contiguous slice of the caller's keys or specs, executed as one unit by
/// the host engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    index: usize,
    range: Range<usize>,
    preferred_location: Option<String>,
}

impl Partition {
    pub const fn new(index: usize, range: Range<usize>) -> Self {
        Self {
            index,
            range,
            preferred_location: None,
        }
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    /// The input indices covered by this partition.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub const fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The node holding most of this partition's keys, if known.
    pub fn preferred_location(&self) -> Option<&str> {
        self.preferred_location.as_deref()
    }
}

/// Plans `⌈N/P⌉`-sized contiguous partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionPlanner {
    parallelism: usize,
}

impl PartitionPlanner {
    /// A parallelism of zero is treated as one.
    pub const fn new(parallelism: usize) -> Self {
        Self {
            parallelism: if parallelism == 0 { 1 } else { parallelism },
        }
    }

    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Splits `len` items into at most `parallelism` non-empty partitions.
    ///
    /// Every partition but the last holds exactly `⌈len/parallelism⌉` items.
    /// `len == 0` yields no partitions.
    pub fn plan(&self, len: usize) -> Vec<Partition> {
        if len == 0 {
            return Vec::new();
        }
        let size = len.div_ceil(self.parallelism);
        (0..len)
            .step_by(size)
            .enumerate()
            .map(|(index, start)| Partition::new(index, start..(start + size).min(len)))
            .collect()
    }

    /// Plans partitions over `keys` and tags each with the location most of
    /// its keys live on.
    ///
    /// Ties go to the location seen first within the partition. Keys the
    /// locator knows nothing about do not vote.
    pub fn plan_with_locality<F>(&self, keys: &[String], locate: F) -> Vec<Partition>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut partitions = self.plan(keys.len());
        for partition in &mut partitions {
            let located = keys[partition.range()].iter().map(|k| locate(k));
            partition.preferred_location = majority(located);
        }
        partitions
    }
}

fn majority(locations: impl Iterator<Item = Option<String>>) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for location in locations.flatten() {
        match counts.iter_mut().find(|(l, _)| *l == location) {
            Some((_, count)) => *count += 1,
            None => counts.push((location, 1)),
        }
    }

    let mut best: Option<(String, usize)> = None;
    for (location, count) in counts {
        if best.as_ref().is_none_or(|(_, b)| count > *b) {
            best = Some((location, count));
        }
    }
    best.map(|(location, _)| location)
}
