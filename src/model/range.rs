use std::cmp::Ordering;
use std::fmt::Display;

/// An inclusive interval of timestamps.
///
/// Partition boundaries, block boundaries and query ranges all use the
/// same representation; a partition covering one day at millisecond
/// resolution spans `[midnight, midnight + 86_399_999]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub lower: i64,
    pub upper: i64,
}

impl TimeRange {
    pub fn new(lower: i64, upper: i64) -> TimeRange {
        TimeRange { lower, upper }
    }

    /// The interval covering every representable timestamp.
    pub const fn all() -> TimeRange {
        TimeRange {
            lower: i64::MIN,
            upper: i64::MAX,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.lower <= timestamp && timestamp <= self.upper
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }

    /// Extends this interval to include the given timestamp.
    pub fn extend(&self, timestamp: i64) -> TimeRange {
        TimeRange {
            lower: self.lower.min(timestamp),
            upper: self.upper.max(timestamp),
        }
    }
}

impl Ord for TimeRange {
    fn cmp(&self, other: &TimeRange) -> Ordering {
        self.lower
            .cmp(&other.lower)
            .then(self.upper.cmp(&other.upper))
    }
}

impl PartialOrd for TimeRange {
    fn partial_cmp(&self, other: &TimeRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// A normalized set of disjoint, sorted time ranges.
///
/// Produced by the query layer from user predicates; an inverted
/// `BETWEEN` collapses to the empty set rather than an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<TimeRange>,
}

impl RangeSet {
    /// The empty set; overlaps nothing.
    pub fn empty() -> RangeSet {
        RangeSet { ranges: Vec::new() }
    }

    /// The set covering every timestamp.
    pub fn all() -> RangeSet {
        RangeSet {
            ranges: vec![TimeRange::all()],
        }
    }

    /// The inclusive interval `[lower, upper]`, or the empty set when the
    /// bounds are inverted.
    pub fn between(lower: i64, upper: i64) -> RangeSet {
        if lower > upper {
            return RangeSet::empty();
        }
        RangeSet {
            ranges: vec![TimeRange::new(lower, upper)],
        }
    }

    /// Builds a set from arbitrary ranges, sorting and coalescing
    /// overlapping or adjacent intervals.
    pub fn from_ranges(mut ranges: Vec<TimeRange>) -> RangeSet {
        ranges.retain(|r| r.lower <= r.upper);
        ranges.sort();
        let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.lower <= last.upper.saturating_add(1) => {
                    last.upper = last.upper.max(range.upper);
                }
                _ => merged.push(range),
            }
        }
        RangeSet { ranges: merged }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        // Ranges are sorted, so the first candidate not entirely below
        // `range` decides.
        self.ranges
            .iter()
            .find(|r| r.upper >= range.lower)
            .is_some_and(|r| r.overlaps(range))
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.ranges.iter().any(|r| r.contains(timestamp))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    /// Lowest timestamp in the set, if any.
    pub fn lower(&self) -> Option<i64> {
        self.ranges.first().map(|r| r.lower)
    }

    /// Highest timestamp in the set, if any.
    pub fn upper(&self) -> Option<i64> {
        self.ranges.last().map(|r| r.upper)
    }
}
