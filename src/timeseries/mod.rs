use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

/// Nanoseconds since the Unix epoch. All extent and sample arithmetic in the
/// proxy is done in nanoseconds regardless of what resolution the origin
/// speaks on the wire.
pub type Epoch = i64;

/// A half-open time interval `[start, end)` with an implicit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Extent {
    pub start: Epoch,
    pub end: Epoch,
}

impl Extent {
    pub fn new(start: Epoch, end: Epoch) -> Self {
        Self { start, end }
    }

    /// True when the interval contains no time.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        epoch >= self.start && epoch < self.end
    }

    /// True when both bounds are integer multiples of `step`.
    pub fn is_aligned(&self, step: i64) -> bool {
        step > 0 && self.start % step == 0 && self.end % step == 0
    }

    /// Snaps `start` down and `end` up to multiples of `step`.
    pub fn align(&self, step: i64) -> Extent {
        if step <= 0 {
            return *self;
        }
        Extent {
            start: floor_to_step(self.start, step),
            end: ceil_to_step(self.end, step),
        }
    }

    /// The overlapping portion of two extents, if any.
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            Some(Extent { start, end })
        } else {
            None
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub fn floor_to_step(v: Epoch, step: i64) -> Epoch {
    v - v.rem_euclid(step)
}

pub fn ceil_to_step(v: Epoch, step: i64) -> Epoch {
    let r = v.rem_euclid(step);
    if r == 0 { v } else { v - r + step }
}

/// An ordered sequence of non-overlapping extents sharing one step.
///
/// Invariants, restored by [`ExtentList::normalize`]: sorted by `start`
/// ascending; adjacent extents with `prev.end == next.start` coalesced;
/// empty extents removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtentList(pub Vec<Extent>);

impl ExtentList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn single(e: Extent) -> Self {
        let mut l = Self(vec![e]);
        l.normalize();
        l
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.0.iter()
    }

    /// Sorts, drops empties, and coalesces overlapping or abutting extents.
    pub fn normalize(&mut self) {
        self.0.retain(|e| !e.is_empty());
        self.0.sort_by_key(|e| (e.start, e.end));
        let mut out: Vec<Extent> = Vec::with_capacity(self.0.len());
        for e in self.0.drain(..) {
            match out.last_mut() {
                Some(prev) if e.start <= prev.end => {
                    prev.end = prev.end.max(e.end);
                }
                _ => out.push(e),
            }
        }
        self.0 = out;
    }

    /// The union of two lists, normalized.
    pub fn union(&self, other: &ExtentList) -> ExtentList {
        let mut merged = ExtentList(
            self.0
                .iter()
                .chain(other.0.iter())
                .copied()
                .collect::<Vec<_>>(),
        );
        merged.normalize();
        merged
    }

    /// The portions of this list that fall inside `e`.
    pub fn crop(&self, e: Extent) -> ExtentList {
        ExtentList(
            self.0
                .iter()
                .filter_map(|x| x.intersection(&e))
                .collect::<Vec<_>>(),
        )
    }

    /// True when the list fully covers `e` with no gaps.
    pub fn covers(&self, e: Extent) -> bool {
        let cropped = self.crop(e);
        cropped.0.len() == 1 && cropped.0[0].start <= e.start && cropped.0[0].end >= e.end
    }

    /// Computes `want \ self`: the step-aligned extents inside `want` that
    /// this list does not cover. These are the deltas the origin must be
    /// asked for.
    pub fn calculate_deltas(&self, want: Extent, step: i64) -> ExtentList {
        let want = want.align(step);
        if want.is_empty() {
            return ExtentList::new();
        }
        let mut have = self.crop(want);
        have.normalize();
        let mut gaps = Vec::new();
        let mut cursor = want.start;
        for h in &have.0 {
            if h.start > cursor {
                gaps.push(Extent::new(cursor, h.start));
            }
            cursor = cursor.max(h.end);
        }
        if cursor < want.end {
            gaps.push(Extent::new(cursor, want.end));
        }
        let mut out = ExtentList(gaps.iter().map(|g| g.align(step)).collect::<Vec<_>>());
        out.normalize();
        out
    }
}

impl fmt::Display for ExtentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", parts.join(";"))
    }
}

/// A parsed, normalized time-range query. `statement` is the query string
/// with its time predicates replaced by placeholders so that requests
/// differing only in range hash to the same fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRangeQuery {
    pub statement: String,
    pub extent: Extent,
    /// Aggregation period, nanoseconds.
    pub step: i64,
    pub tags: BTreeMap<String, String>,
}

impl TimeRangeQuery {
    /// Snaps the extent outward to step boundaries: start floored, end
    /// raised to the next multiple.
    pub fn normalize_extent(&mut self) {
        if self.step > 0 {
            self.extent = self.extent.align(self.step);
        }
    }
}

/// The abstract container the delta engine operates on. Each origin client
/// supplies its own concrete type; the engine only ever sees this trait.
pub trait Timeseries: Send {
    /// Concrete-type escape hatch used by `merge`.
    fn as_any(&self) -> &dyn Any;

    /// Deep copy behind the trait object; the engine keeps one copy for
    /// storage trimming and one for the response crop.
    fn clone_box(&self) -> Box<dyn Timeseries>;

    /// The time ranges this series holds data for.
    fn extents(&self) -> ExtentList;
    fn set_extents(&mut self, extents: ExtentList);

    /// In-place union with `other`. Points with equal epoch and labels in
    /// `other` override this series; the result remains sorted when
    /// `truesort` is set.
    fn merge(&mut self, truesort: bool, other: Box<dyn Timeseries>);

    /// Drops points outside `e` and crops the extent list to match.
    fn crop_to_range(&mut self, e: Extent);

    /// Keeps at most `n` of the most recent timestamps with epoch <= `at`.
    fn crop_to_size(&mut self, n: usize, at: Epoch);

    /// Re-sorts all series by epoch, deduplicating equal epochs.
    fn sort(&mut self);

    /// Approximate in-memory footprint, bytes.
    fn size(&self) -> usize;
    fn series_count(&self) -> usize;
    fn value_count(&self) -> usize;
    /// Count of distinct epochs across all series.
    fn timestamp_count(&self) -> usize;

    fn step(&self) -> i64;
    fn set_step(&mut self, step: i64);
}
