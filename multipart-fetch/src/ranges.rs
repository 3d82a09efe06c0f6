//! Byte-range bookkeeping and chunk planning.
//!
//! [`RangeSet`] is an ordered set of disjoint, half-open `u64` intervals. The
//! fetch manager keeps three of them (desired, filled, still-to-fetch) and
//! derives each scheduling decision from their difference.
//!
//! [`plan_chunk`] turns the lowest uncovered range into an aligned chunk:
//!
//! ```text
//! uncovered:        |      [a ............ b)
//! clip to part:     |      [a ..... a+part)
//! align down:       [A ............ a+part)          A = a - a % alignment
//! cut at boundary:  [A ....... M)                    M = next 1 MiB boundary
//! request length:   round_up(M - A, alignment)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::config::{FetchConfig, MAX_TRANSPORT_LIMIT, TRANSPORT_QUANTUM};

/// Ordered set of disjoint half-open byte ranges.
///
/// Adjacent and overlapping insertions are coalesced, so iteration always
/// yields maximal intervals in increasing order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end
    spans: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Number of maximal intervals in the set.
    pub fn range_count(&self) -> usize {
        self.spans.len()
    }

    /// Iterate maximal intervals in increasing order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.spans.iter().map(|(&start, &end)| start..end)
    }

    /// Lowest interval, if any.
    pub fn first(&self) -> Option<Range<u64>> {
        self.spans.iter().next().map(|(&start, &end)| start..end)
    }

    /// Add every byte of `range` to the set.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // Absorb a predecessor that touches or overlaps.
        if let Some((&prev_start, &prev_end)) = self.spans.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        // Absorb successors that start inside or right after the new span.
        let absorbed: Vec<u64> = self
            .spans
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.spans.remove(&s) {
                end = end.max(e);
            }
        }

        self.spans.insert(start, end);
    }

    /// Remove every byte of `range` from the set.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }

        let overlapping: Vec<(u64, u64)> = self
            .spans
            .range(..range.end)
            .rev()
            .take_while(|&(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.spans.remove(&s);
            if s < range.start {
                self.spans.insert(s, range.start);
            }
            if e > range.end {
                self.spans.insert(range.end, e);
            }
        }
    }

    /// Remove every byte covered by `other`.
    pub fn subtract(&mut self, other: &RangeSet) {
        for range in other.ranges() {
            self.remove(range);
        }
    }

    /// Copy of `self` without the bytes covered by `other`.
    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let mut result = self.clone();
        result.subtract(other);
        result
    }

    /// Returns true if every byte of `range` is in the set.
    #[cfg(test)]
    pub fn contains_range(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        self.spans
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.end)
    }

    /// Returns true if any byte of `range` is in the set.
    pub fn intersects(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return false;
        }
        self.spans
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, &end)| end > range.start)
    }

    /// Total number of bytes covered.
    pub fn len(&self) -> u64 {
        self.spans.iter().map(|(s, e)| e - s).sum()
    }
}

impl From<Range<u64>> for RangeSet {
    fn from(range: Range<u64>) -> Self {
        let mut set = Self::new();
        set.insert(range);
        set
    }
}

impl FromIterator<Range<u64>> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range<u64>>>(iter: I) -> Self {
        let mut set = Self::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges()).finish()
    }
}

/// An aligned chunk chosen for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// The uncovered sub-range that triggered the chunk, clipped to the part size.
    pub raw: Range<u64>,
    /// The aligned byte range the chunk is responsible for.
    pub download: Range<u64>,
    /// Length asked from the source, a multiple of the part alignment.
    pub request_limit: u64,
}

impl ChunkPlan {
    /// Offset the chunk is keyed by.
    pub fn offset(&self) -> u64 {
        self.download.start
    }

    /// Length of the aligned range.
    pub fn len(&self) -> u64 {
        self.download.end - self.download.start
    }

    /// Returns true for a zero-length plan.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape the uncovered `range` into an aligned chunk.
///
/// Returns `None` for an empty range.
pub fn plan_chunk(range: Range<u64>, config: &FetchConfig) -> Option<ChunkPlan> {
    if range.start >= range.end {
        return None;
    }
    let alignment = config.part_alignment.max(1);
    let boundary = config.request_boundary.max(1);

    let raw = range.start..range.end.min(range.start.saturating_add(config.part_size.max(1)));
    let mut download = raw.clone();

    if download.start % alignment != 0 {
        download.start = (download.start / alignment) * alignment;
    }
    if download.start / boundary != (download.end - 1) / boundary {
        download.end = (download.start / boundary + 1) * boundary;
    }

    let request_limit = round_up(download.end - download.start, alignment);

    Some(ChunkPlan {
        raw,
        download,
        request_limit,
    })
}

/// Length actually sent to the transport for a logical `limit`.
///
/// The result is a multiple of [`TRANSPORT_QUANTUM`] that divides
/// [`MAX_TRANSPORT_LIMIT`] evenly, and never less than `limit` unless `limit`
/// exceeds the transport maximum.
pub fn transport_limit(limit: u64) -> u64 {
    let mut length = round_up(limit.max(1), TRANSPORT_QUANTUM);
    if length >= MAX_TRANSPORT_LIMIT {
        return MAX_TRANSPORT_LIMIT;
    }
    while MAX_TRANSPORT_LIMIT % length != 0 {
        length += TRANSPORT_QUANTUM;
    }
    length
}

/// Round `value` up to a multiple of `multiple`.
pub(crate) fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return value;
    }
    match value % multiple {
        0 => value,
        remainder => value + multiple - remainder,
    }
}
