//! Chunk span heuristic and chunk boundary iteration.

use super::TimeRange;
use serde::{Deserialize, Serialize};

/// Result of the summary query: data bounds and density over a range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSummary {
    /// Smallest timestamp present (epoch millis)
    pub earliest_time: i64,
    /// Largest timestamp present (epoch millis)
    pub latest_time: i64,
    pub total_hits: u64,
}

impl DataSummary {
    pub fn new(earliest_time: i64, latest_time: i64, total_hits: u64) -> Self {
        Self {
            earliest_time,
            latest_time,
            total_hits,
        }
    }

    /// A summary that matched nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_data(&self) -> bool {
        self.total_hits > 0
    }

    /// Span that holds roughly `chunk_size` records at the observed density,
    /// never smaller than `min_span`.
    ///
    /// Returns `None` when the summary cannot support an estimate (no hits,
    /// or all hits at a single instant).
    pub fn estimate_span(&self, chunk_size: u64, min_span: i64) -> Option<i64> {
        if self.total_hits == 0 || self.latest_time <= self.earliest_time {
            return None;
        }
        let width = i128::from(self.latest_time) - i128::from(self.earliest_time);
        let span = width * i128::from(chunk_size) / i128::from(self.total_hits);
        let span = i64::try_from(span).unwrap_or(i64::MAX);
        Some(span.max(min_span).max(1))
    }
}

/// One `[start, end)` sub-window of an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub start: i64,
    pub end: i64,
}

impl ChunkSpec {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

impl std::fmt::Display for ChunkSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lazily yields the chunks of a window in ascending order.
///
/// The chunks always tile `[start, end)` exactly. Boundaries are laid out
/// from the first timestamp holding data, so the first chunk also absorbs
/// any empty stretch between `start` and the earliest record, and the chunk
/// holding the latest record is stretched to `end`.
#[derive(Debug, Clone)]
pub struct TimeRangeChunker {
    cursor: i64,
    end: i64,
    span: i64,
    data_start: i64,
    latest: i64,
}

impl TimeRangeChunker {
    /// A single chunk covering `[start, end)`.
    pub fn single(start: i64, end: i64) -> Self {
        Self {
            cursor: start,
            end,
            span: i64::MAX,
            data_start: start,
            latest: i64::MAX,
        }
    }

    /// Fixed-span chunks over `range`, with open bounds resolved from the
    /// summary query.
    pub fn with_span(range: TimeRange, summary: &DataSummary, span: i64) -> Self {
        let (start, end) = resolve_bounds(range, summary);
        Self {
            cursor: start,
            end,
            span: span.max(1),
            data_start: start.max(summary.earliest_time),
            latest: summary.latest_time,
        }
    }

    /// Density-sized chunks over `range`. Falls back to a single chunk when
    /// the summary does not support an estimate.
    pub fn auto(range: TimeRange, summary: &DataSummary, chunk_size: u64, min_span: i64) -> Self {
        match summary.estimate_span(chunk_size, min_span) {
            Some(span) => Self::with_span(range, summary, span),
            None => {
                let (start, end) = resolve_bounds(range, summary);
                Self::single(start, end)
            }
        }
    }

    /// Chunk span in use (`i64::MAX` for a single chunk).
    pub fn span(&self) -> i64 {
        self.span
    }
}

impl Iterator for TimeRangeChunker {
    type Item = ChunkSpec;

    fn next(&mut self) -> Option<ChunkSpec> {
        if self.cursor >= self.end {
            return None;
        }

        let base = self.cursor.max(self.data_start);
        let boundary = base.saturating_add(self.span);
        let chunk_end = if boundary > self.latest || boundary >= self.end {
            self.end
        } else {
            boundary
        };

        let chunk = ChunkSpec::new(self.cursor, chunk_end);
        self.cursor = chunk_end;
        Some(chunk)
    }
}

/// Open bounds fall back to the data bounds: the earliest record for the
/// start, one past the latest record for the end.
fn resolve_bounds(range: TimeRange, summary: &DataSummary) -> (i64, i64) {
    let start = range.start.unwrap_or(summary.earliest_time);
    let end = range
        .end
        .unwrap_or_else(|| summary.latest_time.saturating_add(1));
    (start, end)
}
