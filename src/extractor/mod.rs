//! Time-windowed data extraction from a search backend.
//!
//! A [`DataExtractor`] pulls exactly one time window out of the backend and
//! hands it over as a newline-delimited JSON byte stream. The
//! [`ChunkedDataExtractor`] strings a sequence of such single-shot extractors
//! together so that one logical extraction never asks the backend for more
//! than roughly one chunk's worth of records at a time.
//!
//! # Module Structure
//!
//! - [`search`] - the search backend collaborator interface
//! - [`scroll`] - raw row extraction using scroll pagination
//! - [`aggregation`] - pre-aggregated bucket extraction and its row encoder
//! - [`chunker`] - chunk span heuristic and chunk boundary iteration
//! - [`chunked`] - the chunking wrapper
//! - [`factory`] - strategy selection
//! - [`memory`] - an in-memory search backend

pub mod aggregation;
pub mod chunked;
pub mod chunker;
pub mod factory;
pub mod memory;
pub mod scroll;
pub mod search;

pub use aggregation::{AggregationDataExtractor, AggregationEncoder};
pub use chunked::ChunkedDataExtractor;
pub use chunker::{ChunkSpec, DataSummary, TimeRangeChunker};
pub use factory::{DataExtractorFactory, ExtractorKind, SearchExtractorFactory};
pub use memory::InMemorySearchBackend;
pub use scroll::ScrollDataExtractor;
pub use search::{SearchBackend, SearchRequest, SearchResponse};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Result type for extraction operations.
pub type ExtractorResult<T> = Result<T, ExtractorError>;

/// Byte stream produced by one extraction window.
pub type DataStream = Box<dyn Read + Send>;

/// Errors raised while extracting data.
#[derive(Debug, Error)]
pub enum ExtractorError {
    /// `next()` was called after the extractor reported `has_next() == false`.
    #[error("next() called on an extractor with no more data")]
    NoMoreData,

    /// The backend returned a failed or partial response.
    #[error("search backend returned status {status} with {unavailable_shards} unavailable shard(s): {reason}")]
    BackendResponse {
        status: u16,
        unavailable_shards: u32,
        reason: String,
    },

    /// The backend response could not be interpreted.
    #[error("malformed search response: {0}")]
    MalformedResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Epoch-millisecond time window with optional bounds.
///
/// A missing bound means the window is open on that side. The window is
/// half-open: `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    /// Create a range from optional bounds.
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    /// A range bounded on both sides.
    pub fn between(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// A range with no bounds.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Check if a timestamp falls within this range.
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start.map_or(true, |s| timestamp >= s) && self.end.map_or(true, |e| timestamp < e)
    }

    /// Lower bound, with an open start resolved to `i64::MIN`.
    pub fn resolved_start(&self) -> i64 {
        self.start.unwrap_or(i64::MIN)
    }

    /// Upper bound, with an open end resolved to `i64::MAX`.
    pub fn resolved_end(&self) -> i64 {
        self.end.unwrap_or(i64::MAX)
    }
}

/// Everything an extractor needs to know about what to pull.
///
/// Built once per extraction cycle and shared read-only by every extractor
/// created during that cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionContext {
    pub job_id: String,
    pub time_field: String,
    pub indices: Vec<String>,
    /// Filter predicate in the backend's query language
    pub query: Value,
    /// Aggregation definition; switches the job to bucket extraction
    pub aggregations: Option<Value>,
    /// Script-computed fields added to every row
    pub script_fields: Option<Value>,
    /// Page size hint for row extraction
    pub scroll_size: usize,
    pub range: TimeRange,
}

impl ExtractionContext {
    /// Create a context matching every document in `indices`.
    pub fn new(job_id: impl Into<String>, time_field: impl Into<String>, indices: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            time_field: time_field.into(),
            indices,
            query: serde_json::json!({ "match_all": {} }),
            aggregations: None,
            script_fields: None,
            scroll_size: crate::config::default_scroll_size(),
            range: TimeRange::unbounded(),
        }
    }

    pub fn with_query(mut self, query: Value) -> Self {
        self.query = query;
        self
    }

    pub fn with_aggregations(mut self, aggregations: Value) -> Self {
        self.aggregations = Some(aggregations);
        self
    }

    pub fn with_script_fields(mut self, script_fields: Value) -> Self {
        self.script_fields = Some(script_fields);
        self
    }

    pub fn with_scroll_size(mut self, scroll_size: usize) -> Self {
        self.scroll_size = scroll_size;
        self
    }

    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }
}

/// Shared cancellation flag.
///
/// Cancellation is cooperative: extractors check the flag before each
/// backend call and never interrupt a call already in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-shot extraction of one time window.
///
/// An extractor is created for exactly one window, consumed by a single
/// thread and then discarded. `next()` may be called once; afterwards
/// `has_next()` is permanently false and another call fails with
/// [`ExtractorError::NoMoreData`]. Wrappers that span several windows
/// (see [`ChunkedDataExtractor`]) follow the same protocol across their
/// whole range.
pub trait DataExtractor: Send {
    /// Whether `next()` may still be called.
    fn has_next(&self) -> bool;

    /// Pull the next piece of data.
    ///
    /// Returns `Ok(None)` when the window holds no data or the extractor was
    /// cancelled before it contacted the backend.
    fn next(&mut self) -> ExtractorResult<Option<DataStream>>;

    /// The flag consulted before each backend call.
    fn cancel_flag(&self) -> &CancelFlag;

    /// Request cancellation. Takes effect at the next pre-flight check.
    fn cancel(&self) {
        self.cancel_flag().cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag().is_cancelled()
    }
}
