//! Search backend collaborator interface.
//!
//! Query execution lives outside this crate. Extractors only need to run a
//! time-bounded query (for rows or for aggregation buckets), page through
//! the rows of a scroll, and release the scroll afterwards.

use super::{ExtractorError, ExtractorResult, TimeRange};
use serde_json::Value;

/// A time-bounded query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub indices: Vec<String>,
    pub time_field: String,
    pub range: TimeRange,
    pub query: Value,
    /// Number of rows per page; zero asks for metadata and aggregations only
    pub size: usize,
    pub aggregations: Option<Value>,
    pub script_fields: Option<Value>,
    /// Keep a scroll cursor open for paging through the rows
    pub scroll: bool,
}

/// What the backend sent back.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    /// HTTP-style status code
    pub status: u16,
    pub total_shards: u32,
    /// Shards or partitions that did not contribute to the result
    pub unavailable_shards: u32,
    /// Number of documents matching the query
    pub total_hits: u64,
    /// Documents in this page, ascending by time
    pub hits: Vec<Value>,
    pub aggregations: Option<Value>,
    pub scroll_id: Option<String>,
}

impl SearchResponse {
    /// A successful response with every shard present.
    pub fn ok(total_hits: u64, hits: Vec<Value>) -> Self {
        Self {
            status: 200,
            total_shards: 1,
            unavailable_shards: 0,
            total_hits,
            hits,
            aggregations: None,
            scroll_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fail on a non-success status or on any missing shard.
    ///
    /// Partial results are never passed on; the caller decides whether to
    /// retry the whole cycle.
    pub fn check(&self) -> ExtractorResult<()> {
        if !self.is_success() {
            return Err(ExtractorError::BackendResponse {
                status: self.status,
                unavailable_shards: self.unavailable_shards,
                reason: "request failed".to_string(),
            });
        }
        if self.unavailable_shards > 0 {
            return Err(ExtractorError::BackendResponse {
                status: self.status,
                unavailable_shards: self.unavailable_shards,
                reason: format!(
                    "{} of {} shards unavailable",
                    self.unavailable_shards, self.total_shards
                ),
            });
        }
        Ok(())
    }
}

/// The search backend as seen by the extractors.
///
/// Implementations must be usable from several threads; extractors hold
/// them behind an `Arc`.
pub trait SearchBackend: Send + Sync {
    /// Run a time-bounded query. Rows come back sorted ascending by the
    /// request's time field.
    fn search(&self, request: &SearchRequest) -> ExtractorResult<SearchResponse>;

    /// Fetch the next page of an open scroll.
    fn scroll(&self, scroll_id: &str) -> ExtractorResult<SearchResponse>;

    /// Release a scroll cursor.
    fn clear_scroll(&self, scroll_id: &str) -> ExtractorResult<()>;
}
