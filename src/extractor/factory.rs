//! Strategy selection.

use super::aggregation::AggregationDataExtractor;
use super::chunker::DataSummary;
use super::scroll::ScrollDataExtractor;
use super::search::{SearchBackend, SearchRequest};
use super::{CancelFlag, DataExtractor, ExtractionContext, ExtractorError, ExtractorResult, TimeRange};
use serde_json::{json, Value};
use std::sync::Arc;

const EARLIEST_TIME_AGG: &str = "earliest_time";
const LATEST_TIME_AGG: &str = "latest_time";

/// Extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorKind {
    /// Raw rows through a scroll cursor
    Scroll,
    /// Pre-aggregated buckets through a single metadata-only query
    Aggregation,
}

impl ExtractorKind {
    /// Aggregation when the context defines aggregations, scroll otherwise.
    pub fn for_context(context: &ExtractionContext) -> Self {
        if context.aggregations.is_some() {
            ExtractorKind::Aggregation
        } else {
            ExtractorKind::Scroll
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::Scroll => "scroll",
            ExtractorKind::Aggregation => "aggregation",
        }
    }
}

impl std::fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builds single-window extractors for one job.
pub trait DataExtractorFactory: Send + Sync {
    /// Create an extractor for `[start, end)`.
    fn new_extractor(&self, start: i64, end: i64, cancel: CancelFlag) -> Box<dyn DataExtractor>;

    /// Run the summary query over `range`.
    fn summarise(&self, range: TimeRange) -> ExtractorResult<DataSummary>;
}

/// Factory over a [`SearchBackend`]; the strategy is fixed at construction.
pub struct SearchExtractorFactory {
    kind: ExtractorKind,
    context: Arc<ExtractionContext>,
    backend: Arc<dyn SearchBackend>,
}

impl SearchExtractorFactory {
    pub fn new(context: ExtractionContext, backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            kind: ExtractorKind::for_context(&context),
            context: Arc::new(context),
            backend,
        }
    }

    pub fn kind(&self) -> ExtractorKind {
        self.kind
    }

    pub fn context(&self) -> &ExtractionContext {
        &self.context
    }

    fn summary_request(&self, range: TimeRange) -> SearchRequest {
        let field = &self.context.time_field;
        SearchRequest {
            indices: self.context.indices.clone(),
            time_field: field.clone(),
            range,
            query: self.context.query.clone(),
            size: 0,
            aggregations: Some(json!({
                EARLIEST_TIME_AGG: { "min": { "field": field } },
                LATEST_TIME_AGG: { "max": { "field": field } }
            })),
            script_fields: None,
            scroll: false,
        }
    }
}

impl DataExtractorFactory for SearchExtractorFactory {
    fn new_extractor(&self, start: i64, end: i64, cancel: CancelFlag) -> Box<dyn DataExtractor> {
        match self.kind {
            ExtractorKind::Scroll => Box::new(ScrollDataExtractor::new(
                self.backend.clone(),
                self.context.clone(),
                start,
                end,
                cancel,
            )),
            ExtractorKind::Aggregation => Box::new(AggregationDataExtractor::new(
                self.backend.clone(),
                self.context.clone(),
                start,
                end,
                cancel,
            )),
        }
    }

    fn summarise(&self, range: TimeRange) -> ExtractorResult<DataSummary> {
        let response = self.backend.search(&self.summary_request(range))?;
        response.check()?;

        if response.total_hits == 0 {
            return Ok(DataSummary::empty());
        }

        let aggs = response
            .aggregations
            .as_ref()
            .ok_or_else(|| ExtractorError::MalformedResponse("summary returned no aggregations".to_string()))?;
        Ok(DataSummary::new(
            agg_value(aggs, EARLIEST_TIME_AGG)?,
            agg_value(aggs, LATEST_TIME_AGG)?,
            response.total_hits,
        ))
    }
}

fn agg_value(aggs: &Value, name: &str) -> ExtractorResult<i64> {
    aggs.get(name)
        .and_then(|agg| agg.get("value"))
        .and_then(Value::as_f64)
        .map(|v| v as i64)
        .ok_or_else(|| ExtractorError::MalformedResponse(format!("summary aggregation '{}' has no value", name)))
}
