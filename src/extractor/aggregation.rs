//! Pre-aggregated bucket extraction.
//!
//! The window is fetched with one metadata-only query (no rows requested).
//! The aggregation tree in the response is flattened into the same
//! newline-delimited JSON row format the scroll extractor produces, so the
//! downstream writer never needs to know which strategy was used.

use super::search::{SearchBackend, SearchRequest};
use super::{
    CancelFlag, DataExtractor, DataStream, ExtractionContext, ExtractorError, ExtractorResult,
    TimeRange,
};
use serde_json::{Map, Value};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Field carrying the number of documents behind each encoded row.
pub const DOC_COUNT_FIELD: &str = "doc_count";

/// Flattens a histogram aggregation into one JSON row per leaf bucket.
///
/// The top level must hold exactly one bucket aggregation (the histogram);
/// each histogram bucket's `key` becomes the time field. Inside a bucket,
/// single-value metrics (`{"value": ...}`) become fields of the row and at
/// most one nested bucket aggregation (e.g. `terms`) may fan the row out,
/// its bucket key stored under the aggregation's name. Buckets with a zero
/// document count produce no rows.
#[derive(Debug, Clone)]
pub struct AggregationEncoder {
    time_field: String,
}

impl AggregationEncoder {
    pub fn new(time_field: impl Into<String>) -> Self {
        Self {
            time_field: time_field.into(),
        }
    }

    /// Encode `aggregations` into `out`, returning the number of rows written.
    pub fn encode(&self, aggregations: &Value, out: &mut Vec<u8>) -> ExtractorResult<usize> {
        let aggs = aggregations
            .as_object()
            .ok_or_else(|| malformed("aggregations must be an object"))?;

        let (name, buckets) = single_bucket_aggregation(aggs)?
            .ok_or_else(|| malformed("no histogram aggregation found"))?;
        if aggs.len() > 1 {
            return Err(malformed(&format!(
                "histogram aggregation '{}' must be the only top-level aggregation",
                name
            )));
        }

        let mut rows = Vec::new();
        for bucket in buckets {
            let key = bucket
                .get("key")
                .and_then(Value::as_f64)
                .ok_or_else(|| malformed("histogram bucket without a numeric key"))?;
            let mut base = Map::new();
            base.insert(self.time_field.clone(), Value::from(key as i64));
            self.flatten_bucket(bucket, base, &mut rows)?;
        }

        for row in &rows {
            serde_json::to_writer(&mut *out, row)?;
            out.push(b'\n');
        }
        Ok(rows.len())
    }

    fn flatten_bucket(
        &self,
        bucket: &Value,
        mut fields: Map<String, Value>,
        rows: &mut Vec<Map<String, Value>>,
    ) -> ExtractorResult<()> {
        let object = bucket
            .as_object()
            .ok_or_else(|| malformed("bucket must be an object"))?;
        let doc_count = object.get(DOC_COUNT_FIELD).and_then(Value::as_u64).unwrap_or(0);
        if doc_count == 0 {
            return Ok(());
        }

        for (name, value) in object {
            if matches!(name.as_str(), "key" | "key_as_string" | DOC_COUNT_FIELD) {
                continue;
            }
            if let Some(metric) = value.get("value") {
                fields.insert(name.clone(), metric.clone());
            }
        }

        match single_bucket_aggregation(object)? {
            Some((name, buckets)) => {
                for sub in buckets {
                    let key = sub
                        .get("key")
                        .cloned()
                        .ok_or_else(|| malformed("bucket without a key"))?;
                    let mut sub_fields = fields.clone();
                    sub_fields.insert(name.to_string(), key);
                    self.flatten_bucket(sub, sub_fields, rows)?;
                }
            }
            None => {
                fields.insert(DOC_COUNT_FIELD.to_string(), Value::from(doc_count));
                rows.push(fields);
            }
        }
        Ok(())
    }
}

/// Find the one entry of `aggs` that holds buckets.
fn single_bucket_aggregation(
    aggs: &Map<String, Value>,
) -> ExtractorResult<Option<(&str, &Vec<Value>)>> {
    let mut found = None;
    for (name, value) in aggs {
        if let Some(buckets) = value.get("buckets").and_then(Value::as_array) {
            if found.is_some() {
                return Err(malformed(
                    "more than one bucket aggregation at the same level",
                ));
            }
            found = Some((name.as_str(), buckets));
        }
    }
    Ok(found)
}

fn malformed(message: &str) -> ExtractorError {
    ExtractorError::MalformedResponse(message.to_string())
}

/// Pulls one window of pre-aggregated buckets.
pub struct AggregationDataExtractor {
    backend: Arc<dyn SearchBackend>,
    context: Arc<ExtractionContext>,
    encoder: AggregationEncoder,
    start: i64,
    end: i64,
    consumed: bool,
    cancel: CancelFlag,
}

impl AggregationDataExtractor {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        context: Arc<ExtractionContext>,
        start: i64,
        end: i64,
        cancel: CancelFlag,
    ) -> Self {
        let encoder = AggregationEncoder::new(context.time_field.clone());
        Self {
            backend,
            context,
            encoder,
            start,
            end,
            consumed: false,
            cancel,
        }
    }

    fn build_request(&self) -> SearchRequest {
        SearchRequest {
            indices: self.context.indices.clone(),
            time_field: self.context.time_field.clone(),
            range: TimeRange::between(self.start, self.end),
            query: self.context.query.clone(),
            size: 0,
            aggregations: self.context.aggregations.clone(),
            script_fields: None,
            scroll: false,
        }
    }
}

impl DataExtractor for AggregationDataExtractor {
    fn has_next(&self) -> bool {
        !self.consumed && !self.cancel.is_cancelled()
    }

    fn next(&mut self) -> ExtractorResult<Option<DataStream>> {
        if self.consumed {
            return Err(ExtractorError::NoMoreData);
        }
        self.consumed = true;

        if self.cancel.is_cancelled() {
            debug!(job_id = %self.context.job_id, start = self.start, end = self.end, "Aggregation extraction cancelled before search");
            return Ok(None);
        }

        let response = self.backend.search(&self.build_request())?;
        response.check()?;

        let aggregations = match response.aggregations {
            Some(aggs) if response.total_hits > 0 => aggs,
            _ => return Ok(None),
        };

        let mut buffer = Vec::new();
        let rows = self.encoder.encode(&aggregations, &mut buffer)?;
        debug!(job_id = %self.context.job_id, start = self.start, end = self.end, rows, "Aggregation extraction finished");

        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(Box::new(Cursor::new(buffer))))
    }

    fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}
