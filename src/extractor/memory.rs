//! In-memory search backend.
//!
//! Holds a set of JSON documents and answers the queries the extractors
//! issue: time-range filtering, `term` filters, scroll paging, the summary query's
//! `min`/`max` aggregations and `date_histogram`/`terms` bucket trees with
//! single-value metric sub-aggregations. Used by the CLI to stream files and
//! by tests to stand in for a real cluster.

use super::search::{SearchBackend, SearchRequest, SearchResponse};
use super::{ExtractorError, ExtractorResult};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct OpenScroll {
    remaining: Vec<Value>,
    page_size: usize,
    total_hits: u64,
}

#[derive(Default)]
struct BackendState {
    scrolls: HashMap<String, OpenScroll>,
    next_scroll_id: u64,
    searches: usize,
    unavailable_shards: u32,
}

pub struct InMemorySearchBackend {
    time_field: String,
    /// Sorted ascending by the time field
    documents: Vec<Value>,
    state: Mutex<BackendState>,
}

impl InMemorySearchBackend {
    /// Create a backend over `documents`. Documents without a numeric time
    /// field are dropped.
    pub fn new(time_field: impl Into<String>, documents: Vec<Value>) -> Self {
        let time_field = time_field.into();
        let mut documents: Vec<Value> = documents
            .into_iter()
            .filter(|doc| doc_time(doc, &time_field).is_some())
            .collect();
        documents.sort_by_key(|doc| doc_time(doc, &time_field).unwrap_or(i64::MIN));
        Self {
            time_field,
            documents,
            state: Mutex::new(BackendState::default()),
        }
    }

    /// Load newline-delimited JSON documents. Blank lines are skipped.
    pub fn from_ndjson<R: BufRead>(reader: R, time_field: impl Into<String>) -> ExtractorResult<Self> {
        let mut documents = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            documents.push(serde_json::from_str(line)?);
        }
        Ok(Self::new(time_field, documents))
    }

    /// Report `count` shards as unavailable on every subsequent search.
    pub fn set_unavailable_shards(&self, count: u32) {
        self.state().unavailable_shards = count;
    }

    /// Number of `search` calls served so far.
    pub fn search_count(&self) -> usize {
        self.state().searches
    }

    /// Number of scrolls not yet cleared.
    pub fn open_scrolls(&self) -> usize {
        self.state().scrolls.len()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching(&self, request: &SearchRequest) -> ExtractorResult<Vec<&Value>> {
        let mut matched = Vec::new();
        for doc in &self.documents {
            let in_range = doc_time(doc, &request.time_field)
                .map_or(false, |t| request.range.contains(t));
            if in_range && matches_query(doc, &request.query)? {
                matched.push(doc);
            }
        }
        Ok(matched)
    }
}

impl SearchBackend for InMemorySearchBackend {
    fn search(&self, request: &SearchRequest) -> ExtractorResult<SearchResponse> {
        let mut state = self.state();
        state.searches += 1;

        if state.unavailable_shards > 0 {
            let mut response = SearchResponse::ok(0, vec![]);
            response.total_shards = state.unavailable_shards + 1;
            response.unavailable_shards = state.unavailable_shards;
            return Ok(response);
        }

        let matched = self.matching(request)?;
        let total_hits = matched.len() as u64;

        let aggregations = match &request.aggregations {
            Some(Value::Object(defs)) => Some(aggregate(defs, &matched)?),
            Some(_) => {
                return Err(ExtractorError::MalformedResponse(
                    "aggregations must be an object".to_string(),
                ))
            }
            None => None,
        };

        let mut hits: Vec<Value> = if request.size == 0 {
            Vec::new()
        } else {
            matched.into_iter().cloned().collect()
        };
        let rest = hits.split_off(hits.len().min(request.size));

        let mut response = SearchResponse::ok(total_hits, hits);
        response.aggregations = aggregations;

        if request.scroll {
            state.next_scroll_id += 1;
            let id = format!("scroll-{}", state.next_scroll_id);
            state.scrolls.insert(
                id.clone(),
                OpenScroll {
                    remaining: rest,
                    page_size: request.size.max(1),
                    total_hits,
                },
            );
            response.scroll_id = Some(id);
        }

        tracing::trace!(time_field = %self.time_field, total_hits, "In-memory search served");
        Ok(response)
    }

    fn scroll(&self, scroll_id: &str) -> ExtractorResult<SearchResponse> {
        let mut state = self.state();
        let scroll = state
            .scrolls
            .get_mut(scroll_id)
            .ok_or_else(|| ExtractorError::MalformedResponse(format!("unknown scroll id '{}'", scroll_id)))?;

        let take = scroll.page_size.min(scroll.remaining.len());
        let page: Vec<Value> = scroll.remaining.drain(..take).collect();
        let mut response = SearchResponse::ok(scroll.total_hits, page);
        response.scroll_id = Some(scroll_id.to_string());
        Ok(response)
    }

    fn clear_scroll(&self, scroll_id: &str) -> ExtractorResult<()> {
        self.state().scrolls.remove(scroll_id);
        Ok(())
    }
}

fn doc_time(doc: &Value, field: &str) -> Option<i64> {
    let value = doc.get(field)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// `match_all` and `term` (plain or `{"value": ..}` form) are understood.
fn matches_query(doc: &Value, query: &Value) -> ExtractorResult<bool> {
    if query.get("match_all").is_some() || query.is_null() {
        return Ok(true);
    }
    if let Some(Value::Object(terms)) = query.get("term") {
        for (field, expected) in terms {
            let expected = expected.get("value").unwrap_or(expected);
            if doc.get(field) != Some(expected) {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    Err(ExtractorError::MalformedResponse(format!(
        "unsupported query: {}",
        query
    )))
}

fn aggregate(defs: &Map<String, Value>, docs: &[&Value]) -> ExtractorResult<Value> {
    let mut out = Map::new();
    for (name, def) in defs {
        out.insert(name.clone(), aggregate_one(name, def, docs)?);
    }
    Ok(Value::Object(out))
}

fn aggregate_one(name: &str, def: &Value, docs: &[&Value]) -> ExtractorResult<Value> {
    let sub_aggs = def
        .get("aggs")
        .or_else(|| def.get("aggregations"))
        .and_then(Value::as_object);

    if let Some(hist) = def.get("date_histogram") {
        let field = agg_field(name, hist)?;
        let interval = hist
            .get("fixed_interval")
            .or_else(|| hist.get("interval"))
            .ok_or_else(|| malformed(name, "date_histogram needs an interval"))
            .and_then(|v| parse_interval(name, v))?;
        return date_histogram(field, interval, sub_aggs, docs);
    }

    if let Some(terms) = def.get("terms") {
        let field = agg_field(name, terms)?;
        return terms_buckets(field, sub_aggs, docs);
    }

    for metric in ["min", "max", "avg", "sum", "value_count"] {
        if let Some(body) = def.get(metric) {
            let field = agg_field(name, body)?;
            let values: Vec<f64> = docs
                .iter()
                .filter_map(|doc| doc.get(field).and_then(Value::as_f64))
                .collect();
            let value = match metric {
                "value_count" => Some(values.len() as f64),
                "sum" => Some(values.iter().sum::<f64>()),
                _ if values.is_empty() => None,
                "min" => values.iter().copied().reduce(f64::min),
                "max" => values.iter().copied().reduce(f64::max),
                _ => Some(values.iter().sum::<f64>() / values.len() as f64),
            };
            return Ok(json!({ "value": value }));
        }
    }

    Err(malformed(name, "unsupported aggregation"))
}

fn date_histogram(
    field: &str,
    interval: i64,
    sub_aggs: Option<&Map<String, Value>>,
    docs: &[&Value],
) -> ExtractorResult<Value> {
    let mut groups: BTreeMap<i64, Vec<&Value>> = BTreeMap::new();
    for doc in docs {
        if let Some(t) = doc_time(doc, field) {
            groups
                .entry(t.div_euclid(interval) * interval)
                .or_default()
                .push(doc);
        }
    }

    let (first, last) = match (groups.keys().next(), groups.keys().next_back()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Ok(json!({ "buckets": [] })),
    };

    let mut buckets = Vec::new();
    let mut key = first;
    while key <= last {
        let members = groups.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        buckets.push(bucket(Value::from(key), members, sub_aggs)?);
        key += interval;
    }
    Ok(json!({ "buckets": buckets }))
}

fn terms_buckets(
    field: &str,
    sub_aggs: Option<&Map<String, Value>>,
    docs: &[&Value],
) -> ExtractorResult<Value> {
    let mut groups: BTreeMap<String, (Value, Vec<&Value>)> = BTreeMap::new();
    for doc in docs {
        if let Some(value) = doc.get(field) {
            groups
                .entry(value.to_string())
                .or_insert_with(|| (value.clone(), Vec::new()))
                .1
                .push(doc);
        }
    }

    let mut ordered: Vec<(Value, Vec<&Value>)> = groups.into_values().collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let buckets = ordered
        .into_iter()
        .map(|(key, members)| bucket(key, &members, sub_aggs))
        .collect::<ExtractorResult<Vec<_>>>()?;
    Ok(json!({ "buckets": buckets }))
}

fn bucket(key: Value, members: &[&Value], sub_aggs: Option<&Map<String, Value>>) -> ExtractorResult<Value> {
    let mut bucket = Map::new();
    bucket.insert("key".to_string(), key);
    bucket.insert("doc_count".to_string(), Value::from(members.len()));
    if let Some(defs) = sub_aggs {
        if let Value::Object(children) = aggregate(defs, members)? {
            bucket.extend(children);
        }
    }
    Ok(Value::Object(bucket))
}

fn agg_field<'a>(name: &str, body: &'a Value) -> ExtractorResult<&'a str> {
    body.get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(name, "missing field"))
}

/// Millisecond interval from a number or a `<n><unit>` string.
fn parse_interval(name: &str, value: &Value) -> ExtractorResult<i64> {
    let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
            let (digits, unit) = s.split_at(split);
            let amount: Option<i64> = digits.parse().ok();
            let factor = match unit {
                "" | "ms" => Some(1),
                "s" => Some(1_000),
                "m" => Some(60_000),
                "h" => Some(3_600_000),
                "d" => Some(86_400_000),
                _ => None,
            };
            amount.zip(factor).map(|(a, f)| a * f)
        }
        _ => None,
    };
    match millis {
        Some(ms) if ms > 0 => Ok(ms),
        _ => Err(malformed(name, &format!("invalid interval {}", value))),
    }
}

fn malformed(name: &str, message: &str) -> ExtractorError {
    ExtractorError::MalformedResponse(format!("aggregation '{}': {}", name, message))
}
