//! Unit tests for chunked extraction over the in-memory search backend

use serde_json::{json, Value};
use std::sync::Arc;

use adpipe::config::ChunkingConfig;
use adpipe::extractor::{ChunkSpec, ExtractorKind};
use adpipe::{
    ChunkedDataExtractor, DataExtractor, ExtractionContext, ExtractorError, InMemorySearchBackend,
    SearchExtractorFactory, TimeRange,
};

use crate::helpers::{documents, drain, to_ndjson};

/// 1000 documents one second apart: times 0, 1000, ..., 999000.
fn backend() -> Arc<InMemorySearchBackend> {
    Arc::new(InMemorySearchBackend::new("time", documents(0, 1_000, 1_000)))
}

fn extractor(
    backend: &Arc<InMemorySearchBackend>,
    context: ExtractionContext,
    chunking: ChunkingConfig,
) -> ChunkedDataExtractor {
    let range = context.range;
    let factory = Arc::new(SearchExtractorFactory::new(context, backend.clone()));
    ChunkedDataExtractor::new(factory, range, chunking)
}

fn context(range: TimeRange) -> ExtractionContext {
    ExtractionContext::new("farequote", "time", vec!["farequote".to_string()])
        .with_scroll_size(50)
        .with_range(range)
}

fn auto(chunk_size: u64) -> ChunkingConfig {
    ChunkingConfig {
        chunk_size,
        min_span_ms: 1,
        ..ChunkingConfig::default()
    }
}

fn times(rows: &[Value]) -> Vec<i64> {
    rows.iter().map(|row| row["time"].as_i64().unwrap()).collect()
}

fn assert_tiles(chunks: &[ChunkSpec], start: i64, end: i64) {
    assert_eq!(chunks.first().unwrap().start, start);
    assert_eq!(chunks.last().unwrap().end, end);
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }
}

#[test]
fn auto_chunking_reads_every_row_once_in_order() {
    let backend = backend();
    let mut extractor = extractor(&backend, context(TimeRange::between(0, 1_000_000)), auto(100));

    let chunks = drain(&mut extractor).unwrap();
    let all: Vec<i64> = chunks.iter().flat_map(|rows| times(rows)).collect();

    assert!(chunks.len() >= 10);
    assert_eq!(all, (0..1_000).map(|i| i * 1_000).collect::<Vec<_>>());
    assert_tiles(extractor.issued_chunks(), 0, 1_000_000);
    assert!(!extractor.has_next());
    assert_eq!(backend.open_scrolls(), 0);
}

#[test]
fn manual_chunking_uses_fixed_span() {
    let backend = backend();
    let mut extractor = extractor(
        &backend,
        context(TimeRange::between(0, 1_000_000)),
        ChunkingConfig::manual(250_000),
    );

    let chunks = drain(&mut extractor).unwrap();

    assert_eq!(
        extractor.issued_chunks(),
        &[
            ChunkSpec::new(0, 250_000),
            ChunkSpec::new(250_000, 500_000),
            ChunkSpec::new(500_000, 750_000),
            ChunkSpec::new(750_000, 1_000_000),
        ]
    );
    assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![250; 4]);
}

#[test]
fn disabled_chunking_skips_the_summary_query() {
    let backend = backend();
    let mut extractor = extractor(
        &backend,
        context(TimeRange::between(500_000, 600_000)),
        ChunkingConfig::disabled(),
    );

    let chunks = drain(&mut extractor).unwrap();

    assert_eq!(extractor.issued_chunks(), &[ChunkSpec::new(500_000, 600_000)]);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].len(), 100);
    // Only the initial scroll search; continuation pages are not searches.
    assert_eq!(backend.search_count(), 1);
}

#[test]
fn disabled_chunking_over_open_range_keeps_pre_epoch_rows() {
    let backend = Arc::new(InMemorySearchBackend::new(
        "time",
        vec![json!({"time": -5_000, "v": 1}), json!({"time": 10, "v": 2})],
    ));
    let mut extractor = extractor(
        &backend,
        context(TimeRange::unbounded()),
        ChunkingConfig::disabled(),
    );

    let chunks = drain(&mut extractor).unwrap();

    assert_eq!(extractor.issued_chunks(), &[ChunkSpec::new(i64::MIN, i64::MAX)]);
    assert_eq!(chunks.len(), 1);
    assert_eq!(times(&chunks[0]), vec![-5_000, 10]);
}

#[test]
fn empty_summary_issues_no_chunks() {
    let backend = backend();
    let mut extractor = extractor(&backend, context(TimeRange::between(2_000_000, 3_000_000)), auto(100));

    assert!(extractor.has_next());
    assert!(extractor.next().unwrap().is_none());
    assert!(!extractor.has_next());
    assert!(extractor.issued_chunks().is_empty());
    assert_eq!(backend.search_count(), 1);
    assert!(matches!(extractor.next(), Err(ExtractorError::NoMoreData)));
}

#[test]
fn unavailable_shards_fail_extraction() {
    let backend = backend();
    backend.set_unavailable_shards(1);
    let mut extractor = extractor(&backend, context(TimeRange::between(0, 1_000_000)), auto(100));

    let err = extractor.next().err().unwrap();
    assert!(matches!(err, ExtractorError::BackendResponse { unavailable_shards: 1, .. }));
    assert!(!extractor.has_next());
}

#[test]
fn cancelled_extraction_stops_issuing_chunks() {
    let backend = backend();
    let mut extractor = extractor(&backend, context(TimeRange::between(0, 1_000_000)), auto(100));

    assert!(extractor.next().unwrap().is_some());
    let searches = backend.search_count();
    extractor.cancel();

    assert!(!extractor.has_next());
    assert!(extractor.is_cancelled());
    assert_eq!(extractor.issued_chunks().len(), 1);
    assert_eq!(backend.search_count(), searches);
}

#[test]
fn term_query_filters_rows() {
    let backend = backend();
    let context = context(TimeRange::between(0, 30_000)).with_query(json!({"term": {"airline": "JZA"}}));
    let mut extractor = extractor(&backend, context, ChunkingConfig::disabled());

    let rows: Vec<Value> = drain(&mut extractor).unwrap().into_iter().flatten().collect();

    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|row| row["airline"] == "JZA"));
}

#[test]
fn aggregation_context_extracts_buckets() {
    let backend = backend();
    let context = context(TimeRange::unbounded()).with_aggregations(json!({
        "time": {
            "date_histogram": {"field": "time", "fixed_interval": "60s"},
            "aggs": {"responsetime": {"avg": {"field": "responsetime"}}}
        }
    }));
    let factory = SearchExtractorFactory::new(context.clone(), backend.clone());
    assert_eq!(factory.kind(), ExtractorKind::Aggregation);

    let mut extractor = extractor(&backend, context, ChunkingConfig::disabled());
    let rows: Vec<Value> = drain(&mut extractor).unwrap().into_iter().flatten().collect();

    assert_eq!(rows.len(), 17);
    assert_eq!(rows[0]["time"], 0);
    assert_eq!(rows[0]["doc_count"], 60);
    assert_eq!(rows[0]["responsetime"], 29.5);
    let total: u64 = rows.iter().map(|row| row["doc_count"].as_u64().unwrap()).sum();
    assert_eq!(total, 1_000);
}

#[test]
fn backend_loads_ndjson() {
    let ndjson = format!("{}\n{{\"no_time\":1}}\n", to_ndjson(&documents(5_000, 10, 3)));
    let backend = InMemorySearchBackend::from_ndjson(ndjson.as_bytes(), "time").unwrap();
    assert_eq!(backend.len(), 3);

    let err = InMemorySearchBackend::from_ndjson("{not json".as_bytes(), "time");
    assert!(matches!(err, Err(ExtractorError::Json(_))));
}
