//! Unit tests for time range chunking

use adpipe::extractor::{ChunkSpec, DataSummary};
use adpipe::{TimeRange, TimeRangeChunker};

fn assert_tiles(chunks: &[ChunkSpec], start: i64, end: i64) {
    assert!(!chunks.is_empty(), "no chunks for [{}, {})", start, end);
    assert_eq!(chunks.first().unwrap().start, start);
    assert_eq!(chunks.last().unwrap().end, end);
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].end, pair[1].start, "gap or overlap in {:?}", chunks);
        assert!(pair[0].start < pair[1].start, "not ascending: {:?}", chunks);
    }
    assert!(chunks.iter().all(|c| c.start < c.end), "empty chunk in {:?}", chunks);
}

#[test]
fn auto_chunks_tile_every_range() {
    // (range start, range end, earliest, latest, hits, chunk size, min span)
    let cases: &[(i64, i64, i64, i64, u64, u64, i64)] = &[
        (0, 1_000_000, 0, 1_000_000, 1_000_000, 100_000, 1_000),
        (0, 1_000_000, 0, 999_999, 1_000_000, 100_000, 1_000),
        (0, 1_000_000, 250_000, 750_000, 10, 3, 1),
        (-5_000, 5_000, -4_321, 4_987, 77, 5, 7),
        (1_400_000_000_000, 1_400_086_400_000, 1_400_000_000_000, 1_400_086_399_000, 86_400, 1_000, 60_000),
        (0, 10, 0, 9, 10, 1, 1),
        (0, 10, 3, 3, 1, 1, 1),
        (0, i64::MAX, 0, 1_000, 1_000, 10, 1),
        (100, 200, 0, 1_000, 1_000, 1_000_000, 1),
    ];

    for &(start, end, earliest, latest, hits, chunk_size, min_span) in cases {
        let summary = DataSummary::new(earliest, latest, hits);
        let chunks: Vec<_> =
            TimeRangeChunker::auto(TimeRange::between(start, end), &summary, chunk_size, min_span).collect();
        assert_tiles(&chunks, start, end);
    }
}

#[test]
fn fixed_span_chunks_tile_every_range() {
    for span in [1, 7, 100, 1_000, 999_999, i64::MAX] {
        let summary = DataSummary::new(10, 9_990, 500);
        let chunks: Vec<_> =
            TimeRangeChunker::with_span(TimeRange::between(0, 10_000), &summary, span).collect();
        assert_tiles(&chunks, 0, 10_000);
    }
}

#[test]
fn density_example_yields_ten_equal_chunks() {
    let summary = DataSummary::new(0, 1_000_000, 1_000_000);
    let chunks: Vec<_> =
        TimeRangeChunker::auto(TimeRange::between(0, 1_000_000), &summary, 100_000, 1_000).collect();

    let expected: Vec<_> = (0..10)
        .map(|i| ChunkSpec::new(i * 100_000, (i + 1) * 100_000))
        .collect();
    assert_eq!(chunks, expected);
}

#[test]
fn min_span_bounds_dense_data() {
    let summary = DataSummary::new(0, 1_000, 1_000_000);
    let chunker = TimeRangeChunker::auto(TimeRange::between(0, 10_000), &summary, 10, 500);
    assert_eq!(chunker.span(), 500);
}

#[test]
fn unusable_estimate_gives_one_chunk() {
    let range = TimeRange::between(0, 50);
    for summary in [DataSummary::empty(), DataSummary::new(7, 7, 3)] {
        let chunks: Vec<_> = TimeRangeChunker::auto(range, &summary, 10, 1).collect();
        assert_eq!(chunks, vec![ChunkSpec::new(0, 50)]);
    }
}

#[test]
fn open_bounds_resolve_to_data() {
    let summary = DataSummary::new(1_000, 5_000, 40);
    let chunks: Vec<_> = TimeRangeChunker::auto(TimeRange::unbounded(), &summary, 10, 1).collect();
    assert_tiles(&chunks, 1_000, 5_001);
}

#[test]
fn chunks_are_lazy() {
    let summary = DataSummary::new(0, i64::MAX - 1, 1);
    let mut chunker = TimeRangeChunker::with_span(TimeRange::between(0, i64::MAX), &summary, 1);
    assert_eq!(chunker.next(), Some(ChunkSpec::new(0, 1)));
    assert_eq!(chunker.next(), Some(ChunkSpec::new(1, 2)));
}
