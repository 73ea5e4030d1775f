//! Chunk plan command handler

use anyhow::{bail, Result};

use adpipe::extractor::DataSummary;
use adpipe::{Config, TimeRange, TimeRangeChunker};

use super::{format_millis, format_span};

pub struct ChunksArgs {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub earliest: i64,
    pub latest: i64,
    pub count: u64,
    pub chunk_size: Option<u64>,
    pub span: Option<i64>,
}

/// Print the chunks the range is split into, one per line.
#[cfg(not(tarpaulin_include))]
pub fn handle(config: &Config, args: ChunksArgs) -> Result<()> {
    for line in plan(config, &args)? {
        println!("{}", line);
    }
    Ok(())
}

/// Chunk plan lines: a summary line followed by one line per chunk.
pub fn plan(config: &Config, args: &ChunksArgs) -> Result<Vec<String>> {
    if args.latest < args.earliest {
        bail!("--latest ({}) is before --earliest ({})", args.latest, args.earliest);
    }
    if let (Some(start), Some(end)) = (args.start, args.end) {
        if end <= start {
            bail!("--end ({}) must be after --start ({})", end, start);
        }
    }
    if matches!(args.span, Some(span) if span <= 0) {
        bail!("--span must be positive");
    }

    let range = TimeRange::new(args.start, args.end);
    let summary = DataSummary::new(args.earliest, args.latest, args.count);
    let chunking = &config.extraction.chunking;
    let chunker = match args.span {
        Some(span) => TimeRangeChunker::with_span(range, &summary, span),
        None => TimeRangeChunker::auto(
            range,
            &summary,
            args.chunk_size.unwrap_or(chunking.chunk_size),
            chunking.min_span_ms,
        ),
    };

    let span = match chunker.span() {
        i64::MAX => "whole range".to_string(),
        span => format_span(span),
    };
    let chunks: Vec<_> = chunker.collect();
    let mut lines = Vec::with_capacity(chunks.len() + 1);
    lines.push(format!("{} chunk(s), span {}", chunks.len(), span));
    for (i, chunk) in chunks.iter().enumerate() {
        lines.push(format!(
            "{:>4}  {}  {} .. {}",
            i + 1,
            chunk,
            format_millis(chunk.start),
            format_millis(chunk.end)
        ));
    }
    Ok(lines)
}
