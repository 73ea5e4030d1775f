//! Chunking wrapper presenting one logical extraction over many windows.

use super::chunker::{ChunkSpec, TimeRangeChunker};
use super::factory::DataExtractorFactory;
use super::{CancelFlag, DataExtractor, DataStream, ExtractorError, ExtractorResult, TimeRange};
use crate::config::{ChunkingConfig, ChunkingMode};
use std::iter::Peekable;
use std::sync::Arc;
use tracing::{debug, info};

enum State {
    /// Nothing asked of the backend yet
    Init,
    /// Handing out chunks
    Chunking(Peekable<TimeRangeChunker>),
    /// Summary found nothing, last chunk consumed, cancelled, or failed
    Exhausted,
}

/// Walks a time range chunk by chunk, one single-shot extractor per chunk.
///
/// Each `next()` call extracts exactly one chunk and may return `Ok(None)`
/// for a chunk without data while later chunks remain; callers keep pulling
/// until `has_next()` turns false. Chunks are issued strictly in ascending
/// order and tile the range exactly.
///
/// A backend error from the summary or any chunk ends the extraction; the
/// caller decides whether to restart the cycle.
pub struct ChunkedDataExtractor {
    factory: Arc<dyn DataExtractorFactory>,
    range: TimeRange,
    chunking: ChunkingConfig,
    state: State,
    issued: Vec<ChunkSpec>,
    cancel: CancelFlag,
}

impl ChunkedDataExtractor {
    pub fn new(factory: Arc<dyn DataExtractorFactory>, range: TimeRange, chunking: ChunkingConfig) -> Self {
        Self {
            factory,
            range,
            chunking,
            state: State::Init,
            issued: Vec::new(),
            cancel: CancelFlag::new(),
        }
    }

    /// Chunks handed to underlying extractors so far, in issue order.
    pub fn issued_chunks(&self) -> &[ChunkSpec] {
        &self.issued
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Build the chunk plan, probing the backend unless chunking is off.
    ///
    /// Returns `None` when the summary found no data.
    fn plan(&self) -> ExtractorResult<Option<TimeRangeChunker>> {
        if self.chunking.mode == ChunkingMode::Off {
            return Ok(Some(TimeRangeChunker::single(
                self.range.resolved_start(),
                self.range.resolved_end(),
            )));
        }

        let summary = self.factory.summarise(self.range)?;
        if !summary.has_data() {
            return Ok(None);
        }

        let chunker = match self.chunking.mode {
            ChunkingMode::Manual => {
                TimeRangeChunker::with_span(self.range, &summary, self.chunking.time_span_ms)
            }
            _ => TimeRangeChunker::auto(
                self.range,
                &summary,
                self.chunking.chunk_size,
                self.chunking.min_span_ms,
            ),
        };
        info!(
            earliest = summary.earliest_time,
            latest = summary.latest_time,
            total_hits = summary.total_hits,
            span_ms = chunker.span(),
            "Chunked extraction planned"
        );
        Ok(Some(chunker))
    }

    fn extract_chunk(&mut self, chunk: ChunkSpec) -> ExtractorResult<Option<DataStream>> {
        debug!(chunk_start = chunk.start, chunk_end = chunk.end, "Extracting chunk");
        self.issued.push(chunk);
        let mut extractor = self
            .factory
            .new_extractor(chunk.start, chunk.end, self.cancel.clone());
        extractor.next()
    }
}

impl DataExtractor for ChunkedDataExtractor {
    fn has_next(&self) -> bool {
        !matches!(self.state, State::Exhausted) && !self.cancel.is_cancelled()
    }

    fn next(&mut self) -> ExtractorResult<Option<DataStream>> {
        if matches!(self.state, State::Exhausted) {
            return Err(ExtractorError::NoMoreData);
        }
        if self.cancel.is_cancelled() {
            self.state = State::Exhausted;
            return Ok(None);
        }

        let mut chunks = match std::mem::replace(&mut self.state, State::Exhausted) {
            State::Chunking(chunks) => chunks,
            _ => match self.plan()? {
                Some(chunker) => chunker.peekable(),
                None => {
                    debug!("Summary found no data; nothing to extract");
                    return Ok(None);
                }
            },
        };

        let chunk = match chunks.next() {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        let data = self.extract_chunk(chunk)?;

        if chunks.peek().is_some() {
            self.state = State::Chunking(chunks);
        }
        Ok(data)
    }

    fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}
