//! Raw row extraction using scroll pagination.

use super::search::{SearchBackend, SearchRequest, SearchResponse};
use super::{
    CancelFlag, DataExtractor, DataStream, ExtractionContext, ExtractorError, ExtractorResult,
    TimeRange,
};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pulls the matching rows of one window, ascending by time.
///
/// The window is read through a single scroll: the initial search plus its
/// continuation pages. Cancellation is only honoured before the initial
/// search, so a window that has started is always read to the end.
pub struct ScrollDataExtractor {
    backend: Arc<dyn SearchBackend>,
    context: Arc<ExtractionContext>,
    start: i64,
    end: i64,
    consumed: bool,
    cancel: CancelFlag,
}

impl ScrollDataExtractor {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        context: Arc<ExtractionContext>,
        start: i64,
        end: i64,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            backend,
            context,
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
            size: self.context.scroll_size,
            aggregations: None,
            script_fields: self.context.script_fields.clone(),
            scroll: true,
        }
    }

    /// Drain the scroll started by `first` into newline-delimited JSON.
    fn collect_pages(
        &self,
        first: SearchResponse,
        scroll_id: &mut Option<String>,
    ) -> ExtractorResult<(Vec<u8>, usize)> {
        let mut buffer = Vec::new();
        let mut rows = 0;
        let mut page = first;

        loop {
            page.check()?;
            if page.scroll_id.is_some() {
                *scroll_id = page.scroll_id.clone();
            }
            if page.hits.is_empty() {
                break;
            }
            for hit in &page.hits {
                serde_json::to_writer(&mut buffer, hit)?;
                buffer.push(b'\n');
            }
            rows += page.hits.len();

            match scroll_id.as_deref() {
                Some(id) => page = self.backend.scroll(id)?,
                None => break,
            }
        }

        Ok((buffer, rows))
    }
}

impl DataExtractor for ScrollDataExtractor {
    fn has_next(&self) -> bool {
        !self.consumed && !self.cancel.is_cancelled()
    }

    fn next(&mut self) -> ExtractorResult<Option<DataStream>> {
        if self.consumed {
            return Err(ExtractorError::NoMoreData);
        }
        self.consumed = true;

        if self.cancel.is_cancelled() {
            debug!(job_id = %self.context.job_id, start = self.start, end = self.end, "Scroll extraction cancelled before search");
            return Ok(None);
        }

        let first = self.backend.search(&self.build_request())?;
        let mut scroll_id = first.scroll_id.clone();
        let collected = self.collect_pages(first, &mut scroll_id);

        if let Some(id) = scroll_id {
            if let Err(e) = self.backend.clear_scroll(&id) {
                warn!(job_id = %self.context.job_id, error = %e, "Failed to clear scroll");
            }
        }

        let (buffer, rows) = collected?;
        debug!(job_id = %self.context.job_id, start = self.start, end = self.end, rows, "Scroll extraction finished");

        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(Box::new(Cursor::new(buffer))))
    }

    fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}
