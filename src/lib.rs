//! adpipe Library
//!
//! Feeds time-series data from a search backend into an external
//! anomaly-detection engine over named pipes: chunked extraction, the pipe
//! wire formats and flush synchronisation.

pub mod config;
pub mod extractor;
pub mod process;

pub use config::Config;
pub use extractor::{
    CancelFlag, ChunkedDataExtractor, DataExtractor, ExtractionContext, ExtractorError,
    InMemorySearchBackend, SearchExtractorFactory, TimeRange, TimeRangeChunker,
};
pub use process::{
    AutodetectParams, FlushListener, FsPersister, JobProcessCoordinator, JobSpec, ProcessError,
    ProcessPipes, StateProcessor,
};
