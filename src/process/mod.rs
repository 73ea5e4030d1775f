//! Engine process management.
//!
//! One engine process runs per job. The host talks to it through five named
//! pipes: it writes control commands and length-encoded input records, and
//! reads back engine log lines, result records (including flush
//! acknowledgements) and persisted model state.
//!
//! # Module Structure
//!
//! - [`wire`] - framing for every pipe
//! - [`pipes`] - pipe creation, engine startup and shutdown
//! - [`flush`] - flush acknowledgement rendezvous
//! - [`state`] - state stream splitting and persistence
//! - [`results`] - results stream processing
//! - [`log`] - engine log forwarding
//! - [`input`] - JSON rows to input records
//! - [`params`] - prior job state used to prime the engine
//! - [`persist`] - persistence sink
//! - [`coordinator`] - per-job wiring and the public job operations

pub mod coordinator;
pub mod flush;
pub mod input;
pub mod log;
pub mod params;
pub mod persist;
pub mod pipes;
pub mod results;
pub mod state;
pub mod wire;

pub use coordinator::{JobProcessCoordinator, JobSpec};
pub use flush::FlushListener;
pub use input::DataWriter;
pub use params::{AutodetectParams, AutodetectParamsBuilder, DataCounts, MlFilter, ModelSizeStats, ModelSnapshot, Quantiles};
pub use persist::{FsPersister, JobPersister, PersistError};
pub use pipes::{PipeNames, PipeState, ProcessPipes};
pub use results::ResultsProcessor;
pub use state::StateProcessor;

use crate::extractor::ExtractorError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors raised while starting, feeding or stopping an engine process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A named pipe was not opened by the engine in time.
    #[error("timed out after {timeout:?} waiting for the engine to open {}", path.display())]
    PipeOpenTimeout { path: PathBuf, timeout: Duration },

    /// The engine exited before it opened all of its pipes.
    #[error("engine exited during startup ({status})")]
    ProcessExited { status: String },

    #[error("failed to start engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A command field contains a tab or newline.
    #[error("command field contains a tab or newline: {0:?}")]
    InvalidCommandField(String),

    #[error("job '{0}' is already running")]
    JobAlreadyRunning(String),

    #[error("job '{0}' is not running")]
    JobNotRunning(String),

    /// A reader thread stopped while the job was running.
    #[error("{reader} reader of job '{job_id}' stopped unexpectedly")]
    ReaderThreadDied { job_id: String, reader: &'static str },

    #[error("pipes are not running (state: {0})")]
    NotRunning(PipeState),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading an engine output stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The state stream ended in the middle of a record.
    #[error("state stream ended inside a record ({len} bytes without a terminator)")]
    TruncatedStateRecord { len: usize },

    /// The results stream ended in the middle of a record.
    #[error("results stream ended inside a record ({len} bytes)")]
    TruncatedResult { len: usize },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
