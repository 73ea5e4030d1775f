//! State stream splitting and persistence.

use super::persist::JobPersister;
use super::wire::NulDelimitedReader;
use super::StreamError;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Reads the engine's state stream and persists each record.
///
/// Records are persisted in stream order, one call per record, and are not
/// retained once handed over. Persistence failures are logged and skipped.
pub struct StateProcessor {
    job_id: String,
    persister: Arc<dyn JobPersister>,
    incomplete: AtomicBool,
}

impl StateProcessor {
    pub fn new(job_id: impl Into<String>, persister: Arc<dyn JobPersister>) -> Self {
        Self {
            job_id: job_id.into(),
            persister,
            incomplete: AtomicBool::new(false),
        }
    }

    /// Consume `stream` until it ends, returning how many records were
    /// persisted.
    ///
    /// A stream that ends inside a record fails with
    /// [`StreamError::TruncatedStateRecord`] after every complete record
    /// has been persisted, and marks the persisted state as incomplete.
    pub fn process<R: Read>(&self, stream: R) -> Result<usize, StreamError> {
        let mut persisted = 0;
        for record in NulDelimitedReader::new(stream) {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    if matches!(e, StreamError::TruncatedStateRecord { .. }) {
                        self.incomplete.store(true, Ordering::SeqCst);
                    }
                    return Err(e);
                }
            };
            if record.is_empty() {
                continue;
            }
            match self.persister.persist_state(&self.job_id, &record) {
                Ok(()) => persisted += 1,
                Err(e) => {
                    error!(job_id = %self.job_id, error = %e, bytes = record.len(), "Failed to persist state record")
                }
            }
        }
        debug!(job_id = %self.job_id, persisted, "State stream ended");
        Ok(persisted)
    }

    /// Whether the stream was cut off in the middle of a record.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete.load(Ordering::SeqCst)
    }

    /// Run [`StateProcessor::process`] and log the outcome; for reader
    /// threads.
    pub fn run<R: Read>(&self, stream: R) {
        if let Err(e) = self.process(stream) {
            match e {
                StreamError::TruncatedStateRecord { .. } => {
                    warn!(job_id = %self.job_id, error = %e, "Persisted state may be incomplete")
                }
                _ => error!(job_id = %self.job_id, error = %e, "State reader failed"),
            }
        }
    }
}
