//! Results stream processing.
//!
//! The engine writes a JSON array of result objects. Flush acknowledgements
//! go to the [`FlushListener`]; everything else is persisted. The latest
//! model size stats, snapshot and quantiles are also kept in memory so the
//! job can be reopened from them.

use super::flush::FlushListener;
use super::params::{ModelSizeStats, ModelSnapshot, Quantiles};
use super::persist::JobPersister;
use super::wire::read_json_array;
use super::StreamError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Result record keys that are persisted.
const RESULT_KEYS: &[&str] = &[
    "bucket",
    "records",
    "influencers",
    "modelSizeStats",
    "modelSnapshot",
    "quantiles",
    "categoryDefinition",
];

/// A flush acknowledgement: `"flush": "<id>"` or `"flush": {"id": "<id>"}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlushAck {
    Id(String),
    Object { id: String },
}

impl FlushAck {
    fn id(&self) -> &str {
        match self {
            FlushAck::Id(id) | FlushAck::Object { id } => id,
        }
    }
}

/// Model state seen most recently on the results stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestModelState {
    pub model_size_stats: Option<ModelSizeStats>,
    pub model_snapshot: Option<ModelSnapshot>,
    pub quantiles: Option<Quantiles>,
}

pub struct ResultsProcessor {
    job_id: String,
    persister: Arc<dyn JobPersister>,
    flush_listener: Arc<FlushListener>,
    latest: Mutex<LatestModelState>,
}

impl ResultsProcessor {
    pub fn new(
        job_id: impl Into<String>,
        persister: Arc<dyn JobPersister>,
        flush_listener: Arc<FlushListener>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            persister,
            flush_listener,
            latest: Mutex::new(LatestModelState::default()),
        }
    }

    /// Consume `stream` until it ends, returning the number of records
    /// seen.
    ///
    /// The flush listener is cleared when the stream ends, whether cleanly
    /// or not: no acknowledgement can arrive after that.
    pub fn process<R: Read>(&self, stream: R) -> Result<u64, StreamError> {
        let outcome = self.consume(stream);
        self.flush_listener.clear();
        outcome
    }

    /// Run [`ResultsProcessor::process`] and log the outcome; for reader
    /// threads.
    pub fn run<R: Read>(&self, stream: R) {
        match self.process(stream) {
            Ok(records) => debug!(job_id = %self.job_id, records, "Results stream ended"),
            Err(e) => error!(job_id = %self.job_id, error = %e, "Results reader failed"),
        }
    }

    pub fn latest(&self) -> LatestModelState {
        self.lock().clone()
    }

    fn consume<R: Read>(&self, stream: R) -> Result<u64, StreamError> {
        read_json_array(stream, |record| self.handle(record))
    }

    fn handle(&self, record: Value) {
        let object = match record.as_object() {
            Some(object) => object,
            None => {
                warn!(job_id = %self.job_id, "Ignoring non-object result record");
                return;
            }
        };

        if let Some(flush) = object.get("flush") {
            match FlushAck::deserialize(flush) {
                Ok(ack) => {
                    debug!(job_id = %self.job_id, flush_id = ack.id(), "Flush acknowledged");
                    self.flush_listener.acknowledge_flush(ack.id());
                }
                Err(e) => warn!(job_id = %self.job_id, error = %e, "Malformed flush acknowledgement"),
            }
            return;
        }

        if !RESULT_KEYS.iter().any(|key| object.contains_key(*key)) {
            warn!(job_id = %self.job_id, keys = ?object.keys().collect::<Vec<_>>(), "Unrecognised result record");
            return;
        }

        {
            let mut latest = self.lock();
            if let Some(stats) = self.parse::<ModelSizeStats>(object.get("modelSizeStats")) {
                latest.model_size_stats = Some(ModelSizeStats {
                    job_id: self.job_id.clone(),
                    ..stats
                });
            }
            if let Some(snapshot) = self.parse::<ModelSnapshot>(object.get("modelSnapshot")) {
                latest.model_snapshot = Some(ModelSnapshot {
                    job_id: self.job_id.clone(),
                    ..snapshot
                });
            }
            if let Some(quantiles) = self.parse::<Quantiles>(object.get("quantiles")) {
                latest.quantiles = Some(Quantiles {
                    job_id: self.job_id.clone(),
                    ..quantiles
                });
            }
        }

        if let Err(e) = self.persister.persist_result(&self.job_id, &record) {
            error!(job_id = %self.job_id, error = %e, "Failed to persist result");
        }
    }

    fn parse<T: DeserializeOwned>(&self, value: Option<&Value>) -> Option<T> {
        let value = value?;
        match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Malformed model state record");
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LatestModelState> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
