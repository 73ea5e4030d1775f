//! Persistence sink for engine output.

use super::pipes::sanitize_job_id;
use humansize::{format_size, BINARY};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where state records and result documents end up.
///
/// Calls come from the reader threads; failures are logged by the caller
/// and never retried.
pub trait JobPersister: Send + Sync {
    /// Store one opaque state record.
    fn persist_state(&self, job_id: &str, record: &[u8]) -> Result<(), PersistError>;

    /// Store one result document.
    fn persist_result(&self, job_id: &str, document: &Value) -> Result<(), PersistError>;
}

/// Persists under a root directory:
///
/// ```text
/// <root>/<job>/state/000001.bin
/// <root>/<job>/results.ndjson
/// ```
#[derive(Debug)]
pub struct FsPersister {
    root: PathBuf,
    /// Last state record number per job
    state_seq: Mutex<HashMap<String, u64>>,
}

impl FsPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state_seq: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(sanitize_job_id(job_id))
    }

    pub fn state_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("state")
    }

    pub fn results_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("results.ndjson")
    }

    /// State records stored for a job, in write order.
    pub fn state_records(&self, job_id: &str) -> Result<Vec<PathBuf>, PersistError> {
        let dir = self.state_dir(job_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(io_error(&dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "bin"))
            .collect();
        records.sort();
        Ok(records)
    }

    /// Total bytes stored for a job, human readable.
    pub fn usage_human(&self, job_id: &str) -> String {
        format_size(dir_size(&self.job_dir(job_id)), BINARY)
    }

    fn next_state_seq(&self, job_id: &str) -> Result<u64, PersistError> {
        let mut seqs = self.state_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = match seqs.get(job_id) {
            Some(last) => last + 1,
            None => self.state_records(job_id)?.len() as u64 + 1,
        };
        seqs.insert(job_id.to_string(), seq);
        Ok(seq)
    }
}

impl JobPersister for FsPersister {
    fn persist_state(&self, job_id: &str, record: &[u8]) -> Result<(), PersistError> {
        let dir = self.state_dir(job_id);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let path = dir.join(format!("{:06}.bin", self.next_state_seq(job_id)?));
        let temp_path = path.with_extension("bin.tmp");
        fs::write(&temp_path, record).map_err(io_error(&temp_path))?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(&path)(e));
        }
        Ok(())
    }

    fn persist_result(&self, job_id: &str, document: &Value) -> Result<(), PersistError> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let path = self.results_path(job_id);
        let mut line = serde_json::to_vec(document)?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(io_error(&path))
    }
}

fn dir_size(path: &Path) -> u64 {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
