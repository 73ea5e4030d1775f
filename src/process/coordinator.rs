//! Per-job engine wiring.
//!
//! [`JobProcessCoordinator`] owns one engine process per open job. Opening a
//! job starts the engine through [`ProcessPipes`], then spawns reader threads
//! for the log, results and state pipes. Writes and flushes from callers go
//! through the job's [`DataWriter`]; flush acknowledgements come back through
//! the job's [`FlushListener`].

use super::flush::FlushListener;
use super::input::DataWriter;
use super::log::forward_engine_log;
use super::params::{AutodetectParams, DataCounts, MlFilter, ModelSizeStats};
use super::persist::JobPersister;
use super::pipes::{PipeNames, ProcessPipes};
use super::results::ResultsProcessor;
use super::state::StateProcessor;
use super::wire::encode_command;
use super::{ProcessError, ProcessResult};
use crate::config::Config;
use crate::extractor::DataExtractor;
use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long closing a job waits for its reader threads
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Readers whose death makes a job unusable
const CRITICAL_READERS: &[&str] = &["results", "state"];

/// What to run for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job_id: String,
    /// Field holding the record time in epoch millis
    pub time_field: String,
    /// Fields forwarded to the engine, in record order
    pub analysis_fields: Vec<String>,
    /// Arguments of the `start` command after the process name
    pub process_args: Vec<String>,
}

impl JobSpec {
    pub fn new(
        job_id: impl Into<String>,
        time_field: impl Into<String>,
        analysis_fields: Vec<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            time_field: time_field.into(),
            analysis_fields,
            process_args: Vec::new(),
        }
    }

    pub fn with_process_args(mut self, process_args: Vec<String>) -> Self {
        self.process_args = process_args;
        self
    }
}

/// One running engine and everything attached to it.
struct JobProcess {
    spec: JobSpec,
    pipes: ProcessPipes,
    /// Name sent in the `start` command
    process_name: String,
    writer: DataWriter,
    flush_listener: Arc<FlushListener>,
    results: Arc<ResultsProcessor>,
    state: Arc<StateProcessor>,
    readers: Vec<(&'static str, JoinHandle<()>)>,
    next_flush_id: u64,
    /// Files written for the engine at startup, removed on close
    warm_start_files: Vec<PathBuf>,
    initial: AutodetectParams,
    closed: bool,
}

impl JobProcess {
    fn start(
        config: &Config,
        spec: JobSpec,
        params: &AutodetectParams,
        persister: Arc<dyn JobPersister>,
    ) -> ProcessResult<Self> {
        let job_id = spec.job_id.clone();
        let names = PipeNames::next_for_job(&config.pipe_directory(), &job_id, config.engine.log_pipe);
        let (warm_start_args, warm_start_files) = write_warm_start_files(&names, params)?;

        let mut command = Command::new(&config.engine.program);
        command
            .arg(format!("--jobid={}", job_id))
            .args(names.engine_args())
            .arg("--lengthEncodedInput")
            .args(&warm_start_args)
            .args(&config.engine.args);
        debug!(job_id = %job_id, command = ?command, "Starting engine");

        let mut pipes = ProcessPipes::new(
            job_id.clone(),
            names,
            Duration::from_secs(config.engine.pipe_open_timeout_secs),
            Duration::from_secs(config.engine.shutdown_timeout_secs),
        );
        if let Err(e) = pipes.start(command) {
            remove_files(&warm_start_files);
            return Err(e);
        }

        let flush_listener = Arc::new(FlushListener::new());
        let mut job = JobProcess {
            writer: DataWriter::new(
                spec.time_field.clone(),
                spec.analysis_fields.clone(),
                params.data_counts().clone(),
            ),
            results: Arc::new(ResultsProcessor::new(
                job_id.clone(),
                persister.clone(),
                flush_listener.clone(),
            )),
            state: Arc::new(StateProcessor::new(job_id, persister)),
            flush_listener,
            pipes,
            process_name: config.engine.process_name.clone(),
            spec,
            readers: Vec::new(),
            next_flush_id: 1,
            warm_start_files,
            initial: params.clone(),
            closed: false,
        };

        if let Err(e) = job.spawn_readers().and_then(|()| job.send_start()) {
            if let Err(close_err) = job.shutdown() {
                debug!(job_id = %job.spec.job_id, error = %close_err, "Shutdown after failed start also failed");
            }
            return Err(e);
        }
        Ok(job)
    }

    fn spawn_readers(&mut self) -> ProcessResult<()> {
        let job_id = self.spec.job_id.clone();

        if let Some(log) = self.pipes.take_log_reader() {
            let id = job_id.clone();
            let handle = spawn_reader("log", &job_id, move || {
                if let Err(e) = forward_engine_log(&id, log) {
                    warn!(job_id = %id, error = %e, "Engine log reader failed");
                }
            })?;
            self.readers.push(("log", handle));
        }

        let output = self
            .pipes
            .take_output_reader()
            .ok_or(ProcessError::NotRunning(self.pipes.state()))?;
        let results = self.results.clone();
        let handle = spawn_reader("results", &job_id, move || results.run(output))?;
        self.readers.push(("results", handle));

        let persist = self
            .pipes
            .take_persist_reader()
            .ok_or(ProcessError::NotRunning(self.pipes.state()))?;
        let state = self.state.clone();
        let handle = spawn_reader("state", &job_id, move || state.run(persist))?;
        self.readers.push(("state", handle));

        Ok(())
    }

    fn send_start(&mut self) -> ProcessResult<()> {
        let mut args = Vec::with_capacity(self.spec.process_args.len() + 1);
        args.push(self.process_name.clone());
        args.extend(self.spec.process_args.iter().cloned());
        let line = encode_command("start", &args)?;
        self.pipes.write_command(&line)?;

        let input = self.pipes.input()?;
        self.writer.write_header(input)?;
        input.flush()?;
        Ok(())
    }

    /// Name of the first critical reader that has stopped.
    fn dead_reader(&self) -> Option<&'static str> {
        self.readers
            .iter()
            .find(|(name, handle)| CRITICAL_READERS.contains(name) && handle.is_finished())
            .map(|(name, _)| *name)
    }

    fn write<R: Read>(&mut self, data: R) -> ProcessResult<u64> {
        let input = self.pipes.input()?;
        self.writer.write_rows(BufReader::new(data), input)
    }

    /// Register and send a flush request. The caller waits on the returned
    /// listener without holding the job lock.
    fn request_flush(&mut self) -> ProcessResult<(Arc<FlushListener>, String)> {
        let id = self.next_flush_id.to_string();
        self.next_flush_id += 1;

        self.flush_listener.register(&id);
        let sent = match self.pipes.input() {
            Ok(input) => self.writer.write_flush(&id, input).map_err(ProcessError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.flush_listener.forget(&id);
            return Err(e);
        }
        debug!(job_id = %self.spec.job_id, flush_id = %id, "Flush requested");
        Ok((self.flush_listener.clone(), id))
    }

    /// Everything a fresh engine needs to carry on from this one.
    fn autodetect_params(&self) -> AutodetectParams {
        let latest = self.results.latest();
        AutodetectParams::builder(self.spec.job_id.clone())
            .data_counts(self.writer.counts().clone())
            .model_size_stats(
                latest
                    .model_size_stats
                    .unwrap_or_else(|| self.initial.model_size_stats().clone()),
            )
            .model_snapshot(latest.model_snapshot.or_else(|| self.initial.model_snapshot().cloned()))
            .quantiles(latest.quantiles.or_else(|| self.initial.quantiles().cloned()))
            .filters(self.initial.filters().iter().cloned())
            .build()
    }

    /// Stop the engine. Pending flushes fail first, then the pipes close and
    /// the readers drain. Calling it again is a no-op.
    fn shutdown(&mut self) -> ProcessResult<Option<ExitStatus>> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;

        self.flush_listener.clear();
        let status = self.pipes.close();
        self.join_readers();
        remove_files(&self.warm_start_files);

        if self.state.is_incomplete() {
            warn!(job_id = %self.spec.job_id, "Engine state ended mid-record; persisted state may be incomplete");
        }
        info!(
            job_id = %self.spec.job_id,
            records = self.writer.counts().processed_record_count,
            "Job closed"
        );
        status
    }

    fn join_readers(&mut self) {
        let deadline = Instant::now() + READER_JOIN_TIMEOUT;
        for (name, handle) in self.readers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !handle.is_finished() {
                warn!(job_id = %self.spec.job_id, reader = name, "Reader thread still running, detaching");
                continue;
            }
            if handle.join().is_err() {
                error!(job_id = %self.spec.job_id, reader = name, "Reader thread panicked");
            }
        }
    }
}

impl Drop for JobProcess {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(job_id = %self.spec.job_id, error = %e, "Failed to shut down job");
        }
    }
}

fn spawn_reader<F>(reader: &str, job_id: &str, body: F) -> ProcessResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("{}-{}", reader, job_id))
        .spawn(body)?;
    Ok(handle)
}

/// Write quantiles and filters next to the pipes and build the matching
/// engine arguments.
fn write_warm_start_files(
    names: &PipeNames,
    params: &AutodetectParams,
) -> ProcessResult<(Vec<String>, Vec<PathBuf>)> {
    let mut args = Vec::new();
    let mut files = Vec::new();

    let result = (|| -> ProcessResult<()> {
        if let Some(quantiles) = params.quantiles() {
            let path = names.scoped("quantiles");
            std::fs::write(&path, quantiles.quantile_state.as_bytes())?;
            args.push(format!("--quantilesState={}", path.display()));
            files.push(path);
        }
        if let Some(snapshot) = params.model_snapshot() {
            args.push(format!("--restoreSnapshotId={}", snapshot.snapshot_id));
        }
        if !params.filters().is_empty() {
            let path = names.scoped("filters");
            std::fs::write(&path, filters_config(params.filters().iter()))?;
            args.push(format!("--filtersConfig={}", path.display()));
            files.push(path);
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok((args, files)),
        Err(e) => {
            remove_files(&files);
            Err(e)
        }
    }
}

fn filters_config<'a>(filters: impl Iterator<Item = &'a MlFilter>) -> String {
    let mut config = String::new();
    for filter in filters {
        config.push_str(&filter.to_config_line());
        config.push('\n');
    }
    config
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Failed to remove warm start file");
            }
        }
    }
}

/// Owns the engine processes of all open jobs.
///
/// Every operation takes a job id. Operations on one job are serialised;
/// waiting for a flush does not block writes to other jobs, nor further
/// writes to the same job.
pub struct JobProcessCoordinator {
    config: Config,
    persister: Arc<dyn JobPersister>,
    jobs: Mutex<HashMap<String, Arc<Mutex<JobProcess>>>>,
}

impl JobProcessCoordinator {
    pub fn new(config: Config, persister: Arc<dyn JobPersister>) -> Self {
        Self {
            config,
            persister,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start an engine for `spec`, primed from `params`.
    pub fn open_job(&self, spec: JobSpec, params: &AutodetectParams) -> ProcessResult<()> {
        let job_id = spec.job_id.clone();
        if self.lock_jobs().contains_key(&job_id) {
            return Err(ProcessError::JobAlreadyRunning(job_id));
        }

        let job = JobProcess::start(&self.config, spec, params, self.persister.clone())?;

        let mut jobs = self.lock_jobs();
        if jobs.contains_key(&job_id) {
            drop(jobs);
            drop(job);
            return Err(ProcessError::JobAlreadyRunning(job_id));
        }
        jobs.insert(job_id.clone(), Arc::new(Mutex::new(job)));
        info!(job_id = %job_id, "Job opened");
        Ok(())
    }

    /// Write newline-delimited JSON rows to the job. Returns the number of
    /// records the engine received.
    pub fn write_data<R: Read>(&self, job_id: &str, data: R) -> ProcessResult<u64> {
        self.with_live_job(job_id, |job| job.write(data))
    }

    /// Ask the engine to process everything written so far and wait for it.
    ///
    /// Returns `Ok(false)` when the acknowledgement does not arrive within
    /// `timeout` (the configured flush timeout when `None`) or the engine
    /// goes away first.
    pub fn flush_job(&self, job_id: &str, timeout: Option<Duration>) -> ProcessResult<bool> {
        let (listener, flush_id) = self.with_live_job(job_id, JobProcess::request_flush)?;
        let timeout = timeout.unwrap_or_else(|| self.config.flush_timeout());

        let acknowledged = listener.wait_for_flush(&flush_id, timeout);
        if acknowledged {
            debug!(job_id, flush_id = %flush_id, "Flush acknowledged");
        } else {
            warn!(job_id, flush_id = %flush_id, timeout_secs = timeout.as_secs(), "Flush not acknowledged");
        }
        Ok(acknowledged)
    }

    /// Drive `extractor` to the end, writing every chunk to the job in
    /// order. Returns the number of records written.
    ///
    /// Stops early, without error, once the extractor is cancelled.
    /// Extraction errors end the run and are returned as-is.
    pub fn run_extraction(&self, job_id: &str, extractor: &mut dyn DataExtractor) -> ProcessResult<u64> {
        let mut written = 0;
        while extractor.has_next() {
            match extractor.next()? {
                Some(stream) => written += self.write_data(job_id, stream)?,
                None => debug!(job_id, "Chunk had no data"),
            }
        }
        if extractor.is_cancelled() {
            info!(job_id, written, "Extraction cancelled");
        } else {
            debug!(job_id, written, "Extraction finished");
        }
        Ok(written)
    }

    /// Stop the job's engine and forget the job.
    pub fn close_job(&self, job_id: &str) -> ProcessResult<Option<ExitStatus>> {
        let job = self
            .lock_jobs()
            .remove(job_id)
            .ok_or_else(|| ProcessError::JobNotRunning(job_id.to_string()))?;
        let mut job = lock(&job);
        job.shutdown()
    }

    /// Close every open job, logging failures.
    pub fn close_all(&self) {
        let jobs: Vec<_> = self.lock_jobs().drain().collect();
        for (job_id, job) in jobs {
            if let Err(e) = lock(&job).shutdown() {
                warn!(job_id = %job_id, error = %e, "Failed to close job");
            }
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock_jobs().contains_key(job_id)
    }

    /// Ids of the open jobs, sorted.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn data_counts(&self, job_id: &str) -> ProcessResult<DataCounts> {
        let job = self.job(job_id)?;
        let counts = lock(&job).writer.counts().clone();
        Ok(counts)
    }

    /// Model memory usage last reported by the engine.
    pub fn model_size_stats(&self, job_id: &str) -> ProcessResult<ModelSizeStats> {
        Ok(self.autodetect_params(job_id)?.model_size_stats().clone())
    }

    /// Parameters to reopen the job with after it closes.
    pub fn autodetect_params(&self, job_id: &str) -> ProcessResult<AutodetectParams> {
        let job = self.job(job_id)?;
        let params = lock(&job).autodetect_params();
        Ok(params)
    }

    fn job(&self, job_id: &str) -> ProcessResult<Arc<Mutex<JobProcess>>> {
        self.lock_jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ProcessError::JobNotRunning(job_id.to_string()))
    }

    /// Run `f` on the job unless one of its critical readers has died, in
    /// which case the job is torn down instead.
    fn with_live_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobProcess) -> ProcessResult<T>,
    ) -> ProcessResult<T> {
        let handle = self.job(job_id)?;
        let mut job = lock(&handle);

        let reader = match job.dead_reader() {
            Some(reader) => reader,
            None => return f(&mut *job),
        };

        error!(job_id, reader, "Reader thread died, tearing job down");
        if let Err(e) = job.shutdown() {
            debug!(job_id, error = %e, "Teardown after reader death failed");
        }
        drop(job);

        let mut jobs = self.lock_jobs();
        if jobs.get(job_id).map_or(false, |current| Arc::ptr_eq(current, &handle)) {
            jobs.remove(job_id);
        }
        Err(ProcessError::ReaderThreadDied {
            job_id: job_id.to_string(),
            reader,
        })
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<JobProcess>>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobProcessCoordinator {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn lock(job: &Mutex<JobProcess>) -> MutexGuard<'_, JobProcess> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}
