//! Named pipe setup and engine process lifecycle.
//!
//! Pipes are created before the engine is spawned and handed to it as
//! arguments. Opening a FIFO blocks until the other side opens it too, so
//! each open runs on a helper thread with a deadline; a stuck open is
//! released by briefly opening the opposite end ourselves.

use super::wire::LengthEncodedWriter;
use super::{ProcessError, ProcessResult};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Polling interval while waiting on pipe opens and process exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

static PIPE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writer for the engine's input pipe.
pub type InputWriter = LengthEncodedWriter<BufWriter<File>>;

/// Replace everything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_job_id(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Paths of one job's named pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeNames {
    /// Absent when the engine logs to stderr instead
    pub log: Option<PathBuf>,
    pub command: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub persist: PathBuf,
    prefix: PathBuf,
}

impl PipeNames {
    /// Pipe paths for `job_id` under `dir`, unique to this host process
    /// and `seq`.
    pub fn for_job(dir: &Path, job_id: &str, seq: u64, log_pipe: bool) -> Self {
        let prefix = format!(
            "adpipe_{}_{}_{}",
            sanitize_job_id(job_id),
            std::process::id(),
            seq
        );
        let path = |name: &str| dir.join(format!("{}_{}", prefix, name));
        Self {
            log: log_pipe.then(|| path("log")),
            command: path("command"),
            input: path("input"),
            output: path("output"),
            persist: path("persist"),
            prefix: dir.join(&prefix),
        }
    }

    /// A path next to the pipes that shares their job and sequence prefix,
    /// for files handed to the engine at startup.
    pub fn scoped(&self, name: &str) -> PathBuf {
        let mut path = self.prefix.clone().into_os_string();
        path.push("_");
        path.push(name);
        PathBuf::from(path)
    }

    /// Like [`PipeNames::for_job`] with the next sequence number.
    pub fn next_for_job(dir: &Path, job_id: &str, log_pipe: bool) -> Self {
        let seq = PIPE_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        Self::for_job(dir, job_id, seq, log_pipe)
    }

    /// All pipes, in the order they are opened.
    pub fn all(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::with_capacity(5);
        if let Some(log) = &self.log {
            paths.push(log);
        }
        paths.extend([
            self.command.as_path(),
            self.input.as_path(),
            self.output.as_path(),
            self.persist.as_path(),
        ]);
        paths
    }

    /// Engine arguments naming the pipes.
    pub fn engine_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if let Some(log) = &self.log {
            args.push(format!("--logPipe={}", log.display()));
        }
        args.push(format!("--commandPipe={}", self.command.display()));
        args.push(format!("--input={}", self.input.display()));
        args.push(format!("--output={}", self.output.display()));
        args.push(format!("--persist={}", self.persist.display()));
        args
    }

    /// Create every pipe with owner-only permissions. Pipes created before a
    /// failure are removed again.
    pub fn create(&self) -> io::Result<()> {
        for (i, path) in self.all().iter().enumerate() {
            if let Err(e) = mkfifo(path) {
                for created in &self.all()[..i] {
                    let _ = std::fs::remove_file(created);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove every pipe, ignoring ones already gone.
    pub fn remove(&self) {
        for path in self.all() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(unix)]
fn mkfifo(path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the call's duration
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn mkfifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

/// Lifecycle of a [`ProcessPipes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    NotStarted,
    /// Engine spawned, pipes opening
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PipeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipeState::NotStarted => "not started",
            PipeState::Starting => "starting",
            PipeState::Running => "running",
            PipeState::Stopping => "stopping",
            PipeState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            Direction::Read => options.read(true),
            Direction::Write => options.write(true),
        };
        options
    }
}

/// The engine process and the host's ends of its pipes.
///
/// Closing is idempotent and also happens on drop: the input pipe is
/// closed first, then the command pipe, then the engine gets the shutdown
/// timeout to exit before it is killed. Pipes are removed from disk on
/// every exit path, including a failed start.
pub struct ProcessPipes {
    job_id: String,
    names: PipeNames,
    state: PipeState,
    open_timeout: Duration,
    shutdown_timeout: Duration,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    log: Option<File>,
    command: Option<File>,
    input: Option<InputWriter>,
    output: Option<File>,
    persist: Option<File>,
}

impl ProcessPipes {
    pub fn new(
        job_id: impl Into<String>,
        names: PipeNames,
        open_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            names,
            state: PipeState::NotStarted,
            open_timeout,
            shutdown_timeout,
            child: None,
            exit_status: None,
            log: None,
            command: None,
            input: None,
            output: None,
            persist: None,
        }
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn names(&self) -> &PipeNames {
        &self.names
    }

    /// Engine process id while it runs.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Create the pipes, spawn `command` and open the host ends in the order
    /// log, command, input, output, persist.
    pub fn start(&mut self, mut command: Command) -> ProcessResult<()> {
        if self.state != PipeState::NotStarted {
            return Err(ProcessError::JobAlreadyRunning(self.job_id.clone()));
        }
        self.state = PipeState::Starting;

        if let Err(e) = self.names.create() {
            self.state = PipeState::Stopped;
            return Err(e.into());
        }

        let program = command.get_program().to_string_lossy().into_owned();
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            });
        match child {
            Ok(child) => self.child = Some(child),
            Err(e) => {
                self.names.remove();
                self.state = PipeState::Stopped;
                return Err(e);
            }
        }
        debug!(job_id = %self.job_id, program = %program, pid = ?self.pid(), "Engine spawned");

        if let Err(e) = self.open_all() {
            warn!(job_id = %self.job_id, error = %e, "Engine startup failed");
            self.abort();
            return Err(e);
        }

        self.state = PipeState::Running;
        info!(job_id = %self.job_id, pid = ?self.pid(), "Engine started");
        Ok(())
    }

    fn open_all(&mut self) -> ProcessResult<()> {
        if let Some(path) = self.names.log.clone() {
            self.log = Some(self.open(&path, Direction::Read)?);
        }
        let command = self.names.command.clone();
        self.command = Some(self.open(&command, Direction::Write)?);
        let input = self.names.input.clone();
        let input = self.open(&input, Direction::Write)?;
        self.input = Some(LengthEncodedWriter::new(BufWriter::new(input)));
        let output = self.names.output.clone();
        self.output = Some(self.open(&output, Direction::Read)?);
        let persist = self.names.persist.clone();
        self.persist = Some(self.open(&persist, Direction::Read)?);
        Ok(())
    }

    /// Open one FIFO, giving up when the deadline passes or the engine
    /// exits first.
    fn open(&mut self, path: &Path, direction: Direction) -> ProcessResult<File> {
        let (tx, rx) = mpsc::channel();
        let thread_path = path.to_path_buf();
        thread::Builder::new()
            .name(format!("pipe-open-{}", self.job_id))
            .spawn(move || {
                let _ = tx.send(direction.options().open(&thread_path));
            })?;

        let deadline = Instant::now().checked_add(self.open_timeout);
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => return result.map_err(ProcessError::from),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::Other, "pipe open thread died").into())
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            let exited = match self.child.as_mut() {
                Some(child) => child.try_wait()?,
                None => None,
            };
            if exited.is_none() && deadline.map_or(true, |deadline| Instant::now() < deadline) {
                continue;
            }

            release_blocked_open(path, direction);
            let _ = rx.recv_timeout(self.open_timeout.min(Duration::from_secs(1)));
            return Err(match exited {
                Some(status) => {
                    self.exit_status = Some(status);
                    ProcessError::ProcessExited {
                        status: status.to_string(),
                    }
                }
                None => ProcessError::PipeOpenTimeout {
                    path: path.to_path_buf(),
                    timeout: self.open_timeout,
                },
            });
        }
    }

    /// Send one command line.
    pub fn write_command(&mut self, line: &str) -> ProcessResult<()> {
        if self.state != PipeState::Running {
            return Err(ProcessError::NotRunning(self.state));
        }
        let command = self
            .command
            .as_mut()
            .ok_or(ProcessError::NotRunning(self.state))?;
        command.write_all(line.as_bytes())?;
        command.flush()?;
        Ok(())
    }

    /// The input pipe writer.
    pub fn input(&mut self) -> ProcessResult<&mut InputWriter> {
        if self.state != PipeState::Running {
            return Err(ProcessError::NotRunning(self.state));
        }
        self.input.as_mut().ok_or(ProcessError::NotRunning(self.state))
    }

    /// Hand the log pipe to its reader thread.
    pub fn take_log_reader(&mut self) -> Option<File> {
        self.log.take()
    }

    /// Hand the results pipe to its reader thread.
    pub fn take_output_reader(&mut self) -> Option<File> {
        self.output.take()
    }

    /// Hand the state pipe to its reader thread.
    pub fn take_persist_reader(&mut self) -> Option<File> {
        self.persist.take()
    }

    /// Shut the engine down.
    ///
    /// Closes the input pipe, then the command pipe, waits up to the
    /// shutdown timeout for the engine to exit and kills it otherwise.
    /// Returns the exit status when one was collected. Calling it again is
    /// a no-op.
    pub fn close(&mut self) -> ProcessResult<Option<ExitStatus>> {
        match self.state {
            PipeState::Stopped => return Ok(self.exit_status),
            PipeState::NotStarted => {
                self.state = PipeState::Stopped;
                return Ok(None);
            }
            _ => {}
        }
        self.state = PipeState::Stopping;
        debug!(job_id = %self.job_id, "Closing engine pipes");

        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.flush() {
                debug!(job_id = %self.job_id, error = %e, "Input pipe flush failed on close");
            }
        }
        self.command.take();

        let result = self.wait_or_kill();

        self.log.take();
        self.output.take();
        self.persist.take();
        self.names.remove();
        self.state = PipeState::Stopped;
        result.map(|_| self.exit_status)
    }

    fn wait_or_kill(&mut self) -> ProcessResult<()> {
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Ok(()),
        };
        if self.exit_status.is_some() {
            return Ok(());
        }

        let deadline = Instant::now().checked_add(self.shutdown_timeout);
        loop {
            if let Some(status) = child.try_wait()? {
                info!(job_id = %self.job_id, %status, "Engine exited");
                self.exit_status = Some(status);
                return Ok(());
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(
            job_id = %self.job_id,
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Engine did not exit in time, killing it"
        );
        let _ = child.kill();
        self.exit_status = Some(child.wait()?);
        Ok(())
    }

    /// Tear down after a failed start.
    fn abort(&mut self) {
        self.input.take();
        self.command.take();
        self.log.take();
        self.output.take();
        self.persist.take();
        if let Some(child) = self.child.as_mut() {
            if self.exit_status.is_none() {
                let _ = child.kill();
                self.exit_status = child.wait().ok();
            }
        }
        self.names.remove();
        self.state = PipeState::Stopped;
    }
}

impl Drop for ProcessPipes {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(job_id = %self.job_id, error = %e, "Failed to close engine pipes");
        }
    }
}

/// Open the opposite end of `path` without blocking so a thread stuck in
/// `open` returns.
#[cfg(unix)]
fn release_blocked_open(path: &Path, blocked: Direction) {
    use std::os::unix::fs::OpenOptionsExt;

    let opposite = match blocked {
        Direction::Read => Direction::Write,
        Direction::Write => Direction::Read,
    };
    let _ = opposite
        .options()
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
}

#[cfg(not(unix))]
fn release_blocked_open(_path: &Path, _blocked: Direction) {}
