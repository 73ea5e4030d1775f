//! Engine log forwarding.
//!
//! The engine writes one JSON object per line to its log pipe. Each message
//! is re-emitted as a `tracing` event at the matching level.

use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Read};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Deserialize)]
struct EngineLogMessage {
    level: String,
    message: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

/// Forward every log line of `stream` until it ends. Returns the number of
/// messages forwarded.
pub fn forward_engine_log<R: Read>(job_id: &str, stream: R) -> io::Result<usize> {
    let mut forwarded = 0;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EngineLogMessage>(line) {
            Ok(message) => emit(job_id, &message),
            Err(_) => warn!(job_id, line, "Unparseable engine log line"),
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

fn emit(job_id: &str, msg: &EngineLogMessage) {
    let pid = msg.pid.unwrap_or_default();
    let file = msg.file.as_deref().unwrap_or("");
    let line = msg.line.unwrap_or_default();
    let text = msg.message.as_str();

    match msg.level.to_ascii_uppercase().as_str() {
        "TRACE" => trace!(job_id, pid, file, line, "{}", text),
        "DEBUG" => debug!(job_id, pid, file, line, "{}", text),
        "INFO" => info!(job_id, pid, file, line, "{}", text),
        "WARN" | "WARNING" => warn!(job_id, pid, file, line, "{}", text),
        _ => error!(job_id, pid, file, line, level = %msg.level, "{}", text),
    }
}
