//! Shared helpers for integration tests
//!
//! The fake engine is a /bin/sh script. [`OPEN_PIPES`] parses the pipe
//! arguments and opens the engine ends in the order the host expects:
//! fd 3 log, 4 command, 5 input, 6 output, 7 persist.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use adpipe::process::wire::LengthEncodedWriter;
use adpipe::process::{DataCounts, DataWriter};
use adpipe::Config;

pub const OPEN_PIPES: &str = r#"
log=/dev/null
for arg in "$@"; do
  case "$arg" in
    --logPipe=*) log="${arg#--logPipe=}" ;;
    --commandPipe=*) cmd="${arg#--commandPipe=}" ;;
    --input=*) input="${arg#--input=}" ;;
    --output=*) output="${arg#--output=}" ;;
    --persist=*) persist="${arg#--persist=}" ;;
  esac
done
exec 3>"$log" 4<"$cmd" 5<"$input" 6>"$output" 7>"$persist"
"#;

/// Write an executable engine script running `body` into `dir`.
#[cfg(unix)]
pub fn write_engine(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("engine.sh");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config running `program` with pipes under `dir` and short timeouts.
pub fn engine_config(dir: &Path, program: &Path) -> Config {
    let mut config = Config::default();
    config.engine.program = program.display().to_string();
    config.engine.pipe_dir = Some(dir.display().to_string());
    config.engine.pipe_open_timeout_secs = 10;
    config.engine.shutdown_timeout_secs = 5;
    config.persistence.directory = dir.join("data").display().to_string();
    config
}

/// Pipes still present in `dir`.
pub fn pipes_left(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("adpipe_"))
        .collect()
}

/// Bytes the host sends on the input pipe for `rows` followed by flush 1.
pub fn expected_input(job_id: &str, time_field: &str, fields: &[&str], rows: &str) -> Vec<u8> {
    let fields = fields.iter().map(|f| f.to_string()).collect();
    let mut writer = DataWriter::new(time_field, fields, DataCounts::new(job_id));
    let mut out = LengthEncodedWriter::new(Vec::new());
    writer.write_rows(rows.as_bytes(), &mut out).unwrap();
    writer.write_flush("1", &mut out).unwrap();
    out.into_inner()
}
