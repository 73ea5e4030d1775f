//! Integration tests for ProcessPipes

use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use adpipe::process::wire::{encode_command, LengthEncodedReader};
use adpipe::process::{PipeNames, PipeState};
use adpipe::{ProcessError, ProcessPipes};

use crate::helpers::{pipes_left, write_engine, OPEN_PIPES};

fn pipes(temp: &TempDir, open_timeout: Duration) -> ProcessPipes {
    let names = PipeNames::for_job(temp.path(), "farequote", 1, false);
    ProcessPipes::new("farequote", names, open_timeout, Duration::from_secs(5))
}

#[test]
fn commands_and_input_reach_the_engine() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().display().to_string();
    let engine = write_engine(
        temp.path(),
        &format!(
            "{}\nread -r line <&4\nprintf '%s\\n' \"$line\" > \"{m}/command\"\ncat <&5 > \"{m}/input\"\n",
            OPEN_PIPES,
            m = marker
        ),
    );
    let mut pipes = pipes(&temp, Duration::from_secs(10));
    assert!(matches!(
        pipes.write_command("start\n"),
        Err(ProcessError::NotRunning(PipeState::NotStarted))
    ));

    pipes.start(Command::new(&engine)).unwrap();
    assert_eq!(pipes.state(), PipeState::Running);
    assert!(pipes.pid().is_some());
    assert!(pipes.take_log_reader().is_none());

    pipes
        .write_command(&encode_command("start", &["autodetect"]).unwrap())
        .unwrap();
    let input = pipes.input().unwrap();
    input.write_record(&["time", "airline", "."]).unwrap();
    input.write_record(&["1400000000", "AAL", ""]).unwrap();
    input.flush().unwrap();

    let status = pipes.close().unwrap();
    assert!(status.unwrap().success());
    assert_eq!(pipes.state(), PipeState::Stopped);
    // Closing again is a no-op
    assert!(pipes.close().is_ok());

    assert_eq!(
        std::fs::read_to_string(temp.path().join("command")).unwrap(),
        "start\tautodetect\n"
    );
    let bytes = std::fs::read(temp.path().join("input")).unwrap();
    let mut reader = LengthEncodedReader::new(bytes.as_slice());
    assert_eq!(
        reader.read_record().unwrap().unwrap(),
        vec!["time", "airline", "."]
    );
    assert_eq!(
        reader.read_record().unwrap().unwrap(),
        vec!["1400000000", "AAL", ""]
    );
    assert!(reader.read_record().unwrap().is_none());
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn engine_that_never_opens_its_pipes_times_out() {
    let temp = TempDir::new().unwrap();
    let mut pipes = pipes(&temp, Duration::from_secs(1));
    let mut command = Command::new("sleep");
    command.arg("30");

    let start = Instant::now();
    match pipes.start(command) {
        Err(ProcessError::PipeOpenTimeout { path, timeout }) => {
            assert_eq!(&path, &pipes.names().command);
            assert_eq!(timeout, Duration::from_secs(1));
        }
        other => panic!("expected PipeOpenTimeout, got {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(pipes.state(), PipeState::Stopped);
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn missing_engine_binary_fails_to_spawn() {
    let temp = TempDir::new().unwrap();
    let mut pipes = pipes(&temp, Duration::from_secs(1));

    match pipes.start(Command::new(temp.path().join("no-such-engine"))) {
        Err(ProcessError::Spawn { .. }) => {}
        other => panic!("expected Spawn, got {:?}", other),
    }
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn unbounded_timeouts_start_and_close_the_engine() {
    let temp = TempDir::new().unwrap();
    let engine = write_engine(
        temp.path(),
        &format!("{}\ncat <&5 > /dev/null\n", OPEN_PIPES),
    );
    let names = PipeNames::for_job(temp.path(), "farequote", 1, false);
    let mut pipes = ProcessPipes::new("farequote", names, Duration::MAX, Duration::MAX);

    pipes.start(Command::new(&engine)).unwrap();
    assert_eq!(pipes.state(), PipeState::Running);

    let status = pipes.close().unwrap();
    assert!(status.unwrap().success());
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn engine_exit_ends_an_unbounded_open_wait() {
    let temp = TempDir::new().unwrap();
    let engine = write_engine(temp.path(), "exit 3\n");
    let names = PipeNames::for_job(temp.path(), "farequote", 1, false);
    let mut pipes = ProcessPipes::new("farequote", names, Duration::MAX, Duration::MAX);

    match pipes.start(Command::new(&engine)) {
        Err(ProcessError::ProcessExited { status }) => assert!(status.contains('3')),
        other => panic!("expected ProcessExited, got {:?}", other),
    }
    assert_eq!(pipes.state(), PipeState::Stopped);
    assert!(pipes_left(temp.path()).is_empty());
}
