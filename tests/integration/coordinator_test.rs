//! Integration tests for JobProcessCoordinator against a scripted engine

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use adpipe::{AutodetectParams, FsPersister, JobProcessCoordinator, JobSpec, ProcessError};

use crate::helpers::{engine_config, expected_input, pipes_left, write_engine, OPEN_PIPES};

const ROWS: &str = r#"{"time":1400000000000,"airline":"AAL","responsetime":132.2}
{"time":1400000060000,"airline":"JZA","responsetime":990.4}
"#;

fn spec() -> JobSpec {
    JobSpec::new(
        "farequote",
        "time",
        vec!["airline".to_string(), "responsetime".to_string()],
    )
}

fn coordinator(
    temp: &TempDir,
    body: &str,
    shutdown_timeout_secs: u64,
) -> (JobProcessCoordinator, Arc<FsPersister>) {
    let engine = write_engine(temp.path(), body);
    let mut config = engine_config(temp.path(), &engine);
    config.engine.shutdown_timeout_secs = shutdown_timeout_secs;
    let persister = Arc::new(FsPersister::new(config.persistence_directory()));
    (JobProcessCoordinator::new(config, persister.clone()), persister)
}

/// An engine that opens its pipes and then never reads or answers.
fn silent_engine() -> String {
    format!("{}\nexec sleep 30\n", OPEN_PIPES)
}

// ============================================
// Full Job Tests
// ============================================

#[test]
fn job_runs_end_to_end() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().display().to_string();
    let expected = expected_input("farequote", "time", &["airline", "responsetime"], ROWS);
    let body = format!(
        r#"{open}
printf '%s\n' "$@" > "{m}/args"
read -r start <&4
printf '%s\n' "$start" > "{m}/start"
printf '{{"level":"INFO","message":"engine ready"}}\n' >&3
printf 'A\000B\000' >&7
head -c {n} <&5 > "{m}/input.bin"
printf '[{{"bucket":{{"timestamp":1}}}},{{"modelSizeStats":{{"modelBytes":1024}}}},{{"flush":"1"}}' >&6
cat <&5 > /dev/null
printf ']' >&6
"#,
        open = OPEN_PIPES,
        m = marker,
        n = expected.len()
    );
    let (coordinator, persister) = coordinator(&temp, &body, 5);

    coordinator
        .open_job(spec(), &AutodetectParams::builder("farequote").build())
        .unwrap();
    assert!(coordinator.is_running("farequote"));

    assert_eq!(coordinator.write_data("farequote", ROWS.as_bytes()).unwrap(), 2);
    assert!(coordinator
        .flush_job("farequote", Some(Duration::from_secs(10)))
        .unwrap());

    assert_eq!(coordinator.model_size_stats("farequote").unwrap().model_bytes, 1024);
    let params = coordinator.autodetect_params("farequote").unwrap();
    assert_eq!(params.data_counts().processed_record_count, 2);
    assert_eq!(
        params.data_counts().latest_record_time_stamp,
        Some(1_400_000_060_000)
    );

    let status = coordinator.close_job("farequote").unwrap();
    assert!(status.unwrap().success());
    assert!(!coordinator.is_running("farequote"));

    assert_eq!(std::fs::read(temp.path().join("input.bin")).unwrap(), expected);
    assert_eq!(
        std::fs::read_to_string(temp.path().join("start")).unwrap(),
        "start\tautodetect\n"
    );
    let args = std::fs::read_to_string(temp.path().join("args")).unwrap();
    assert!(args.lines().any(|arg| arg == "--jobid=farequote"));
    assert!(args.lines().any(|arg| arg == "--lengthEncodedInput"));
    assert!(args.lines().any(|arg| arg.starts_with("--logPipe=")));

    assert_eq!(persister.state_records("farequote").unwrap().len(), 2);
    let results = std::fs::read_to_string(persister.results_path("farequote")).unwrap();
    assert_eq!(results.lines().count(), 2);
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn unacknowledged_flush_times_out_and_engine_is_killed() {
    let temp = TempDir::new().unwrap();
    let (coordinator, _) = coordinator(&temp, &silent_engine(), 1);

    coordinator
        .open_job(spec(), &AutodetectParams::builder("farequote").build())
        .unwrap();
    assert!(!coordinator
        .flush_job("farequote", Some(Duration::from_millis(200)))
        .unwrap());

    let start = Instant::now();
    let status = coordinator.close_job("farequote").unwrap();
    assert!(!status.unwrap().success());
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn second_open_of_a_running_job_fails() {
    let temp = TempDir::new().unwrap();
    let (coordinator, _) = coordinator(&temp, &silent_engine(), 1);
    let params = AutodetectParams::builder("farequote").build();

    coordinator.open_job(spec(), &params).unwrap();
    match coordinator.open_job(spec(), &params) {
        Err(ProcessError::JobAlreadyRunning(id)) => assert_eq!(id, "farequote"),
        other => panic!("expected JobAlreadyRunning, got {:?}", other.map(|_| ())),
    }
    assert_eq!(coordinator.running_jobs(), vec!["farequote".to_string()]);

    coordinator.close_all();
    assert!(coordinator.running_jobs().is_empty());
}

// ============================================
// Failure Tests
// ============================================

#[test]
fn engine_that_exits_during_startup_is_reported() {
    let temp = TempDir::new().unwrap();
    let (coordinator, _) = coordinator(&temp, "exit 3", 1);

    match coordinator.open_job(spec(), &AutodetectParams::builder("farequote").build()) {
        Err(ProcessError::ProcessExited { .. }) => {}
        other => panic!("expected ProcessExited, got {:?}", other),
    }
    assert!(!coordinator.is_running("farequote"));
    assert!(pipes_left(temp.path()).is_empty());
}

#[test]
fn dead_results_reader_tears_the_job_down() {
    let temp = TempDir::new().unwrap();
    let body = format!("{}\nexec 6>&- 7>&-\nexec sleep 30\n", OPEN_PIPES);
    let (coordinator, _) = coordinator(&temp, &body, 1);

    coordinator
        .open_job(spec(), &AutodetectParams::builder("farequote").build())
        .unwrap();

    let row = r#"{"time":1400000000000,"airline":"AAL","responsetime":1}"#;
    let deadline = Instant::now() + Duration::from_secs(10);
    let reader = loop {
        match coordinator.write_data("farequote", row.as_bytes()) {
            Ok(_) => {
                assert!(Instant::now() < deadline, "reader death never noticed");
                thread::sleep(Duration::from_millis(20));
            }
            Err(ProcessError::ReaderThreadDied { reader, .. }) => break reader,
            Err(e) => panic!("unexpected error: {}", e),
        }
    };

    assert!(reader == "results" || reader == "state");
    assert!(!coordinator.is_running("farequote"));
    assert!(matches!(
        coordinator.write_data("farequote", row.as_bytes()),
        Err(ProcessError::JobNotRunning(_))
    ));
    assert!(pipes_left(temp.path()).is_empty());
}
