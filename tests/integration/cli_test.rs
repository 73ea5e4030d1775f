//! Integration tests for the adpipe binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn adpipe() -> Command {
    Command::cargo_bin("adpipe").unwrap()
}

#[test]
fn help_lists_subcommands() {
    adpipe()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn chunks_prints_the_plan() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");

    adpipe()
        .args(["--config", config.to_str().unwrap()])
        .args(["chunks", "--start", "0", "--end", "1000000"])
        .args(["--earliest", "0", "--latest", "1000000", "--count", "1000000"])
        .args(["--chunk-size", "100000"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("10 chunk(s), span 100s\n"))
        .stdout(predicate::str::contains("[900000, 1000000)"))
        .stdout(predicate::str::contains("1970-01-01T00:00:00.000Z"));
}

#[test]
fn chunks_rejects_inverted_range() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");

    adpipe()
        .args(["--config", config.to_str().unwrap()])
        .args(["chunks", "--start", "10", "--end", "5"])
        .args(["--earliest", "0", "--latest", "10", "--count", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be after"));
}

#[test]
fn config_path_echoes_explicit_path() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("custom.toml");

    adpipe()
        .args(["config", "path", "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(format!("{}\n", config.display()));
}

#[test]
fn config_show_reflects_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    fs::write(&config, "[engine]\nprogram = \"/opt/engine/autodetect\"\n").unwrap();

    adpipe()
        .args(["--config", config.to_str().unwrap(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("program = \"/opt/engine/autodetect\""))
        .stdout(predicate::str::contains("[flush]"));
}

#[test]
fn invalid_config_is_reported() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    fs::write(&config, "[flush]\ntimeout_secs = 0\n").unwrap();

    adpipe()
        .args(["--config", config.to_str().unwrap(), "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timeout_secs"));
}

#[cfg(unix)]
#[test]
fn run_streams_a_file_through_the_engine() {
    use crate::helpers::{expected_input, write_engine, OPEN_PIPES};

    let temp = TempDir::new().unwrap();
    let rows = "{\"time\":1400000000000,\"airline\":\"AAL\",\"responsetime\":132.2}\n\
                {\"time\":1400000060000,\"airline\":\"JZA\",\"responsetime\":990.4}\n\
                {\"time\":1400000120000,\"airline\":\"KLM\"}\n";
    let data = temp.path().join("farequote.ndjson");
    fs::write(&data, rows).unwrap();

    let expected = expected_input("farequote", "time", &["airline", "responsetime"], rows);
    let engine = write_engine(
        temp.path(),
        &format!(
            "{}\nread -r start <&4\nhead -c {} <&5 > /dev/null\nprintf '[{{\"flush\":\"1\"}}' >&6\ncat <&5 > /dev/null\nprintf ']' >&6\n",
            OPEN_PIPES,
            expected.len()
        ),
    );
    let config = temp.path().join("config.toml");
    fs::write(
        &config,
        format!(
            "[engine]\nprogram = {:?}\npipe_dir = {:?}\n\n[persistence]\ndirectory = {:?}\n",
            engine.display().to_string(),
            temp.path().display().to_string(),
            temp.path().join("data").display().to_string()
        ),
    )
    .unwrap();

    adpipe()
        .args(["--config", config.to_str().unwrap()])
        .args(["run", "farequote", "--data", data.to_str().unwrap()])
        .args(["--time-field", "time", "--fields", "airline,responsetime"])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("3 written, 0 out of order"))
        .stdout(predicate::str::contains("8 processed, 1 missing"))
        .stdout(predicate::str::contains("Flush:       acknowledged"));
}
