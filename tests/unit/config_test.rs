//! Unit tests for config module

use adpipe::config::{ChunkingConfig, ChunkingMode};
use adpipe::Config;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn default_config_has_expected_values() {
    let config = Config::default();
    assert_eq!(config.engine.program, "autodetect");
    assert_eq!(config.engine.process_name, "autodetect");
    assert!(config.engine.args.is_empty());
    assert!(config.engine.pipe_dir.is_none());
    assert_eq!(config.engine.pipe_open_timeout_secs, 10);
    assert_eq!(config.engine.shutdown_timeout_secs, 30);
    assert!(config.engine.log_pipe);
    assert_eq!(config.extraction.scroll_size, 1000);
    assert_eq!(config.extraction.chunking.mode, ChunkingMode::Auto);
    assert_eq!(config.extraction.chunking.chunk_size, 100_000);
    assert_eq!(config.extraction.chunking.min_span_ms, 60_000);
    assert_eq!(config.extraction.chunking.time_span_ms, 3_600_000);
    assert_eq!(config.flush_timeout(), Duration::from_secs(30));
    assert!(config.validate().is_ok());
}

#[test]
fn config_serialization_roundtrip() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).unwrap();
    let parsed: Config = toml::from_str(&toml_str).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn partial_config_fills_defaults() {
    let toml_str = r#"
[engine]
program = "/opt/engine/bin/autodetect"

[extraction.chunking]
mode = "manual"
time_span_ms = 600000
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.engine.program, "/opt/engine/bin/autodetect");
    assert_eq!(config.engine.process_name, "autodetect");
    assert_eq!(config.extraction.chunking.mode, ChunkingMode::Manual);
    assert_eq!(config.extraction.chunking.time_span_ms, 600_000);
    assert_eq!(config.extraction.chunking.chunk_size, 100_000);
    assert_eq!(config.extraction.scroll_size, 1000);
}

#[test]
fn chunking_mode_off_parses() {
    let config: Config = toml::from_str("[extraction.chunking]\nmode = \"off\"\n").unwrap();
    assert_eq!(config.extraction.chunking, ChunkingConfig::disabled());
}

#[test]
fn validate_rejects_zero_values() {
    let mut config = Config::default();
    config.extraction.scroll_size = 0;
    assert!(config.validate().unwrap_err().contains("scroll_size"));

    let mut config = Config::default();
    config.extraction.chunking.chunk_size = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.flush.timeout_secs = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.engine.pipe_open_timeout_secs = 0;
    assert!(config.validate().is_err());
}

#[test]
fn load_from_missing_file_returns_defaults() {
    let temp = TempDir::new().unwrap();
    let config = Config::load_from(&temp.path().join("missing.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn save_then_load() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("config.toml");
    let mut config = Config::default();
    config.engine.pipe_dir = Some("/run/adpipe".to_string());
    config.flush.timeout_secs = 5;

    config.save_to(&path).unwrap();
    let loaded = Config::load_from(&path).unwrap();

    assert_eq!(loaded, config);
    assert_eq!(loaded.pipe_directory(), std::path::PathBuf::from("/run/adpipe"));
}

#[test]
fn load_from_rejects_invalid_values() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[extraction]\nscroll_size = 0\n").unwrap();
    let err = Config::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("Invalid config"));
}

#[test]
fn load_from_rejects_malformed_toml() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[engine\nprogram = 1").unwrap();
    assert!(Config::load_from(&path).is_err());
}

#[test]
fn pipe_directory_defaults_to_temp_dir() {
    assert_eq!(Config::default().pipe_directory(), std::env::temp_dir());
}
