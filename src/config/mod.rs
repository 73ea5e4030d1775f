//! Configuration management for adpipe

mod io;
mod types;

pub use types::*;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

impl Config {
    /// Get the config file path (~/.config/adpipe/config.toml)
    pub fn config_path() -> Result<PathBuf> {
        io::config_path()
    }

    /// Get the config directory path (~/.config/adpipe)
    pub fn config_dir() -> Result<PathBuf> {
        io::config_dir()
    }

    /// Load configuration from file, or return defaults if not found
    pub fn load() -> Result<Self> {
        io::load()
    }

    /// Load configuration from an explicit file, or return defaults if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        io::load_from(path)
    }

    /// Save configuration to the given file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        io::save(self, path)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.extraction.scroll_size == 0 {
            return Err("extraction.scroll_size must be greater than 0".to_string());
        }
        let chunking = &self.extraction.chunking;
        if chunking.chunk_size == 0 {
            return Err("extraction.chunking.chunk_size must be greater than 0".to_string());
        }
        if chunking.min_span_ms <= 0 {
            return Err("extraction.chunking.min_span_ms must be greater than 0".to_string());
        }
        if chunking.time_span_ms <= 0 {
            return Err("extraction.chunking.time_span_ms must be greater than 0".to_string());
        }
        if self.engine.pipe_open_timeout_secs == 0 {
            return Err("engine.pipe_open_timeout_secs must be greater than 0".to_string());
        }
        if self.engine.shutdown_timeout_secs == 0 {
            return Err("engine.shutdown_timeout_secs must be greater than 0".to_string());
        }
        if self.flush.timeout_secs == 0 {
            return Err("flush.timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Directory the named pipes live in.
    pub fn pipe_directory(&self) -> PathBuf {
        match &self.engine.pipe_dir {
            Some(dir) => expand_home(dir),
            None => std::env::temp_dir(),
        }
    }

    /// Expand ~ in the persistence directory path
    pub fn persistence_directory(&self) -> PathBuf {
        expand_home(&self.persistence.directory)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush.timeout_secs)
    }
}

fn expand_home(dir: &str) -> PathBuf {
    if let Some(stripped) = dir.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(dir)
}
