//! Configuration type definitions and defaults

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Engine process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable spawned for each job
    #[serde(default = "default_program")]
    pub program: String,
    /// Process name sent in the `start` command
    #[serde(default = "default_process_name")]
    pub process_name: String,
    /// Extra arguments appended to the spawned command line
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory the named pipes are created in (system temp dir when unset)
    #[serde(default)]
    pub pipe_dir: Option<String>,
    /// How long each pipe open may block before startup fails
    #[serde(default = "default_pipe_open_timeout")]
    pub pipe_open_timeout_secs: u64,
    /// Grace period for the engine to exit before it is killed
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Whether the engine writes its log messages to a dedicated pipe
    #[serde(default = "default_log_pipe")]
    pub log_pipe: bool,
}

pub fn default_program() -> String {
    "autodetect".to_string()
}

pub fn default_process_name() -> String {
    "autodetect".to_string()
}

pub fn default_pipe_open_timeout() -> u64 {
    10
}

pub fn default_shutdown_timeout() -> u64 {
    30
}

pub fn default_log_pipe() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            process_name: default_process_name(),
            args: Vec::new(),
            pipe_dir: None,
            pipe_open_timeout_secs: default_pipe_open_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            log_pipe: default_log_pipe(),
        }
    }
}

/// Extraction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Page size for scroll queries
    #[serde(default = "default_scroll_size")]
    pub scroll_size: usize,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

pub fn default_scroll_size() -> usize {
    1000
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            scroll_size: default_scroll_size(),
            chunking: ChunkingConfig::default(),
        }
    }
}

/// How an extraction window is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMode {
    /// Size chunks from the density observed by a summary query
    Auto,
    /// Fixed `time_span_ms` chunks
    Manual,
    /// One chunk covering the whole window, no summary
    Off,
}

/// Chunking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunking_mode")]
    pub mode: ChunkingMode,
    /// Target number of records per chunk (auto mode)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Lower bound for an auto-sized chunk span
    #[serde(default = "default_min_span_ms")]
    pub min_span_ms: i64,
    /// Chunk span used in manual mode
    #[serde(default = "default_time_span_ms")]
    pub time_span_ms: i64,
}

pub fn default_chunking_mode() -> ChunkingMode {
    ChunkingMode::Auto
}

pub fn default_chunk_size() -> u64 {
    100_000
}

pub fn default_min_span_ms() -> i64 {
    60_000
}

pub fn default_time_span_ms() -> i64 {
    3_600_000
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            mode: default_chunking_mode(),
            chunk_size: default_chunk_size(),
            min_span_ms: default_min_span_ms(),
            time_span_ms: default_time_span_ms(),
        }
    }
}

impl ChunkingConfig {
    /// Chunking switched off: one chunk for the whole window.
    pub fn disabled() -> Self {
        Self {
            mode: ChunkingMode::Off,
            ..Self::default()
        }
    }

    /// Fixed-span chunking.
    pub fn manual(time_span_ms: i64) -> Self {
        Self {
            mode: ChunkingMode::Manual,
            time_span_ms,
            ..Self::default()
        }
    }
}

/// Flush configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_timeout")]
    pub timeout_secs: u64,
}

pub fn default_flush_timeout() -> u64 {
    30
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_flush_timeout(),
        }
    }
}

/// Filesystem persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_directory")]
    pub directory: String,
}

pub fn default_persistence_directory() -> String {
    "~/.local/share/adpipe".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: default_persistence_directory(),
        }
    }
}
