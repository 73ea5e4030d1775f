//! CLI definitions for adpipe
//!
//! This module contains the clap CLI structure definitions, separated from main.rs
//! so the command handlers can share them.

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Build clap styles for consistent CLI appearance.
pub fn build_cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Green.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::White.on_default())
        .valid(AnsiColor::White.on_default())
        .invalid(AnsiColor::Red.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
}

#[derive(Parser)]
#[command(name = "adpipe")]
#[command(about = "[ adpipe ] - feed time-series data to an anomaly-detection engine over named pipes")]
#[command(
    long_about = "adpipe - drive a streaming anomaly-detection engine over named pipes.

adpipe pulls records for a time range in bounded chunks, writes them to an
engine process through its input pipe, persists the state and results the
engine writes back, and waits for flush acknowledgements.

QUICK START:
    adpipe chunks --start 0 --end 1000000 --earliest 0 --latest 1000000 --count 1000000
    adpipe run farequote --data data.ndjson --time-field time --fields airline,responsetime
    adpipe config show

Set RUST_LOG (e.g. RUST_LOG=adpipe=debug) to change log verbosity."
)]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.config/adpipe/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the chunk plan for a time range
    #[command(long_about = "Print the chunks a time range is split into.

The data summary (earliest and latest record time, record count) normally
comes from a summary query; here it is given on the command line. Times are
epoch milliseconds and chunks are half-open.

EXAMPLES:
    adpipe chunks --start 0 --end 1000000 --earliest 0 --latest 1000000 --count 1000000
    adpipe chunks --start 0 --end 86400000 --earliest 0 --latest 86400000 --count 500 --span 3600000")]
    Chunks {
        /// Range start (epoch millis, inclusive)
        #[arg(long)]
        start: Option<i64>,
        /// Range end (epoch millis, exclusive)
        #[arg(long)]
        end: Option<i64>,
        /// Earliest record time in the range
        #[arg(long)]
        earliest: i64,
        /// Latest record time in the range
        #[arg(long)]
        latest: i64,
        /// Number of records in the range
        #[arg(long)]
        count: u64,
        /// Target records per chunk (default: from config)
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Fixed chunk span in millis instead of the estimate
        #[arg(long)]
        span: Option<i64>,
    },

    /// Stream an NDJSON file through the engine
    #[command(long_about = "Open a job, stream an NDJSON file through the chunked extractor
into the engine, flush, and close the job.

Each line of the data file is one JSON object carrying the time field in
epoch milliseconds. The engine executable and its pipe settings come from
the [engine] config section. Ctrl-C stops extraction after the chunk in
flight.

EXAMPLES:
    adpipe run farequote --data farequote.ndjson --time-field time --fields airline,responsetime
    adpipe run farequote --data farequote.ndjson --time-field time --fields responsetime --start 1400000000000")]
    Run {
        /// Job identifier
        job_id: String,
        /// NDJSON data file
        #[arg(long, value_name = "FILE")]
        data: PathBuf,
        /// Field holding the record time (epoch millis)
        #[arg(long)]
        time_field: String,
        /// Comma-separated fields sent to the engine
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Range start (epoch millis, inclusive)
        #[arg(long)]
        start: Option<i64>,
        /// Range end (epoch millis, exclusive)
        #[arg(long)]
        end: Option<i64>,
        /// Extra arguments for the engine's start command
        #[arg(last = true)]
        process_args: Vec<String>,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}
