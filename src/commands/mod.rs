//! Command handlers for the adpipe CLI.
//!
//! Each submodule handles a specific CLI command or command group.
//! The main dispatch logic remains in main.rs.

pub mod chunks;
pub mod config;
pub mod run;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::path::Path;

use adpipe::Config;

/// Load the configuration from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Render epoch millis as an RFC 3339 UTC timestamp, falling back to the raw
/// number when it is out of chrono's range.
pub fn format_millis(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(time) => time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

/// Render a span in millis using the largest whole unit.
pub fn format_span(millis: i64) -> String {
    const UNITS: [(i64, &str); 4] = [(86_400_000, "d"), (3_600_000, "h"), (60_000, "m"), (1_000, "s")];
    for (size, unit) in UNITS {
        if millis >= size && millis % size == 0 {
            return format!("{}{}", millis / size, unit);
        }
    }
    format!("{}ms", millis)
}
