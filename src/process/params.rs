//! Prior job state used to prime a (re)started engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Running totals of the data sent to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataCounts {
    pub job_id: String,
    pub processed_record_count: u64,
    pub processed_field_count: u64,
    pub input_bytes: u64,
    pub input_record_count: u64,
    pub input_field_count: u64,
    pub invalid_date_count: u64,
    pub missing_field_count: u64,
    pub out_of_order_time_stamp_count: u64,
    /// Epoch millis of the earliest record sent
    pub earliest_record_time_stamp: Option<i64>,
    /// Epoch millis of the latest record sent
    pub latest_record_time_stamp: Option<i64>,
}

impl DataCounts {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    /// Account for one record accepted and written to the engine.
    pub fn record_processed(&mut self, timestamp_ms: i64, fields: u64, missing: u64) {
        self.processed_record_count += 1;
        self.processed_field_count += fields.saturating_sub(missing);
        self.missing_field_count += missing;
        if self.earliest_record_time_stamp.map_or(true, |t| timestamp_ms < t) {
            self.earliest_record_time_stamp = Some(timestamp_ms);
        }
        if self.latest_record_time_stamp.map_or(true, |t| timestamp_ms > t) {
            self.latest_record_time_stamp = Some(timestamp_ms);
        }
    }

    /// Account for one record read from the input, written or not.
    pub fn record_read(&mut self, bytes: u64, fields: u64) {
        self.input_record_count += 1;
        self.input_bytes += bytes;
        self.input_field_count += fields;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    #[default]
    Ok,
    SoftLimit,
    HardLimit,
}

/// Engine model memory usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSizeStats {
    pub job_id: String,
    pub model_bytes: u64,
    pub total_by_field_count: u64,
    pub total_over_field_count: u64,
    pub total_partition_field_count: u64,
    pub bucket_allocation_failures_count: u64,
    pub memory_status: MemoryStatus,
    pub log_time: Option<i64>,
}

impl ModelSizeStats {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }
}

/// Reference to a persisted model snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub job_id: String,
    pub snapshot_id: String,
    pub timestamp: Option<i64>,
    pub description: Option<String>,
    pub snapshot_doc_count: u64,
    pub latest_record_time_stamp: Option<i64>,
    pub latest_result_time_stamp: Option<i64>,
}

/// Normalisation quantiles, opaque to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Quantiles {
    pub job_id: String,
    pub timestamp: Option<i64>,
    pub quantile_state: String,
}

/// A named list of items referenced by detector rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MlFilter {
    pub id: String,
    pub items: BTreeSet<String>,
}

impl MlFilter {
    pub fn new<I, S>(id: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Config line understood by the engine: `filter.<id> = ["a", "b"]`.
    pub fn to_config_line(&self) -> String {
        let items: Vec<&String> = self.items.iter().collect();
        // Serializing a Vec<&String> cannot fail
        let list = serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string());
        format!("filter.{} = {}", self.id, list)
    }
}

/// Everything persisted about a job that a fresh engine needs.
///
/// Data counts and model size stats are always present; a job that never
/// ran starts from empty ones. Filters are kept sorted so equality and
/// hashing do not depend on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AutodetectParams {
    data_counts: DataCounts,
    model_size_stats: ModelSizeStats,
    model_snapshot: Option<ModelSnapshot>,
    quantiles: Option<Quantiles>,
    filters: BTreeSet<MlFilter>,
}

impl AutodetectParams {
    pub fn builder(job_id: impl Into<String>) -> AutodetectParamsBuilder {
        AutodetectParamsBuilder::new(job_id)
    }

    pub fn data_counts(&self) -> &DataCounts {
        &self.data_counts
    }

    pub fn model_size_stats(&self) -> &ModelSizeStats {
        &self.model_size_stats
    }

    pub fn model_snapshot(&self) -> Option<&ModelSnapshot> {
        self.model_snapshot.as_ref()
    }

    pub fn quantiles(&self) -> Option<&Quantiles> {
        self.quantiles.as_ref()
    }

    pub fn filters(&self) -> &BTreeSet<MlFilter> {
        &self.filters
    }
}

pub struct AutodetectParamsBuilder {
    data_counts: DataCounts,
    model_size_stats: ModelSizeStats,
    model_snapshot: Option<ModelSnapshot>,
    quantiles: Option<Quantiles>,
    filters: BTreeSet<MlFilter>,
}

impl AutodetectParamsBuilder {
    pub fn new(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self {
            data_counts: DataCounts::new(job_id.clone()),
            model_size_stats: ModelSizeStats::new(job_id),
            model_snapshot: None,
            quantiles: None,
            filters: BTreeSet::new(),
        }
    }

    pub fn data_counts(mut self, data_counts: DataCounts) -> Self {
        self.data_counts = data_counts;
        self
    }

    pub fn model_size_stats(mut self, model_size_stats: ModelSizeStats) -> Self {
        self.model_size_stats = model_size_stats;
        self
    }

    pub fn model_snapshot(mut self, model_snapshot: Option<ModelSnapshot>) -> Self {
        self.model_snapshot = model_snapshot;
        self
    }

    pub fn quantiles(mut self, quantiles: Option<Quantiles>) -> Self {
        self.quantiles = quantiles;
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = MlFilter>) -> Self {
        self.filters = filters.into_iter().collect();
        self
    }

    pub fn build(self) -> AutodetectParams {
        AutodetectParams {
            data_counts: self.data_counts,
            model_size_stats: self.model_size_stats,
            model_snapshot: self.model_snapshot,
            quantiles: self.quantiles,
            filters: self.filters,
        }
    }
}
