//! JSON rows to engine input records.

use super::params::DataCounts;
use super::wire::{LengthEncodedWriter, CONTROL_FIELD_NAME, FLUSH_MESSAGE_PREFIX};
use super::ProcessResult;
use serde_json::Value;
use std::io::{self, BufRead, Write};
use tracing::{debug, warn};

/// Turns newline-delimited JSON rows into length-encoded input records.
///
/// The record layout is fixed by the header: the time field (epoch
/// seconds), then the analysis fields, then the control field. Rows older
/// than the latest row already written are counted and dropped, because
/// the engine only accepts time-ordered input.
#[derive(Debug)]
pub struct DataWriter {
    time_field: String,
    analysis_fields: Vec<String>,
    counts: DataCounts,
    latest_time_ms: Option<i64>,
    header_written: bool,
}

impl DataWriter {
    /// Continue from `counts`, which may carry totals from an earlier run.
    pub fn new(time_field: impl Into<String>, analysis_fields: Vec<String>, counts: DataCounts) -> Self {
        let latest_time_ms = counts.latest_record_time_stamp;
        Self {
            time_field: time_field.into(),
            analysis_fields,
            counts,
            latest_time_ms,
            header_written: false,
        }
    }

    /// Field names in record order.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.num_fields());
        header.push(self.time_field.clone());
        header.extend(self.analysis_fields.iter().cloned());
        header.push(CONTROL_FIELD_NAME.to_string());
        header
    }

    pub fn num_fields(&self) -> usize {
        self.analysis_fields.len() + 2
    }

    pub fn counts(&self) -> &DataCounts {
        &self.counts
    }

    /// Write the header record unless it was already written.
    pub fn write_header<W: Write>(&mut self, out: &mut LengthEncodedWriter<W>) -> io::Result<()> {
        if !self.header_written {
            out.write_record(&self.header())?;
            self.header_written = true;
        }
        Ok(())
    }

    /// Write every row of `rows`, returning how many records were written.
    pub fn write_rows<R: BufRead, W: Write>(
        &mut self,
        rows: R,
        out: &mut LengthEncodedWriter<W>,
    ) -> ProcessResult<u64> {
        self.write_header(out)?;

        let mut written = 0;
        for line in rows.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let row = match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(row)) => row,
                Ok(_) | Err(_) => {
                    warn!(time_field = %self.time_field, "Skipping row that is not a JSON object");
                    self.counts.record_read(line.len() as u64 + 1, 0);
                    continue;
                }
            };
            self.counts.record_read(line.len() as u64 + 1, row.len() as u64);

            let time_ms = match row.get(&self.time_field).and_then(parse_time_ms) {
                Some(t) => t,
                None => {
                    self.counts.invalid_date_count += 1;
                    continue;
                }
            };
            if self.latest_time_ms.map_or(false, |latest| time_ms < latest) {
                self.counts.out_of_order_time_stamp_count += 1;
                continue;
            }

            let mut record = Vec::with_capacity(self.num_fields());
            record.push(time_ms.div_euclid(1000).to_string());
            let mut missing = 0;
            for field in &self.analysis_fields {
                match row.get(field).map(field_value) {
                    Some(Some(value)) => record.push(value),
                    _ => {
                        missing += 1;
                        record.push(String::new());
                    }
                }
            }
            record.push(String::new());

            out.write_record(&record)?;
            self.latest_time_ms = Some(time_ms);
            self.counts
                .record_processed(time_ms, self.analysis_fields.len() as u64 + 1, missing);
            written += 1;
        }

        out.flush()?;
        debug!(written, "Rows written to engine");
        Ok(written)
    }

    /// Write a flush request carrying `id`.
    pub fn write_flush<W: Write>(&mut self, id: &str, out: &mut LengthEncodedWriter<W>) -> io::Result<()> {
        self.write_header(out)?;
        out.write_control(self.num_fields(), &format!("{}{}", FLUSH_MESSAGE_PREFIX, id))?;
        out.flush()
    }
}

/// Epoch millis from a number or a numeric string.
fn parse_time_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Textual field value; `None` for null.
fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
