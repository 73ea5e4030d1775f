//! Test helper utilities

#![allow(dead_code)]

use serde_json::{json, Value};

use adpipe::extractor::{DataStream, ExtractorResult};
use adpipe::DataExtractor;

/// `count` documents spaced `step` millis apart starting at `start`, with a
/// cycling `airline` and a `responsetime` equal to the index.
pub fn documents(start: i64, step: i64, count: usize) -> Vec<Value> {
    const AIRLINES: [&str; 3] = ["AAL", "JZA", "KLM"];
    (0..count)
        .map(|i| {
            json!({
                "time": start + step * i as i64,
                "airline": AIRLINES[i % AIRLINES.len()],
                "responsetime": i as f64,
            })
        })
        .collect()
}

/// Render documents as NDJSON.
pub fn to_ndjson(documents: &[Value]) -> String {
    documents
        .iter()
        .map(|doc| format!("{}\n", doc))
        .collect()
}

/// Read a data stream back into its JSON rows.
pub fn read_rows(stream: DataStream) -> Vec<Value> {
    let mut text = String::new();
    let mut stream = stream;
    std::io::Read::read_to_string(&mut stream, &mut text).expect("stream is UTF-8");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("row is JSON"))
        .collect()
}

/// Drain an extractor, returning the rows of every non-empty chunk.
pub fn drain(extractor: &mut dyn DataExtractor) -> ExtractorResult<Vec<Vec<Value>>> {
    let mut chunks = Vec::new();
    while extractor.has_next() {
        if let Some(stream) = extractor.next()? {
            chunks.push(read_rows(stream));
        }
    }
    Ok(chunks)
}
