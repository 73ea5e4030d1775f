//! Run command handler

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use adpipe::extractor::SearchBackend;
use adpipe::process::DataCounts;
use adpipe::{
    AutodetectParams, ChunkedDataExtractor, Config, DataExtractor, ExtractionContext, FsPersister,
    InMemorySearchBackend, JobProcessCoordinator, JobSpec, SearchExtractorFactory, TimeRange,
};

use super::format_millis;

pub struct RunArgs {
    pub job_id: String,
    pub data: PathBuf,
    pub time_field: String,
    pub fields: Vec<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub process_args: Vec<String>,
}

/// Open the job, stream the data file through it, flush and close.
#[cfg(not(tarpaulin_include))]
pub fn handle(config: Config, args: RunArgs) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow!("Invalid config: {}", e))?;
    if args.fields.is_empty() {
        return Err(anyhow!("--fields needs at least one field"));
    }

    let file = File::open(&args.data)
        .with_context(|| format!("Failed to open data file: {:?}", args.data))?;
    let backend = InMemorySearchBackend::from_ndjson(BufReader::new(file), args.time_field.as_str())
        .with_context(|| format!("Failed to load data file: {:?}", args.data))?;
    info!(documents = backend.len(), file = %args.data.display(), "Loaded data");

    let range = TimeRange::new(args.start, args.end);
    let context = ExtractionContext::new(
        args.job_id.as_str(),
        args.time_field.as_str(),
        vec![args.data.display().to_string()],
    )
    .with_scroll_size(config.extraction.scroll_size)
    .with_range(range);
    let backend: Arc<dyn SearchBackend> = Arc::new(backend);
    let factory = Arc::new(SearchExtractorFactory::new(context, backend));
    let mut extractor = ChunkedDataExtractor::new(factory, range, config.extraction.chunking.clone());

    let cancel = extractor.cancel_flag().clone();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .ok(); // Ignore if handler already set

    let persister = Arc::new(FsPersister::new(config.persistence_directory()));
    let coordinator = JobProcessCoordinator::new(config, persister.clone());
    let spec = JobSpec::new(args.job_id.as_str(), args.time_field.as_str(), args.fields)
        .with_process_args(args.process_args);
    coordinator.open_job(spec, &AutodetectParams::builder(args.job_id.as_str()).build())?;

    let job_id = args.job_id.as_str();
    let outcome = coordinator
        .run_extraction(job_id, &mut extractor)
        .and_then(|written| Ok((written, coordinator.flush_job(job_id, None)?)));
    let counts = coordinator.data_counts(job_id);
    coordinator.close_job(job_id)?;

    let (written, flushed) = outcome?;
    println!("{}", summary(job_id, written, flushed, &counts?));
    println!(
        "Persisted:   {} in {}",
        persister.usage_human(job_id),
        persister.job_dir(job_id).display()
    );
    if extractor.is_cancelled() {
        println!("Extraction was cancelled before the end of the range.");
    }
    Ok(())
}

/// Human-readable run summary.
pub fn summary(job_id: &str, written: u64, flushed: bool, counts: &DataCounts) -> String {
    let bound = |t: Option<i64>| t.map(format_millis).unwrap_or_else(|| "-".to_string());
    format!(
        "Job {}\n\
         Records:     {} written, {} out of order, {} without a valid time\n\
         Fields:      {} processed, {} missing\n\
         Time span:   {} .. {}\n\
         Flush:       {}",
        job_id,
        written,
        counts.out_of_order_time_stamp_count,
        counts.invalid_date_count,
        counts.processed_field_count,
        counts.missing_field_count,
        bound(counts.earliest_record_time_stamp),
        bound(counts.latest_record_time_stamp),
        if flushed { "acknowledged" } else { "not acknowledged" }
    )
}
