use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tender_core::{ErrorEntry, ErrorKind, RunMetadata, TenderType, WriteOutcome};
use tracing::debug;

/// Everything the pipeline reports about a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    PageVisited,
    RecordParsed { tender_type: TenderType },
    RecordWritten(WriteOutcome),
    /// One tender dropped; counts toward `failures`.
    Failure { kind: ErrorKind, message: String },
    /// A run-level error (listing page, output flush). Logged in
    /// `error_summary` only, since `failures` counts tenders.
    RunError { kind: ErrorKind, message: String },
    OutputWritten { location: String },
}

/// Sole owner of a run's [`RunMetadata`]. Other components only send events.
#[derive(Debug)]
pub struct RunRecorder {
    run_id: String,
    scraper_version: String,
    config: JsonValue,
    start_time: DateTime<Utc>,
    pages_visited: AtomicU64,
    tenders_parsed: AtomicU64,
    tenders_saved: AtomicU64,
    failures: AtomicU64,
    deduped: AtomicU64,
    types: Mutex<BTreeMap<TenderType, u64>>,
    errors: Mutex<BTreeMap<ErrorKind, Vec<ErrorEntry>>>,
    output_file: Mutex<Option<String>>,
}

impl RunRecorder {
    pub fn new(
        run_id: impl Into<String>,
        scraper_version: impl Into<String>,
        config: JsonValue,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scraper_version: scraper_version.into(),
            config,
            start_time,
            pages_visited: AtomicU64::new(0),
            tenders_parsed: AtomicU64::new(0),
            tenders_saved: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            deduped: AtomicU64::new(0),
            types: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
            output_file: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(&self, event: RunEvent) {
        debug!(run_id = %self.run_id, ?event, "run event");
        match event {
            RunEvent::PageVisited => {
                self.pages_visited.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::RecordParsed { tender_type } => {
                self.tenders_parsed.fetch_add(1, Ordering::Relaxed);
                let mut types = self.types.lock().unwrap_or_else(PoisonError::into_inner);
                *types.entry(tender_type).or_default() += 1;
            }
            RunEvent::RecordWritten(WriteOutcome::Inserted | WriteOutcome::Updated) => {
                self.tenders_saved.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::RecordWritten(WriteOutcome::Skipped) => {
                self.deduped.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::Failure { kind, message } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.log_error(kind, message);
            }
            RunEvent::RunError { kind, message } => self.log_error(kind, message),
            RunEvent::OutputWritten { location } => {
                *self.output_file.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
            }
        }
    }

    fn log_error(&self, kind: ErrorKind, message: String) {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        errors.entry(kind).or_default().push(ErrorEntry {
            message,
            timestamp: Utc::now(),
        });
    }

    /// Current counters; `end_time` and `duration_seconds` stay empty.
    pub fn snapshot(&self) -> RunMetadata {
        let mut metadata = RunMetadata::new(
            self.run_id.clone(),
            self.scraper_version.clone(),
            self.config.clone(),
            self.start_time,
        );
        metadata.pages_visited = self.pages_visited.load(Ordering::Relaxed);
        metadata.tenders_parsed = self.tenders_parsed.load(Ordering::Relaxed);
        metadata.tenders_saved = self.tenders_saved.load(Ordering::Relaxed);
        metadata.failures = self.failures.load(Ordering::Relaxed);
        metadata.deduped_count = self.deduped.load(Ordering::Relaxed);
        metadata.tender_types_processed = self
            .types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        metadata.error_summary = self
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        metadata.output_file = self
            .output_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        metadata
    }

    pub fn finalize(&self) -> RunMetadata {
        self.finalize_at(Utc::now())
    }

    pub fn finalize_at(&self, end_time: DateTime<Utc>) -> RunMetadata {
        let mut metadata = self.snapshot();
        let elapsed = end_time.signed_duration_since(self.start_time);
        metadata.end_time = Some(end_time);
        metadata.duration_seconds = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
        metadata
    }
}
