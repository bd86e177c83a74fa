//! Run orchestration: configuration, work queue, dedup writes and run metadata.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tender_adapters::NprocureListingCrawler;
use tender_storage::store::{load_json_snapshot, JSON_SNAPSHOT};
use tender_storage::{
    ArtifactStore, FileFormat, FileStore, HttpClientConfig, HttpFetcher, JsonMetadataStore,
    MemoryStore, MetadataSink, TenderStore,
};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod parquet;
pub mod pipeline;
pub mod postgres;
pub mod recorder;
pub mod summary;
pub mod writer;

pub use config::{ConfigError, OutputFormat, SyncConfig};
pub use parquet::{ParquetManifest, ParquetManifestFile, ParquetStore};
pub use pipeline::{Pipeline, PipelineSettings, RecordError, RunReport};
pub use postgres::PgStore;
pub use recorder::{RunEvent, RunRecorder};
pub use summary::{render_run_list, render_run_summary};
pub use writer::{DedupWriter, WriteError};

pub const CRATE_NAME: &str = "tender-sync";

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Sinks for one run: where records go, and where the run metadata goes.
pub struct RunSinks {
    pub store: Arc<dyn TenderStore>,
    pub metadata: Vec<Arc<dyn MetadataSink>>,
}

/// Dry runs get an in-memory store seeded from the JSON snapshot, so dedup
/// counters match what a real run would report.
pub async fn open_sinks(config: &SyncConfig, run_id: &str) -> Result<RunSinks> {
    let json_metadata: Arc<dyn MetadataSink> =
        Arc::new(JsonMetadataStore::new(config.metadata_dir.clone()));

    if config.dry_run {
        let existing = load_json_snapshot(&config.output_dir.join(JSON_SNAPSHOT))
            .await
            .context("loading snapshot for dry run")?;
        info!(existing = existing.len(), "dry run: records will not be persisted");
        return Ok(RunSinks {
            store: Arc::new(MemoryStore::with_records(existing)),
            metadata: vec![json_metadata],
        });
    }

    let sinks = match config.output_format {
        OutputFormat::Json | OutputFormat::Ndjson => {
            let format = if config.output_format == OutputFormat::Json {
                FileFormat::Json
            } else {
                FileFormat::Ndjson
            };
            let store = FileStore::open(format, config.output_dir.clone(), run_id)
                .await
                .with_context(|| format!("opening {} store", config.output_format))?;
            RunSinks {
                store: Arc::new(store),
                metadata: vec![json_metadata],
            }
        }
        OutputFormat::Parquet => {
            let store = ParquetStore::open(&config.output_dir, run_id)
                .await
                .context("opening parquet store")?;
            RunSinks {
                store: Arc::new(store),
                metadata: vec![json_metadata],
            }
        }
        OutputFormat::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::MissingDatabaseUrl)?;
            let pg = PgStore::connect(url).await?;
            pg.migrate().await?;
            let pg = Arc::new(pg);
            let pg_metadata: Arc<dyn MetadataSink> = pg.clone();
            RunSinks {
                store: pg,
                metadata: vec![json_metadata, pg_metadata],
            }
        }
    };
    Ok(sinks)
}

/// Validate, wire the live site fetcher and crawler, and run to completion.
pub async fn run_from_config(
    config: SyncConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport> {
    config.validate()?;
    let run_id = new_run_id();
    let base_url = config.base_url()?;

    let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: std::time::Duration::from_secs(config.timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.concurrency,
    })?);
    let crawler = Arc::new(NprocureListingCrawler::new(
        fetcher.clone(),
        base_url,
        config.backoff_policy(),
    ));
    let sinks = open_sinks(&config, &run_id).await?;
    let recorder = Arc::new(RunRecorder::new(
        run_id.clone(),
        config.scraper_version.clone(),
        config.to_json(),
        Utc::now(),
    ));

    info!(
        run_id = %run_id,
        format = %config.output_format,
        dry_run = config.dry_run,
        filters = config.filters.has_filters(),
        "starting tender run"
    );
    let mut pipeline = Pipeline::new(
        PipelineSettings::from_config(&config),
        recorder,
        fetcher,
        crawler,
        sinks.store,
    );
    if config.save_raw_pages {
        pipeline = pipeline.with_artifacts(ArtifactStore::new(config.artifacts_dir.clone()));
    }
    for sink in sinks.metadata {
        pipeline = pipeline.with_metadata_sink(sink);
    }
    pipeline.run(config.filters.clone(), shutdown).await
}
