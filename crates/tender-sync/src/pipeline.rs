//! Work queue and worker pool: stubs in, written records and run metadata out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use tender_adapters::{extract_tender, ExtractError, ExtractOptions, ListingCrawler, StubCursor};
use tender_core::{ErrorKind, RunMetadata, TenderStub};
use tender_storage::{
    fetch_with_retry, ArtifactStore, BackoffPolicy, FetchError, MetadataSink, NavigationLimiter,
    PageFetcher, TenderStore,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::recorder::{RunEvent, RunRecorder};
use crate::writer::{DedupWriter, WriteError};

/// Why one tender was dropped. Never fatal for the run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(err) => err.kind(),
            Self::Extract(err) => err.kind(),
            Self::Write(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub concurrency: usize,
    pub limit: Option<usize>,
    pub rate_limit: Duration,
    pub policy: BackoffPolicy,
    pub keep_raw_snippet: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            limit: config.limit,
            rate_limit: config.rate_limit(),
            policy: config.backoff_policy(),
            keep_raw_snippet: config.keep_raw_snippet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub metadata_locations: Vec<String>,
    pub dispatched: usize,
}

/// State shared by every worker of one run.
struct Shared {
    run_id: String,
    fetcher: Arc<dyn PageFetcher>,
    limiter: NavigationLimiter,
    policy: BackoffPolicy,
    writer: DedupWriter,
    recorder: Arc<RunRecorder>,
    artifacts: Option<ArtifactStore>,
    keep_raw_snippet: bool,
}

pub struct Pipeline {
    settings: PipelineSettings,
    shared: Shared,
    crawler: Arc<dyn ListingCrawler>,
    store: Arc<dyn TenderStore>,
    metadata_sinks: Vec<Arc<dyn MetadataSink>>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        recorder: Arc<RunRecorder>,
        fetcher: Arc<dyn PageFetcher>,
        crawler: Arc<dyn ListingCrawler>,
        store: Arc<dyn TenderStore>,
    ) -> Self {
        let shared = Shared {
            run_id: recorder.run_id().to_string(),
            fetcher,
            limiter: NavigationLimiter::new(settings.rate_limit),
            policy: settings.policy,
            writer: DedupWriter::new(Arc::clone(&store)),
            recorder,
            artifacts: None,
            keep_raw_snippet: settings.keep_raw_snippet,
        };
        Self {
            settings,
            shared,
            crawler,
            store,
            metadata_sinks: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.shared.artifacts = Some(artifacts);
        self
    }

    pub fn with_metadata_sink(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.metadata_sinks.push(sink);
        self
    }

    /// Crawl, process and persist until the listing is exhausted, the limit is
    /// reached, or `shutdown` flips to `true`.
    pub async fn run(
        self,
        filters: tender_core::SearchFilters,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<RunReport> {
        let span = info_span!("run", run_id = %self.shared.run_id);
        self.run_inner(filters, shutdown).instrument(span).await
    }

    async fn run_inner(
        self,
        filters: tender_core::SearchFilters,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<RunReport> {
        let Self {
            settings,
            shared,
            crawler,
            store,
            metadata_sinks,
        } = self;
        let shared = Arc::new(shared);
        let concurrency = settings.concurrency.max(1);
        info!(concurrency, limit = ?settings.limit, "run started");

        let (sender, receiver) = mpsc::channel::<TenderStub>(concurrency * 2);
        let mut workers = spawn_workers(Arc::clone(&shared), receiver, concurrency);

        let cursor = StubCursor::new(crawler, filters);
        let dispatched = dispatch(cursor, sender, settings.limit, shutdown, &shared.recorder).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task aborted");
            }
        }
        info!(dispatched, "all workers finished");

        let flush_error = match store.flush().await {
            Ok(Some(location)) => {
                shared.recorder.record(RunEvent::OutputWritten { location });
                None
            }
            Ok(None) => None,
            Err(err) => {
                shared.recorder.record(RunEvent::RunError {
                    kind: err.kind(),
                    message: format!("flushing output: {err}"),
                });
                Some(err)
            }
        };

        let metadata = shared.recorder.finalize();
        let mut metadata_locations = Vec::with_capacity(metadata_sinks.len());
        for sink in &metadata_sinks {
            let location = sink
                .save(&metadata)
                .await
                .with_context(|| format!("saving metadata for run {}", metadata.run_id))?;
            metadata_locations.push(location);
        }

        if let Some(err) = flush_error {
            bail!("flushing output for run {}: {err}", metadata.run_id);
        }
        info!(
            pages_visited = metadata.pages_visited,
            tenders_saved = metadata.tenders_saved,
            failures = metadata.failures,
            "run finished"
        );
        Ok(RunReport {
            metadata,
            metadata_locations,
            dispatched,
        })
    }
}

/// Resolves once `shutdown` reads `true`; never resolves if the sender is gone.
async fn interrupted(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Single producer: feeds stubs into the queue until a stop condition, then
/// drops the sender so idle workers exit.
async fn dispatch(
    mut cursor: StubCursor,
    sender: mpsc::Sender<TenderStub>,
    limit: Option<usize>,
    mut shutdown: watch::Receiver<bool>,
    recorder: &RunRecorder,
) -> usize {
    let mut dispatched = 0usize;
    loop {
        if limit.is_some_and(|limit| dispatched >= limit) {
            info!(dispatched, "record limit reached, stopping dispatch");
            break;
        }
        let next = tokio::select! {
            biased;
            _ = interrupted(&mut shutdown) => {
                info!(dispatched, "interrupt received, stopping dispatch");
                break;
            }
            next = cursor.next() => next,
        };
        match next {
            Ok(Some(stub)) => {
                if sender.send(stub).await.is_err() {
                    warn!("work queue closed early");
                    break;
                }
                dispatched += 1;
            }
            Ok(None) => break,
            Err(err) => {
                recorder.record(RunEvent::RunError {
                    kind: err.kind(),
                    message: format!("listing page {}: {err}", cursor.pages_fetched()),
                });
                break;
            }
        }
    }
    debug!(pages = cursor.pages_fetched(), "listing cursor closed");
    dispatched
}

fn spawn_workers(
    shared: Arc<Shared>,
    receiver: mpsc::Receiver<TenderStub>,
    concurrency: usize,
) -> JoinSet<()> {
    let receiver = Arc::new(Mutex::new(receiver));
    let mut workers = JoinSet::new();
    for worker in 0..concurrency {
        let shared = Arc::clone(&shared);
        let receiver = Arc::clone(&receiver);
        workers.spawn(
            async move {
                loop {
                    let next = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(stub) = next else {
                        debug!(worker, "queue closed, worker exiting");
                        break;
                    };
                    shared.process(worker, stub).await;
                }
            }
            .instrument(info_span!("worker", worker)),
        );
    }
    workers
}

impl Shared {
    async fn process(&self, worker: usize, stub: TenderStub) {
        let span = info_span!(
            "fetch_detail",
            run_id = %self.run_id,
            tender_id = %stub.tender_id,
            url = %stub.source_url
        );
        if let Err(err) = self.process_stub(worker, &stub).instrument(span).await {
            let kind = err.kind();
            warn!(worker, tender_id = %stub.tender_id, %kind, error = %err, "tender dropped");
            self.recorder.record(RunEvent::Failure {
                kind,
                message: format!("{}: {err}", stub.tender_id),
            });
        }
    }

    async fn process_stub(&self, worker: usize, stub: &TenderStub) -> Result<(), RecordError> {
        self.limiter.acquire(worker).await;
        let page = fetch_with_retry(self.fetcher.as_ref(), &stub.source_url, &self.policy).await?;
        self.recorder.record(RunEvent::PageVisited);

        if let Some(artifacts) = &self.artifacts {
            match artifacts
                .store_page(page.fetched_at, &stub.tender_id, page.body.as_bytes())
                .await
            {
                Ok(stored) => debug!(
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "stored raw page"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "could not store raw page"),
            }
        }

        let opts = ExtractOptions {
            source_url: stub.source_url.clone(),
            tender_id_hint: Some(stub.tender_id.clone()),
            keep_raw_snippet: self.keep_raw_snippet,
        };
        let record = extract_tender(&page.body, &opts, Utc::now())?;
        self.recorder.record(RunEvent::RecordParsed {
            tender_type: record.tender_type,
        });

        let outcome = self.writer.write(record).await?;
        self.recorder.record(RunEvent::RecordWritten(outcome));
        Ok(())
    }
}
