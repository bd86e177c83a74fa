use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tender_core::{ErrorKind, TenderRecord};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding tender records: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decoding {} line {line}: {source}", path.display())]
    Decode {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage backend: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageError
    }
}

/// Key-value sink the deduplicating writer talks to.
#[async_trait]
pub trait TenderStore: Send + Sync {
    async fn get(&self, tender_id: &str) -> Result<Option<TenderRecord>, StorageError>;

    async fn put(&self, record: TenderRecord) -> Result<(), StorageError>;

    /// Persist buffered state. Returns where the output went, if anywhere.
    async fn flush(&self) -> Result<Option<String>, StorageError>;
}

/// In-process sink. Doubles as the dry-run sink: dedup works, nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, TenderRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = TenderRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.tender_id.clone(), r))
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn records(&self) -> Vec<TenderRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl TenderStore for MemoryStore {
    async fn get(&self, tender_id: &str) -> Result<Option<TenderRecord>, StorageError> {
        Ok(self.records.read().await.get(tender_id).cloned())
    }

    async fn put(&self, record: TenderRecord) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(record.tender_id.clone(), record);
        Ok(())
    }

    async fn flush(&self) -> Result<Option<String>, StorageError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Pretty JSON array per run, plus the `tenders.json` snapshot.
    Json,
    /// One record per line in `tenders.ndjson`.
    Ndjson,
}

pub const JSON_SNAPSHOT: &str = "tenders.json";
pub const NDJSON_FILE: &str = "tenders.ndjson";

/// File-backed sink that loads previously captured records so dedup spans runs.
#[derive(Debug)]
pub struct FileStore {
    format: FileFormat,
    dir: PathBuf,
    run_id: String,
    memory: MemoryStore,
    written: Mutex<Vec<String>>,
}

impl FileStore {
    pub async fn open(
        format: FileFormat,
        dir: impl Into<PathBuf>,
        run_id: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        let existing = match format {
            FileFormat::Json => load_json_snapshot(&dir.join(JSON_SNAPSHOT)).await?,
            FileFormat::Ndjson => load_ndjson(&dir.join(NDJSON_FILE)).await?,
        };
        info!(dir = %dir.display(), existing = existing.len(), ?format, "opened file store");
        Ok(Self {
            format,
            dir,
            run_id: run_id.into(),
            memory: MemoryStore::with_records(existing),
            written: Mutex::new(Vec::new()),
        })
    }

    pub fn run_file(&self) -> PathBuf {
        self.dir.join(format!("tenders_{}.json", self.run_id))
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        write_atomic(path, bytes)
            .await
            .map_err(|source| StorageError::io(path, source))
    }
}

#[async_trait]
impl TenderStore for FileStore {
    async fn get(&self, tender_id: &str) -> Result<Option<TenderRecord>, StorageError> {
        self.memory.get(tender_id).await
    }

    async fn put(&self, record: TenderRecord) -> Result<(), StorageError> {
        let id = record.tender_id.clone();
        self.memory.put(record).await?;
        self.written.lock().await.push(id);
        Ok(())
    }

    async fn flush(&self) -> Result<Option<String>, StorageError> {
        let all = self.memory.records().await;
        match self.format {
            FileFormat::Json => {
                let written = self.written.lock().await.clone();
                let mut this_run = Vec::with_capacity(written.len());
                for id in dedup_preserving_order(written) {
                    if let Some(record) = self.memory.get(&id).await? {
                        this_run.push(record);
                    }
                }
                let run_file = self.run_file();
                self.write_file(&run_file, &serde_json::to_vec_pretty(&this_run)?)
                    .await?;
                self.write_file(
                    &self.dir.join(JSON_SNAPSHOT),
                    &serde_json::to_vec_pretty(&all)?,
                )
                .await?;
                info!(path = %run_file.display(), records = this_run.len(), "wrote run file");
                Ok(Some(run_file.display().to_string()))
            }
            FileFormat::Ndjson => {
                let mut out = Vec::new();
                for record in &all {
                    serde_json::to_writer(&mut out, record)?;
                    out.push(b'\n');
                }
                let path = self.dir.join(NDJSON_FILE);
                self.write_file(&path, &out).await?;
                info!(path = %path.display(), records = all.len(), "wrote ndjson file");
                Ok(Some(path.display().to_string()))
            }
        }
    }
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Read the running JSON snapshot; a missing file is an empty store.
pub async fn load_json_snapshot(path: &Path) -> Result<Vec<TenderRecord>, StorageError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageError::io(path, err)),
    };
    let records = serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
        path: path.to_path_buf(),
        line: source.line(),
        source,
    })?;
    Ok(drop_unidentified(path, records))
}

/// Records without a `tender_id` cannot take part in dedup; skip them.
fn drop_unidentified(path: &Path, records: Vec<TenderRecord>) -> Vec<TenderRecord> {
    let total = records.len();
    let kept: Vec<TenderRecord> = records
        .into_iter()
        .filter(|r| !r.tender_id.trim().is_empty())
        .collect();
    if kept.len() < total {
        warn!(
            path = %path.display(),
            skipped = total - kept.len(),
            "skipping stored records without tender_id"
        );
    }
    kept
}

async fn load_ndjson(path: &Path) -> Result<Vec<TenderRecord>, StorageError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageError::io(path, err)),
    };
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|source| StorageError::Decode {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(drop_unidentified(path, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use tempfile::tempdir;
    use tender_core::{Amount, Attachment, Document, Exemption, Form, Stage, TenderDate};

    fn record(id: &str, title: &str) -> TenderRecord {
        TenderRecord {
            tender_id: id.into(),
            source_url: format!("https://tender.nprocure.com/view-nit-home?id={id}"),
            title: title.into(),
            organization: "Roads and Buildings".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn json_store_writes_run_file_and_reloads_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(FileFormat::Json, dir.path(), "run-a")
            .await
            .expect("open");
        store.put(record("1", "Road repair")).await.expect("put");
        store.put(record("2", "Supply of pumps")).await.expect("put");
        let out = store.flush().await.expect("flush").expect("path");
        assert!(out.ends_with("tenders_run-a.json"));

        let reopened = FileStore::open(FileFormat::Json, dir.path(), "run-b")
            .await
            .expect("reopen");
        let found = reopened.get("2").await.expect("get").expect("present");
        assert_eq!(found.title, "Supply of pumps");

        reopened.flush().await.expect("flush empty run");
        let run_b: Vec<TenderRecord> =
            serde_json::from_slice(&std::fs::read(reopened.run_file()).expect("read"))
                .expect("decode");
        assert!(run_b.is_empty());
    }

    #[tokio::test]
    async fn ndjson_store_round_trips_lines() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(FileFormat::Ndjson, dir.path(), "run-a")
            .await
            .expect("open");
        store.put(record("7", "Bridge work")).await.expect("put");
        store.put(record("8", "Audit services")).await.expect("put");
        store.flush().await.expect("flush");

        let text = std::fs::read_to_string(dir.path().join(NDJSON_FILE)).expect("read");
        assert_eq!(text.lines().count(), 2);

        let reopened = FileStore::open(FileFormat::Ndjson, dir.path(), "run-b")
            .await
            .expect("reopen");
        assert!(reopened.get("7").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn corrupt_ndjson_reports_line() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join(NDJSON_FILE), "{}\nnot json\n").expect("seed");
        let err = FileStore::open(FileFormat::Ndjson, dir.path(), "run")
            .await
            .expect_err("bad line");
        assert!(matches!(err, StorageError::Decode { line: 2, .. }));
        assert_eq!(err.kind(), ErrorKind::StorageError);
    }

    fn full_record(id: &str) -> TenderRecord {
        let closing = NaiveDate::from_ymd_opt(2026, 2, 10).expect("date");
        TenderRecord {
            tender_fee: Some(Amount::Parsed { value: 2400.0 }),
            emd_amount: Some(Amount::Unparsed {
                text: "Exempted".into(),
            }),
            bid_submission_end: Some(TenderDate::DateTime(
                closing.and_hms_opt(18, 0, 0).expect("time"),
            )),
            bid_submission_start: Some(TenderDate::Date(closing)),
            closing_date: Some(closing),
            exempted_fee: Some(Exemption::Reason("MSME".into())),
            attachments: vec![Attachment {
                name: "NIT Document".into(),
                url: Some("https://tender.nprocure.com/download?file=NIT.pdf".into()),
                size: Some("1.2 MB".into()),
                file_type: Some("pdf".into()),
            }],
            stages: vec![
                Stage {
                    stage_name: "Preliminary".into(),
                    evaluation_date: Some(TenderDate::Date(closing)),
                    minimum_forms: 1,
                    forms: vec![Form {
                        form_id: Some("F1".into()),
                        form_name: Some("Bidder details".into()),
                        form_mode: Some("Online".into()),
                        submission_type: None,
                        mandatory: true,
                    }],
                    required_documents: vec![
                        Document {
                            sr_no: Some(1),
                            document_name: Some("PAN card".into()),
                            mandatory: true,
                        },
                        Document {
                            sr_no: Some(2),
                            document_name: Some("GST certificate".into()),
                            mandatory: false,
                        },
                    ],
                },
                Stage {
                    stage_name: "Commercial".into(),
                    evaluation_date: None,
                    minimum_forms: 0,
                    forms: Vec::new(),
                    required_documents: Vec::new(),
                },
            ],
            ingested_at: Utc
                .with_ymd_and_hms(2026, 2, 1, 9, 30, 0)
                .single()
                .expect("ts"),
            ..record(id, "Construction of staff quarters")
        }
    }

    #[tokio::test]
    async fn file_stores_reload_nested_records_unchanged() {
        for format in [FileFormat::Json, FileFormat::Ndjson] {
            let dir = tempdir().expect("tempdir");
            let store = FileStore::open(format, dir.path(), "run-a")
                .await
                .expect("open");
            let original = full_record("271843");
            store.put(original.clone()).await.expect("put");
            store.flush().await.expect("flush");

            let loaded = match format {
                FileFormat::Json => load_json_snapshot(&dir.path().join(JSON_SNAPSHOT)).await,
                FileFormat::Ndjson => load_ndjson(&dir.path().join(NDJSON_FILE)).await,
            }
            .expect("load");
            assert_eq!(loaded, vec![original.clone()], "{format:?}");

            let stages = &loaded[0].stages;
            assert_eq!(stages.len(), 2);
            assert_eq!(stages[0].stage_name, "Preliminary");
            assert_eq!(stages[0].forms.len(), 1);
            assert_eq!(stages[0].required_documents.len(), 2);
            assert!(loaded[0].emd_amount.as_ref().is_some_and(Amount::is_unparsed));
        }
    }

    #[tokio::test]
    async fn records_without_id_are_skipped_on_load() {
        let dir = tempdir().expect("tempdir");
        let valid = serde_json::to_string(&record("9", "Canal lining")).expect("encode");
        std::fs::write(dir.path().join(NDJSON_FILE), format!("{{}}\n{valid}\n"))
            .expect("seed ndjson");
        std::fs::write(
            dir.path().join(JSON_SNAPSHOT),
            format!("[{{\"tender_id\": \"  \"}}, {valid}]"),
        )
        .expect("seed json");

        let lines = load_ndjson(&dir.path().join(NDJSON_FILE)).await.expect("ndjson");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].tender_id, "9");

        let snapshot = load_json_snapshot(&dir.path().join(JSON_SNAPSHOT))
            .await
            .expect("json");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].tender_id, "9");
    }

    #[tokio::test]
    async fn memory_store_never_persists() {
        let store = MemoryStore::new();
        store.put(record("1", "x")).await.expect("put");
        assert_eq!(store.len().await, 1);
        assert_eq!(store.flush().await.expect("flush"), None);
    }
}
