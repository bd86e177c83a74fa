//! Columnar batch export: `tenders.parquet`, `stages.parquet` and a manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tender_core::{Amount, TenderDate, TenderRecord};
use tender_storage::store::{load_json_snapshot, JSON_SNAPSHOT};
use tender_storage::{write_atomic, MemoryStore, StorageError, TenderStore};
use tracing::info;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Keeps the run's records in memory and writes one snapshot per run under
/// `<output>/<run_id>/` on flush.
#[derive(Debug)]
pub struct ParquetStore {
    run_dir: PathBuf,
    run_id: String,
    memory: MemoryStore,
}

impl ParquetStore {
    /// Seeds dedup state from the JSON snapshot in `output_dir`, if one exists.
    pub async fn open(output_dir: &Path, run_id: impl Into<String>) -> Result<Self, StorageError> {
        let run_id = run_id.into();
        let existing = load_json_snapshot(&output_dir.join(JSON_SNAPSHOT)).await?;
        info!(existing = existing.len(), "opened parquet store");
        Ok(Self {
            run_dir: output_dir.join(&run_id),
            run_id,
            memory: MemoryStore::with_records(existing),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    async fn export(&self) -> Result<PathBuf> {
        let records = self.memory.records().await;
        tokio::fs::create_dir_all(&self.run_dir)
            .await
            .with_context(|| format!("creating {}", self.run_dir.display()))?;

        let tenders_path = self.run_dir.join("tenders.parquet");
        let stages_path = self.run_dir.join("stages.parquet");
        let tender_rows = write_tenders_parquet(&tenders_path, &records)?;
        let stage_rows = write_stages_parquet(&stages_path, &records)?;

        let manifest = ParquetManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: self.run_id.clone(),
            files: vec![
                manifest_entry("tenders", &self.run_dir, &tenders_path, tender_rows)?,
                manifest_entry("stages", &self.run_dir, &stages_path, stage_rows)?,
            ],
        };
        let manifest_path = self.run_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        write_atomic(&manifest_path, &bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(
            dir = %self.run_dir.display(),
            tenders = tender_rows,
            stages = stage_rows,
            "wrote parquet export"
        );
        Ok(manifest_path)
    }
}

#[async_trait]
impl TenderStore for ParquetStore {
    async fn get(&self, tender_id: &str) -> Result<Option<TenderRecord>, StorageError> {
        self.memory.get(tender_id).await
    }

    async fn put(&self, record: TenderRecord) -> Result<(), StorageError> {
        self.memory.put(record).await
    }

    async fn flush(&self) -> Result<Option<String>, StorageError> {
        let manifest = self
            .export()
            .await
            .map_err(|err| StorageError::Backend(format!("{err:#}")))?;
        Ok(Some(manifest.display().to_string()))
    }
}

fn date_text(date: &TenderDate) -> String {
    match date {
        TenderDate::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        TenderDate::Date(d) => d.format("%Y-%m-%d").to_string(),
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_tenders_parquet(path: &Path, records: &[TenderRecord]) -> Result<usize> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("tender_id", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("ifb_number", DataType::Utf8, true),
        ArrowField::new("tender_type", DataType::Utf8, false),
        ArrowField::new("tender_status", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("organization", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("estimated_value", DataType::Float64, true),
        ArrowField::new("estimated_value_text", DataType::Utf8, true),
        ArrowField::new("tender_fee", DataType::Float64, true),
        ArrowField::new("tender_fee_text", DataType::Utf8, true),
        ArrowField::new("emd_amount", DataType::Float64, true),
        ArrowField::new("emd_amount_text", DataType::Utf8, true),
        ArrowField::new("bid_submission_end", DataType::Utf8, true),
        ArrowField::new("publish_date", DataType::Utf8, true),
        ArrowField::new("closing_date", DataType::Utf8, true),
        ArrowField::new("bid_validity_days", DataType::UInt32, true),
        ArrowField::new("document_count", DataType::UInt32, true),
        ArrowField::new("stage_count", DataType::UInt32, false),
        ArrowField::new("stages_json", DataType::Utf8, false),
        ArrowField::new("attachments_json", DataType::Utf8, false),
        ArrowField::new("ingested_at", DataType::Utf8, false),
        ArrowField::new("updated_at", DataType::Utf8, true),
    ]));

    let text = |f: fn(&TenderRecord) -> Option<&str>| {
        StringArray::from(records.iter().map(f).collect::<Vec<_>>())
    };
    let owned = |f: fn(&TenderRecord) -> Option<String>| {
        StringArray::from(records.iter().map(f).collect::<Vec<_>>())
    };
    // Amounts split into a numeric column and a text column for unparsed values.
    let amount_value = |f: fn(&TenderRecord) -> Option<&Amount>| {
        Float64Array::from(
            records
                .iter()
                .map(|r| f(r).and_then(Amount::value))
                .collect::<Vec<_>>(),
        )
    };
    let amount_text = |f: fn(&TenderRecord) -> Option<&Amount>| {
        StringArray::from(
            records
                .iter()
                .map(|r| match f(r) {
                    Some(Amount::Unparsed { text }) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )
    };

    let mut stages_json = Vec::with_capacity(records.len());
    let mut attachments_json = Vec::with_capacity(records.len());
    for record in records {
        stages_json.push(serde_json::to_string(&record.stages).context("encoding stages")?);
        attachments_json
            .push(serde_json::to_string(&record.attachments).context("encoding attachments")?);
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|r| Some(r.tender_id.as_str()))),
            Arc::new(text(|r| Some(r.source_url.as_str()))),
            Arc::new(text(|r| r.ifb_number.as_deref())),
            Arc::new(text(|r| Some(r.tender_type.as_str()))),
            Arc::new(text(|r| Some(r.tender_status.as_str()))),
            Arc::new(text(|r| Some(r.title.as_str()))),
            Arc::new(text(|r| Some(r.organization.as_str()))),
            Arc::new(text(|r| r.location.as_deref())),
            Arc::new(amount_value(|r| r.estimated_value.as_ref())),
            Arc::new(amount_text(|r| r.estimated_value.as_ref())),
            Arc::new(amount_value(|r| r.tender_fee.as_ref())),
            Arc::new(amount_text(|r| r.tender_fee.as_ref())),
            Arc::new(amount_value(|r| r.emd_amount.as_ref())),
            Arc::new(amount_text(|r| r.emd_amount.as_ref())),
            Arc::new(owned(|r| r.bid_submission_end.as_ref().map(date_text))),
            Arc::new(owned(|r| r.publish_date.map(|d| d.to_string()))),
            Arc::new(owned(|r| r.closing_date.map(|d| d.to_string()))),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.bid_validity_days).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.document_count).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| count(r.stages.len())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(stages_json)),
            Arc::new(StringArray::from(attachments_json)),
            Arc::new(owned(|r| Some(r.ingested_at.to_rfc3339()))),
            Arc::new(owned(|r| r.updated_at.map(|t| t.to_rfc3339()))),
        ],
    )
    .context("building tenders record batch")?;
    write_parquet(path, batch)?;
    Ok(records.len())
}

fn write_stages_parquet(path: &Path, records: &[TenderRecord]) -> Result<usize> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("tender_id", DataType::Utf8, false),
        ArrowField::new("stage_index", DataType::UInt32, false),
        ArrowField::new("stage_name", DataType::Utf8, false),
        ArrowField::new("evaluation_date", DataType::Utf8, true),
        ArrowField::new("minimum_forms", DataType::UInt32, false),
        ArrowField::new("form_count", DataType::UInt32, false),
        ArrowField::new("document_count", DataType::UInt32, false),
    ]));

    let rows = records
        .iter()
        .flat_map(|r| {
            r.stages
                .iter()
                .enumerate()
                .map(move |(idx, stage)| (r.tender_id.as_str(), count(idx), stage))
        })
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|(id, _, _)| Some(*id)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                rows.iter().map(|(_, idx, _)| *idx).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, _, s)| Some(s.stage_name.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, _, s)| s.evaluation_date.as_ref().map(date_text))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                rows.iter().map(|(_, _, s)| s.minimum_forms).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                rows.iter().map(|(_, _, s)| count(s.forms.len())).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                rows.iter()
                    .map(|(_, _, s)| count(s.required_documents.len()))
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building stages record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}
