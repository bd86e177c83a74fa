use std::path::PathBuf;

use async_trait::async_trait;
use tender_core::RunMetadata;
use tokio::fs;
use tracing::{info, warn};

use crate::store::StorageError;
use crate::write_atomic;

/// Destination for finalized run metadata.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    /// Returns a description of where the metadata went.
    async fn save(&self, metadata: &RunMetadata) -> Result<String, StorageError>;
}

/// One `metadata_<run_id>.json` file per run.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    dir: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("metadata_{run_id}.json"))
    }

    pub async fn load(&self, run_id: &str) -> Result<Option<RunMetadata>, StorageError> {
        let path = self.path_for(run_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(path, err)),
        };
        let metadata = serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
            path,
            line: source.line(),
            source,
        })?;
        Ok(Some(metadata))
    }

    pub async fn list_run_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&self.dir, err)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::io(&self.dir, err))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name
                .strip_prefix("metadata_")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Stored runs, newest first. Unreadable files are skipped with a warning.
    pub async fn recent_runs(&self) -> Result<Vec<RunMetadata>, StorageError> {
        let mut runs = Vec::new();
        for id in self.list_run_ids().await? {
            match self.load(&id).await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(err) => warn!(run_id = %id, error = %err, "skipping unreadable run metadata"),
            }
        }
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }
}

#[async_trait]
impl MetadataSink for JsonMetadataStore {
    async fn save(&self, metadata: &RunMetadata) -> Result<String, StorageError> {
        let path = self.path_for(&metadata.run_id);
        let bytes = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| StorageError::io(&path, source))?;
        info!(run_id = %metadata.run_id, path = %path.display(), "saved run metadata");
        Ok(path.display().to_string())
    }
}
