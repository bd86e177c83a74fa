use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tender_core::{ErrorKind, TenderRecord, WriteOutcome};
use tender_storage::{StorageError, TenderStore};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("writing tender {tender_id}: {source}")]
pub struct WriteError {
    pub tender_id: String,
    #[source]
    pub source: StorageError,
}

impl WriteError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageError
    }
}

/// Merges records into a [`TenderStore`] keyed on `tender_id`.
///
/// Writes for one id are serialized through a per-id lock; distinct ids
/// proceed in parallel.
pub struct DedupWriter {
    store: Arc<dyn TenderStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DedupWriter {
    pub fn new(store: Arc<dyn TenderStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lease(&self, tender_id: &str) -> IdLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        IdLease {
            locks: &self.locks,
            tender_id: tender_id.to_string(),
            lock: Arc::clone(locks.entry(tender_id.to_string()).or_default()),
        }
    }

    /// Cancel-safe: dropping the returned future mid-write still releases the id.
    pub async fn write(&self, record: TenderRecord) -> Result<WriteOutcome, WriteError> {
        let tender_id = record.tender_id.clone();
        let lease = self.lease(&tender_id);
        let result = {
            let _guard = lease.lock.lock().await;
            self.write_locked(record).await
        };
        drop(lease);
        result.map_err(|source| WriteError { tender_id, source })
    }

    async fn write_locked(&self, mut record: TenderRecord) -> Result<WriteOutcome, StorageError> {
        let tender_id = record.tender_id.clone();
        let existing = retry_once(&tender_id, || self.store.get(&tender_id)).await?;
        let now = Utc::now();

        let outcome = match existing {
            None => {
                record.created_at = Some(now);
                record.updated_at = Some(now);
                WriteOutcome::Inserted
            }
            Some(previous) if previous.same_content(&record) => {
                debug!(tender_id = %tender_id, "content unchanged, skipping write");
                return Ok(WriteOutcome::Skipped);
            }
            Some(previous) => {
                record.created_at = previous.created_at.or(Some(now));
                record.updated_at = Some(now);
                WriteOutcome::Updated
            }
        };

        retry_once(&tender_id, || self.store.put(record.clone())).await?;
        debug!(tender_id = %tender_id, ?outcome, "tender written");
        Ok(outcome)
    }
}

/// Holds one id's lock entry; removes it on drop once nobody else uses it.
struct IdLease<'a> {
    locks: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    tender_id: String,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for IdLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.tender_id);
        }
    }
}

async fn retry_once<T, F, Fut>(tender_id: &str, op: F) -> Result<T, StorageError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(tender_id, error = %err, "storage operation failed, retrying once");
            op().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tender_storage::MemoryStore;

    use crate::recorder::{RunEvent, RunRecorder};

    fn record(id: &str, title: &str) -> TenderRecord {
        TenderRecord {
            tender_id: id.into(),
            source_url: format!("https://tender.nprocure.com/view-nit-home?id={id}"),
            title: title.into(),
            organization: "Roads and Buildings Department".into(),
            ingested_at: Utc::now(),
            ..TenderRecord::default()
        }
    }

    #[tokio::test]
    async fn second_identical_write_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let writer = DedupWriter::new(store.clone());

        let first = writer.write(record("271843", "Road widening")).await.expect("first");
        assert_eq!(first, WriteOutcome::Inserted);
        let stored = store.get("271843").await.expect("get").expect("present");
        let updated_at = stored.updated_at;
        assert!(updated_at.is_some());
        assert_eq!(stored.created_at, updated_at);

        let second = writer.write(record("271843", "Road widening")).await.expect("second");
        assert_eq!(second, WriteOutcome::Skipped);
        assert_eq!(store.len().await, 1);
        let stored = store.get("271843").await.expect("get").expect("present");
        assert_eq!(stored.updated_at, updated_at);
    }

    #[tokio::test]
    async fn changed_content_updates_and_keeps_created_at() {
        let store = Arc::new(MemoryStore::new());
        let writer = DedupWriter::new(store.clone());
        writer.write(record("271843", "Road widening")).await.expect("insert");
        let created = store.get("271843").await.expect("get").expect("present").created_at;

        let outcome = writer
            .write(record("271843", "Road widening, phase 2"))
            .await
            .expect("update");
        assert_eq!(outcome, WriteOutcome::Updated);
        let stored = store.get("271843").await.expect("get").expect("present");
        assert_eq!(stored.title, "Road widening, phase 2");
        assert_eq!(stored.created_at, created);
        assert!(stored.updated_at >= created);
    }

    #[tokio::test]
    async fn concurrent_identical_writes_store_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(DedupWriter::new(store.clone()));
        let recorder = Arc::new(RunRecorder::new(
            "run",
            "0.1.0",
            serde_json::Value::Null,
            Utc::now(),
        ));
        let template = record("271843", "Road widening");

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let writer = Arc::clone(&writer);
                let recorder = Arc::clone(&recorder);
                let record = template.clone();
                tokio::spawn(async move {
                    let outcome = writer.write(record).await.expect("write");
                    recorder.record(RunEvent::RecordWritten(outcome));
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join");
        }

        assert_eq!(store.len().await, 1);
        let meta = recorder.snapshot();
        assert_eq!(meta.tenders_saved, 1);
        assert_eq!(meta.deduped_count, 1);
        assert!(writer.locks.lock().expect("locks").is_empty());
    }

    struct FlakyStore {
        inner: MemoryStore,
        put_failures: AtomicUsize,
    }

    #[async_trait]
    impl TenderStore for FlakyStore {
        async fn get(&self, tender_id: &str) -> Result<Option<TenderRecord>, StorageError> {
            self.inner.get(tender_id).await
        }

        async fn put(&self, record: TenderRecord) -> Result<(), StorageError> {
            let remaining = self.put_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.put_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.put(record).await
        }

        async fn flush(&self) -> Result<Option<String>, StorageError> {
            Ok(None)
        }
    }

    /// Never answers `get`, so a write stays parked while holding its id.
    struct StalledStore;

    #[async_trait]
    impl TenderStore for StalledStore {
        async fn get(&self, _tender_id: &str) -> Result<Option<TenderRecord>, StorageError> {
            std::future::pending().await
        }

        async fn put(&self, _record: TenderRecord) -> Result<(), StorageError> {
            Ok(())
        }

        async fn flush(&self) -> Result<Option<String>, StorageError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn cancelled_write_releases_its_lock_entry() {
        let writer = DedupWriter::new(Arc::new(StalledStore));
        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            writer.write(record("271843", "Road")),
        )
        .await;
        assert!(attempt.is_err(), "write should still be pending");
        assert!(writer.locks.lock().expect("locks").is_empty());
    }

    #[tokio::test]
    async fn failed_put_is_retried_once() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            put_failures: AtomicUsize::new(1),
        });
        let writer = DedupWriter::new(store.clone());
        let outcome = writer.write(record("1", "Bridge")).await.expect("retried");
        assert_eq!(outcome, WriteOutcome::Inserted);
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn second_put_failure_is_a_storage_error() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            put_failures: AtomicUsize::new(2),
        });
        let writer = DedupWriter::new(store.clone());
        let err = writer.write(record("1", "Bridge")).await.expect_err("fails twice");
        assert_eq!(err.kind(), ErrorKind::StorageError);
        assert_eq!(err.tender_id, "1");
        assert!(store.inner.is_empty().await);
    }
}
