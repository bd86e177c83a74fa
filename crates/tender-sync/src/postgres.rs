//! Relational sink: `tenders` upserted on `tender_id`, one `run_metadata` row per run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tender_core::{Amount, RunMetadata, TenderRecord};
use tender_storage::{MetadataSink, StorageError, TenderStore};
use tracing::info;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

fn backend(err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn as_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Numeric column value and text column value for one amount field.
fn split_amount(amount: Option<&Amount>) -> (Option<f64>, Option<String>) {
    match amount {
        Some(Amount::Parsed { value }) => (Some(*value), None),
        Some(Amount::Unparsed { text }) => (None, Some(text.clone())),
        None => (None, None),
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("applying postgres migrations")?;
        info!("postgres migrations applied");
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, start_time, end_time, duration_seconds, scraper_version, config,
                   pages_visited, tenders_parsed, tenders_saved, failures, deduped_count,
                   tender_types_processed, error_summary, output_file
              FROM run_metadata
             ORDER BY start_time DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("loading run metadata")?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let count = |name: &str| -> Result<u64> {
                let value: i64 = row.try_get(name)?;
                Ok(u64::try_from(value).unwrap_or(0))
            };
            let types: JsonValue = row.try_get("tender_types_processed")?;
            let errors: JsonValue = row.try_get("error_summary")?;
            runs.push(RunMetadata {
                run_id: row.try_get("run_id")?,
                start_time: row.try_get("start_time")?,
                end_time: row.try_get("end_time")?,
                duration_seconds: row.try_get("duration_seconds")?,
                scraper_version: row.try_get("scraper_version")?,
                config: row.try_get("config")?,
                pages_visited: count("pages_visited")?,
                tenders_parsed: count("tenders_parsed")?,
                tenders_saved: count("tenders_saved")?,
                failures: count("failures")?,
                deduped_count: count("deduped_count")?,
                tender_types_processed: serde_json::from_value(types)
                    .context("decoding tender_types_processed")?,
                error_summary: serde_json::from_value(errors).context("decoding error_summary")?,
                output_file: row.try_get("output_file")?,
            });
        }
        Ok(runs)
    }
}

#[async_trait]
impl TenderStore for PgStore {
    async fn get(&self, tender_id: &str) -> Result<Option<TenderRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT record, created_at, updated_at
              FROM tenders
             WHERE tender_id = $1
            "#,
        )
        .bind(tender_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: JsonValue = row.try_get("record").map_err(backend)?;
        let mut record: TenderRecord = serde_json::from_value(value).map_err(backend)?;
        record.created_at = row.try_get::<Option<DateTime<Utc>>, _>("created_at").map_err(backend)?;
        record.updated_at = row.try_get::<Option<DateTime<Utc>>, _>("updated_at").map_err(backend)?;
        Ok(Some(record))
    }

    async fn put(&self, record: TenderRecord) -> Result<(), StorageError> {
        let document = serde_json::to_value(&record)?;
        let (estimated_value, estimated_text) = split_amount(record.estimated_value.as_ref());
        let (fee_value, fee_text) = split_amount(record.tender_fee.as_ref());
        let (emd_value, emd_text) = split_amount(record.emd_amount.as_ref());
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO tenders (
                tender_id, source_url, ifb_number, tender_type, tender_status, title,
                organization, location, estimated_value, estimated_value_text, tender_fee,
                tender_fee_text, emd_amount, emd_amount_text, publish_date, closing_date,
                document_count, record, ingested_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            ON CONFLICT (tender_id) DO UPDATE SET
                source_url = EXCLUDED.source_url,
                ifb_number = EXCLUDED.ifb_number,
                tender_type = EXCLUDED.tender_type,
                tender_status = EXCLUDED.tender_status,
                title = EXCLUDED.title,
                organization = EXCLUDED.organization,
                location = EXCLUDED.location,
                estimated_value = EXCLUDED.estimated_value,
                estimated_value_text = EXCLUDED.estimated_value_text,
                tender_fee = EXCLUDED.tender_fee,
                tender_fee_text = EXCLUDED.tender_fee_text,
                emd_amount = EXCLUDED.emd_amount,
                emd_amount_text = EXCLUDED.emd_amount_text,
                publish_date = EXCLUDED.publish_date,
                closing_date = EXCLUDED.closing_date,
                document_count = EXCLUDED.document_count,
                record = EXCLUDED.record,
                ingested_at = EXCLUDED.ingested_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.tender_id)
        .bind(&record.source_url)
        .bind(&record.ifb_number)
        .bind(record.tender_type.as_str())
        .bind(record.tender_status.as_str())
        .bind(&record.title)
        .bind(&record.organization)
        .bind(&record.location)
        .bind(estimated_value)
        .bind(estimated_text)
        .bind(fee_value)
        .bind(fee_text)
        .bind(emd_value)
        .bind(emd_text)
        .bind(record.publish_date)
        .bind(record.closing_date)
        .bind(record.document_count.map(|n| i32::try_from(n).unwrap_or(i32::MAX)))
        .bind(document)
        .bind(record.ingested_at)
        .bind(record.created_at.unwrap_or(now))
        .bind(record.updated_at.unwrap_or(now))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn flush(&self) -> Result<Option<String>, StorageError> {
        Ok(Some("postgres:tenders".to_string()))
    }
}

#[async_trait]
impl MetadataSink for PgStore {
    async fn save(&self, metadata: &RunMetadata) -> Result<String, StorageError> {
        let types = serde_json::to_value(&metadata.tender_types_processed)?;
        let errors = serde_json::to_value(&metadata.error_summary)?;
        sqlx::query(
            r#"
            INSERT INTO run_metadata (
                run_id, start_time, end_time, duration_seconds, scraper_version, config,
                pages_visited, tenders_parsed, tenders_saved, failures, deduped_count,
                tender_types_processed, error_summary, output_file
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (run_id) DO UPDATE SET
                end_time = EXCLUDED.end_time,
                duration_seconds = EXCLUDED.duration_seconds,
                pages_visited = EXCLUDED.pages_visited,
                tenders_parsed = EXCLUDED.tenders_parsed,
                tenders_saved = EXCLUDED.tenders_saved,
                failures = EXCLUDED.failures,
                deduped_count = EXCLUDED.deduped_count,
                tender_types_processed = EXCLUDED.tender_types_processed,
                error_summary = EXCLUDED.error_summary,
                output_file = EXCLUDED.output_file
            "#,
        )
        .bind(&metadata.run_id)
        .bind(metadata.start_time)
        .bind(metadata.end_time)
        .bind(metadata.duration_seconds)
        .bind(&metadata.scraper_version)
        .bind(&metadata.config)
        .bind(as_i64(metadata.pages_visited))
        .bind(as_i64(metadata.tenders_parsed))
        .bind(as_i64(metadata.tenders_saved))
        .bind(as_i64(metadata.failures))
        .bind(as_i64(metadata.deduped_count))
        .bind(types)
        .bind(errors)
        .bind(&metadata.output_file)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        info!(run_id = %metadata.run_id, "saved run metadata to postgres");
        Ok(format!("postgres:run_metadata/{}", metadata.run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_migration_creates_indexed_tables() {
        let migration = MIGRATOR.iter().next().expect("at least one migration");
        let sql = migration.sql.as_ref();
        for needle in [
            "CREATE TABLE IF NOT EXISTS tenders",
            "CREATE TABLE IF NOT EXISTS run_metadata",
            "ON tenders (tender_id)",
            "ON tenders (closing_date)",
            "ON run_metadata (start_time)",
            "tender_fee_text TEXT",
            "estimated_value_text TEXT",
            "BEFORE UPDATE ON tenders",
        ] {
            assert!(sql.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn amounts_split_into_value_and_text_columns() {
        assert_eq!(
            split_amount(Some(&Amount::Parsed { value: 2400.0 })),
            (Some(2400.0), None)
        );
        assert_eq!(
            split_amount(Some(&Amount::Unparsed { text: "Nil".into() })),
            (None, Some("Nil".to_string()))
        );
        assert_eq!(split_amount(None), (None, None));
    }
}
