//! Record store: durable CRUD for file records, extracted metadata, and
//! error rows.
//!
//! All mutation goes through this type; every method is a single statement
//! or a single transaction so concurrent readers never observe a partial
//! write. Counter updates (`processing_attempts`) happen in SQL, not
//! read-modify-write in application code.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{
    Branch, ErrorType, FileMetadata, FileRecord, FileWithMetadata, ProcessingError,
    ProcessingStatus,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new file record with both branches `pending`. Every accepted
    /// upload gets a record before any processing begins.
    pub async fn create_file_record(
        &self,
        filename: &str,
        storage_url: &str,
        storage_id: &str,
        file_size: i64,
    ) -> Result<FileRecord, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO files
                (id, filename, storage_url, storage_id, file_size, upload_timestamp,
                 vector_processing_status, metadata_processing_status, processing_attempts)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', 'pending', 0)
            "#,
        )
        .bind(&id)
        .bind(filename)
        .bind(storage_url)
        .bind(storage_id)
        .bind(file_size)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(FileRecord {
            id,
            filename: filename.to_string(),
            storage_url: storage_url.to_string(),
            storage_id: storage_id.to_string(),
            file_size,
            upload_timestamp: now,
            vector_processing_status: ProcessingStatus::Pending,
            metadata_processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
        })
    }

    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| map_file_row(&r)))
    }

    pub async fn get_with_metadata(
        &self,
        file_id: &str,
    ) -> Result<Option<FileWithMetadata>, sqlx::Error> {
        let file = match self.get_file(file_id).await? {
            Some(f) => f,
            None => return Ok(None),
        };

        let meta_row = sqlx::query("SELECT * FROM file_metadata WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(Some(FileWithMetadata {
            file,
            file_metadata: meta_row.map(|r| map_metadata_row(&r)),
        }))
    }

    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FileWithMetadata>, sqlx::Error> {
        // One statement for the whole page. The two tables share no column
        // names, so both mappers read the joined row directly; a NULL
        // m.file_id marks a file with no extracted metadata yet.
        let rows = sqlx::query(
            r#"
            SELECT f.*, m.*
            FROM files f
            LEFT JOIN file_metadata m ON m.file_id = f.id
            ORDER BY f.upload_timestamp DESC, f.id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let meta_file_id: Option<String> = row.get("file_id");
                FileWithMetadata {
                    file: map_file_row(row),
                    file_metadata: meta_file_id.map(|_| map_metadata_row(row)),
                }
            })
            .collect())
    }

    /// Set one branch's status. The column name comes from the `Branch` enum,
    /// never from caller input.
    pub async fn update_status(
        &self,
        file_id: &str,
        branch: Branch,
        status: ProcessingStatus,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "UPDATE files SET {} = ? WHERE id = ?",
            branch.status_column()
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Serialized per-record increment; no lost updates under concurrent
    /// dispatches.
    pub async fn increment_attempts(&self, file_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE files SET processing_attempts = processing_attempts + 1 WHERE id = ?",
        )
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or overwrite the extracted metadata for a file (re-extraction
    /// replaces the previous row).
    pub async fn upsert_metadata(&self, meta: &FileMetadata) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO file_metadata
                (file_id, vendor_name, contract_type, scope_of_services, start_date, end_date,
                 contract_duration, contract_value_local, currency, contract_value_usd,
                 contract_status, auto_renewal, payment_terms, liability_cap,
                 termination_for_convenience, price_escalation,
                 auto_renewal_risk_score, payment_terms_risk_score, liability_cap_risk_score,
                 termination_risk_score, price_escalation_risk_score,
                 total_risk_score, risk_band, risk_color,
                 raw_text_length, extraction_timestamp, confidence_score)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&meta.file_id)
        .bind(&meta.vendor_name)
        .bind(&meta.contract_type)
        .bind(&meta.scope_of_services)
        .bind(&meta.start_date)
        .bind(&meta.end_date)
        .bind(&meta.contract_duration)
        .bind(meta.contract_value_local)
        .bind(&meta.currency)
        .bind(meta.contract_value_usd)
        .bind(&meta.contract_status)
        .bind(&meta.auto_renewal)
        .bind(&meta.payment_terms)
        .bind(&meta.liability_cap)
        .bind(&meta.termination_for_convenience)
        .bind(&meta.price_escalation)
        .bind(meta.auto_renewal_risk_score)
        .bind(meta.payment_terms_risk_score)
        .bind(meta.liability_cap_risk_score)
        .bind(meta.termination_risk_score)
        .bind(meta.price_escalation_risk_score)
        .bind(meta.total_risk_score)
        .bind(&meta.risk_band)
        .bind(&meta.risk_color)
        .bind(meta.raw_text_length)
        .bind(meta.extraction_timestamp.map(|t| t.timestamp()))
        .bind(meta.confidence_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append an error row. Rows are never deleted by the pipeline.
    pub async fn append_error(
        &self,
        file_id: &str,
        error_type: ErrorType,
        message: &str,
        details: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO processing_errors (id, file_id, error_type, error_message, error_details, timestamp, resolved)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(file_id)
        .bind(error_type.as_str())
        .bind(message)
        .bind(details)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unresolved_errors(&self) -> Result<Vec<ProcessingError>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM processing_errors WHERE resolved = 0 ORDER BY timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(map_error_row).collect())
    }

    pub async fn errors_for_file(
        &self,
        file_id: &str,
    ) -> Result<Vec<ProcessingError>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM processing_errors WHERE file_id = ? ORDER BY timestamp DESC",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(map_error_row).collect())
    }

    /// Operator action: mark an error row handled. Returns false when the id
    /// is unknown.
    pub async fn resolve_error(&self, error_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE processing_errors SET resolved = 1 WHERE id = ?")
            .bind(error_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a file record and everything hanging off it (metadata, error
    /// rows, chunks, vectors) in one transaction. Returns the deleted record
    /// so the caller can clean up object storage.
    pub async fn delete(&self, file_id: &str) -> Result<Option<FileRecord>, sqlx::Error> {
        let record = match self.get_file(file_id).await? {
            Some(r) => r,
            None => return Ok(None),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM processing_errors WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_metadata WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(record))
    }
}

fn map_file_row(row: &SqliteRow) -> FileRecord {
    let ts: i64 = row.get("upload_timestamp");
    let vector_status: String = row.get("vector_processing_status");
    let metadata_status: String = row.get("metadata_processing_status");

    FileRecord {
        id: row.get("id"),
        filename: row.get("filename"),
        storage_url: row.get("storage_url"),
        storage_id: row.get("storage_id"),
        file_size: row.get("file_size"),
        upload_timestamp: epoch_to_datetime(ts),
        vector_processing_status: ProcessingStatus::parse(&vector_status)
            .unwrap_or(ProcessingStatus::Pending),
        metadata_processing_status: ProcessingStatus::parse(&metadata_status)
            .unwrap_or(ProcessingStatus::Pending),
        processing_attempts: row.get("processing_attempts"),
    }
}

fn map_metadata_row(row: &SqliteRow) -> FileMetadata {
    let extraction_ts: Option<i64> = row.get("extraction_timestamp");

    FileMetadata {
        file_id: row.get("file_id"),
        vendor_name: row.get("vendor_name"),
        contract_type: row.get("contract_type"),
        scope_of_services: row.get("scope_of_services"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        contract_duration: row.get("contract_duration"),
        contract_value_local: row.get("contract_value_local"),
        currency: row.get("currency"),
        contract_value_usd: row.get("contract_value_usd"),
        contract_status: row.get("contract_status"),
        auto_renewal: row.get("auto_renewal"),
        payment_terms: row.get("payment_terms"),
        liability_cap: row.get("liability_cap"),
        termination_for_convenience: row.get("termination_for_convenience"),
        price_escalation: row.get("price_escalation"),
        auto_renewal_risk_score: row.get("auto_renewal_risk_score"),
        payment_terms_risk_score: row.get("payment_terms_risk_score"),
        liability_cap_risk_score: row.get("liability_cap_risk_score"),
        termination_risk_score: row.get("termination_risk_score"),
        price_escalation_risk_score: row.get("price_escalation_risk_score"),
        total_risk_score: row.get("total_risk_score"),
        risk_band: row.get("risk_band"),
        risk_color: row.get("risk_color"),
        raw_text_length: row.get("raw_text_length"),
        extraction_timestamp: extraction_ts.map(epoch_to_datetime),
        confidence_score: row.get("confidence_score"),
    }
}

fn map_error_row(row: &SqliteRow) -> ProcessingError {
    let ts: i64 = row.get("timestamp");
    let error_type: String = row.get("error_type");
    let resolved: i64 = row.get("resolved");

    ProcessingError {
        id: row.get("id"),
        file_id: row.get("file_id"),
        error_type: ErrorType::parse(&error_type).unwrap_or(ErrorType::VectorProcessing),
        error_message: row.get("error_message"),
        error_details: row.get("error_details"),
        timestamp: epoch_to_datetime(ts),
        resolved: resolved != 0,
    }
}

fn epoch_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}
