use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Uploaded files with per-branch processing state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            storage_url TEXT NOT NULL,
            storage_id TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            upload_timestamp INTEGER NOT NULL,
            vector_processing_status TEXT NOT NULL DEFAULT 'pending',
            metadata_processing_status TEXT NOT NULL DEFAULT 'pending',
            processing_attempts INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Extracted contract metadata, 0-or-1 per file
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_metadata (
            file_id TEXT PRIMARY KEY,
            vendor_name TEXT,
            contract_type TEXT,
            scope_of_services TEXT,
            start_date TEXT,
            end_date TEXT,
            contract_duration TEXT,
            contract_value_local REAL,
            currency TEXT,
            contract_value_usd REAL,
            contract_status TEXT,
            auto_renewal TEXT,
            payment_terms TEXT,
            liability_cap TEXT,
            termination_for_convenience TEXT,
            price_escalation TEXT,
            auto_renewal_risk_score INTEGER,
            payment_terms_risk_score INTEGER,
            liability_cap_risk_score INTEGER,
            termination_risk_score INTEGER,
            price_escalation_risk_score INTEGER,
            total_risk_score REAL,
            risk_band TEXT,
            risk_color TEXT,
            raw_text_length INTEGER,
            extraction_timestamp INTEGER,
            confidence_score REAL,
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only pipeline failure log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_errors (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            error_type TEXT NOT NULL,
            error_message TEXT NOT NULL,
            error_details TEXT,
            timestamp INTEGER NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Text chunks produced by the vector branch
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            file_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY (file_id, chunk_index),
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedding vectors, little-endian f32 BLOBs keyed by chunk
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            file_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (file_id, chunk_index),
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_files_upload_timestamp ON files(upload_timestamp DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_errors_file_id ON processing_errors(file_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_errors_resolved ON processing_errors(resolved)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
