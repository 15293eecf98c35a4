//! Core data models used throughout Clausebase.
//!
//! These types represent the uploaded files, extracted contract metadata,
//! and error records that flow through the processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-branch processing state. Transitions only move forward
/// (`Pending → Processing → Completed | Failed`); a failed branch returns to
/// `Processing` only through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never left without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

/// One of the two independent pipelines tracked per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Vector,
    Metadata,
}

impl Branch {
    /// Column name on the `files` table.
    pub fn status_column(&self) -> &'static str {
        match self {
            Branch::Vector => "vector_processing_status",
            Branch::Metadata => "metadata_processing_status",
        }
    }
}

/// One uploaded contract document and its processing state.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    pub storage_url: String,
    pub storage_id: String,
    pub file_size: i64,
    pub upload_timestamp: DateTime<Utc>,
    pub vector_processing_status: ProcessingStatus,
    pub metadata_processing_status: ProcessingStatus,
    pub processing_attempts: i64,
}

impl FileRecord {
    pub fn status(&self, branch: Branch) -> ProcessingStatus {
        match branch {
            Branch::Vector => self.vector_processing_status,
            Branch::Metadata => self.metadata_processing_status,
        }
    }

    /// True when both branches have reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.vector_processing_status.is_terminal()
            && self.metadata_processing_status.is_terminal()
    }
}

/// Structured contract facts extracted by the LLM collaborator. Present
/// 0-or-1 times per file; overwritten on re-extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub vendor_name: Option<String>,
    pub contract_type: Option<String>,
    pub scope_of_services: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub contract_duration: Option<String>,
    pub contract_value_local: Option<f64>,
    pub currency: Option<String>,
    pub contract_value_usd: Option<f64>,
    /// Business-logic status (Active/Expired/Draft), distinct from the
    /// processing statuses on the file record.
    pub contract_status: Option<String>,

    // Commercial terms
    pub auto_renewal: Option<String>,
    pub payment_terms: Option<String>,
    pub liability_cap: Option<String>,
    pub termination_for_convenience: Option<String>,
    pub price_escalation: Option<String>,

    // Risk scores (0 low, 1 medium, 2 high per field)
    pub auto_renewal_risk_score: Option<i64>,
    pub payment_terms_risk_score: Option<i64>,
    pub liability_cap_risk_score: Option<i64>,
    pub termination_risk_score: Option<i64>,
    pub price_escalation_risk_score: Option<i64>,
    pub total_risk_score: Option<f64>,
    pub risk_band: Option<String>,
    pub risk_color: Option<String>,

    pub raw_text_length: Option<i64>,
    pub extraction_timestamp: Option<DateTime<Utc>>,
    pub confidence_score: Option<f64>,
}

/// A file record with its extracted metadata, as served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct FileWithMetadata {
    #[serde(flatten)]
    pub file: FileRecord,
    pub file_metadata: Option<FileMetadata>,
}

/// Pipeline failure category recorded alongside an error row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    VectorProcessing,
    MetadataExtraction,
    FileUpload,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::VectorProcessing => "vector_processing",
            ErrorType::MetadataExtraction => "metadata_extraction",
            ErrorType::FileUpload => "file_upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector_processing" => Some(ErrorType::VectorProcessing),
            "metadata_extraction" => Some(ErrorType::MetadataExtraction),
            "file_upload" => Some(ErrorType::FileUpload),
            _ => None,
        }
    }
}

/// Append-only audit row capturing a pipeline stage failure.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingError {
    pub id: String,
    pub file_id: String,
    pub error_type: ErrorType,
    pub error_message: String,
    pub error_details: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

/// A chunk of a document's extracted text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub file_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// Snapshot of dispatcher state, served by `GET /api/v1/queue/status`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub is_running: bool,
    pub queued: usize,
    pub in_flight: usize,
    pub total_workers: usize,
}
