//! Stage error taxonomy for the processing pipeline.
//!
//! Each variant is scoped to one pipeline stage so the queue can downgrade a
//! failure into the right status write + error row without inspecting
//! message strings. `Store` is the exception: persistence failures risk
//! inconsistent state and are retried at the queue layer before being
//! surfaced as a dispatcher-level alarm.

use thiserror::Error;

use crate::models::ErrorType;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before any file record mutation (bad type, oversized, empty).
    #[error("upload rejected: {0}")]
    Upload(String),

    /// Text extraction failed (unreadable or corrupt input, parser outage).
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Embedding generation failed (quota, timeout, malformed response).
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// LLM metadata output was missing, malformed, or failed validation.
    #[error("metadata extraction failed: {0}")]
    Metadata(String),

    /// Object storage upload/download/delete failed.
    #[error("object storage error: {0}")]
    Storage(String),

    /// Record store failure. Fatal to the current operation.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// The error row category this failure is recorded under.
    pub fn error_type(&self) -> ErrorType {
        match self {
            PipelineError::Upload(_) | PipelineError::Storage(_) => ErrorType::FileUpload,
            PipelineError::Extraction(_) | PipelineError::Embedding(_) => {
                ErrorType::VectorProcessing
            }
            PipelineError::Metadata(_) => ErrorType::MetadataExtraction,
            PipelineError::Store(_) => ErrorType::VectorProcessing,
        }
    }
}
