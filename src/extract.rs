//! Text extraction collaborator.
//!
//! Turns stored contract bytes (PDF, DOCX) into plain UTF-8 text for the
//! downstream chunking and metadata stages. Two implementations:
//!
//! - **[`LocalExtractor`]** — in-process parsing via `pdf-extract` and a
//!   streaming OOXML reader; the default.
//! - **[`RemoteExtractor`]** — posts bytes to an external parsing service
//!   (bearer token from `CLAUSEBASE_PARSER_TOKEN`), for scanned documents
//!   that need OCR.
//!
//! Extraction never panics on malformed input; failures surface as
//! [`PipelineError::Extraction`] and the queue records them per branch.

use anyhow::Result;
use async_trait::async_trait;
use std::io::Read;
use std::time::Duration;

use crate::config::ExtractionConfig;
use crate::error::PipelineError;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract plain text from one document. The filename carries the
    /// extension used for format dispatch.
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String, PipelineError>;
}

pub fn create_extractor(config: &ExtractionConfig) -> Result<Box<dyn TextExtractor>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalExtractor)),
        "remote" => Ok(Box::new(RemoteExtractor::new(config)?)),
        other => anyhow::bail!("Unknown extraction provider: {}", other),
    }
}

// ============ Local parser ============

pub struct LocalExtractor;

#[async_trait]
impl TextExtractor for LocalExtractor {
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String, PipelineError> {
        // pdf-extract is CPU-bound and synchronous; keep it off the async
        // worker threads.
        let filename = filename.to_string();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_by_extension(&filename, &bytes))
            .await
            .map_err(|e| PipelineError::Extraction(format!("extraction task panicked: {}", e)))?
    }
}

fn extract_by_extension(filename: &str, bytes: &[u8]) -> Result<String, PipelineError> {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => extract_pdf(bytes),
        "docx" => extract_docx(bytes),
        "doc" => Err(PipelineError::Extraction(
            "legacy .doc requires the remote parsing service".to_string(),
        )),
        other => Err(PipelineError::Extraction(format!(
            "unsupported document format: .{}",
            other
        ))),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, PipelineError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| PipelineError::Extraction(format!("PDF parse failed: {}", e)))
}

fn extract_docx(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::Extraction(e.to_string()))?;

    let mut doc_xml = Vec::new();
    let mut found = false;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::Extraction(e.to_string()))?;
        if entry.name() == "word/document.xml" {
            entry
                .take(MAX_XML_ENTRY_BYTES)
                .read_to_end(&mut doc_xml)
                .map_err(|e| PipelineError::Extraction(e.to_string()))?;
            if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
                return Err(PipelineError::Extraction(
                    "word/document.xml exceeds size limit".to_string(),
                ));
            }
            found = true;
            break;
        }
    }
    if !found {
        return Err(PipelineError::Extraction(
            "word/document.xml not found".to_string(),
        ));
    }

    extract_w_t_elements(&doc_xml)
}

/// Collect `<w:t>` text runs; paragraph ends become newlines so clause
/// numbering survives into the chunker.
fn extract_w_t_elements(xml: &[u8]) -> Result<String, PipelineError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                if in_text_run {
                    out.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = false;
                } else if e.local_name().as_ref() == b"p" && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::Extraction(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ Remote parsing service ============

pub struct RemoteExtractor {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.endpoint required for remote provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl TextExtractor for RemoteExtractor {
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String, PipelineError> {
        let token = std::env::var("CLAUSEBASE_PARSER_TOKEN")
            .map_err(|_| PipelineError::Extraction("CLAUSEBASE_PARSER_TOKEN not set".to_string()))?;

        let resp = self
            .client
            .post(format!("{}/parse", self.endpoint))
            .header("Authorization", format!("Bearer {}", token))
            .header("X-Filename", filename)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| PipelineError::Extraction(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Extraction(format!(
                "parser returned {}: {}",
                status, body
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Extraction(e.to_string()))?;

        json.get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Extraction("parser response missing text".to_string()))
    }
}
