//! Embedding generator collaborator.
//!
//! Produces one vector per chunk for the vector-indexing branch:
//! - **[`DisabledEmbedder`]** — always errors; used when embeddings are not
//!   configured, which fails the vector branch without touching metadata.
//! - **[`OpenAIEmbedder`]** — calls the OpenAI embeddings API with batching,
//!   retry, and backoff (`OPENAI_API_KEY` from the environment).
//!
//! Vectors are stored as little-endian f32 BLOBs; see [`vec_to_blob`] and
//! [`blob_to_vec`].
//!
//! # Retry strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) are retried
//! - HTTP 4xx (not 429) fails immediately
//! - Network errors are retried
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::PipelineError;
use crate::models::Chunk;

#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Model identifier recorded alongside stored vectors.
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed chunk texts, returning one vector per chunk in input order.
    async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, PipelineError>;

    /// Embed a single search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let chunk = Chunk {
            file_id: String::new(),
            chunk_index: 0,
            text: text.to_string(),
            hash: String::new(),
        };
        let mut vecs = self.embed(std::slice::from_ref(&chunk)).await?;
        vecs.pop()
            .ok_or_else(|| PipelineError::Embedding("empty embedding response".to_string()))
    }
}

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAIEmbedder::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// Fails every embed call. The vector branch of each file lands in `failed`
/// with an explanatory error row; the metadata branch is unaffected.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingGenerator for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Err(PipelineError::Embedding(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Embedding("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| PipelineError::Embedding(e.to_string()))?;
                        return parse_openai_response(&json, texts.len(), self.dims);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(PipelineError::Embedding(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429), don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::Embedding(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::Embedding(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::Embedding("embedding failed after retries".to_string())
        }))
    }
}

#[async_trait]
impl EmbeddingGenerator for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut out = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            out.extend(self.embed_batch(&texts).await?);
        }
        Ok(out)
    }
}

fn parse_openai_response(
    json: &serde_json::Value,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, PipelineError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PipelineError::Embedding("response missing data array".to_string()))?;

    if data.len() != expected {
        return Err(PipelineError::Embedding(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| PipelineError::Embedding("response item missing embedding".to_string()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vec.len() != dims {
            return Err(PipelineError::Embedding(format!(
                "expected {} dims, got {}",
                dims,
                vec.len()
            )));
        }
        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`. Returns `0.0`
/// for empty vectors or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
