//! Object storage collaborator.
//!
//! Uploaded contract bytes are persisted outside the record store and
//! addressed by an opaque storage id. Two implementations:
//!
//! - **[`LocalStorage`]** — writes under a configured directory; the default
//!   for development and tests.
//! - **[`RemoteStorage`]** — forwards bytes to an HTTP object store with a
//!   bearer token (`CLAUSEBASE_STORAGE_TOKEN`).

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::PipelineError;

/// Durable location of one uploaded object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub url: String,
    pub storage_id: String,
}

/// Narrow interface over the object store. Upload happens synchronously in
/// the upload handler; download happens later on a queue worker.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bytes: &[u8], filename: &str) -> Result<StoredObject, PipelineError>;
    async fn download(&self, storage_id: &str) -> Result<Vec<u8>, PipelineError>;
    async fn delete(&self, storage_id: &str) -> Result<(), PipelineError>;
}

pub fn create_storage(config: &StorageConfig) -> Result<Box<dyn ObjectStorage>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalStorage::new(config.root.clone()))),
        "remote" => Ok(Box::new(RemoteStorage::new(config)?)),
        other => anyhow::bail!("Unknown storage provider: {}", other),
    }
}

// ============ Local directory store ============

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, storage_id: &str) -> PathBuf {
        self.root.join(storage_id)
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn upload(&self, bytes: &[u8], filename: &str) -> Result<StoredObject, PipelineError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        // The storage id keeps the original extension so the extractor can
        // sniff the format from it.
        let ext = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let storage_id = format!("{}{}", Uuid::new_v4(), ext);

        let path = self.object_path(&storage_id);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        Ok(StoredObject {
            url: format!("file://{}", path.display()),
            storage_id,
        })
    }

    async fn download(&self, storage_id: &str) -> Result<Vec<u8>, PipelineError> {
        tokio::fs::read(self.object_path(storage_id))
            .await
            .map_err(|e| PipelineError::Storage(format!("read {}: {}", storage_id, e)))
    }

    async fn delete(&self, storage_id: &str) -> Result<(), PipelineError> {
        match tokio::fs::remove_file(self.object_path(storage_id)).await {
            Ok(()) => Ok(()),
            // Already gone is fine for a delete
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::Storage(e.to_string())),
        }
    }
}

// ============ Remote HTTP store ============

pub struct RemoteStorage {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("storage.endpoint required for remote provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn token() -> Result<String, PipelineError> {
        std::env::var("CLAUSEBASE_STORAGE_TOKEN")
            .map_err(|_| PipelineError::Storage("CLAUSEBASE_STORAGE_TOKEN not set".to_string()))
    }
}

#[async_trait]
impl ObjectStorage for RemoteStorage {
    async fn upload(&self, bytes: &[u8], filename: &str) -> Result<StoredObject, PipelineError> {
        let token = Self::token()?;

        let resp = self
            .client
            .post(format!("{}/objects", self.endpoint))
            .header("Authorization", format!("Bearer {}", token))
            .header("X-Filename", filename)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Storage(format!(
                "upload failed with {}: {}",
                status, body
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let storage_id = json
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::Storage("upload response missing id".to_string()))?
            .to_string();
        let url = match json.get("url").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => format!("{}/objects/{}", self.endpoint, storage_id),
        };

        Ok(StoredObject { url, storage_id })
    }

    async fn download(&self, storage_id: &str) -> Result<Vec<u8>, PipelineError> {
        let token = Self::token()?;

        let resp = self
            .client
            .get(format!("{}/objects/{}", self.endpoint, storage_id))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Storage(format!(
                "download {} failed with {}",
                storage_id, status
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, storage_id: &str) -> Result<(), PipelineError> {
        let token = Self::token()?;

        let resp = self
            .client
            .delete(format!("{}/objects/{}", self.endpoint, storage_id))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            return Err(PipelineError::Storage(format!(
                "delete {} failed with {}",
                storage_id, status
            )));
        }
        Ok(())
    }
}
