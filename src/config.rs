use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum number of files processed concurrently. Small by default to
    /// stay within third-party rate limits.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Bounded retries for status writes that fail at the store layer.
    #[serde(default = "default_store_write_retries")]
    pub store_write_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            store_write_retries: default_store_write_retries(),
        }
    }
}

fn default_max_workers() -> usize {
    3
}
fn default_store_write_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl UploadConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

fn default_max_file_size_mb() -> u64 {
    50
}
fn default_allowed_extensions() -> Vec<String> {
    vec![".pdf".to_string(), ".docx".to_string(), ".doc".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `local` stores uploaded bytes under `root`; `remote` forwards them to
    /// an HTTP object store at `endpoint` (bearer token from
    /// `CLAUSEBASE_STORAGE_TOKEN`).
    #[serde(default = "default_local_provider")]
    pub provider: String,
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_local_provider(),
            root: default_storage_root(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// `local` parses PDF/DOCX in-process; `remote` posts bytes to a parsing
    /// service at `endpoint` (bearer token from `CLAUSEBASE_PARSER_TOKEN`).
    #[serde(default = "default_local_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_local_provider(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_local_provider() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_disabled_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled_provider(),
            model: None,
            endpoint: None,
            max_retries: default_max_retries(),
            timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

fn default_disabled_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_metadata_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }
    if config.queue.max_workers == 0 {
        anyhow::bail!("queue.max_workers must be >= 1");
    }
    if config.upload.max_file_size_mb == 0 {
        anyhow::bail!("upload.max_file_size_mb must be >= 1");
    }

    match config.storage.provider.as_str() {
        "local" => {}
        "remote" => {
            if config.storage.endpoint.is_none() {
                anyhow::bail!("storage.endpoint must be set when storage.provider is 'remote'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage provider: '{}'. Must be local or remote.",
            other
        ),
    }

    match config.extraction.provider.as_str() {
        "local" => {}
        "remote" => {
            if config.extraction.endpoint.is_none() {
                anyhow::bail!(
                    "extraction.endpoint must be set when extraction.provider is 'remote'"
                );
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be local or remote.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.metadata.provider == "openai" && config.metadata.model.is_none() {
        anyhow::bail!("metadata.model must be specified when provider is 'openai'");
    }
    match config.metadata.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown metadata provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}
