use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Root directory for the `local` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Storage account name (Azure).
    #[serde(default)]
    pub account: Option<String>,
    /// Blob container (Azure).
    #[serde(default)]
    pub container: Option<String>,
    /// Key prefix prepended to every blob name (S3 and Azure).
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint: MinIO or LocalStack for S3, Azurite for Azure.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root: default_storage_root(),
            bucket: None,
            region: default_region(),
            account: None,
            container: None,
            prefix: String::new(),
            endpoint_url: None,
        }
    }
}

fn default_storage_backend() -> String {
    "local".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
    /// `"words"`, or a path to a HuggingFace `tokenizer.json` (needs the
    /// `hf-tokenizer` feature). Model names like `"gpt-4"` are not resolved;
    /// they fall back to words with a warning.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_tokenizer() -> String {
    "words".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name (OpenAI) or deployment name (Azure).
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL. Required for Azure; defaults to `https://api.openai.com` for OpenAI.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_api_version")]
    pub api_version: String,
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
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_version: default_embedding_api_version(),
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

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_api_version() -> String {
    "2024-05-01-preview".to_string()
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

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_chat_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_version: default_chat_api_version(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            max_retries: default_max_retries(),
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

impl ChatConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_chat_api_version() -> String {
    "2024-06-01".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_chat_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_backend")]
    pub backend: String,
    #[serde(default = "default_index_name")]
    pub name: String,
    /// Search service endpoint (Azure backend).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_search_api_version")]
    pub api_version: String,
    /// How many times the failed subset of an upsert is retried.
    #[serde(default = "default_upsert_retries")]
    pub upsert_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            name: default_index_name(),
            endpoint: None,
            api_version: default_search_api_version(),
            upsert_retries: default_upsert_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl IndexConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_index_backend() -> String {
    "sqlite".to_string()
}
fn default_index_name() -> String {
    "documents".to_string()
}
fn default_search_api_version() -> String {
    "2023-11-01".to_string()
}
fn default_upsert_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Write a non-authoritative copy of each fragment to the `chunks` table.
    #[serde(default = "default_true")]
    pub mirror_chunks: bool,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            mirror_chunks: true,
            extract_timeout_secs: default_extract_timeout_secs(),
            storage_timeout_secs: default_storage_timeout_secs(),
        }
    }
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./data/tmp")
}
fn default_true() -> bool {
    true
}
fn default_extract_timeout_secs() -> u64 {
    120
}
fn default_storage_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunk windows must advance by at least one unit.
    if config.chunking.size == 0 {
        bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        bail!(
            "chunking.overlap ({}) must be smaller than chunking.size ({})",
            config.chunking.overlap,
            config.chunking.size
        );
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.top_k > config.retrieval.max_top_k {
        bail!("retrieval.top_k must not exceed retrieval.max_top_k");
    }

    match config.storage.backend.as_str() {
        "local" => {}
        "s3" => {
            if config.storage.bucket.is_none() {
                bail!("storage.bucket must be set when storage.backend = 's3'");
            }
        }
        "azure" => {
            if config.storage.account.is_none() || config.storage.container.is_none() {
                bail!("storage.account and storage.container must be set when storage.backend = 'azure'");
            }
        }
        other => bail!(
            "Unknown storage backend: '{}'. Must be local, s3, or azure.",
            other
        ),
    }

    for (section, provider, model) in [
        (
            "embedding",
            &config.embedding.provider,
            &config.embedding.model,
        ),
        ("chat", &config.chat.provider, &config.chat.model),
    ] {
        match provider.as_str() {
            "disabled" | "openai" => {}
            "azure" => {
                let url = if section == "embedding" {
                    &config.embedding.url
                } else {
                    &config.chat.url
                };
                if url.is_none() {
                    bail!("{}.url must be set when provider is 'azure'", section);
                }
            }
            other => bail!(
                "Unknown {} provider: '{}'. Must be disabled, openai, or azure.",
                section,
                other
            ),
        }
        if provider != "disabled" && model.is_none() {
            bail!(
                "{}.model must be specified when provider is '{}'",
                section,
                provider
            );
        }
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    if !(0.0..=2.0).contains(&config.chat.temperature) {
        bail!("chat.temperature must be in [0.0, 2.0]");
    }

    match config.index.backend.as_str() {
        "sqlite" | "memory" => {}
        "azure" => {
            if config.index.endpoint.is_none() {
                bail!("index.endpoint must be set when index.backend = 'azure'");
            }
        }
        other => bail!(
            "Unknown index backend: '{}'. Must be sqlite, memory, or azure.",
            other
        ),
    }

    Ok(())
}
