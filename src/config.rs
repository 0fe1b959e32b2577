use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_storage_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_distance")]
    pub distance: String,
}

fn default_backend() -> String {
    "qdrant".to_string()
}
fn default_storage_url() -> String {
    "http://127.0.0.1:6333".to_string()
}
fn default_collection() -> String {
    "delta_index".to_string()
}
fn default_distance() -> String {
    "Cosine".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Per-request token ceiling documented for the model.
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,
    /// Fraction of `token_limit` a closed batch may actually use.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Number of concurrent embedding requests (T).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            token_limit: default_token_limit(),
            safety_margin: default_safety_margin(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_token_limit() -> usize {
    8192
}
fn default_safety_margin() -> f64 {
    0.9
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
}

fn default_overlap_lines() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_visibility_batch_size")]
    pub visibility_batch_size: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_visibility_batch_size() -> usize {
    1000
}
fn default_max_file_bytes() -> u64 {
    1_048_576
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Frontend pool size (T+2). The hash and chunk pools run two workers
    /// ahead of the embedding pool so the provider is never starved.
    pub fn frontend_workers(&self) -> usize {
        self.concurrency + 2
    }

    /// Largest token count a closed batch may carry.
    pub fn effective_token_limit(&self) -> usize {
        (self.token_limit as f64 * self.safety_margin) as usize
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.embedding.safety_margin)
        || config.embedding.safety_margin == 0.0
    {
        anyhow::bail!("embedding.safety_margin must be in (0.0, 1.0]");
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

    match config.storage.backend.as_str() {
        "qdrant" | "memory" => {}
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be qdrant or memory.",
            other
        ),
    }

    if config.indexing.visibility_batch_size == 0 {
        anyhow::bail!("indexing.visibility_batch_size must be >= 1");
    }

    Ok(config)
}
