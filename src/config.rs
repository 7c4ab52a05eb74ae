//! TOML configuration.
//!
//! ```toml
//! [source]
//! identity = "indexer@example.com"
//!
//! [index]
//! db_path = "./data/dix.sqlite"
//! ```
//!
//! Every other section and key has a default; see `config/dix.example.toml`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use drive_index_core::search::{FusionType, QueryParams};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Identity the crawl runs as. Documents without explicit grantees are
    /// attributed to it.
    pub identity: String,
    #[serde(default = "default_drive_url")]
    pub drive_url: String,
    #[serde(default = "default_docs_url")]
    pub docs_url: String,
    /// Environment variable holding the OAuth bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Crawl only Google Docs documents.
    #[serde(default)]
    pub only_documents: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_drive_url() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_docs_url() -> String {
    "https://docs.googleapis.com/v1".to_string()
}
fn default_token_env() -> String {
    "DRIVE_ACCESS_TOKEN".to_string()
}
fn default_page_size() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
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
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Maximum in-flight document fetches or embedding batches.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}
fn default_task_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            batch_size: default_index_batch_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/dix.sqlite")
}
fn default_index_batch_size() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `0.0` is pure keyword, `1.0` pure vector. Must stay below `0.5`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default)]
    pub fusion: FusionType,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_group_limit")]
    pub group_limit: usize,
    #[serde(default = "default_min_group_score")]
    pub min_group_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            fusion: FusionType::default(),
            final_limit: default_final_limit(),
            group_limit: default_group_limit(),
            min_group_score: default_min_group_score(),
        }
    }
}

impl RetrievalConfig {
    pub fn query_params(&self) -> QueryParams {
        QueryParams {
            alpha: self.hybrid_alpha,
            fusion: self.fusion,
            group_limit: self.group_limit,
            min_group_score: self.min_group_score,
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    drive_index_core::search::DEFAULT_ALPHA
}
fn default_final_limit() -> usize {
    10
}
fn default_group_limit() -> usize {
    drive_index_core::search::DEFAULT_GROUP_LIMIT
}
fn default_min_group_score() -> f64 {
    drive_index_core::search::DEFAULT_MIN_GROUP_SCORE
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.source.identity.trim().is_empty() {
        bail!("source.identity must not be empty");
    }
    if config.source.page_size == 0 || config.source.page_size > 1000 {
        bail!("source.page_size must be in 1..=1000");
    }

    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.pipeline.concurrency == 0 {
        bail!("pipeline.concurrency must be > 0");
    }
    if config.pipeline.task_timeout_secs == 0 {
        bail!("pipeline.task_timeout_secs must be > 0");
    }

    if config.index.batch_size == 0 {
        bail!("index.batch_size must be > 0");
    }

    if !(0.0..0.5).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 0.5)");
    }
    if config.retrieval.final_limit == 0 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.group_limit == 0 {
        bail!("retrieval.group_limit must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "local" | "disabled" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, ollama, or disabled.",
            other
        ),
    }

    Ok(config)
}
