//! Server configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use ember_engine::{
    DistanceFunction, EngineConfig, FsyncPolicy, HnswConfig, IndexingPolicy,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration.
///
/// Example YAML:
/// ```yaml
/// http_addr: "0.0.0.0:8080"
/// data_dir: "/var/lib/ember"
/// dimensions: 768
/// metric: cosine
/// index:
///   m: 16
///   ef_search: 100
///   policy: synchronous
/// storage:
///   fsync: batch
///   fsync_batch_ms: 5
/// embedding:
///   base_url: "http://localhost:11434"
///   model: "nomic-embed-text"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Directory for the record log and index snapshot
    pub data_dir: PathBuf,

    /// Vector dimension produced by the embedding model
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Metric the index is built with
    #[serde(default)]
    pub metric: DistanceFunction,

    /// Metric queries are ranked with; must equal `metric` when set
    #[serde(default)]
    pub search_metric: Option<DistanceFunction>,

    /// Per-request deadline for engine calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub index: IndexSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub embedding: EmbeddingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSection {
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// When false every search is an exact scan
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub policy: IndexingPolicy,

    /// Live node count below which searches use the exact scan
    #[serde(default)]
    pub exact_threshold: Option<usize>,

    #[serde(default = "default_rebuild_tombstone_ratio")]
    pub rebuild_tombstone_ratio: f64,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            max_layers: default_max_layers(),
            enabled: true,
            policy: IndexingPolicy::default(),
            exact_threshold: None,
            rebuild_tombstone_ratio: default_rebuild_tombstone_ratio(),
        }
    }
}

/// Record log fsync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncMode {
    Always,
    #[default]
    Batch,
    Os,
}

impl FromStr for FsyncMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "batch" => Ok(Self::Batch),
            "os" => Ok(Self::Os),
            other => Err(ConfigError::InvalidField(format!(
                "Unknown fsync mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub fsync: FsyncMode,

    /// Batch window, only used with `fsync: batch`
    #[serde(default = "default_fsync_batch_ms")]
    pub fsync_batch_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            fsync: FsyncMode::default(),
            fsync_batch_ms: default_fsync_batch_ms(),
        }
    }
}

impl StorageSection {
    pub fn fsync_policy(&self) -> FsyncPolicy {
        match self.fsync {
            FsyncMode::Always => FsyncPolicy::Always,
            FsyncMode::Batch => FsyncPolicy::Batch(Duration::from_millis(self.fsync_batch_ms)),
            FsyncMode::Os => FsyncPolicy::Os,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSection {
    /// Ollama base URL
    #[serde(default = "default_embedding_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            base_url: default_embedding_url(),
            model: default_embedding_model(),
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_dimensions() -> usize {
    768
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    200
}

fn default_ef_search() -> usize {
    100
}

fn default_max_layers() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_rebuild_tombstone_ratio() -> f64 {
    0.5
}

fn default_fsync_batch_ms() -> u64 {
    5
}

fn default_embedding_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_timeout_ms() -> u64 {
    10_000
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidField(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// A config with every default and the given data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            http_addr: default_http_addr(),
            data_dir: data_dir.into(),
            dimensions: default_dimensions(),
            metric: DistanceFunction::default(),
            search_metric: None,
            request_timeout_ms: default_request_timeout_ms(),
            index: IndexSection::default(),
            storage: StorageSection::default(),
            embedding: EmbeddingSection::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - EMBER_DATA_DIR (required)
    /// - EMBER_HTTP_ADDR
    /// - EMBER_DIMENSIONS
    /// - EMBER_METRIC, EMBER_SEARCH_METRIC
    /// - EMBER_REQUEST_TIMEOUT_MS
    /// - EMBER_INDEX_M, EMBER_INDEX_EF_CONSTRUCTION, EMBER_INDEX_EF_SEARCH,
    ///   EMBER_INDEX_ENABLED, EMBER_INDEX_POLICY
    /// - EMBER_FSYNC, EMBER_FSYNC_BATCH_MS
    /// - EMBER_EMBEDDING_URL, EMBER_EMBEDDING_MODEL, EMBER_EMBEDDING_TIMEOUT_MS
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("EMBER_DATA_DIR")
            .map_err(|_| ConfigError::MissingField("EMBER_DATA_DIR".to_string()))?;

        let mut config = Self::with_data_dir(data_dir);

        if let Ok(addr) = std::env::var("EMBER_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(d) = env_parse("EMBER_DIMENSIONS")? {
            config.dimensions = d;
        }
        if let Some(metric) = env_parse("EMBER_METRIC")? {
            config.metric = metric;
        }
        config.search_metric = env_parse("EMBER_SEARCH_METRIC")?;
        if let Some(ms) = env_parse("EMBER_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = ms;
        }

        if let Some(m) = env_parse("EMBER_INDEX_M")? {
            config.index.m = m;
        }
        if let Some(ef) = env_parse("EMBER_INDEX_EF_CONSTRUCTION")? {
            config.index.ef_construction = ef;
        }
        if let Some(ef) = env_parse("EMBER_INDEX_EF_SEARCH")? {
            config.index.ef_search = ef;
        }
        if let Some(enabled) = env_parse("EMBER_INDEX_ENABLED")? {
            config.index.enabled = enabled;
        }
        if let Ok(policy) = std::env::var("EMBER_INDEX_POLICY") {
            config.index.policy = match policy.trim().to_ascii_lowercase().as_str() {
                "synchronous" | "sync" => IndexingPolicy::Synchronous,
                "asynchronous" | "async" => IndexingPolicy::Asynchronous,
                other => {
                    return Err(ConfigError::InvalidField(format!(
                        "EMBER_INDEX_POLICY: unknown policy {}",
                        other
                    )))
                }
            };
        }

        if let Some(mode) = env_parse("EMBER_FSYNC")? {
            config.storage.fsync = mode;
        }
        if let Some(ms) = env_parse("EMBER_FSYNC_BATCH_MS")? {
            config.storage.fsync_batch_ms = ms;
        }

        if let Ok(url) = std::env::var("EMBER_EMBEDDING_URL") {
            config.embedding.base_url = url;
        }
        if let Ok(model) = std::env::var("EMBER_EMBEDDING_MODEL") {
            config.embedding.model = model;
        }
        if let Some(ms) = env_parse("EMBER_EMBEDDING_TIMEOUT_MS")? {
            config.embedding.timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidField(format!("Invalid http_addr: {}", e)))?;

        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(ConfigError::InvalidField(
                "data_dir exists but is not a directory".to_string(),
            ));
        }

        if self.dimensions == 0 {
            return Err(ConfigError::InvalidField(
                "dimensions must be > 0".to_string(),
            ));
        }

        if let Some(search_metric) = self.search_metric {
            if search_metric != self.metric {
                return Err(ConfigError::InvalidField(format!(
                    "search_metric {} does not match metric {}",
                    search_metric, self.metric
                )));
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidField(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.index.m < 2 {
            return Err(ConfigError::InvalidField("index.m must be >= 2".to_string()));
        }

        if !(self.index.rebuild_tombstone_ratio > 0.0 && self.index.rebuild_tombstone_ratio <= 1.0)
        {
            return Err(ConfigError::InvalidField(
                "index.rebuild_tombstone_ratio must be within (0, 1]".to_string(),
            ));
        }

        if self.storage.fsync == FsyncMode::Batch
            && !(1..=1000).contains(&self.storage.fsync_batch_ms)
        {
            return Err(ConfigError::InvalidField(
                "storage.fsync_batch_ms must be within 1..=1000".to_string(),
            ));
        }

        reqwest::Url::parse(&self.embedding.base_url).map_err(|e| {
            ConfigError::InvalidField(format!("Invalid embedding.base_url: {}", e))
        })?;

        if self.embedding.model.is_empty() {
            return Err(ConfigError::InvalidField(
                "embedding.model cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Engine settings derived from this config.
    pub fn engine_config(&self) -> EngineConfig {
        let hnsw = HnswConfig {
            m: self.index.m,
            m_max0: self.index.m * 2,
            ef_construction: self.index.ef_construction,
            ef_search: self.index.ef_search,
            max_layers: self.index.max_layers,
            ..HnswConfig::default()
        };

        EngineConfig {
            dimensions: self.dimensions,
            metric: self.metric,
            search_metric: self.search_metric,
            data_dir: Some(self.data_dir.clone()),
            hnsw,
            index_enabled: self.index.enabled,
            policy: self.index.policy,
            exact_threshold: self.index.exact_threshold,
            rebuild_tombstone_ratio: self.index.rebuild_tombstone_ratio,
            fsync: self.storage.fsync_policy(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}
