//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or [`Config::default`]) is
//! a valid in-memory setup. The loaded `Config` is the template that the
//! workspace manager deep-clones into each engine instance.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::workspace::WorkspaceId;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Identifier used when a request names no workspace.
    #[serde(default = "default_workspace")]
    pub default: String,
    /// Upper bound on cached engine instances. Unset means unbounded.
    #[serde(default)]
    pub max_instances: Option<usize>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            default: default_workspace(),
            max_instances: None,
        }
    }
}

fn default_workspace() -> String {
    "default".to_string()
}

/// Storage backend for one storage kind.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root under which each workspace gets its own directory.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub kv: BackendKind,
    #[serde(default)]
    pub vector: BackendKind,
    #[serde(default)]
    pub graph: BackendKind,
    #[serde(default)]
    pub doc_status: BackendKind,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            kv: BackendKind::Memory,
            vector: BackendKind::Memory,
            graph: BackendKind::Memory,
            doc_status: BackendKind::Memory,
        }
    }
}

impl StorageConfig {
    /// Directory owned by `workspace`.
    pub fn workspace_dir(&self, workspace: &WorkspaceId) -> PathBuf {
        self.working_dir.join(workspace.as_str())
    }

    pub fn uses_sqlite(&self) -> bool {
        [self.kv, self.vector, self.graph, self.doc_status].contains(&BackendKind::Sqlite)
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("./rag_storage")
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
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Documents processed concurrently per engine instance.
    #[serde(default = "default_max_parallel_insert")]
    pub max_parallel_insert: usize,
    /// Extra extraction rounds per chunk after the first.
    #[serde(default = "default_max_gleaning")]
    pub max_gleaning: u32,
    #[serde(default = "default_true")]
    pub enable_llm_cache: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_insert: default_max_parallel_insert(),
            max_gleaning: default_max_gleaning(),
            enable_llm_cache: true,
        }
    }
}

fn default_max_parallel_insert() -> usize {
    2
}
fn default_max_gleaning() -> u32 {
    1
}
fn default_true() -> bool {
    true
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

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extractor")]
    pub provider: String,
    /// Free-form model arguments handed to the extractor.
    #[serde(default)]
    pub model_kwargs: BTreeMap<String, serde_json::Value>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_extractor(),
            model_kwargs: BTreeMap::new(),
        }
    }
}

fn default_extractor() -> String {
    "heuristic".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Limit on each embedding or extraction call.
    #[serde(default = "default_model_secs")]
    pub model_secs: u64,
    /// Limit on each storage call made by the pipeline.
    #[serde(default = "default_storage_secs")]
    pub storage_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            model_secs: default_model_secs(),
            storage_secs: default_storage_secs(),
        }
    }
}

fn default_model_secs() -> u64 {
    120
}
fn default_storage_secs() -> u64 {
    60
}

impl Config {
    /// Check value ranges and cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        WorkspaceId::parse(&self.workspace.default)
            .map_err(|e| anyhow::anyhow!("workspace.default: {}", e))?;

        if self.workspace.max_instances == Some(0) {
            bail!("workspace.max_instances must be >= 1 when set");
        }
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.pipeline.max_parallel_insert == 0 {
            bail!("pipeline.max_parallel_insert must be >= 1");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        if self.timeouts.model_secs == 0 || self.timeouts.storage_secs == 0 {
            bail!("timeouts must be > 0 seconds");
        }

        match self.embedding.provider.as_str() {
            "hash" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
                other
            ),
        }

        match self.extraction.provider.as_str() {
            "heuristic" => {}
            other => bail!(
                "Unknown extraction provider: '{}'. Built-in providers: heuristic.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
