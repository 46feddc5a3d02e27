//! TOML configuration with environment overrides.
//!
//! Every section has defaults so a minimal (or missing) config file still
//! produces a usable [`Config`]. Secrets never live in the file: API keys
//! are read from the environment by the clients that need them.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::chunk::ChunkStrategy;
use crate::vector_store::Distance;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requests_per_minute: usize,
    #[serde(default)]
    pub tokens_per_minute: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            endpoint: None,
            api_version: default_api_version(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
            requests_per_minute: 0,
            tokens_per_minute: 0,
        }
    }
}

fn default_llm_provider() -> String {
    "azure-openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4.1".to_string()
}
fn default_api_version() -> String {
    "2024-10-21".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_retries() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the provider's base URL (Azure: the resource endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            url: None,
            api_version: default_api_version(),
        }
    }
}

fn default_embedding_provider() -> String {
    "jina".to_string()
}
fn default_embedding_model() -> String {
    "jina-clip-v2".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    /// Persistence file for the `memory` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub distance: Distance,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_qdrant_url(),
            path: None,
            collection: None,
            distance: Distance::default(),
        }
    }
}

fn default_backend() -> String {
    "qdrant".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_model")]
    pub model: String,
    #[serde(default = "default_mistral_url")]
    pub url: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            model: default_ocr_model(),
            url: default_mistral_url(),
            output_dir: default_output_dir(),
            timeout_secs: default_ocr_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_ocr_model() -> String {
    "mistral-ocr-latest".to_string()
}
fn default_mistral_url() -> String {
    "https://api.mistral.ai".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("data/processed")
}
fn default_ocr_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            overlap_chars: default_overlap_chars(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_overlap_chars() -> usize {
    1000
}
fn default_max_chars() -> usize {
    20000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_tool_delay_ms")]
    pub tool_delay_ms: u64,
    #[serde(default = "default_context_limit")]
    pub default_context_limit: usize,
    #[serde(default = "default_max_context_limit")]
    pub max_context_limit: usize,
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            tool_delay_ms: default_tool_delay_ms(),
            default_context_limit: default_context_limit(),
            max_context_limit: default_max_context_limit(),
            system_prompt_path: None,
            user_id: default_user_id(),
        }
    }
}

fn default_max_tool_rounds() -> usize {
    8
}
fn default_tool_delay_ms() -> u64 {
    500
}
fn default_context_limit() -> usize {
    3
}
fn default_max_context_limit() -> usize {
    20
}
fn default_user_id() -> String {
    "user_123".to_string()
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

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Per-target level directives, e.g. `reqwest = "error"`.
    #[serde(default = "default_log_targets")]
    pub targets: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            targets: default_log_targets(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_targets() -> BTreeMap<String, String> {
    ["hyper", "reqwest", "h2"]
        .into_iter()
        .map(|t| (t.to_string(), "error".to_string()))
        .collect()
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Whether the chat provider talks to an Azure OpenAI deployment.
    pub fn llm_is_azure(&self) -> bool {
        self.llm.provider == "azure-openai"
    }
}

/// Load the config file at `path`, falling back to defaults when the file
/// is missing and `allow_missing` is set. Environment overrides are applied
/// in both cases.
pub fn load_config_or_default(path: &Path, allow_missing: bool) -> Result<Config> {
    if allow_missing && !path.exists() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        validate(&config)?;
        return Ok(config);
    }
    load_config(path)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}

/// Apply the environment variables understood by the deployment scripts.
///
/// `lookup` is injected so tests don't have to mutate the process
/// environment.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(endpoint) = lookup("AZURE_OPENAI_ENDPOINT") {
        if config.llm_is_azure() && config.llm.endpoint.is_none() {
            config.llm.endpoint = Some(endpoint.clone());
        }
        if config.embedding.provider == "azure-openai" && config.embedding.url.is_none() {
            config.embedding.url = Some(endpoint);
        }
    }
    if let Some(version) = lookup("AZURE_OPENAI_API_VERSION") {
        config.llm.api_version = version.clone();
        config.embedding.api_version = version;
    }

    if let Some(url) = lookup("QDRANT_URL") {
        config.vector_store.backend = "qdrant".to_string();
        config.vector_store.url = match lookup("QDRANT_PORT") {
            Some(port) if !port.is_empty() => format!("{}:{}", url.trim_end_matches('/'), port),
            _ => url,
        };
    } else if let Some(path) = lookup("QDRANT_PATH_TO_DB") {
        config.vector_store.backend = "memory".to_string();
        config.vector_store.path = Some(PathBuf::from(path).join("collections.json"));
    }

    if let Some(collection) = lookup("QDRANT_COLLECTION") {
        config.vector_store.collection = Some(collection);
    }
}

fn validate(config: &Config) -> Result<()> {
    match config.llm.provider.as_str() {
        "azure-openai" | "openai" | "mistral" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be azure-openai, openai, or mistral.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    match config.embedding.provider.as_str() {
        "jina" | "openai" | "azure-openai" | "mistral" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be jina, openai, azure-openai, or mistral.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }

    match config.vector_store.backend.as_str() {
        "qdrant" | "memory" => {}
        other => anyhow::bail!(
            "Unknown vector_store backend: '{}'. Must be qdrant or memory.",
            other
        ),
    }

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    if config.agent.max_context_limit < 1 {
        anyhow::bail!("agent.max_context_limit must be >= 1");
    }
    if !(1..=config.agent.max_context_limit).contains(&config.agent.default_context_limit) {
        anyhow::bail!("agent.default_context_limit must be in [1, agent.max_context_limit]");
    }

    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        anyhow::bail!(
            "Invalid logging level: '{}'. Must be one of {}.",
            config.logging.level,
            LOG_LEVELS.join(", ")
        );
    }
    for (target, level) in &config.logging.targets {
        if !LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!("Invalid logging level: '{}' for target: '{}'", level, target);
        }
    }

    Ok(())
}
