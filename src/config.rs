//! TOML configuration parsing and validation.
//!
//! A single file (default `./config/docindex.toml`) drives every command.
//! Secrets may be supplied through the environment instead of the file:
//! `OPENAI_API_KEY` for OpenAI embeddings and synthesis, `MYSCALE_PASSWORD`
//! for the MyScale store.
//!
//! ```toml
//! [source]
//! root = "./docs.myscale.com"
//!
//! [embedding]
//! provider = "local"
//! model = "all-minilm-l6-v2"
//!
//! [store]
//! backend = "myscale"
//!
//! [store.myscale]
//! host = "msc-xxxx.us-east-1.aws.myscale.com"
//! username = "default"
//!
//! [synthesis]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docindex_core::retrieve::QueryMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string()]
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
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
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
            batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
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
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default)]
    pub myscale: Option<MyScaleConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite: None,
            myscale: None,
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MyScaleConfig {
    pub host: String,
    #[serde(default = "default_myscale_port")]
    pub port: u16,
    pub username: String,
    /// Falls back to `MYSCALE_PASSWORD` when absent.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default = "default_myscale_database")]
    pub database: String,
    #[serde(default = "default_myscale_table")]
    pub table: String,
    #[serde(default = "default_myscale_metric")]
    pub metric: String,
    #[serde(default = "default_myscale_index_type")]
    pub index_type: String,
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    #[serde(default = "default_myscale_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl MyScaleConfig {
    /// Password from the config file, else from `MYSCALE_PASSWORD`.
    pub fn resolved_password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| std::env::var("MYSCALE_PASSWORD").ok())
    }
}

fn default_myscale_port() -> u16 {
    443
}
fn default_true() -> bool {
    true
}
fn default_myscale_database() -> String {
    "default".to_string()
}
fn default_myscale_table() -> String {
    "llama_index".to_string()
}
fn default_myscale_metric() -> String {
    "cosine".to_string()
}
fn default_myscale_index_type() -> String {
    "MSTG".to_string()
}
fn default_insert_batch_size() -> usize {
    32
}
fn default_myscale_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_mode")]
    pub mode: QueryMode,
    #[serde(default = "default_top_k")]
    pub similarity_top_k: usize,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_amplify_ratio")]
    pub amplify_ratio: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            similarity_top_k: default_top_k(),
            hybrid_alpha: default_hybrid_alpha(),
            amplify_ratio: default_amplify_ratio(),
        }
    }
}

fn default_mode() -> QueryMode {
    QueryMode::Hybrid
}
fn default_top_k() -> usize {
    20
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_amplify_ratio() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: 0.0,
            max_context_chars: default_max_context_chars(),
            max_retries: default_max_retries(),
            timeout_secs: default_synthesis_timeout_secs(),
        }
    }
}

impl SynthesisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_max_context_chars() -> usize {
    12_000
}
fn default_synthesis_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_load_concurrency")]
    pub load_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            load_concurrency: default_load_concurrency(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_workers() -> usize {
    4
}
fn default_load_concurrency() -> usize {
    8
}

impl Config {
    /// In-code configuration: current directory as source, in-memory store,
    /// embeddings and synthesis disabled.
    pub fn minimal() -> Self {
        Self {
            source: SourceConfig {
                root: PathBuf::from("."),
                extensions: default_extensions(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            store: StoreConfig {
                backend: "memory".to_string(),
                sqlite: None,
                myscale: None,
            },
            retrieval: RetrievalConfig::default(),
            synthesis: SynthesisConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    /// Check cross-field rules that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.source.extensions.is_empty() {
            bail!("source.extensions must list at least one extension");
        }

        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }

        if self.retrieval.similarity_top_k < 1 {
            bail!("retrieval.similarity_top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
        }
        if self.retrieval.amplify_ratio < 1 {
            bail!("retrieval.amplify_ratio must be >= 1");
        }

        if self.batch.batch_size < 1 {
            bail!("batch.batch_size must be >= 1");
        }
        if self.batch.workers < 1 {
            bail!("batch.workers must be >= 1");
        }
        if self.batch.load_concurrency < 1 {
            bail!("batch.load_concurrency must be >= 1");
        }

        let emb = &self.embedding;
        if emb.batch_size < 1 {
            bail!("embedding.batch_size must be >= 1");
        }
        match emb.provider.as_str() {
            "disabled" => {}
            "local" => crate::embedding::check_local_model(emb)?,
            "hash" => {
                if emb.dims.unwrap_or(0) == 0 {
                    bail!("embedding.dims must be > 0 when provider is 'hash'");
                }
            }
            "openai" | "ollama" => {
                if emb.dims.unwrap_or(0) == 0 {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        emb.provider
                    );
                }
                if emb.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        emb.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, hash, local, openai, or ollama.",
                other
            ),
        }

        match self.store.backend.as_str() {
            "memory" => {}
            "sqlite" => {
                if self.store.sqlite.is_none() {
                    bail!("store.backend = 'sqlite' requires a [store.sqlite] section with `path`");
                }
            }
            "myscale" => {
                let ms = self.store.myscale.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("store.backend = 'myscale' requires a [store.myscale] section")
                })?;
                if ms.host.trim().is_empty() {
                    bail!("store.myscale.host must not be empty");
                }
                if ms.username.trim().is_empty() {
                    bail!("store.myscale.username must not be empty");
                }
                if ms.insert_batch_size < 1 {
                    bail!("store.myscale.insert_batch_size must be >= 1");
                }
                match ms.metric.to_lowercase().as_str() {
                    "cosine" | "l2" | "ip" => {}
                    other => bail!(
                        "Unknown store.myscale.metric: '{}'. Must be cosine, l2, or ip.",
                        other
                    ),
                }
            }
            other => bail!(
                "Unknown store backend: '{}'. Must be sqlite, myscale, or memory.",
                other
            ),
        }

        let syn = &self.synthesis;
        match syn.provider.as_str() {
            "disabled" => {}
            "openai" | "ollama" => {
                if syn.model.is_none() {
                    bail!(
                        "synthesis.model must be specified when provider is '{}'",
                        syn.provider
                    );
                }
                if syn.max_context_chars < 256 {
                    bail!("synthesis.max_context_chars must be >= 256");
                }
            }
            other => bail!(
                "Unknown synthesis provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[source]
root = "./docs"

[store.sqlite]
path = "./data/docindex.sqlite"
"#;

    #[test]
    fn defaults_fill_in() {
        let cfg = parse_config(BASE).unwrap();
        assert_eq!(cfg.source.extensions, vec!["md"]);
        assert_eq!(cfg.store.backend, "sqlite");
        assert_eq!(cfg.retrieval.mode, QueryMode::Hybrid);
        assert_eq!(cfg.retrieval.similarity_top_k, 20);
        assert_eq!(cfg.batch.batch_size, 100);
        assert_eq!(cfg.batch.workers, 4);
        assert!(!cfg.embedding.is_enabled());
        assert!(!cfg.synthesis.is_enabled());
    }

    #[test]
    fn rejects_alpha_out_of_range() {
        let toml = format!("{}\n[retrieval]\nhybrid_alpha = 1.5\n", BASE);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));
    }

    #[test]
    fn hash_provider_needs_dims() {
        let toml = format!("{}\n[embedding]\nprovider = \"hash\"\n", BASE);
        assert!(parse_config(&toml).is_err());
        let toml = format!("{}\n[embedding]\nprovider = \"hash\"\ndims = 64\n", BASE);
        assert!(parse_config(&toml).is_ok());
    }

    #[test]
    fn openai_needs_model() {
        let toml = format!("{}\n[embedding]\nprovider = \"openai\"\ndims = 1536\n", BASE);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn myscale_backend_needs_section() {
        let toml = "[source]\nroot = \".\"\n[store]\nbackend = \"myscale\"\n";
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("[store.myscale]"));
    }

    #[test]
    fn myscale_section_parses_with_defaults() {
        let toml = r#"
[source]
root = "."

[store]
backend = "myscale"

[store.myscale]
host = "example.myscale.cloud"
username = "default"
password = "secret"
"#;
        let cfg = parse_config(toml).unwrap();
        let ms = cfg.store.myscale.unwrap();
        assert_eq!(ms.port, 443);
        assert!(ms.secure);
        assert_eq!(ms.table, "llama_index");
        assert_eq!(ms.resolved_password().as_deref(), Some("secret"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let toml = format!("{}\n[retrieval]\nmode = \"fuzzy\"\n", BASE);
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn example_config_parses() {
        let cfg = parse_config(include_str!("../config/docindex.example.toml")).unwrap();
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.store.backend, "sqlite");
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    #[test]
    fn local_model_must_be_loadable() {
        let mut cfg = Config::minimal();
        cfg.embedding.provider = "local".to_string();
        cfg.validate().unwrap();
        cfg.embedding.model = Some("all-mpnet-base-v2".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn minimal_is_valid() {
        Config::minimal().validate().unwrap();
    }
}
