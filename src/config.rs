//! Configuration loading and validation.
//!
//! Configuration lives in `config.json` under the data directory (default
//! `$HOME/.mem-oracle`). Missing keys fall back to defaults; unknown keys
//! are rejected; out-of-range values are collected and reported together in
//! a single startup error rather than one at a time.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
    /// Root data directory for the cache, vectors, and metadata database.
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub worker: WorkerConfig,
    pub crawler: CrawlerConfig,
    pub hybrid: HybridConfig,
    pub retrieval: RetrievalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            worker: WorkerConfig::default(),
            crawler: CrawlerConfig::default(),
            hybrid: HybridConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mem-oracle")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EmbeddingConfig {
    /// One of `local`, `openai`, `voyage`, `cohere`.
    pub provider: String,
    /// Model name for remote providers; each provider has a default.
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Override the provider's API base URL.
    pub api_base: Option<String>,
    /// Texts per remote embedding request.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
            api_key: None,
            api_base: None,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct VectorStoreConfig {
    /// One of `local`, `qdrant`, `pinecone`. Only `local` is implemented;
    /// the remote values pass validation but fail at construction.
    pub provider: String,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub collection_prefix: Option<String>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            url: None,
            api_key: None,
            collection_prefix: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WorkerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: 7432,
            host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CrawlerConfig {
    /// Concurrent workers per docset.
    pub concurrency: usize,
    /// Minimum milliseconds between fetches to one docset's host.
    pub request_delay: u64,
    /// Per-fetch timeout in milliseconds.
    pub timeout: u64,
    /// Hard cap on pages per docset.
    pub max_pages: usize,
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            request_delay: 500,
            timeout: 30_000,
            max_pages: 1000,
            user_agent: format!("mem-oracle/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HybridConfig {
    /// When false, search is vector-only.
    pub enabled: bool,
    /// Weight of the vector score in the hybrid fusion.
    pub alpha: f64,
    /// Candidates taken from the vector phase before fusion.
    pub vector_top_k: usize,
    /// Candidates taken from the keyword phase before fusion.
    pub keyword_top_k: usize,
    /// Keyword results below this score are dropped before fusion.
    pub min_keyword_score: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.7,
            vector_top_k: 50,
            keyword_top_k: 50,
            min_keyword_score: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RetrievalConfig {
    /// Diversity cap: admitted results per `(docset, page)`.
    pub max_chunks_per_page: usize,
    /// Budget cap: total characters across admitted results.
    pub max_total_chars: usize,
    /// Attach formatted snippets to results.
    pub format_snippets: bool,
    /// Upper bound on a single snippet's content length.
    pub snippet_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_page: 3,
            max_total_chars: 12_000,
            format_snippets: true,
            snippet_max_chars: 1500,
        }
    }
}

/// Load `config.json` from `path`, or fall back to defaults when the file
/// does not exist. Unknown keys and out-of-range values are fatal; every
/// offending field is reported in one error.
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

/// Check every configured value against its allowed range, collecting all
/// violations before failing.
pub fn validate(config: &Config) -> Result<()> {
    let mut problems: Vec<String> = Vec::new();

    match config.embedding.provider.as_str() {
        "local" | "openai" | "voyage" | "cohere" => {}
        other => problems.push(format!(
            "embedding.provider must be local, openai, voyage, or cohere (got '{}')",
            other
        )),
    }
    if !(1..=1000).contains(&config.embedding.batch_size) {
        problems.push(format!(
            "embedding.batchSize must be in [1, 1000] (got {})",
            config.embedding.batch_size
        ));
    }
    if let Some(base) = &config.embedding.api_base {
        if url::Url::parse(base).is_err() {
            problems.push(format!("embedding.apiBase is not a valid URL: '{}'", base));
        }
    }

    match config.vector_store.provider.as_str() {
        "local" | "qdrant" | "pinecone" => {}
        other => problems.push(format!(
            "vectorStore.provider must be local, qdrant, or pinecone (got '{}')",
            other
        )),
    }

    if config.worker.port == 0 {
        problems.push("worker.port must be in [1, 65535]".to_string());
    }

    if !(1..=50).contains(&config.crawler.concurrency) {
        problems.push(format!(
            "crawler.concurrency must be in [1, 50] (got {})",
            config.crawler.concurrency
        ));
    }
    if config.crawler.request_delay > 60_000 {
        problems.push(format!(
            "crawler.requestDelay must be in [0, 60000] ms (got {})",
            config.crawler.request_delay
        ));
    }
    if !(1000..=120_000).contains(&config.crawler.timeout) {
        problems.push(format!(
            "crawler.timeout must be in [1000, 120000] ms (got {})",
            config.crawler.timeout
        ));
    }
    if !(1..=100_000).contains(&config.crawler.max_pages) {
        problems.push(format!(
            "crawler.maxPages must be in [1, 100000] (got {})",
            config.crawler.max_pages
        ));
    }

    if !(0.0..=1.0).contains(&config.hybrid.alpha) {
        problems.push(format!(
            "hybrid.alpha must be in [0.0, 1.0] (got {})",
            config.hybrid.alpha
        ));
    }
    if !(1..=1000).contains(&config.hybrid.vector_top_k) {
        problems.push(format!(
            "hybrid.vectorTopK must be in [1, 1000] (got {})",
            config.hybrid.vector_top_k
        ));
    }
    if !(1..=1000).contains(&config.hybrid.keyword_top_k) {
        problems.push(format!(
            "hybrid.keywordTopK must be in [1, 1000] (got {})",
            config.hybrid.keyword_top_k
        ));
    }
    if !(0.0..=1.0).contains(&config.hybrid.min_keyword_score) {
        problems.push(format!(
            "hybrid.minKeywordScore must be in [0.0, 1.0] (got {})",
            config.hybrid.min_keyword_score
        ));
    }

    if !(1..=20).contains(&config.retrieval.max_chunks_per_page) {
        problems.push(format!(
            "retrieval.maxChunksPerPage must be in [1, 20] (got {})",
            config.retrieval.max_chunks_per_page
        ));
    }
    if !(1000..=500_000).contains(&config.retrieval.max_total_chars) {
        problems.push(format!(
            "retrieval.maxTotalChars must be in [1000, 500000] (got {})",
            config.retrieval.max_total_chars
        ));
    }
    if !(100..=10_000).contains(&config.retrieval.snippet_max_chars) {
        problems.push(format!(
            "retrieval.snippetMaxChars must be in [100, 10000] (got {})",
            config.retrieval.snippet_max_chars
        ));
    }

    if !problems.is_empty() {
        bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }
    Ok(())
}

impl Config {
    /// Path of the metadata database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("metadata.sqlite")
    }

    /// Root directory for cached page bodies.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Root directory for persisted vector namespaces.
    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Path of the configuration file inside a data directory.
    pub fn config_path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn unknown_keys_rejected() {
        let raw = r#"{ "dataDir": "/tmp/x", "crawlSpeed": 9 }"#;
        let parsed: Result<Config, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn partial_config_merges_defaults() {
        let raw = r#"{ "crawler": { "concurrency": 2 } }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.crawler.concurrency, 2);
        assert_eq!(config.crawler.max_pages, 1000);
        assert_eq!(config.worker.port, 7432);
    }

    #[test]
    fn out_of_range_values_are_aggregated() {
        let mut config = Config::default();
        config.crawler.concurrency = 0;
        config.hybrid.alpha = 1.5;
        config.retrieval.max_chunks_per_page = 99;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("crawler.concurrency"));
        assert!(err.contains("hybrid.alpha"));
        assert!(err.contains("retrieval.maxChunksPerPage"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut config = Config::default();
        config.embedding.provider = "bedrock".to_string();
        assert!(validate(&config).is_err());
    }
}
