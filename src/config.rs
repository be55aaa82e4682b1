//! Configuration parsing, environment overrides and validation.
//!
//! Configuration is read from an optional TOML file (default
//! `config/welearn.toml`). A missing file yields the defaults below; the
//! deployment environment variables are then layered on top, and the
//! result is validated.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! client_origins_regex = "https://.*\\.welearn\\.example"
//!
//! [qdrant]
//! host = "localhost"
//! port = 6333
//!
//! [postgres]
//! driver = "postgresql"
//! host = "localhost"
//! database = "welearn"
//!
//! [embedding]
//! provider = "local"
//!
//! [chat.llm]
//! provider = "azure"
//! base_url = "https://my-resource.openai.azure.com"
//! model = "gpt-4o-mini"
//! ```
//!
//! # Environment overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `QDRANT_HOST` / `QDRANT_PORT` / `QDRANT_API_KEY` | `qdrant.*` |
//! | `PG_USER` / `PG_PASSWORD` / `PG_HOST` / `PG_PORT` / `PG_DATABASE` / `PG_DRIVER` | `postgres.*` |
//! | `AZURE_API_BASE` / `AZURE_API_KEY` / `AZURE_API_VERSION` | `chat.llm.*` |
//! | `AZURE_MISTRAL_API_BASE` / `AZURE_MISTRAL_API_KEY` | `tutor.llm.*` |
//! | `CLIENT_ORIGINS_REGEX` | `server.client_origins_regex` |
//! | `CORPUS` | `search.default_corpus` |
//! | `DATA_COLLECTION_ORIGIN_PREFIX` | `data_collection.origin_prefix` |
//! | `BIND_ADDR` | `server.bind` |

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub qdrant: QdrantConfig,
    pub postgres: PostgresConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub chat: ChatConfig,
    pub tutor: TutorConfig,
    pub agent: AgentConfig,
    pub data_collection: DataCollectionConfig,
}

// ============ Server ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub api_v1_prefix: String,
    pub project_name: String,
    pub semver: String,
    /// Origins allowed by CORS. Empty allows none.
    pub client_origins_regex: String,
    /// Require a valid `X-API-Key` on `/api/v1/*`.
    pub require_api_key: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_v1_prefix: "/api/v1".to_string(),
            project_name: "WeLearn".to_string(),
            semver: "0.1.0".to_string(),
            client_origins_regex: String::new(),
            require_api_key: true,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============ Backends ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6333,
            https: false,
            api_key: None,
            timeout_secs: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub driver: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub database: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            driver: "postgresql".to_string(),
            user: None,
            password: None,
            host: Some("localhost".to_string()),
            port: None,
            database: "welearn".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local`, `openai` or `ollama`.
    pub provider: String,
    /// Default model; collections override it with their own model.
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Capacity of the `(model, text)` query embedding cache.
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            cache_size: 1024,
        }
    }
}

// ============ Services ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_corpus: String,
    pub collection_prefix: String,
    pub score_threshold: f32,
    /// JSON object mapping a lowercase subject to its embedding.
    pub subject_vectors_path: Option<PathBuf>,
    /// Collection searched by the micro-learning journey.
    pub journey_collection: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_corpus: "conversation".to_string(),
            collection_prefix: "collection_welearn_".to_string(),
            score_threshold: 0.5,
            subject_vectors_path: None,
            journey_collection: "collection_welearn_en_all-minilm-l6-v2".to_string(),
        }
    }
}

/// An OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `azure` or `openai`.
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    /// Model name, or deployment name for Azure.
    pub model: String,
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
    pub max_tries: u32,
    pub max_time_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "azure".to_string(),
            base_url: String::new(),
            api_key: None,
            api_version: Some("2024-02-15-preview".to_string()),
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            timeout_secs: 120,
            max_tries: 5,
            max_time_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_sources: usize,
    pub llm: LlmConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_sources: 7,
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TutorConfig {
    pub nb_results: usize,
    pub llm: LlmConfig,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            nb_results: 10,
            llm: LlmConfig {
                model: "Mistral-Large-2411".to_string(),
                api_version: Some("2024-05-01-preview".to_string()),
                ..LlmConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub history_size: usize,
    /// Threads kept in memory; the least recently used is evicted past this.
    pub max_threads: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 4,
            history_size: 5,
            max_threads: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCollectionConfig {
    /// Stripped request origins starting with this prefix are collected.
    pub origin_prefix: String,
}

// ============ Loading ============

/// Load, override and validate the configuration.
///
/// A non-existent `path` is not an error: defaults are used.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Layer deployment variables over `config`. `lookup` returns the value of
/// an environment variable, or `None` when it is unset.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

    if let Some(v) = get("QDRANT_HOST") {
        config.qdrant.host = v;
    }
    if let Some(v) = get("QDRANT_PORT").and_then(|v| v.parse().ok()) {
        config.qdrant.port = v;
    }
    if let Some(v) = get("QDRANT_API_KEY") {
        config.qdrant.api_key = Some(v);
    }

    if let Some(v) = get("PG_USER") {
        config.postgres.user = Some(v);
    }
    if let Some(v) = get("PG_PASSWORD") {
        config.postgres.password = Some(v);
    }
    if let Some(v) = get("PG_HOST") {
        config.postgres.host = Some(v);
    }
    if let Some(v) = get("PG_PORT") {
        config.postgres.port = Some(v);
    }
    if let Some(v) = get("PG_DATABASE") {
        config.postgres.database = v;
    }
    if let Some(v) = get("PG_DRIVER") {
        config.postgres.driver = v;
    }

    if let Some(v) = get("AZURE_API_BASE") {
        config.chat.llm.base_url = v;
    }
    if let Some(v) = get("AZURE_API_KEY") {
        config.chat.llm.api_key = Some(v);
    }
    if let Some(v) = get("AZURE_API_VERSION") {
        config.chat.llm.api_version = Some(v);
    }
    if let Some(v) = get("AZURE_MISTRAL_API_BASE") {
        config.tutor.llm.base_url = v;
    }
    if let Some(v) = get("AZURE_MISTRAL_API_KEY") {
        config.tutor.llm.api_key = Some(v);
    }

    if let Some(v) = get("CLIENT_ORIGINS_REGEX") {
        config.server.client_origins_regex = v;
    }
    if let Some(v) = get("CORPUS") {
        config.search.default_corpus = v;
    }
    if let Some(v) = get("DATA_COLLECTION_ORIGIN_PREFIX") {
        config.data_collection.origin_prefix = v;
    }
    if let Some(v) = get("BIND_ADDR") {
        config.server.bind = v;
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.qdrant.port == 0 {
        bail!("qdrant.port must be > 0");
    }
    if !(0.0..=1.0).contains(&config.search.score_threshold) {
        bail!("search.score_threshold must be in [0.0, 1.0]");
    }
    for (name, llm) in [("chat.llm", &config.chat.llm), ("tutor.llm", &config.tutor.llm)] {
        if llm.max_tries < 1 {
            bail!("{}.max_tries must be >= 1", name);
        }
        match llm.provider.as_str() {
            "azure" | "openai" => {}
            other => bail!(
                "Unknown {} provider: '{}'. Must be azure or openai.",
                name,
                other
            ),
        }
    }
    let prefix = &config.server.api_v1_prefix;
    if prefix.len() < 2 || !prefix.starts_with('/') || prefix.ends_with('/') {
        bail!("server.api_v1_prefix must look like '/api/v1'");
    }
    if config.agent.max_threads == 0 {
        bail!("agent.max_threads must be >= 1");
    }
    if config.agent.max_steps == 0 {
        bail!("agent.max_steps must be >= 1");
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or local.",
            other
        ),
    }
    if !config.server.client_origins_regex.is_empty() {
        regex::Regex::new(&config.server.client_origins_regex)
            .with_context(|| "server.client_origins_regex is not a valid regex")?;
    }
    Ok(())
}

impl Config {
    /// SQLAlchemy-style URL: `{driver}://{user}:{password}@{host}:{port}/{database}`.
    ///
    /// A `+dialect` suffix on the driver is dropped; empty parts are omitted.
    pub fn postgres_url(&self) -> String {
        let pg = &self.postgres;
        let scheme = pg.driver.split('+').next().unwrap_or("postgresql");
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());

        let mut url = format!("{}://", scheme);
        if let Some(user) = non_empty(&pg.user) {
            url.push_str(&user);
            if let Some(password) = non_empty(&pg.password) {
                url.push(':');
                url.push_str(&password);
            }
            url.push('@');
        }
        if let Some(host) = non_empty(&pg.host) {
            url.push_str(&host);
        }
        if let Some(port) = non_empty(&pg.port) {
            url.push(':');
            url.push_str(&port);
        }
        url.push('/');
        url.push_str(&pg.database);
        url
    }

    /// Base URL of the Qdrant REST API. A scheme already present in
    /// `qdrant.host` is kept.
    pub fn qdrant_url(&self) -> String {
        let host = self.qdrant.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, self.qdrant.port)
        } else {
            let scheme = if self.qdrant.https { "https" } else { "http" };
            format!("{}://{}:{}", scheme, host, self.qdrant.port)
        }
    }

    /// TOML rendering with secrets masked.
    pub fn redacted(&self) -> Result<String> {
        let mut copy = self.clone();
        let mask = |v: &mut Option<String>| {
            if v.as_deref().is_some_and(|s| !s.is_empty()) {
                *v = Some("********".to_string());
            }
        };
        mask(&mut copy.qdrant.api_key);
        mask(&mut copy.postgres.password);
        mask(&mut copy.chat.llm.api_key);
        mask(&mut copy.tutor.llm.api_key);
        toml::to_string_pretty(&copy).with_context(|| "Failed to render config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.server.bind, "0.0.0.0:8080");
        assert_eq!(c.server.api_v1_prefix, "/api/v1");
        assert_eq!(c.search.score_threshold, 0.5);
        assert_eq!(c.search.collection_prefix, "collection_welearn_");
        assert_eq!(c.chat.max_sources, 7);
        assert_eq!(c.agent.max_steps, 4);
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        apply_env_overrides(
            &mut c,
            env(&[
                ("QDRANT_HOST", "qdrant.internal"),
                ("QDRANT_PORT", "6334"),
                ("PG_DATABASE", "wl"),
                ("AZURE_API_BASE", "https://azure.example"),
                ("CLIENT_ORIGINS_REGEX", "https://.*"),
                ("CORPUS", "ted"),
            ]),
        );
        assert_eq!(c.qdrant.host, "qdrant.internal");
        assert_eq!(c.qdrant.port, 6334);
        assert_eq!(c.postgres.database, "wl");
        assert_eq!(c.chat.llm.base_url, "https://azure.example");
        assert_eq!(c.server.client_origins_regex, "https://.*");
        assert_eq!(c.search.default_corpus, "ted");
    }

    #[test]
    fn test_postgres_url() {
        let mut c = Config::default();
        c.postgres.driver = "postgresql+psycopg2".into();
        c.postgres.user = Some("u".into());
        c.postgres.password = Some("p".into());
        c.postgres.host = Some("db".into());
        c.postgres.port = Some("5432".into());
        c.postgres.database = "welearn".into();
        assert_eq!(c.postgres_url(), "postgresql://u:p@db:5432/welearn");

        c.postgres.user = Some(String::new());
        c.postgres.port = None;
        assert_eq!(c.postgres_url(), "postgresql://db/welearn");
    }

    #[test]
    fn test_qdrant_url() {
        let mut c = Config::default();
        assert_eq!(c.qdrant_url(), "http://localhost:6333");
        c.qdrant.host = "https://cloud.qdrant.io".into();
        assert_eq!(c.qdrant_url(), "https://cloud.qdrant.io:6333");
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut c = Config::default();
        c.chat.llm.api_key = Some("secret-key".into());
        c.postgres.password = Some("hunter2".into());
        let out = c.redacted().unwrap();
        assert!(!out.contains("secret-key"));
        assert!(!out.contains("hunter2"));
        assert!(out.contains("********"));
    }

    #[test]
    fn test_validation_errors() {
        let mut c = Config::default();
        c.search.score_threshold = 1.5;
        assert!(validate(&c).is_err());

        let mut c = Config::default();
        c.embedding.provider = "word2vec".into();
        assert!(validate(&c).unwrap_err().to_string().contains("word2vec"));

        let mut c = Config::default();
        c.server.client_origins_regex = "(".into();
        assert!(validate(&c).is_err());

        let mut c = Config::default();
        c.chat.llm.max_tries = 0;
        assert!(validate(&c).is_err());

        let mut c = Config::default();
        c.agent.max_threads = 0;
        assert!(validate(&c).unwrap_err().to_string().contains("max_threads"));
    }

    #[test]
    fn test_load_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[search]\nscore_threshold = 0.3\n\n[chat]\nmax_sources = 3").unwrap();
        let c: Config = toml::from_str(&std::fs::read_to_string(f.path()).unwrap()).unwrap();
        assert_eq!(c.search.score_threshold, 0.3);
        assert_eq!(c.chat.max_sources, 3);
        assert_eq!(c.qdrant.port, 6333);
    }
}
