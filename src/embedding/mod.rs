//! Query embedding backends.
//!
//! Each vector collection is embedded with its own model
//! (`collection_welearn_{lang}_{model}`), so every call names the model
//! explicitly and it overrides `embedding.model` from the configuration.
//!
//! - **[`OpenAIProvider`]** calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]** calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`LocalProvider`]** runs fastembed models in-process; no network calls after model download.
//!
//! [`ProviderEmbedder`] dispatches on `embedding.provider`, and
//! [`QueryEmbedder`] puts a bounded `(model, text)` cache in front of any
//! [`Embedder`].
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use welearn_core::vector::EmbeddingProvider;

use crate::config::EmbeddingConfig;
use crate::error::ApiError;

/// Turns a text into a vector with a named model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_openai(config: &EmbeddingConfig, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_openai_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("OpenAI API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("OpenAI API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_ollama(config: &EmbeddingConfig, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/api/embed", url))
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_ollama_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("Ollama API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("Ollama API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    url,
                    e
                ));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("Ollama embedding failed after retries")))
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ Local Provider (fastembed) ============

const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

/// Dimensionality of the local models we know about.
fn local_model_dims(name: &str) -> Option<usize> {
    match name {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => Some(384),
        "bge-base-en-v1.5"
        | "nomic-embed-text-v1"
        | "nomic-embed-text-v1.5"
        | "multilingual-e5-base"
        | "paraphrase-multilingual-mpnet-base-v2" => Some(768),
        "bge-large-en-v1.5" | "multilingual-e5-large" => Some(1024),
        _ => None,
    }
}

/// Embedding provider for in-process inference. Models are downloaded on
/// first use from Hugging Face and cached on disk.
pub struct LocalProvider {
    model_name: String,
    dims: usize,
}

impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
        let dims = match config.dims.or_else(|| local_model_dims(&model_name)) {
            Some(d) => d,
            None => return Err(model_not_found(&model_name)),
        };
        Ok(Self { model_name, dims })
    }
}

impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn model_not_found(name: &str) -> anyhow::Error {
    ApiError::ModelNotFound(format!("Embedding model '{}' not found", name)).into()
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        "paraphrase-multilingual-mpnet-base-v2" => {
            Ok(fastembed::EmbeddingModel::ParaphraseMLMpnetBaseV2)
        }
        other => Err(model_not_found(other)),
    }
}

/// Loaded fastembed models, one per model name.
#[cfg(feature = "local-embeddings-fastembed")]
type LocalModels = Arc<Mutex<HashMap<String, Arc<Mutex<fastembed::TextEmbedding>>>>>;

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(
    models: &LocalModels,
    config: &EmbeddingConfig,
    model_name: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let fastembed_model = config_to_fastembed_model(model_name)?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();
    let models = Arc::clone(models);
    let model_name = model_name.to_string();

    tokio::task::spawn_blocking(move || {
        let model = {
            let mut loaded = models
                .lock()
                .map_err(|_| anyhow!("local model registry lock poisoned"))?;
            match loaded.get(&model_name) {
                Some(m) => Arc::clone(m),
                None => {
                    let m = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(fastembed_model)
                            .with_show_download_progress(false),
                    )
                    .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                    let m = Arc::new(Mutex::new(m));
                    loaded.insert(model_name.clone(), Arc::clone(&m));
                    m
                }
            }
        };

        let mut model = model
            .lock()
            .map_err(|_| anyhow!("local model lock poisoned"))?;
        let embeddings = model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow!("Local embedding failed: {}", e))?;

        Ok(embeddings)
    })
    .await?
}

/// Instantiate the configured provider, validating its settings.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | [`LocalProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Dispatch ============

/// [`Embedder`] backed by the configured provider.
pub struct ProviderEmbedder {
    config: EmbeddingConfig,
    #[cfg(feature = "local-embeddings-fastembed")]
    local_models: LocalModels,
}

impl ProviderEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "local-embeddings-fastembed")]
            local_models: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Embed a batch with `model`, which overrides `embedding.model`.
    pub async fn embed_texts(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.config.provider.as_str() {
            "openai" => embed_openai(&self.config, model, texts).await,
            "ollama" => embed_ollama(&self.config, model, texts).await,
            #[cfg(feature = "local-embeddings-fastembed")]
            "local" => embed_local_fastembed(&self.local_models, &self.config, model, texts).await,
            #[cfg(not(feature = "local-embeddings-fastembed"))]
            "local" => bail!(
                "Local embedding provider requires --features local-embeddings-fastembed"
            ),
            other => bail!("Unknown embedding provider: {}", other),
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_texts(model, &[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }
}

// ============ Cache ============

#[derive(Default)]
struct CacheState {
    entries: HashMap<(String, String), Arc<Vec<f32>>>,
    order: VecDeque<(String, String)>,
}

/// Bounded `(model, text)` cache in front of an [`Embedder`]. The least
/// recently used entry is evicted first.
pub struct QueryEmbedder {
    inner: Arc<dyn Embedder>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl QueryEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &(String, String)) -> Result<Option<Arc<Vec<f32>>>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("embedding cache lock poisoned"))?;
        let hit = state.entries.get(key).cloned();
        if hit.is_some() {
            if let Some(pos) = state.order.iter().position(|k| k == key) {
                if let Some(k) = state.order.remove(pos) {
                    state.order.push_back(k);
                }
            }
        }
        Ok(hit)
    }

    fn store(&self, key: (String, String), value: Arc<Vec<f32>>) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("embedding cache lock poisoned"))?;
        if state.entries.insert(key.clone(), value).is_none() {
            state.order.push_back(key);
        }
        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for QueryEmbedder {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let key = (model.to_string(), text.to_string());
        if let Some(hit) = self.lookup(&key)? {
            return Ok(hit.as_ref().clone());
        }
        let vector = Arc::new(self.inner.embed(model, text).await?);
        self.store(key, Arc::clone(&vector))?;
        Ok(vector.as_ref().clone())
    }
}
