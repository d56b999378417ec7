//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`LocalEmbeddingProvider`]** — deterministic 384-dim hashing
//!   projection; no network, no API key, always available.
//! - **[`OpenAiEmbeddingProvider`]**, **[`VoyageEmbeddingProvider`]**,
//!   **[`CohereEmbeddingProvider`]** — remote APIs with batching, bearer
//!   auth, and retry with backoff.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider based on
//! the configuration's `embedding.provider` value.
//!
//! # Retry Strategy
//!
//! Remote calls go through [`crate::retry`]: HTTP 429/5xx and transient
//! network errors are retried with exponential backoff (honouring
//! `Retry-After`); other client errors fail immediately. Every returned
//! vector's length is validated against the provider's declared
//! dimensionality.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::retry::{self, AttemptError, RetryPolicy};

/// Capability over `{local, openai, voyage, cohere}` embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier (e.g. `"local"`, `"openai"`).
    fn name(&self) -> &str;

    /// Fixed dimensionality of every vector this provider produces.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, one vector per text, preserving order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Convenience: embed a single text.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }
}

// ============ Local Provider ============

/// Dimensionality of the local hashing projection.
pub const LOCAL_DIMENSIONS: usize = 384;

/// Deterministic, network-free embedding fallback.
///
/// Lowercases, strips punctuation, drops tokens of length ≤ 2, then
/// projects each remaining token into a fixed 384-dim space by hashing its
/// characters into an index and a sign bit, summing weighted by term
/// frequency, and L2-normalising. The same text always embeds to the same
/// unit-norm vector.
pub struct LocalEmbeddingProvider;

impl LocalEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut frequencies: HashMap<String, usize> = HashMap::new();
        let normalized: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        for token in normalized.split_whitespace() {
            if token.len() <= 2 {
                continue;
            }
            *frequencies.entry(token.to_string()).or_insert(0) += 1;
        }

        let mut vector = vec![0.0f32; LOCAL_DIMENSIONS];
        for (token, tf) in &frequencies {
            let hash = fnv1a(token.as_bytes());
            let index = ((hash >> 1) % LOCAL_DIMENSIONS as u64) as usize;
            let sign = if hash & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign * *tf as f32;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for LocalEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        LOCAL_DIMENSIONS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Stable FNV-1a, so persisted vectors survive recompilation.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ============ Remote Providers ============

/// Shared wire plumbing for the remote providers.
struct RemoteClient {
    client: reqwest::Client,
    api_key: String,
    batch_size: usize,
    policy: RetryPolicy,
}

impl RemoteClient {
    fn new(config: &EmbeddingConfig, env_key: &str) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(env_key).ok())
            .ok_or_else(|| {
                anyhow!(
                    "embedding.apiKey (or {}) required for provider '{}'",
                    env_key,
                    config.provider
                )
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_key,
            batch_size: config.batch_size,
            policy: RetryPolicy::default(),
        })
    }

    /// POST `body` to `url`, retrying transient failures, and return the
    /// parsed JSON.
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        retry::retry(&self.policy, || {
            let client = self.client.clone();
            let api_key = self.api_key.clone();
            let url = url.to_string();
            let body = body.clone();
            async move {
                let response = client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| {
                        let message = e.to_string();
                        if retry::is_transient_message(&message) {
                            AttemptError::transient(anyhow!(
                                "embedding request failed: {}",
                                message
                            ))
                        } else {
                            AttemptError::fatal(anyhow!("embedding request failed: {}", message))
                        }
                    })?;

                let status = response.status().as_u16();
                if retry::is_retryable_status(status) {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let text = response.text().await.unwrap_or_default();
                    return Err(AttemptError::transient(anyhow!(
                        "embedding API error {}: {}",
                        status,
                        text
                    ))
                    .with_retry_after(retry_after));
                }
                if !(200..300).contains(&status) {
                    let text = response.text().await.unwrap_or_default();
                    return Err(AttemptError::fatal(anyhow!(
                        "embedding API error {}: {}",
                        status,
                        text
                    )));
                }

                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| AttemptError::fatal(anyhow!("invalid embedding response: {}", e)))
            }
        })
        .await
    }
}

fn validate_dimensions(vectors: &[Vec<f32>], expected: usize, provider: &str) -> Result<()> {
    for vector in vectors {
        if vector.len() != expected {
            bail!(
                "{} returned a {}-dim vector, expected {}",
                provider,
                vector.len(),
                expected
            );
        }
    }
    Ok(())
}

/// Parse `{data: [{embedding, index}]}` responses (OpenAI and Voyage),
/// re-sorting by the `index` field so output order matches input order.
fn parse_indexed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid embedding response: missing data array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid embedding response: missing embedding"))?;
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

/// OpenAI `POST /v1/embeddings`.
pub struct OpenAiEmbeddingProvider {
    remote: RemoteClient,
    model: String,
    api_base: String,
    dims: usize,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let dims = match model.as_str() {
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" | "text-embedding-3-small" => 1536,
            _ => 1536,
        };
        Ok(Self {
            remote: RemoteClient::new(config, "OPENAI_API_KEY")?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.remote.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = self.remote.post_json(&url, &body).await?;
            let batch_vectors = parse_indexed_response(&json)?;
            if batch_vectors.len() != batch.len() {
                bail!(
                    "openai returned {} embeddings for {} inputs",
                    batch_vectors.len(),
                    batch.len()
                );
            }
            vectors.extend(batch_vectors);
        }
        validate_dimensions(&vectors, self.dims, "openai")?;
        Ok(vectors)
    }
}

/// Voyage AI `POST /v1/embeddings`.
pub struct VoyageEmbeddingProvider {
    remote: RemoteClient,
    model: String,
    api_base: String,
    dims: usize,
}

impl VoyageEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().unwrap_or_else(|| "voyage-2".to_string());
        let dims = match model.as_str() {
            "voyage-large-2" => 1536,
            _ => 1024,
        };
        Ok(Self {
            remote: RemoteClient::new(config, "VOYAGE_API_KEY")?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.voyageai.com/v1".to_string()),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbeddingProvider {
    fn name(&self) -> &str {
        "voyage"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.remote.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = self.remote.post_json(&url, &body).await?;
            let batch_vectors = parse_indexed_response(&json)?;
            if batch_vectors.len() != batch.len() {
                bail!(
                    "voyage returned {} embeddings for {} inputs",
                    batch_vectors.len(),
                    batch.len()
                );
            }
            vectors.extend(batch_vectors);
        }
        validate_dimensions(&vectors, self.dims, "voyage")?;
        Ok(vectors)
    }
}

/// Cohere `POST /v1/embed`.
pub struct CohereEmbeddingProvider {
    remote: RemoteClient,
    model: String,
    api_base: String,
    dims: usize,
}

impl CohereEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "embed-english-v3.0".to_string());
        let dims = match model.as_str() {
            "embed-english-light-v3.0" | "embed-multilingual-light-v3.0" => 384,
            _ => 1024,
        };
        Ok(Self {
            remote: RemoteClient::new(config, "COHERE_API_KEY")?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.cohere.com/v1".to_string()),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for CohereEmbeddingProvider {
    fn name(&self) -> &str {
        "cohere"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.api_base.trim_end_matches('/'));
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.remote.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "texts": batch,
                "input_type": "search_document",
            });
            let json = self.remote.post_json(&url, &body).await?;
            let embeddings = json
                .get("embeddings")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow!("invalid embedding response: missing embeddings"))?;
            if embeddings.len() != batch.len() {
                bail!(
                    "cohere returned {} embeddings for {} inputs",
                    embeddings.len(),
                    batch.len()
                );
            }
            for embedding in embeddings {
                let values = embedding
                    .as_array()
                    .ok_or_else(|| anyhow!("invalid embedding response: non-array embedding"))?;
                vectors.push(
                    values
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect(),
                );
            }
        }
        validate_dimensions(&vectors, self.dims, "cohere")?;
        Ok(vectors)
    }
}

/// Create the provider named by the configuration.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"local"` | [`LocalEmbeddingProvider`] |
/// | `"openai"` | [`OpenAiEmbeddingProvider`] |
/// | `"voyage"` | [`VoyageEmbeddingProvider`] |
/// | `"cohere"` | [`CohereEmbeddingProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalEmbeddingProvider::new())),
        "openai" => Ok(Arc::new(OpenAiEmbeddingProvider::new(config)?)),
        "voyage" => Ok(Arc::new(VoyageEmbeddingProvider::new(config)?)),
        "cohere" => Ok(Arc::new(CohereEmbeddingProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_is_deterministic_and_unit_norm() {
        let provider = LocalEmbeddingProvider::new();
        let a = provider.embed_single("Install the toolchain first").await.unwrap();
        let b = provider.embed_single("Install the toolchain first").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), LOCAL_DIMENSIONS);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn local_distinguishes_texts() {
        let provider = LocalEmbeddingProvider::new();
        let a = provider.embed_single("alpha content about parsing").await.unwrap();
        let b = provider.embed_single("completely different subject matter").await.unwrap();
        assert_ne!(a, b);

        // Identical text must be the nearest neighbour of itself.
        let self_sim = crate::vector::cosine_similarity(&a, &a);
        let cross_sim = crate::vector::cosine_similarity(&a, &b);
        assert!(self_sim > cross_sim);
    }

    #[tokio::test]
    async fn local_drops_short_tokens_and_punctuation() {
        let provider = LocalEmbeddingProvider::new();
        // Only tokens of length ≤ 2 and punctuation: nothing survives.
        let empty = provider.embed_single("a an it, of!! to §§").await.unwrap();
        assert!(empty.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn local_batch_preserves_order() {
        let provider = LocalEmbeddingProvider::new();
        let texts = vec![
            "first text body".to_string(),
            "second text body".to_string(),
        ];
        let batch = provider.embed(&texts).await.unwrap();
        let first = provider.embed_single("first text body").await.unwrap();
        assert_eq!(batch[0], first);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn indexed_response_resorted_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_indexed_response(&json).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[test]
    fn malformed_response_is_an_error() {
        let json = serde_json::json!({ "unexpected": true });
        assert!(parse_indexed_response(&json).is_err());
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let mut config = EmbeddingConfig::default();
        config.provider = "quantum".to_string();
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn factory_builds_local_without_keys() {
        let config = EmbeddingConfig::default();
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.dimensions(), LOCAL_DIMENSIONS);
    }
}
