//! Embedding provider abstraction and the pipeline-facing [`Embedder`].
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAiProvider`]**: calls the OpenAI or Azure OpenAI embeddings API
//!   with retry and backoff (see [`crate::http`]).
//!
//! [`Embedder`] wraps a provider with sub-batching, a per-call deadline and
//! the degrade-don't-crash policy: a failed call yields zero-length
//! placeholder vectors instead of an error, and callers decide what an
//! unavailable embedding means for them.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::Service;
use crate::guard;
use crate::http::{self, ApiEndpoint, ApiFlavor};

/// A backend that turns texts into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model or deployment identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed `texts`, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI / Azure Provider ============

/// Embedding provider using the OpenAI embeddings API or an Azure OpenAI
/// deployment.
///
/// Requires `OPENAI_API_KEY` or `AZURE_OPENAI_API_KEY` respectively.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    endpoint: ApiEndpoint,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config, or if
    /// the API key is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let flavor = ApiFlavor::from_provider(&config.provider)
            .ok_or_else(|| anyhow::anyhow!("Unknown embedding provider: {}", config.provider))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", config.provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", config.provider))?;

        Ok(Self {
            model,
            dims,
            endpoint: ApiEndpoint::new(flavor, config.url.as_deref(), &config.api_version)?,
            client: http::client(config.timeout())?,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint.operation_url(&self.model, "embeddings");
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = http::send_with_retry("Embeddings", self.max_retries, || {
            self.endpoint
                .authorize(self.client.post(&url))
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        let json: serde_json::Value = response.json().await?;
        parse_embeddings_response(&json)
    }
}

/// Parse an embeddings API response, ordering vectors by their `index`.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"`, `"azure"` | [`OpenAiProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" | "azure" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Embedder ============

/// Pipeline-facing embedding client bound to one provider.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    timeout: Duration,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(
            create_provider(config)?,
            config.batch_size,
            config.timeout(),
        ))
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed one text. Returns an empty vector when the embedding is
    /// unavailable.
    pub async fn embed_one(&self, text: &str, cancel: &CancellationToken) -> Vec<f32> {
        self.embed_many(&[text.to_string()], cancel)
            .await
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    /// Embed `texts` in sub-batches of `batch_size`.
    ///
    /// The result always has one entry per input, in input order. Every
    /// text of a sub-batch whose call fails, times out, is cancelled, or
    /// returns the wrong number of vectors gets a zero-length placeholder.
    pub async fn embed_many(&self, texts: &[String], cancel: &CancellationToken) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(texts.len());

        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let result = guard::bounded(
                Service::Embedding,
                self.timeout,
                cancel,
                self.provider.embed_batch(batch),
            )
            .await;

            match result {
                Ok(vectors) if vectors.len() == batch.len() => {
                    debug!(batch = batch_no, size = batch.len(), "embedded batch");
                    out.extend(vectors);
                }
                Ok(vectors) => {
                    warn!(
                        batch = batch_no,
                        expected = batch.len(),
                        got = vectors.len(),
                        "embedding response length mismatch, using placeholders"
                    );
                    out.extend(batch.iter().map(|_| Vec::new()));
                }
                Err(e) => {
                    warn!(batch = batch_no, error = %e, "embedding failed, using placeholders");
                    out.extend(batch.iter().map(|_| Vec::new()));
                }
            }
        }

        out
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use doc_rag::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds each text as `[len, 1.0]`; fails every `fail_every`-th call.
    struct FlakyProvider {
        calls: AtomicUsize,
        fail_every: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && call % self.fail_every == 0 {
                bail!("service unavailable");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    /// Always returns a single vector regardless of input length.
    struct ShortProvider;

    #[async_trait]
    impl EmbeddingProvider for ShortProvider {
        fn model_name(&self) -> &str {
            "short"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0]])
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    fn flaky(fail_every: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_every,
        })
    }

    #[tokio::test]
    async fn embed_many_preserves_length_and_order() {
        let embedder = Embedder::new(flaky(0), 3, Duration::from_secs(5));
        let out = embedder
            .embed_many(&texts(7), &CancellationToken::new())
            .await;
        assert_eq!(out.len(), 7);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
    }

    #[tokio::test]
    async fn failed_sub_batch_yields_placeholders() {
        // Second of three sub-batches fails.
        let embedder = Embedder::new(flaky(2), 2, Duration::from_secs(5));
        let out = embedder
            .embed_many(&texts(6), &CancellationToken::new())
            .await;
        assert_eq!(out.len(), 6);
        assert!(!out[0].is_empty() && !out[1].is_empty());
        assert!(out[2].is_empty() && out[3].is_empty());
        assert!(!out[4].is_empty() && !out[5].is_empty());
    }

    #[tokio::test]
    async fn disabled_provider_degrades_to_placeholders() {
        let embedder = Embedder::new(Arc::new(DisabledProvider), 8, Duration::from_secs(5));
        let out = embedder
            .embed_many(&texts(3), &CancellationToken::new())
            .await;
        assert_eq!(out, vec![Vec::<f32>::new(); 3]);
        assert!(embedder
            .embed_one("q", &CancellationToken::new())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn length_mismatch_counts_as_failure() {
        let embedder = Embedder::new(Arc::new(ShortProvider), 8, Duration::from_secs(5));
        let out = embedder
            .embed_many(&texts(3), &CancellationToken::new())
            .await;
        assert!(out.iter().all(Vec::is_empty));
    }

    #[tokio::test]
    async fn cancelled_request_yields_placeholders() {
        let token = CancellationToken::new();
        token.cancel();
        let embedder = Embedder::new(flaky(0), 8, Duration::from_secs(5));
        assert!(embedder.embed_one("q", &token).await.is_empty());
    }

    #[test]
    fn parse_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn parse_rejects_missing_data() {
        assert!(parse_embeddings_response(&serde_json::json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_degenerate() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
