//! Embedding providers.
//!
//! Defines the [`Embedder`] trait and [`HttpEmbedder`], which talks to any
//! of the supported hosted embedding APIs:
//!
//! | Provider | Endpoint | Key |
//! |----------|----------|-----|
//! | `jina` | `https://api.jina.ai/v1/embeddings` | `JINAAI_API_KEY` |
//! | `openai` | `https://api.openai.com/v1/embeddings` | `OPENAI_API_KEY` |
//! | `azure-openai` | `{url}/openai/deployments/{model}/embeddings` | `AZURE_OPENAI_API_KEY` |
//! | `mistral` | `https://api.mistral.ai/v1/embeddings` | `MISTRAL_API_KEY` |
//!
//! All of them answer with `data[{ index, embedding }]`; vectors are
//! returned in input order regardless of the order in the response.
//!
//! Also provides the vector similarity helpers used by the in-memory store:
//! [`cosine_similarity`], [`dot_product`] and [`euclidean_distance`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{api_key, ApiError};
use crate::http::{client_with_timeout, send_with_retry, JsonRequest};

/// Turns text into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"jina-clip-v2"`).
    fn model_name(&self) -> &str;

    /// Expected vector size, when known up front.
    fn dims(&self) -> Option<usize>;

    /// Embed a batch of texts; one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Total tokens billed so far.
    fn tokens_used(&self) -> u64 {
        0
    }
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embedder.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Embed `texts` in batches of at most `batch_size`.
pub async fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for (i, batch) in texts.chunks(batch_size.max(1)).enumerate() {
        debug!(batch = i, size = batch.len(), "embedding batch");
        vectors.extend(embedder.embed(batch).await?);
    }
    Ok(vectors)
}

/// Build the embedder selected by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(HttpEmbedder::new(config)?))
}

// ============ Providers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Jina,
    OpenAi,
    AzureOpenAi,
    Mistral,
}

impl EmbeddingProvider {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "jina" => Ok(Self::Jina),
            "openai" => Ok(Self::OpenAi),
            "azure-openai" => Ok(Self::AzureOpenAi),
            "mistral" => Ok(Self::Mistral),
            other => bail!("Unknown embedding provider: {}", other),
        }
    }

    fn service(self) -> &'static str {
        match self {
            Self::Jina => "Jina",
            Self::OpenAi => "OpenAI embeddings",
            Self::AzureOpenAi => "Azure OpenAI embeddings",
            Self::Mistral => "Mistral embeddings",
        }
    }

    fn key_var(self) -> &'static str {
        match self {
            Self::Jina => "JINAAI_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::AzureOpenAi => "AZURE_OPENAI_API_KEY",
            Self::Mistral => "MISTRAL_API_KEY",
        }
    }
}

/// Resolve the embeddings endpoint for a provider.
///
/// `base_url` overrides the provider's default host; Azure has no default
/// and requires it.
pub fn endpoint_url(
    provider: EmbeddingProvider,
    model: &str,
    base_url: Option<&str>,
    api_version: &str,
) -> Result<String> {
    let base = base_url.map(|u| u.trim_end_matches('/'));
    Ok(match provider {
        EmbeddingProvider::Jina => {
            format!("{}/v1/embeddings", base.unwrap_or("https://api.jina.ai"))
        }
        EmbeddingProvider::OpenAi => {
            format!("{}/v1/embeddings", base.unwrap_or("https://api.openai.com"))
        }
        EmbeddingProvider::Mistral => {
            format!("{}/v1/embeddings", base.unwrap_or("https://api.mistral.ai"))
        }
        EmbeddingProvider::AzureOpenAi => {
            let Some(base) = base else {
                bail!("embedding.url (or AZURE_OPENAI_ENDPOINT) required for azure-openai embeddings");
            };
            format!(
                "{}/openai/deployments/{}/embeddings?api-version={}",
                base, model, api_version
            )
        }
    })
}

/// Request body for one batch.
pub fn request_body(provider: EmbeddingProvider, model: &str, texts: &[String]) -> Value {
    match provider {
        EmbeddingProvider::Jina => json!({
            "model": model,
            "input": texts.iter().map(|t| json!({ "text": t })).collect::<Vec<_>>(),
        }),
        EmbeddingProvider::AzureOpenAi => json!({ "input": texts }),
        EmbeddingProvider::OpenAi | EmbeddingProvider::Mistral => json!({
            "model": model,
            "input": texts,
        }),
    }
}

/// Parse `data[{ index, embedding }]`, ordering vectors by `index`.
///
/// Returns the vectors and the reported total token usage.
pub fn parse_embeddings(
    service: &str,
    json: &Value,
    expected: usize,
) -> std::result::Result<(Vec<Vec<f32>>, u64), ApiError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ApiError::invalid_response(service, "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ApiError::invalid_response(service, "missing embedding"))?;
        let vector = embedding
            .iter()
            .map(|v| v.as_f64().map(|x| x as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| {
                let message = format!("non-numeric value in embedding {}", index);
                ApiError::invalid_response(service, message)
            })?;
        indexed.push((index, vector));
    }

    if indexed.len() != expected {
        return Err(ApiError::invalid_response(
            service,
            format!("expected {} embeddings, got {}", expected, indexed.len()),
        ));
    }

    indexed.sort_by_key(|(i, _)| *i);

    let tokens = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    Ok((indexed.into_iter().map(|(_, v)| v).collect(), tokens))
}

/// Embedder backed by one of the hosted embedding APIs.
pub struct HttpEmbedder {
    client: reqwest::Client,
    provider: EmbeddingProvider,
    model: String,
    dims: Option<usize>,
    url: String,
    api_key: String,
    max_retries: u32,
    tokens: AtomicU64,
}

impl HttpEmbedder {
    /// Fails when the provider's API key is not in the environment or the
    /// endpoint cannot be resolved.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let provider = EmbeddingProvider::parse(&config.provider)?;
        Self::with_api_key(config, api_key(provider.key_var())?)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let provider = EmbeddingProvider::parse(&config.provider)?;
        let url = endpoint_url(
            provider,
            &config.model,
            config.url.as_deref(),
            &config.api_version,
        )?;
        Ok(Self {
            client: client_with_timeout(config.timeout_secs)?,
            provider,
            model: config.model.clone(),
            dims: config.dims,
            url,
            api_key,
            max_retries: config.max_retries,
            tokens: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let service = self.provider.service();
        let body = request_body(self.provider, &self.model, texts);
        let req = JsonRequest::post(service, &self.url, &body);
        let req = match self.provider {
            EmbeddingProvider::AzureOpenAi => req.header("api-key", &self.api_key),
            _ => req.bearer(&self.api_key),
        };

        let json = send_with_retry(&self.client, &req, self.max_retries).await?;
        let (vectors, tokens) = parse_embeddings(service, &json, texts.len())?;
        self.tokens.fetch_add(tokens, Ordering::Relaxed);

        if let Some(dims) = self.dims {
            if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                return Err(ApiError::invalid_response(
                    service,
                    format!("expected {} dimensions, got {}", dims, bad.len()),
                )
                .into());
            }
        }

        Ok(vectors)
    }

    fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

// ============ Vector Math ============

/// Cosine similarity in `[-1, 1]`; 0 for empty, mismatched or zero vectors.
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

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_dot_and_euclid() {
        assert_eq!(dot_product(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
    }

    #[test]
    fn test_jina_body_wraps_text() {
        let body = request_body(
            EmbeddingProvider::Jina,
            "jina-clip-v2",
            &["hello".to_string()],
        );
        assert_eq!(body["model"], "jina-clip-v2");
        assert_eq!(body["input"][0]["text"], "hello");
    }

    #[test]
    fn test_openai_body_plain_strings() {
        let body = request_body(EmbeddingProvider::OpenAi, "m", &["a".into(), "b".into()]);
        assert_eq!(body["input"], json!(["a", "b"]));
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(
            endpoint_url(EmbeddingProvider::Jina, "m", None, "v").unwrap(),
            "https://api.jina.ai/v1/embeddings"
        );
        assert_eq!(
            endpoint_url(
                EmbeddingProvider::AzureOpenAi,
                "ada",
                Some("https://res.openai.azure.com/"),
                "2024-10-21"
            )
            .unwrap(),
            "https://res.openai.azure.com/openai/deployments/ada/embeddings?api-version=2024-10-21"
        );
        assert!(endpoint_url(EmbeddingProvider::AzureOpenAi, "ada", None, "v").is_err());
    }

    #[test]
    fn test_parse_sorts_by_index() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ],
            "usage": {"total_tokens": 7}
        });
        let (vectors, tokens) = parse_embeddings("test", &json, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
        assert_eq!(tokens, 7);
    }

    #[test]
    fn test_parse_rejects_wrong_count() {
        let json = json!({"data": [{"index": 0, "embedding": [1.0]}]});
        assert!(parse_embeddings("test", &json, 2).is_err());
        assert!(parse_embeddings("test", &json!({}), 1).is_err());
    }

    #[test]
    fn test_parse_rejects_non_numeric_values() {
        let json = json!({"data": [{"index": 0, "embedding": [0.5, "NaN", null]}]});
        let err = parse_embeddings("test", &json, 1).unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse { .. }));
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn test_unknown_provider() {
        assert!(EmbeddingProvider::parse("cohere").is_err());
    }
}
