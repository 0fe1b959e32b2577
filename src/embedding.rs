//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]** — calls an OpenAI-compatible embeddings API with
//!   retry, exponential backoff, and jitter.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: `base * 2^attempt` capped at 32× base, plus random jitter;
//!   a `Retry-After` header on a 429 overrides the computed delay.
//!
//! A batch that exhausts its retries surfaces a single batch-level error —
//! it never returns a partial set of vectors. The safety-margined token
//! budget the batch assembler enforces is re-verified here before any
//! request goes out; only forced singleton batches may exceed it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::chunk::approx_token_count;
use crate::config::EmbeddingConfig;

/// Interface to an external embedding provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Token count for `text` under the active model.
    fn count_tokens(&self, text: &str) -> usize {
        approx_token_count(text)
    }
    /// Embed a batch of texts, returning one vector per input in input
    /// order. All-or-nothing: an error means no vector was produced.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
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

/// Embedding provider for OpenAI-compatible APIs.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
    base_backoff: Duration,
    /// Safety-margined per-request ceiling; re-verified on every batch.
    token_budget: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            api_key,
            client,
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            token_budget: config.effective_token_limit(),
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.as_millis() as u64 * (1u64 << (attempt - 1).min(5));
        let jitter = rand::rng().random_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // The batch assembler keeps closed batches under the budget; this
        // re-check catches any caller that didn't, before a request is
        // spent. A singleton may exceed the budget (forced oversized
        // chunk) and is passed through for the provider to judge.
        if texts.len() > 1 {
            let total: usize = texts.iter().map(|t| self.count_tokens(t)).sum();
            if total > self.token_budget {
                bail!(
                    "batch of {} texts totals {} tokens, over the {}-token budget",
                    texts.len(),
                    total,
                    self.token_budget
                );
            }
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        let mut server_wait: Option<Duration> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // A server-provided Retry-After hint overrides the
                // computed backoff.
                let delay = server_wait.take().unwrap_or_else(|| self.backoff_delay(attempt));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_embeddings_response(&json)?;
                        if vectors.len() != texts.len() {
                            bail!(
                                "Provider returned {} vectors for {} inputs",
                                vectors.len(),
                                texts.len()
                            );
                        }
                        return Ok(vectors);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        server_wait = retry_after_hint(&response);
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt,
                            "embedding request throttled or failed, will retry"
                        );
                        last_err =
                            Some(anyhow::anyhow!("Embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

/// `Retry-After` seconds from a rate-limit response, if present.
fn retry_after_hint(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Extract `data[].embedding` arrays in input order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
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
