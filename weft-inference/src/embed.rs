// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use weft_common::retry::{ClassifyError, ErrorClass};
use weft_entities::SparseWeights;

use crate::rate_limit::ProviderRateLimiter;
use crate::InferenceError;

/// Maximum inputs per embeddings request.
const EMBED_BATCH_SIZE: usize = 128;

/// Upper bound on cumulative backoff for one embedding batch.
const EMBED_RETRY_BUDGET: Duration = Duration::from_secs(120);

/// Produces dense embeddings in batches.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait DenseEmbedder: Send + Sync + 'static {
    fn dimensions(&self) -> usize;

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError>;
}

/// Produces sparse term weights for keyword-style ranking.
#[async_trait]
pub trait SparseEmbedder: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> Result<SparseWeights, InferenceError>;
}

/// Dense embedder speaking the OpenAI-compatible `/embeddings` endpoint.
///
/// Requests go through a provider rate limiter and transient failures retry
/// with exponential backoff; a batch that keeps failing surfaces the last
/// error to the caller, which marks the affected entities failed and moves
/// on.
pub struct HttpDenseEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
    rate_limiter: ProviderRateLimiter,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsDatum>,
}

#[derive(Deserialize)]
struct EmbeddingsDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpDenseEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        requests_per_second: u32,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|error| InferenceError::Configuration(error.to_string()))?,
            rate_limiter: ProviderRateLimiter::per_second(requests_per_second)?,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        self.rate_limiter.acquire().await;
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": batch }))
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    InferenceError::Timeout(error.to_string())
                } else {
                    InferenceError::Unavailable(error.to_string())
                }
            })?;
        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<f64>().ok())
                .unwrap_or(1.0);
            return Err(InferenceError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(InferenceError::Unavailable(format!("{status}")));
        }
        if !status.is_success() {
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let payload: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|error| InferenceError::InvalidResponse(error.to_string()))?;
        if payload.data.len() != batch.len() {
            return Err(InferenceError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                payload.data.len()
            )));
        }
        let mut embeddings = vec![Vec::new(); batch.len()];
        for datum in payload.data {
            if datum.index >= embeddings.len() {
                return Err(InferenceError::InvalidResponse(format!(
                    "embedding index {} out of range",
                    datum.index
                )));
            }
            embeddings[datum.index] = datum.embedding;
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl DenseEmbedder for HttpDenseEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let backoff = ExponentialBackoffBuilder::new()
                .with_max_elapsed_time(Some(EMBED_RETRY_BUDGET))
                .build();
            let batch_embeddings = backoff::future::retry(backoff, || async {
                self.embed_batch(batch).await.map_err(|error| {
                    if error.error_class() == ErrorClass::Retryable {
                        warn!(%error, "embedding-batch-retry");
                        backoff::Error::transient(error)
                    } else {
                        backoff::Error::permanent(error)
                    }
                })
            })
            .await?;
            embeddings.extend(batch_embeddings);
        }
        Ok(embeddings)
    }
}

/// Deterministic local sparse embedder: hashed term buckets weighted by
/// `1 + ln(tf)`. No model download, stable across restarts, good enough to
/// drive BM25-style ranking in hybrid mode.
#[derive(Default)]
pub struct HashedSparseEmbedder;

impl HashedSparseEmbedder {
    pub fn new() -> Self {
        Self
    }
}

/// FNV-1a, fixed here so bucket assignment never changes underneath stored
/// sparse vectors.
fn fnv1a(term: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in term.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[async_trait]
impl SparseEmbedder for HashedSparseEmbedder {
    async fn embed(&self, text: &str) -> Result<SparseWeights, InferenceError> {
        let mut term_frequencies: BTreeMap<u32, u32> = BTreeMap::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.len() > 1)
        {
            *term_frequencies.entry(fnv1a(token)).or_default() += 1;
        }
        let mut weights = SparseWeights::default();
        for (index, frequency) in term_frequencies {
            weights.indices.push(index);
            weights.values.push(1.0 + (frequency as f32).ln());
        }
        Ok(weights)
    }
}
