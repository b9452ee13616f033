//! External embedding service client.
//!
//! The engine never generates embeddings itself — vector procedures that
//! receive a string query translate it to a vector through this seam,
//! synchronously, and cache the result. The default [`NullEmbedder`] makes
//! string queries an error until a service is configured.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::config::EmbeddingConfig;
use crate::{Error, Result};

/// Text → dense vector translation, provided by an external service.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// No service configured: string queries to vector procedures fail with a
/// clear message; vector queries are unaffected.
#[derive(Debug, Default)]
pub struct NullEmbedder;

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::ExecutionError(
            "no embedding service configured; pass a vector instead of a string".into(),
        ))
    }
}

/// HTTP client for an embedding service speaking the common
/// `{"model": ..., "input": ...}` → `{"embedding": [...]}` shape.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::StorageError(format!("embedding client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("embedding service unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "embedding service returned {}",
                response.status()
            )));
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::ExecutionError(format!("embedding response malformed: {e}")))?;
        Ok(body.embedding)
    }
}

/// Memoizing wrapper: identical query strings hit the service once.
pub struct CachingEmbedder {
    inner: Box<dyn Embedder>,
    cache: DashMap<String, Vec<f32>>,
    capacity: usize,
}

impl CachingEmbedder {
    pub fn new(inner: Box<dyn Embedder>) -> Self {
        Self { inner, cache: DashMap::new(), capacity: 4096 }
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit.clone());
        }
        let vector = self.inner.embed(text).await?;
        if self.cache.len() >= self.capacity {
            self.cache.clear();
        }
        self.cache.insert(text.to_owned(), vector.clone());
        Ok(vector)
    }
}

/// Pick an embedder from configuration.
pub fn from_config(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    if config.endpoint.is_empty() {
        Ok(Box::new(NullEmbedder))
    } else {
        Ok(Box::new(CachingEmbedder::new(Box::new(HttpEmbedder::new(config)?))))
    }
}
