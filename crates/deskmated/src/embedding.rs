//! Text embedders.
//!
//! `HashingEmbedder` is the offline default: lowercase words, light
//! stemming, stopwords dropped, signed feature hashing into a fixed number
//! of dimensions, L2-normalized. Same text, same vector, every run.
//!
//! `OllamaEmbedder` calls a local Ollama server and keeps an LRU cache of
//! query vectors.

use crate::classifier::words;
use async_trait::async_trait;
use deskmate_shared::IndexError;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;

    fn name(&self) -> &str;
}

/// Cosine similarity in [-1, 1]. Returns 0.0 for empty, mismatched or
/// zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
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
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "my", "me", "i", "im", "is", "are", "was", "be", "been", "it", "its",
    "to", "of", "and", "or", "on", "in", "for", "with", "at", "by", "this", "that", "so",
    "not", "no", "wont", "cant", "cannot", "dont", "doesnt", "didnt", "isnt", "very", "any",
    "all", "your", "you", "if", "from", "up", "can", "do", "doe", "just", "keep",
];

/// Strip common suffixes so "connecting" and "connect" share a feature.
pub fn stem(word: &str) -> String {
    let mut w = word.to_string();
    for suffix in ["ing", "ed"] {
        if w.chars().count() > suffix.len() + 3 && w.ends_with(suffix) {
            // suffixes are ASCII, so this cut is on a char boundary
            w.truncate(w.len() - suffix.len());
            let mut tail = w.chars().rev();
            if let (Some(last), Some(prev)) = (tail.next(), tail.next()) {
                if last == prev && last.is_ascii_alphabetic() && !matches!(last, 'l' | 's' | 'z') {
                    w.pop();
                }
            }
            break;
        }
    }
    w
}

/// Words that carry meaning for retrieval.
pub fn content_terms(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Default number of hashed dimensions
pub const DEFAULT_HASH_DIMS: usize = 1024;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for term in content_terms(text) {
            let hash = fnv1a(term.as_bytes());
            let index = (hash % self.dims as u64) as usize;
            let sign = if (hash >> 63) & 1 == 1 { -1.0 } else { 1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        Ok(self.embed_sync(text))
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

const QUERY_CACHE_SIZE: usize = 1000;

/// Embeddings from a local Ollama server, with an LRU query cache.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        let capacity = NonZeroUsize::new(QUERY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        info!("Ollama embedder: {} ({})", base_url, model);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            query_cache: RwLock::new(LruCache::new(capacity)),
        })
    }

    async fn fetch(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let request = OllamaEmbedRequest {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| IndexError::Unavailable(format!("embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(IndexError::Unavailable(format!(
                "Ollama embedding error: {}",
                response.status()
            )));
        }

        let body: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Unavailable(format!("bad embedding response: {}", e)))?;
        if let Some(embedding) = body.embedding {
            Ok(embedding)
        } else if let Some(embeddings) = body.embeddings {
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| IndexError::Unavailable("empty embeddings array".to_string()))
        } else {
            Err(IndexError::Unavailable("no embedding returned".to_string()))
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        if let Some(cached) = self.query_cache.write().await.get(text) {
            debug!("embedding cache hit");
            return Ok(cached.clone());
        }
        let embedding = self.fetch(text).await?;
        self.query_cache
            .write()
            .await
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
