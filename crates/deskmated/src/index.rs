//! Embedding index over the knowledge pack.
//!
//! The index is built once at startup and is read-only afterwards. Queries
//! embed the text, score every passage by cosine similarity and return the
//! `k` nearest as `(passage, distance)` with `distance = 1 - cosine`.

use crate::embedding::{cosine_similarity, Embedder};
use crate::ranker::PassageRanker;
use async_trait::async_trait;
use deskmate_shared::{Category, IndexError, KnownCause, KnownStep, Passage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Built-in knowledge pack
const BUILTIN_PACK: &str = include_str!("../knowledge/it_support.json");

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("failed to read knowledge pack {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid knowledge pack: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("knowledge pack is empty")]
    Empty,
}

/// One entry of a knowledge pack file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub problem: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub causes: Vec<KnownCause>,
    #[serde(default)]
    pub solutions: Vec<KnownStep>,
}

fn known(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty() && v != "unknown")
}

impl KnowledgeEntry {
    /// Searchable passage: problem, description and symptoms.
    pub fn into_passage(self) -> Passage {
        let category = self.category.parse::<Category>().unwrap_or_else(|e| {
            warn!("knowledge entry {}: {}, using unknown", self.id, e);
            Category::Unknown
        });
        let mut text = self.problem.clone();
        if !self.description.is_empty() {
            text.push_str(". ");
            text.push_str(&self.description);
        }
        if !self.symptoms.is_empty() {
            text.push_str(". Symptoms: ");
            text.push_str(&self.symptoms.join(", "));
        }
        let mut passage = Passage::new(self.id, category, text);
        passage.metadata.title = self.problem;
        passage.metadata.device_type = known(self.device_type);
        passage.metadata.os = known(self.os);
        passage.causes = self.causes;
        passage.solutions = self.solutions;
        passage
    }
}

pub fn parse_pack(json: &str) -> Result<Vec<KnowledgeEntry>, KnowledgeError> {
    let entries: Vec<KnowledgeEntry> = serde_json::from_str(json)?;
    if entries.is_empty() {
        return Err(KnowledgeError::Empty);
    }
    Ok(entries)
}

pub fn builtin_pack() -> Result<Vec<KnowledgeEntry>, KnowledgeError> {
    parse_pack(BUILTIN_PACK)
}

pub fn load_pack(path: &Path) -> Result<Vec<KnowledgeEntry>, KnowledgeError> {
    let json = std::fs::read_to_string(path).map_err(|source| KnowledgeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_pack(&json)
}

/// Metadata filter for `search`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub category: Option<Category>,
    pub device_type: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, passage: &Passage) -> bool {
        if let Some(category) = self.category {
            if passage.metadata.category != category {
                return false;
            }
        }
        if let Some(wanted) = &self.device_type {
            match &passage.metadata.device_type {
                Some(device) if device.eq_ignore_ascii_case(wanted.trim()) => {}
                _ => return false,
            }
        }
        true
    }
}

#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    /// Nearest passages as `(passage, distance)`, nearest first. Ties keep
    /// insertion order.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<(Passage, f32)>, IndexError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ranked passages matching `filter`, at most `top_k`.
    async fn search(
        &self,
        text: &str,
        top_k: usize,
        similarity_threshold: f32,
        filter: &SearchFilter,
    ) -> Result<Vec<Passage>, IndexError> {
        let hits: Vec<(Passage, f32)> = self
            .query(text, self.len())
            .await?
            .into_iter()
            .filter(|(p, _)| filter.matches(p))
            .collect();
        Ok(PassageRanker::new(similarity_threshold, top_k).rank(hits))
    }
}

/// In-process index. Passages and their vectors live behind an `Arc`.
pub struct InMemoryIndex {
    passages: Arc<Vec<Passage>>,
    embedder: Arc<dyn Embedder>,
}

impl InMemoryIndex {
    /// Embed every passage once.
    pub async fn build(
        passages: Vec<Passage>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        let mut indexed = Vec::with_capacity(passages.len());
        for mut passage in passages {
            passage.embedding = embedder.embed(&passage.text).await?;
            indexed.push(passage);
        }
        info!(
            "index built: {} passages ({} embedder)",
            indexed.len(),
            embedder.name()
        );
        Ok(Self {
            passages: Arc::new(indexed),
            embedder,
        })
    }

    pub async fn from_entries(
        entries: Vec<KnowledgeEntry>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        let passages = entries.into_iter().map(KnowledgeEntry::into_passage).collect();
        Self::build(passages, embedder).await
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryIndex {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<(Passage, f32)>, IndexError> {
        let query = self.embedder.embed(text).await?;
        let mut scored: Vec<(usize, f32)> = self
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| (i, 1.0 - cosine_similarity(&query, &p.embedding)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, distance)| (self.passages[i].clone(), distance))
            .collect())
    }

    fn len(&self) -> usize {
        self.passages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    async fn builtin_index() -> InMemoryIndex {
        InMemoryIndex::from_entries(builtin_pack().unwrap(), Arc::new(HashingEmbedder::default()))
            .await
            .unwrap()
    }

    #[test]
    fn test_builtin_pack_parses() {
        let entries = builtin_pack().unwrap();
        assert!(entries.len() >= 10);
        for entry in entries {
            let id = entry.id.clone();
            let passage = entry.into_passage();
            assert!(passage.metadata.category.is_known(), "{} has no category", id);
            assert!(!passage.causes.is_empty());
            assert!(!passage.solutions.is_empty());
        }
    }

    #[test]
    fn test_legacy_categories_mapped() {
        let json = r#"[{"id":"x","problem":"Locked out","category":"security","os":"unknown"}]"#;
        let passage = parse_pack(json).unwrap().remove(0).into_passage();
        assert_eq!(passage.metadata.category, Category::Os);
        assert!(passage.metadata.os.is_none());
        assert_eq!(passage.display_title(), "Locked out");
    }

    #[test]
    fn test_empty_pack_rejected() {
        assert!(matches!(parse_pack("[]"), Err(KnowledgeError::Empty)));
        assert!(matches!(parse_pack("{"), Err(KnowledgeError::Parse(_))));
    }

    #[test]
    fn test_load_pack_missing_file() {
        let err = load_pack(Path::new("/nonexistent/pack.json")).unwrap_err();
        assert!(matches!(err, KnowledgeError::Io { .. }));
    }

    #[tokio::test]
    async fn test_query_orders_by_distance() {
        let index = builtin_index().await;
        let hits = index.query("My Wi-Fi won't connect", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0.source_id(), "wifi_1");
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[tokio::test]
    async fn test_query_is_deterministic() {
        let index = builtin_index().await;
        let a = index.query("computer is slow and freezing", 5).await.unwrap();
        let b = index.query("computer is slow and freezing", 5).await.unwrap();
        let ids_a: Vec<&str> = a.iter().map(|(p, _)| p.source_id()).collect();
        let ids_b: Vec<&str> = b.iter().map(|(p, _)| p.source_id()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn test_search_applies_filter() {
        let index = builtin_index().await;
        let filter = SearchFilter {
            category: Some(Category::Performance),
            device_type: None,
        };
        let results = index.search("slow computer", 10, 0.0, &filter).await.unwrap();
        assert!(!results.is_empty());
        assert!(results
            .iter()
            .all(|p| p.metadata.category == Category::Performance));

        let phones = SearchFilter {
            category: None,
            device_type: Some("Phone".into()),
        };
        let results = index.search("battery", 10, 0.0, &phones).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_id(), "phone_battery_1");
    }
}
