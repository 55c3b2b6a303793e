//! Knowledge passages returned by the retrieval index.

use crate::category::Category;
use crate::diagnosis::RiskLevel;
use serde::{Deserialize, Serialize};

/// Likelihood tag attached to a cause in the knowledge pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    High,
    Medium,
    Low,
}

impl Likelihood {
    /// Base confidence used by the rule-based analyzer.
    pub fn weight(&self) -> f32 {
        match self {
            Self::High => 0.8,
            Self::Medium => 0.55,
            Self::Low => 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownCause {
    pub cause: String,
    pub likelihood: Likelihood,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownStep {
    pub action: String,
    #[serde(default)]
    pub why: String,
    #[serde(default = "default_risk")]
    pub risk_level: RiskLevel,
}

fn default_risk() -> RiskLevel {
    RiskLevel::Safe
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageMetadata {
    pub source_id: String,
    pub category: Category,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

/// A read-only snapshot of an indexed passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub metadata: PassageMetadata,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
    /// Populated by the ranker at query time
    #[serde(default)]
    pub similarity: f32,
    #[serde(default)]
    pub causes: Vec<KnownCause>,
    #[serde(default)]
    pub solutions: Vec<KnownStep>,
}

impl Passage {
    pub fn new(source_id: impl Into<String>, category: Category, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: PassageMetadata {
                source_id: source_id.into(),
                category,
                title: String::new(),
                device_type: None,
                os: None,
            },
            embedding: Vec::new(),
            similarity: 0.0,
            causes: Vec::new(),
            solutions: Vec::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.metadata.source_id
    }

    /// Title if present, otherwise the first line of the text.
    pub fn display_title(&self) -> &str {
        if !self.metadata.title.is_empty() {
            return &self.metadata.title;
        }
        self.text.lines().next().unwrap_or("")
    }

    /// Short excerpt for prompts, cut on a char boundary.
    pub fn excerpt(&self, max_chars: usize) -> String {
        if self.text.chars().count() <= max_chars {
            return self.text.clone();
        }
        let cut: String = self.text.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let p = Passage::new("p1", Category::Networking, "Wi‑Fi ümlaut text that goes on");
        let e = p.excerpt(6);
        assert!(e.ends_with("..."));
        assert!(e.chars().count() <= 9);
    }

    #[test]
    fn test_display_title_falls_back_to_text() {
        let mut p = Passage::new("p1", Category::Os, "First line\nsecond");
        assert_eq!(p.display_title(), "First line");
        p.metadata.title = "Title".into();
        assert_eq!(p.display_title(), "Title");
    }

    #[test]
    fn test_likelihood_weights_ordered() {
        assert!(Likelihood::High.weight() > Likelihood::Medium.weight());
        assert!(Likelihood::Medium.weight() > Likelihood::Low.weight());
    }

    #[test]
    fn test_embedding_not_serialized() {
        let mut p = Passage::new("p1", Category::Os, "text");
        p.embedding = vec![0.1, 0.2];
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("embedding").is_none());
    }
}
