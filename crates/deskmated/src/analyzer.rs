//! Cause analyzer.
//!
//! Ranks candidate causes for a normalized query. With a model backend the
//! causes come from the LLM under a bounded timeout and a strict schema;
//! any provider failure falls back to the rule-based path, which reads the
//! known causes of the ranked passages or the category's generic table and
//! never fails.

use crate::config::PipelineConfig;
use crate::llm::LlmClient;
use crate::normalizer::NormalizedQuery;
use crate::prompts::{causes_prompt, CAUSES_SCHEMA};
use deskmate_shared::session::attempt_key;
use deskmate_shared::{Category, Cause, DeviceInfo, Passage, ProviderError, Step, TechnicalLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which path produced causes or steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    Llm,
    RuleBased,
}

impl ReasoningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::RuleBased => "rule_based",
        }
    }
}

/// Everything the analyzer and composer know about the current turn.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub query: &'a NormalizedQuery,
    /// Ranked, nearest first
    pub passages: &'a [Passage],
    pub device: Option<&'a DeviceInfo>,
    pub technical_level: TechnicalLevel,
    /// Attempted step keys, including the ones this turn is about to record
    pub attempted: &'a BTreeSet<String>,
    /// Steps of earlier diagnoses in the session
    pub prior_steps: &'a [Step],
}

#[derive(Debug, Clone, PartialEq)]
pub struct CauseAnalysis {
    /// Ordered by confidence, descending
    pub causes: Vec<Cause>,
    pub mode: ReasoningMode,
}

// =============================================================================
// Fallback tables
// =============================================================================

/// Generic causes per category, used when no passage supplies causes.
fn category_causes(category: Category) -> &'static [(&'static str, &'static str)] {
    match category {
        Category::Networking => &[
            (
                "Router or modem needs a restart",
                "Home network equipment often gets stuck after long uptime",
            ),
            (
                "Network adapter settings are wrong",
                "A disabled adapter or stale network profile blocks connections",
            ),
        ],
        Category::Performance => &[
            (
                "Too many programs running in the background",
                "Background programs compete for memory and CPU",
            ),
            ("Low free disk space", "A nearly full drive slows down the whole system"),
        ],
        Category::Os => &[
            (
                "Pending or failed system update",
                "Half-installed updates leave the system in a mixed state",
            ),
            ("Corrupted system settings", "Damaged settings make features misbehave"),
        ],
        Category::Peripherals => &[
            ("Loose or faulty connection", "Cables and wireless pairing are the usual weak point"),
            ("Outdated device driver", "The device needs a driver that matches the system"),
        ],
        Category::Mobile => &[
            (
                "Background apps misbehaving",
                "A misbehaving app can drain battery and slow the phone",
            ),
            ("Outdated app or OS version", "Known bugs are often fixed in newer versions"),
        ],
        Category::Hardware => &[
            ("Power or cable problem", "Loose cables and failing adapters look like dead hardware"),
            ("Failing hardware component", "Parts wear out and may need a repair shop"),
        ],
        Category::Unknown => &[],
    }
}

const GENERIC_CAUSES: &[(&str, &str)] = &[
    ("Software configuration issue", "Settings or software may need adjustment"),
    ("Temporary system glitch", "Restart often resolves temporary issues"),
];

/// Base confidences for table causes, in table order
const TABLE_CONFIDENCE: &[f32] = &[0.5, 0.45, 0.4, 0.35];

/// Added when the passage OS matches the device OS
const OS_MATCH_BOOST: f32 = 0.05;

// =============================================================================
// Model output schema
// =============================================================================

#[derive(Debug, Deserialize)]
struct CausesOutput {
    causes: Vec<CauseOutput>,
}

#[derive(Debug, Deserialize)]
struct CauseOutput {
    label: String,
    confidence: f64,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    supporting_passages: Vec<String>,
}

/// Strict conversion of model output into causes.
fn parse_causes(
    value: serde_json::Value,
    passages: &[Passage],
) -> Result<Vec<Cause>, ProviderError> {
    let output: CausesOutput = serde_json::from_value(value)
        .map_err(|e| ProviderError::Malformed(format!("causes: {}", e)))?;
    if output.causes.is_empty() {
        return Err(ProviderError::Malformed("causes: empty list".to_string()));
    }
    let known: HashSet<&str> = passages.iter().map(|p| p.source_id()).collect();
    let mut causes = Vec::with_capacity(output.causes.len());
    for (i, raw) in output.causes.into_iter().enumerate() {
        let label = raw.label.trim();
        if label.is_empty() {
            return Err(ProviderError::Malformed(format!("causes[{}]: empty label", i)));
        }
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(ProviderError::Malformed(format!(
                "causes[{}]: confidence {} outside 0..=1",
                i, raw.confidence
            )));
        }
        let supporting: Vec<String> = raw
            .supporting_passages
            .into_iter()
            .filter(|id| known.contains(id.as_str()))
            .collect();
        let mut cause = Cause::new(label, raw.confidence as f32).with_passages(supporting);
        if let Some(explanation) = raw.explanation.filter(|e| !e.trim().is_empty()) {
            cause = cause.with_explanation(explanation.trim());
        }
        causes.push(cause);
    }
    Ok(causes)
}

// =============================================================================
// Analyzer
// =============================================================================

pub struct CauseAnalyzer {
    llm: Option<Arc<dyn LlmClient>>,
    llm_timeout: Duration,
    max_causes: usize,
    attempted_penalty: f32,
    no_knowledge_cap: f32,
}

impl CauseAnalyzer {
    pub fn new(
        llm: Option<Arc<dyn LlmClient>>,
        llm_timeout: Duration,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            llm,
            llm_timeout,
            max_causes: config.max_causes,
            attempted_penalty: config.attempted_penalty,
            no_knowledge_cap: config.no_knowledge_confidence_cap,
        }
    }

    /// Ranked causes for this turn. Never fails.
    pub async fn analyze(&self, ctx: &AnalysisContext<'_>) -> CauseAnalysis {
        if let Some(client) = &self.llm {
            match self.analyze_with_llm(client.as_ref(), ctx).await {
                Ok(causes) => {
                    info!("cause analysis: {} causes from {}", causes.len(), client.name());
                    return CauseAnalysis {
                        causes: self.finalize(causes, ctx),
                        mode: ReasoningMode::Llm,
                    };
                }
                Err(e) => warn!("cause analysis via {} failed, using rules: {}", client.name(), e),
            }
        }
        let causes = self.rule_based(ctx);
        info!("cause analysis: {} causes from rules", causes.len());
        CauseAnalysis {
            causes,
            mode: ReasoningMode::RuleBased,
        }
    }

    async fn analyze_with_llm(
        &self,
        client: &dyn LlmClient,
        ctx: &AnalysisContext<'_>,
    ) -> Result<Vec<Cause>, ProviderError> {
        let prompt = causes_prompt(ctx, self.max_causes);
        let value = tokio::time::timeout(self.llm_timeout, client.generate(&prompt, &CAUSES_SCHEMA))
            .await
            .map_err(|_| ProviderError::Timeout(self.llm_timeout.as_millis() as u64))??;
        parse_causes(value, ctx.passages)
    }

    /// Deterministic causes from passages or the category table.
    pub fn rule_based(&self, ctx: &AnalysisContext<'_>) -> Vec<Cause> {
        let device_os = ctx
            .device
            .and_then(|d| d.os.as_deref())
            .map(|os| os.to_lowercase());

        let mut causes: Vec<Cause> = Vec::new();
        for passage in ctx.passages {
            let boost = match (&device_os, &passage.metadata.os) {
                (Some(device), Some(os)) if device.contains(os.as_str()) => OS_MATCH_BOOST,
                _ => 0.0,
            };
            for known in &passage.causes {
                let score = known.likelihood.weight() * (0.5 + 0.5 * passage.similarity) + boost;
                let existing = causes
                    .iter_mut()
                    .find(|c| c.label.eq_ignore_ascii_case(known.cause.trim()));
                match existing {
                    Some(cause) => {
                        cause.confidence = cause.confidence.max(score.min(1.0));
                        if !cause.supporting_passages.iter().any(|id| id == passage.source_id()) {
                            cause.supporting_passages.push(passage.source_id().to_string());
                        }
                    }
                    None => causes.push(
                        Cause::new(known.cause.trim(), score)
                            .with_passages(vec![passage.source_id().to_string()])
                            .with_explanation(format!(
                                "Common issue for {}",
                                passage.display_title()
                            )),
                    ),
                }
            }
        }

        if causes.is_empty() {
            debug!("no passage causes, using {} table", ctx.query.category);
            let table = category_causes(ctx.query.category)
                .iter()
                .chain(GENERIC_CAUSES.iter());
            for ((label, explanation), confidence) in table.zip(TABLE_CONFIDENCE.iter()) {
                causes.push(Cause::new(*label, *confidence).with_explanation(*explanation));
            }
        }

        self.finalize(causes, ctx)
    }

    /// Penalize already-addressed causes, cap, order and truncate.
    fn finalize(&self, mut causes: Vec<Cause>, ctx: &AnalysisContext<'_>) -> Vec<Cause> {
        let addressed = addressed_causes(ctx.prior_steps, ctx.attempted);
        for cause in causes.iter_mut() {
            if addressed.contains(&cause.label.to_lowercase()) {
                debug!("down-ranking '{}', its remedies were tried", cause.label);
                cause.confidence *= self.attempted_penalty;
            }
            if ctx.passages.is_empty() {
                cause.confidence = cause.confidence.min(self.no_knowledge_cap);
            }
        }

        let position = |cause: &Cause| -> usize {
            cause
                .supporting_passages
                .first()
                .and_then(|id| ctx.passages.iter().position(|p| p.source_id() == id))
                .unwrap_or(usize::MAX)
        };
        // sort_by is stable, so full ties keep insertion order
        causes.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| position(a).cmp(&position(b)))
        });
        causes.truncate(self.max_causes);
        causes
    }
}

/// Lowercased labels of causes that earlier steps addressed and that the
/// user has since tried.
pub fn addressed_causes(prior_steps: &[Step], attempted: &BTreeSet<String>) -> HashSet<String> {
    prior_steps
        .iter()
        .filter(|s| attempted.contains(&attempt_key(&s.action)))
        .filter_map(|s| s.addresses.as_ref())
        .map(|label| label.to_lowercase())
        .collect()
}

// =============================================================================
// Severity and complexity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Expert,
}

const CRITICAL_TERMS: &[&str] = &["crash", "lost", "deleted", "corrupted", "smoking", "burning"];
const HIGH_TERMS: &[&str] = &["won't turn on", "wont turn on", "blue screen", "no power", "dead"];
const EXPERT_TERMS: &[&str] = &["motherboard", "firmware", "bios", "data recovery", "soldering"];
const COMPLEX_TERMS: &[&str] = &["blue screen", "corrupted", "driver", "registry"];
const SIMPLE_TERMS: &[&str] = &["slow", "wifi", "password", "volume"];

fn lowered(problem: &str) -> String {
    problem.to_lowercase().replace('\u{2019}', "'").replace("wi-fi", "wifi")
}

pub fn assess_severity(problem: &str, causes: &[Cause]) -> Severity {
    let text = lowered(problem);
    if CRITICAL_TERMS.iter().any(|t| text.contains(t)) {
        Severity::Critical
    } else if HIGH_TERMS.iter().any(|t| text.contains(t)) {
        Severity::High
    } else if causes.iter().any(|c| c.confidence >= 0.7) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub fn assess_complexity(problem: &str) -> Complexity {
    let text = lowered(problem);
    if EXPERT_TERMS.iter().any(|t| text.contains(t)) {
        Complexity::Expert
    } else if COMPLEX_TERMS.iter().any(|t| text.contains(t)) {
        Complexity::Complex
    } else if SIMPLE_TERMS.iter().any(|t| text.contains(t)) {
        Complexity::Simple
    } else {
        Complexity::Moderate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeLlmClient;
    use deskmate_shared::{KnownCause, Likelihood, RiskLevel};
    use serde_json::json;

    fn query(text: &str, category: Category) -> NormalizedQuery {
        NormalizedQuery {
            text: text.into(),
            statement: text.into(),
            category,
            pattern: None,
            is_follow_up: false,
            answered_clarification: false,
            follow_up_question: None,
        }
    }

    fn passage(id: &str, similarity: f32, causes: &[(&str, Likelihood)]) -> Passage {
        let mut p = Passage::new(id, Category::Networking, format!("passage {}", id));
        p.similarity = similarity;
        p.causes = causes
            .iter()
            .map(|(c, l)| KnownCause {
                cause: c.to_string(),
                likelihood: *l,
            })
            .collect();
        p
    }

    fn analyzer(llm: Option<Arc<dyn LlmClient>>) -> CauseAnalyzer {
        CauseAnalyzer::new(llm, Duration::from_millis(200), &PipelineConfig::default())
    }

    fn ctx<'a>(
        q: &'a NormalizedQuery,
        passages: &'a [Passage],
        attempted: &'a BTreeSet<String>,
        prior: &'a [Step],
    ) -> AnalysisContext<'a> {
        AnalysisContext {
            query: q,
            passages,
            device: None,
            technical_level: TechnicalLevel::Beginner,
            attempted,
            prior_steps: prior,
        }
    }

    #[test]
    fn test_rule_based_from_passages() {
        let q = query("wifi down", Category::Networking);
        let passages = vec![
            passage(
                "a",
                0.9,
                &[("Router issues", Likelihood::Medium), ("Adapter off", Likelihood::High)],
            ),
            passage("b", 0.5, &[("Router issues", Likelihood::High)]),
        ];
        let attempted = BTreeSet::new();
        let causes = analyzer(None).rule_based(&ctx(&q, &passages, &attempted, &[]));
        assert_eq!(causes[0].label, "Adapter off");
        let router = causes.iter().find(|c| c.label == "Router issues").unwrap();
        // best of 0.55 * 0.95 and 0.8 * 0.75
        assert!((router.confidence - 0.6).abs() < 1e-5);
        assert_eq!(router.supporting_passages, vec!["a", "b"]);
    }

    #[test]
    fn test_rule_based_without_passages_uses_table_and_cap() {
        let q = query("printer trouble", Category::Peripherals);
        let attempted = BTreeSet::new();
        let causes = analyzer(None).rule_based(&ctx(&q, &[], &attempted, &[]));
        assert_eq!(causes.len(), 3);
        assert_eq!(causes[0].label, "Loose or faulty connection");
        assert!(causes.iter().all(|c| c.confidence <= 0.6));
    }

    #[test]
    fn test_unknown_category_gets_generic_causes() {
        let q = query("something odd", Category::Unknown);
        let attempted = BTreeSet::new();
        let causes = analyzer(None).rule_based(&ctx(&q, &[], &attempted, &[]));
        assert_eq!(causes.len(), 2);
        assert_eq!(causes[0].label, "Software configuration issue");
    }

    #[test]
    fn test_ties_break_on_passage_position() {
        let q = query("x", Category::Networking);
        let passages = vec![
            passage("first", 0.6, &[("Cause A", Likelihood::Medium)]),
            passage("second", 0.6, &[("Cause B", Likelihood::Medium)]),
        ];
        let attempted = BTreeSet::new();
        let causes = analyzer(None).rule_based(&ctx(&q, &passages, &attempted, &[]));
        assert_eq!(causes[0].label, "Cause A");
        assert_eq!(causes[1].label, "Cause B");
    }

    #[test]
    fn test_attempted_remedies_down_rank() {
        let q = query("wifi down", Category::Networking);
        let passages = vec![passage(
            "a",
            0.8,
            &[("Adapter off", Likelihood::High), ("Router issues", Likelihood::Medium)],
        )];
        let prior =
            vec![Step::new("Turn the adapter on", "x", RiskLevel::Safe).addressing("Adapter off")];
        let mut attempted = BTreeSet::new();
        attempted.insert(attempt_key("Turn the adapter on"));

        let causes = analyzer(None).rule_based(&ctx(&q, &passages, &attempted, &prior));
        assert_eq!(causes[0].label, "Router issues");
        let adapter = causes.iter().find(|c| c.label == "Adapter off").unwrap();
        assert!((adapter.confidence - 0.8 * 0.9 * 0.5).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_llm_causes_used() {
        let fake = FakeLlmClient::new().with_response(
            "causes",
            Ok(json!({"causes": [
                {"label": "DNS misconfigured", "confidence": 0.4, "supporting_passages": ["zzz"]},
                {"label": "Router down", "confidence": 0.9, "explanation": "lights off"}
            ]})),
        );
        let q = query("wifi down", Category::Networking);
        let passages = vec![passage("a", 0.8, &[])];
        let attempted = BTreeSet::new();
        let analysis = analyzer(Some(Arc::new(fake)))
            .analyze(&ctx(&q, &passages, &attempted, &[]))
            .await;
        assert_eq!(analysis.mode, ReasoningMode::Llm);
        assert_eq!(analysis.causes[0].label, "Router down");
        // unknown passage ids are dropped
        assert!(analysis.causes[1].supporting_passages.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_llm_output_falls_back() {
        let bad_outputs = vec![
            json!({"causes": []}),
            json!({"causes": [{"label": "", "confidence": 0.5}]}),
            json!({"causes": [{"label": "x", "confidence": 1.5}]}),
            json!({"causes": [{"label": "x"}]}),
            json!({"reasons": []}),
        ];
        let q = query("printer trouble", Category::Peripherals);
        let attempted = BTreeSet::new();
        for bad in bad_outputs {
            let fake = FakeLlmClient::new().with_response("causes", Ok(bad));
            let analysis = analyzer(Some(Arc::new(fake)))
                .analyze(&ctx(&q, &[], &attempted, &[]))
                .await;
            assert_eq!(analysis.mode, ReasoningMode::RuleBased);
            assert!(!analysis.causes.is_empty());
        }
    }

    #[tokio::test]
    async fn test_llm_timeout_falls_back() {
        let fake = FakeLlmClient::new()
            .with_response("causes", Ok(json!({"causes": [{"label": "x", "confidence": 0.5}]})))
            .with_delay(Duration::from_secs(5));
        let q = query("printer trouble", Category::Peripherals);
        let attempted = BTreeSet::new();
        let started = std::time::Instant::now();
        let analysis = analyzer(Some(Arc::new(fake)))
            .analyze(&ctx(&q, &[], &attempted, &[]))
            .await;
        assert_eq!(analysis.mode, ReasoningMode::RuleBased);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_severity_and_complexity() {
        assert_eq!(assess_severity("my files were deleted", &[]), Severity::Critical);
        assert_eq!(assess_severity("laptop won't turn on", &[]), Severity::High);
        assert_eq!(assess_severity("printer odd", &[Cause::new("x", 0.8)]), Severity::Medium);
        assert_eq!(assess_severity("printer odd", &[]), Severity::Low);

        assert_eq!(assess_complexity("need to reflash the BIOS"), Complexity::Expert);
        assert_eq!(assess_complexity("driver keeps failing"), Complexity::Complex);
        assert_eq!(assess_complexity("My Wi-Fi is flaky"), Complexity::Simple);
        assert_eq!(assess_complexity("printer odd"), Complexity::Moderate);
    }
}
