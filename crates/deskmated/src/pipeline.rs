//! The diagnostic pipeline.
//!
//! normalize -> retrieve -> rank -> analyze causes -> compose steps ->
//! validate safety -> render. All slow work happens while the session is
//! checked out but before anything is written to it; the user turn, the
//! assistant turn and any attempted-step marks are committed together at
//! the end, so a dropped turn leaves the session untouched.

use crate::analyzer::{
    assess_complexity, assess_severity, AnalysisContext, CauseAnalyzer, Complexity, ReasoningMode,
    Severity,
};
use crate::classifier::{CategoryClassifier, KeywordClassifier};
use crate::composer::SolutionComposer;
use crate::config::{Config, EmbedderKind, PipelineConfig};
use crate::embedding::{Embedder, HashingEmbedder, OllamaEmbedder};
use crate::index::{builtin_pack, load_pack, InMemoryIndex, KnowledgeIndex, SearchFilter};
use crate::llm::{client_from_config, LlmClient};
use crate::normalizer::{Normalized, NormalizedQuery, QueryNormalizer};
use crate::ranker::PassageRanker;
use crate::render::{self, questions};
use crate::safety::{self, SafetyValidator};
use crate::sessions::SessionStore;
use anyhow::Context;
use deskmate_shared::request::{validate_session_id, MAX_MESSAGE_CHARS};
use deskmate_shared::session::attempt_key;
use deskmate_shared::{
    Category, Cause, ChatRequest, DeviceInfo, Diagnosis, DiagnosisKind, FeedbackOutcome,
    FeedbackRequest, HistoryMessage, Passage, PipelineError, Session, Step, Turn,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sources listed in a diagnosis
const MAX_SOURCES: usize = 3;

/// Upper bound for `search` results
const MAX_SEARCH_LIMIT: usize = 50;

const BACKUP_TERMS: &[&str] = &[
    "format",
    "reset",
    "reinstall",
    "delete",
    "wipe",
    "erase",
    "partition",
];

/// Assessment of a problem without a step plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemAnalysis {
    pub category: Category,
    pub severity: Severity,
    pub likely_causes: Vec<Cause>,
    pub complexity: Complexity,
    pub requires_data_backup: bool,
    pub safe_to_attempt: bool,
}

/// Daemon status reported over RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub version: String,
    pub passages: usize,
    pub llm: Option<String>,
    pub sessions: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    llm_name: Option<String>,
    normalizer: QueryNormalizer,
    index: Arc<dyn KnowledgeIndex>,
    ranker: PassageRanker,
    top_k: usize,
    index_timeout: Duration,
    analyzer: CauseAnalyzer,
    composer: SolutionComposer,
    safety: SafetyValidator,
    sessions: Arc<SessionStore>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        index: Arc<dyn KnowledgeIndex>,
        llm: Option<Arc<dyn LlmClient>>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self::with_classifier(config, index, llm, sessions, Arc::new(KeywordClassifier::new()))
    }

    pub fn with_classifier(
        config: &Config,
        index: Arc<dyn KnowledgeIndex>,
        llm: Option<Arc<dyn LlmClient>>,
        sessions: Arc<SessionStore>,
        classifier: Arc<dyn CategoryClassifier>,
    ) -> Self {
        let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
        let llm_name = llm.as_ref().map(|c| c.name());
        info!(
            "pipeline: classifier={}, index={} passages, llm={}",
            classifier.name(),
            index.len(),
            llm_name.as_deref().unwrap_or("none")
        );
        Self {
            config: config.pipeline.clone(),
            llm_name,
            normalizer: QueryNormalizer::new(classifier, config.pipeline.min_query_tokens),
            index,
            ranker: PassageRanker::new(
                config.retrieval.similarity_threshold,
                config.retrieval.result_cap,
            ),
            top_k: config.retrieval.top_k,
            index_timeout: Duration::from_millis(config.retrieval.timeout_ms),
            analyzer: CauseAnalyzer::new(llm.clone(), llm_timeout, &config.pipeline),
            composer: SolutionComposer::new(llm, llm_timeout, &config.pipeline),
            safety: SafetyValidator::new(),
            sessions,
        }
    }

    /// Build the index from the configured knowledge pack and embedder.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let entries = match &config.retrieval.knowledge_path {
            Some(path) => load_pack(path)
                .with_context(|| format!("loading knowledge pack {}", path.display()))?,
            None => builtin_pack().context("loading built-in knowledge pack")?,
        };
        let embedder: Arc<dyn Embedder> = match config.retrieval.embedder {
            EmbedderKind::Hashing => Arc::new(HashingEmbedder::default()),
            EmbedderKind::Ollama => Arc::new(
                OllamaEmbedder::new(
                    &config.retrieval.ollama_url,
                    &config.retrieval.embedding_model,
                    Duration::from_millis(config.retrieval.timeout_ms),
                )
                .context("creating embedding client")?,
            ),
        };
        let index = InMemoryIndex::from_entries(entries, embedder)
            .await
            .context("building knowledge index")?;
        let llm = client_from_config(&config.llm);
        Ok(Self::new(config, Arc::new(index), llm, Arc::new(SessionStore::new())))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub async fn status(&self) -> PipelineStatus {
        PipelineStatus {
            version: deskmate_shared::VERSION.to_string(),
            passages: self.index.len(),
            llm: self.llm_name.clone(),
            sessions: self.sessions.len().await,
        }
    }

    // =========================================================================
    // Chat
    // =========================================================================

    /// Run one conversational turn.
    pub async fn handle(&self, request: ChatRequest) -> Result<Diagnosis, PipelineError> {
        request.validate()?;
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut session = self.sessions.checkout(&session_id).await;

        let seeds = if session.is_empty() {
            seed_turns(&request.conversation_history)
        } else {
            Vec::new()
        };
        let history: Vec<Turn> = if session.is_empty() {
            let start = seeds.len().saturating_sub(self.config.history_window);
            seeds[start..].to_vec()
        } else {
            session.recent(self.config.history_window).to_vec()
        };

        let device = request
            .device_info
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| session.device().cloned());

        let (diagnosis, marks) = match self
            .normalizer
            .normalize(&request.message, &history, device.as_ref())
        {
            Normalized::Onboarding => {
                info!("[{}] onboarding", session_id);
                (onboarding(&session_id), Vec::new())
            }
            Normalized::Clarify { question } => {
                info!("[{}] asking for clarification", session_id);
                (clarification(&session_id, &request.message, question), Vec::new())
            }
            Normalized::Query(query) => {
                self.solve(&session_id, &session, query, device.as_ref(), &request)
                    .await
            }
        };

        // commit
        for turn in seeds {
            session.append(turn);
        }
        if let Some(device) = request.device_info.clone() {
            session.set_device(device);
        }
        for action in &marks {
            session.mark_attempted(action);
        }
        session.append(Turn::user(request.message.clone()));
        session.append(Turn::assistant(diagnosis.response.clone(), Some(diagnosis.clone())));

        Ok(diagnosis)
    }

    async fn solve(
        &self,
        session_id: &str,
        session: &Session,
        query: NormalizedQuery,
        device: Option<&DeviceInfo>,
        request: &ChatRequest,
    ) -> (Diagnosis, Vec<String>) {
        // a follow-up report means the last plan was tried
        let marks: Vec<String> = if query.is_follow_up {
            session
                .last_diagnosis()
                .map(|d| d.solution_steps.iter().map(|s| s.action.clone()).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut attempted: BTreeSet<String> = session.attempted_solutions().clone();
        attempted.extend(marks.iter().map(|a| attempt_key(a)));
        let prior_steps: Vec<Step> = session
            .diagnoses()
            .flat_map(|d| d.solution_steps.iter().cloned())
            .collect();

        let passages = self.retrieve(&query.text).await;
        info!(
            "[{}] {} query '{}': {} passages",
            session_id,
            query.category,
            query.statement,
            passages.len()
        );

        let ctx = AnalysisContext {
            query: &query,
            passages: &passages,
            device,
            technical_level: request.technical_level,
            attempted: &attempted,
            prior_steps: &prior_steps,
        };
        let analysis = self.analyzer.analyze(&ctx).await;
        let composition = self.composer.compose(&ctx, &analysis.causes).await;
        let report = self.safety.validate(&query.text, composition.steps);

        let both_llm =
            analysis.mode == ReasoningMode::Llm && composition.mode == ReasoningMode::Llm;
        let mode = if both_llm {
            ReasoningMode::Llm
        } else {
            ReasoningMode::RuleBased
        };
        let route = reasoning_route(!passages.is_empty(), mode, query.follow_up_question.is_some());

        let next_steps = render::next_steps(report.steps.len(), report.escalation);
        let mut response = render::summary(
            &query.statement,
            &analysis.causes,
            &report.steps,
            &report.warnings,
            next_steps,
            query.follow_up_question.as_deref(),
        );
        if passages.is_empty() {
            response = format!("{}\n\n{}", render::GENERAL_GUIDANCE, response);
        }

        let diagnosis = Diagnosis {
            response,
            session_id: session_id.to_string(),
            kind: DiagnosisKind::Solution,
            category: query.category,
            problem_understanding: query.statement.clone(),
            causes: analysis.causes,
            solution_steps: report.steps,
            warnings: report.warnings,
            next_steps: next_steps.to_string(),
            escalation: report.escalation,
            follow_up_question: query.follow_up_question.clone(),
            reasoning_route: route,
            sources: passages
                .iter()
                .take(MAX_SOURCES)
                .map(|p| p.display_title().to_string())
                .collect(),
        };
        if let Err(violation) = diagnosis.check_invariants() {
            error!("[{}] diagnosis violates its contract: {}", session_id, violation);
        }
        (diagnosis, marks)
    }

    /// Ranked passages for `text`. Index failures and timeouts degrade to
    /// no passages.
    async fn retrieve(&self, text: &str) -> Vec<Passage> {
        match tokio::time::timeout(self.index_timeout, self.index.query(text, self.top_k)).await {
            Ok(Ok(hits)) => self.ranker.rank(hits),
            Ok(Err(e)) => {
                warn!("index query failed, continuing without passages: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "index query timed out after {} ms, continuing without passages",
                    self.index_timeout.as_millis()
                );
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Feedback, analysis, search, sessions
    // =========================================================================

    pub async fn record_feedback(
        &self,
        feedback: FeedbackRequest,
    ) -> Result<FeedbackOutcome, PipelineError> {
        validate_session_id(&feedback.session_id)?;
        let mut session = self
            .sessions
            .checkout_existing(&feedback.session_id)
            .await
            .ok_or_else(|| PipelineError::UnknownSession(feedback.session_id.clone()))?;

        let mut marked = 0;
        if feedback.solved {
            session.mark_resolved();
        } else {
            let actions: Vec<String> = session
                .last_diagnosis()
                .map(|d| d.solution_steps.iter().map(|s| s.action.clone()).collect())
                .unwrap_or_default();
            for action in &actions {
                if session.mark_attempted(action) {
                    marked += 1;
                }
            }
        }
        info!(
            "[{}] feedback {:?} solved={} marked={}{}",
            feedback.session_id,
            feedback.rating,
            feedback.solved,
            marked,
            feedback
                .comment
                .as_deref()
                .map(|c| format!(" comment={:?}", c))
                .unwrap_or_default()
        );
        Ok(FeedbackOutcome {
            session_id: feedback.session_id,
            marked_attempted: marked,
            resolved: session.is_resolved(),
        })
    }

    /// Category, causes and risk profile of a problem, no steps.
    pub async fn analyze(
        &self,
        problem: &str,
        device: Option<&DeviceInfo>,
    ) -> Result<ProblemAnalysis, PipelineError> {
        validate_text(problem, "problem_description")?;
        let query = self.normalizer.query(problem, device);
        let passages = self.retrieve(&query.text).await;
        let attempted = BTreeSet::new();
        let ctx = AnalysisContext {
            query: &query,
            passages: &passages,
            device,
            technical_level: Default::default(),
            attempted: &attempted,
            prior_steps: &[],
        };
        let causes = self.analyzer.analyze(&ctx).await.causes;

        let category = match (query.category, passages.first()) {
            (Category::Unknown, Some(top)) => top.metadata.category,
            (category, _) => category,
        };
        let lowered = problem.to_lowercase();
        Ok(ProblemAnalysis {
            category,
            severity: assess_severity(problem, &causes),
            complexity: assess_complexity(problem),
            requires_data_backup: BACKUP_TERMS.iter().any(|t| lowered.contains(t)),
            safe_to_attempt: !safety::problem_is_dangerous(problem),
            likely_causes: causes,
        })
    }

    /// Knowledge passages for `query`, optionally filtered.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        category: Option<Category>,
        device_type: Option<String>,
    ) -> Result<Vec<Passage>, PipelineError> {
        validate_text(query, "query")?;
        let filter = SearchFilter {
            category,
            device_type,
        };
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        let search = self
            .index
            .search(query, limit, self.ranker.threshold(), &filter);
        match tokio::time::timeout(self.index_timeout, search).await {
            Ok(Ok(passages)) => Ok(passages),
            Ok(Err(e)) => {
                warn!("search failed, returning no results: {}", e);
                Ok(Vec::new())
            }
            Err(_) => {
                warn!("search timed out, returning no results");
                Ok(Vec::new())
            }
        }
    }

    pub async fn session(&self, id: &str) -> Result<Session, PipelineError> {
        validate_session_id(id)?;
        self.sessions
            .snapshot(id)
            .await
            .ok_or_else(|| PipelineError::UnknownSession(id.to_string()))
    }

    /// Evict a session. Returns whether it existed.
    pub async fn clear_session(&self, id: &str) -> Result<bool, PipelineError> {
        validate_session_id(id)?;
        Ok(self.sessions.evict(id).await)
    }
}

fn validate_text(text: &str, field: &str) -> Result<(), PipelineError> {
    if text.trim().is_empty() {
        return Err(PipelineError::Validation(format!("{} must not be empty", field)));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(PipelineError::Validation(format!(
            "{} exceeds {} characters",
            field, MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

/// Turns built from caller-supplied history. System messages are dropped.
fn seed_turns(history: &[HistoryMessage]) -> Vec<Turn> {
    history
        .iter()
        .filter_map(|m| match m.role.as_str() {
            "user" => Some(Turn::user(m.content.clone())),
            "assistant" => Some(Turn::assistant(m.content.clone(), None)),
            _ => None,
        })
        .collect()
}

/// Stable label of the path a turn took, e.g. `rag+rule_based+no_follow_up`.
pub fn reasoning_route(had_passages: bool, mode: ReasoningMode, asked_follow_up: bool) -> String {
    format!(
        "{}+{}+{}",
        if had_passages { "rag" } else { "no_kb_match" },
        mode.as_str(),
        if asked_follow_up { "asked_follow_up" } else { "no_follow_up" }
    )
}

fn onboarding(session_id: &str) -> Diagnosis {
    let mut diagnosis = Diagnosis::conversational(
        DiagnosisKind::Onboarding,
        session_id,
        render::ONBOARDING_TEXT,
        questions::ONBOARDING,
    );
    diagnosis.problem_understanding = "Greeting / onboarding".to_string();
    diagnosis.next_steps = render::ONBOARDING_NEXT_STEPS.to_string();
    diagnosis
}

fn clarification(session_id: &str, raw: &str, question: String) -> Diagnosis {
    let mut diagnosis = Diagnosis::conversational(
        DiagnosisKind::Clarification,
        session_id,
        question.clone(),
        question,
    );
    diagnosis.problem_understanding = raw.trim().to_string();
    diagnosis
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskmate_shared::FeedbackRating;

    async fn pipeline() -> Pipeline {
        Pipeline::from_config(&Config::default()).await.unwrap()
    }

    #[test]
    fn test_reasoning_route_labels() {
        assert_eq!(
            reasoning_route(true, ReasoningMode::RuleBased, false),
            "rag+rule_based+no_follow_up"
        );
        assert_eq!(
            reasoning_route(false, ReasoningMode::Llm, true),
            "no_kb_match+llm+asked_follow_up"
        );
    }

    #[test]
    fn test_seed_turns_skip_system() {
        let history = vec![
            HistoryMessage {
                role: "system".into(),
                content: "be nice".into(),
            },
            HistoryMessage {
                role: "user".into(),
                content: "my printer".into(),
            },
        ];
        let turns = seed_turns(&history);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text(), "my printer");
    }

    #[tokio::test]
    async fn test_greeting_onboards() {
        let p = pipeline().await;
        let d = p.handle(ChatRequest::new("hello")).await.unwrap();
        assert_eq!(d.kind, DiagnosisKind::Onboarding);
        assert!(d.solution_steps.is_empty());
        assert_eq!(d.follow_up_question.as_deref(), Some(questions::ONBOARDING));
    }

    #[tokio::test]
    async fn test_session_records_turns() {
        let p = pipeline().await;
        let d = p
            .handle(ChatRequest::new("printer is not printing anything").with_session("s-1"))
            .await
            .unwrap();
        assert_eq!(d.session_id, "s-1");
        let session = p.session("s-1").await.unwrap();
        assert_eq!(session.turns().len(), 2);
        assert!(session.last_diagnosis().is_some());
    }

    #[tokio::test]
    async fn test_feedback_marks_steps() {
        let p = pipeline().await;
        let d = p
            .handle(ChatRequest::new("printer is not printing anything").with_session("s-2"))
            .await
            .unwrap();
        let outcome = p
            .record_feedback(FeedbackRequest {
                session_id: "s-2".into(),
                rating: FeedbackRating::NotHelpful,
                solved: false,
                comment: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.marked_attempted, d.solution_steps.len());
        assert!(!outcome.resolved);

        let unknown = p
            .record_feedback(FeedbackRequest {
                session_id: "nope".into(),
                rating: FeedbackRating::Helpful,
                solved: true,
                comment: None,
            })
            .await;
        assert!(matches!(unknown, Err(PipelineError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_analyze_format_problem() {
        let p = pipeline().await;
        let analysis = p.analyze("I need to format my hard drive", None).await.unwrap();
        assert!(analysis.requires_data_backup);
        assert!(analysis.safe_to_attempt);
        assert!(!analysis.likely_causes.is_empty());
        assert!(p.analyze("   ", None).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_session() {
        let p = pipeline().await;
        p.handle(ChatRequest::new("hello").with_session("s-3")).await.unwrap();
        assert!(p.clear_session("s-3").await.unwrap());
        assert!(!p.clear_session("s-3").await.unwrap());
        assert!(matches!(p.session("s-3").await, Err(PipelineError::UnknownSession(_))));
    }
}
