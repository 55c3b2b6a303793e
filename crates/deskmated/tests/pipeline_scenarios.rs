//! End-to-end scenarios through the public pipeline API.

use async_trait::async_trait;
use deskmate_shared::{
    Category, ChatRequest, Diagnosis, DiagnosisKind, FeedbackRating, FeedbackRequest,
    HistoryMessage, IndexError, Passage, PipelineError, ProviderError, RiskLevel,
};
use deskmated::embedding::HashingEmbedder;
use deskmated::index::{builtin_pack, InMemoryIndex, KnowledgeIndex};
use deskmated::llm::{FakeLlmClient, LlmClient};
use deskmated::render;
use deskmated::{Config, Pipeline, SessionStore};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn builtin_index() -> Arc<dyn KnowledgeIndex> {
    let embedder = Arc::new(HashingEmbedder::default());
    let index = InMemoryIndex::from_entries(builtin_pack().unwrap(), embedder)
        .await
        .unwrap();
    Arc::new(index)
}

async fn rule_pipeline() -> Pipeline {
    Pipeline::new(&Config::default(), builtin_index().await, None, Arc::new(SessionStore::new()))
}

async fn llm_pipeline(config: &Config, llm: Arc<dyn LlmClient>) -> Pipeline {
    Pipeline::new(config, builtin_index().await, Some(llm), Arc::new(SessionStore::new()))
}

fn assert_well_formed(d: &Diagnosis) {
    if let Err(e) = d.check_invariants() {
        panic!("invalid diagnosis ({}): {:#?}", e, d);
    }
    for (i, step) in d.solution_steps.iter().enumerate() {
        assert_eq!(step.step_number as usize, i + 1);
    }
    assert!(d.causes.len() <= 3);
    assert!(d
        .causes
        .windows(2)
        .all(|w| w[0].confidence >= w[1].confidence));
}

/// Index that always fails.
struct BrokenIndex;

#[async_trait]
impl KnowledgeIndex for BrokenIndex {
    async fn query(&self, _text: &str, _k: usize) -> Result<Vec<(Passage, f32)>, IndexError> {
        Err(IndexError::Unavailable("connection refused".into()))
    }

    fn len(&self) -> usize {
        0
    }
}

/// Index that never answers in time.
struct StalledIndex;

#[async_trait]
impl KnowledgeIndex for StalledIndex {
    async fn query(&self, _text: &str, _k: usize) -> Result<Vec<(Passage, f32)>, IndexError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }

    fn len(&self) -> usize {
        0
    }
}

// =============================================================================
// Rule-based path
// =============================================================================

#[tokio::test]
async fn wifi_problem_gets_grounded_diagnosis() {
    let p = rule_pipeline().await;
    let d = p
        .handle(ChatRequest::new("My Wi-Fi keeps disconnecting on my laptop").with_session("wifi"))
        .await
        .unwrap();

    assert_well_formed(&d);
    assert_eq!(d.kind, DiagnosisKind::Solution);
    assert_eq!(d.category, Category::Networking);
    assert!(d.reasoning_route.starts_with("rag+rule_based+"));
    assert!(d.sources.iter().any(|s| s == "Wi-Fi not connecting"));
    assert!((3..=8).contains(&d.solution_steps.len()));
    assert!(!d.causes.is_empty());
    assert!(d.response.contains("**Step-by-Step Solution**"));
    assert!(!d.escalation);
}

#[tokio::test]
async fn format_request_carries_data_loss_warning() {
    let p = rule_pipeline().await;
    let d = p
        .handle(ChatRequest::new("I need to format my hard drive"))
        .await
        .unwrap();

    assert_well_formed(&d);
    let format_step = d
        .solution_steps
        .iter()
        .find(|s| s.action.to_lowercase().starts_with("format"))
        .expect("format step");
    assert_eq!(format_step.risk_level, RiskLevel::Risky);

    let tag = format!("Step {}:", format_step.step_number);
    assert!(d
        .warnings
        .iter()
        .any(|w| w.starts_with("[data-loss]") && w.contains(&tag)));

    let backup = d
        .solution_steps
        .iter()
        .position(|s| s.action.to_lowercase().contains("back up"))
        .expect("backup step");
    assert!(backup + 1 < format_step.step_number as usize);
}

#[tokio::test]
async fn empty_message_asks_for_details() {
    let p = rule_pipeline().await;
    let d = p.handle(ChatRequest::new("   ")).await.unwrap();
    assert_eq!(d.kind, DiagnosisKind::Clarification);
    assert!(d.solution_steps.is_empty());
    assert!(d.causes.is_empty());
    assert!(d.follow_up_question.is_some());
    assert_well_formed(&d);
}

#[tokio::test]
async fn vague_problem_then_answer_produces_solution() {
    let p = rule_pipeline().await;
    let first = p
        .handle(ChatRequest::new("it's broken").with_session("vague"))
        .await
        .unwrap();
    assert_eq!(first.kind, DiagnosisKind::Clarification);

    let second = p
        .handle(ChatRequest::new("my printer is not printing anything").with_session("vague"))
        .await
        .unwrap();
    assert_eq!(second.kind, DiagnosisKind::Solution);
    assert_eq!(second.category, Category::Peripherals);
    assert_well_formed(&second);
}

#[tokio::test]
async fn unknown_problem_falls_back_to_general_guidance() {
    let p = rule_pipeline().await;
    let d = p
        .handle(ChatRequest::new("my quantum flux capacitor hums loudly"))
        .await
        .unwrap();

    assert_well_formed(&d);
    assert!(d.reasoning_route.starts_with("no_kb_match+rule_based+"));
    assert!(d.response.starts_with(render::GENERAL_GUIDANCE));
    assert!(d.solution_steps.len() >= 3);
    let cap = Config::default().pipeline.no_knowledge_confidence_cap;
    assert!(d.causes.iter().all(|c| c.confidence <= cap + f32::EPSILON));
    assert!(d.sources.is_empty());
}

#[tokio::test]
async fn dangerous_problem_escalates() {
    let p = rule_pipeline().await;
    let d = p
        .handle(ChatRequest::new("My laptop makes a burning smell and sparks"))
        .await
        .unwrap();

    assert_well_formed(&d);
    assert!(d.escalation);
    assert!(d.warnings.iter().any(|w| w.starts_with("[physical-danger]")));
}

#[tokio::test]
async fn same_request_same_diagnosis() {
    let p = rule_pipeline().await;
    let a = p
        .handle(ChatRequest::new("computer is slow and freezing").with_session("det-a"))
        .await
        .unwrap();
    let b = p
        .handle(ChatRequest::new("computer is slow and freezing").with_session("det-b"))
        .await
        .unwrap();

    assert_eq!(a.causes, b.causes);
    assert_eq!(a.solution_steps, b.solution_steps);
    assert_eq!(a.warnings, b.warnings);
    assert_eq!(a.reasoning_route, b.reasoning_route);
}

// =============================================================================
// Conversation state
// =============================================================================

#[tokio::test]
async fn failed_attempt_down_ranks_cause_and_skips_steps() {
    let p = rule_pipeline().await;
    let first = p
        .handle(ChatRequest::new("My Wi-Fi keeps disconnecting on my laptop").with_session("retry"))
        .await
        .unwrap();
    let top = first.top_cause().unwrap().clone();
    assert!(first.solution_steps.iter().all(|s| s.addresses.is_some()));
    assert!(first
        .solution_steps
        .iter()
        .any(|s| s.addresses.as_deref() == Some(top.label.as_str())));

    let second = p
        .handle(ChatRequest::new("that didn't work").with_session("retry"))
        .await
        .unwrap();
    assert_eq!(second.kind, DiagnosisKind::Solution);
    assert_well_formed(&second);

    // either gone or strictly lower in both confidence and rank
    if let Some(rank) = second.causes.iter().position(|c| c.label == top.label) {
        assert!(rank > 0, "top cause kept its rank: {:?}", second.causes);
        assert!(second.causes[rank].confidence < top.confidence);
    }

    let tried: Vec<String> = first
        .solution_steps
        .iter()
        .map(|s| s.action.to_lowercase())
        .collect();
    for step in &second.solution_steps {
        assert!(
            !tried.contains(&step.action.to_lowercase()),
            "repeated step: {}",
            step.action
        );
    }

    let session = p.session("retry").await.unwrap();
    assert_eq!(session.turns().len(), 4);
    for action in &first.solution_steps {
        assert!(session.is_attempted(&action.action));
    }
}

#[tokio::test]
async fn retry_does_not_reword_tried_remedies() {
    let p = rule_pipeline().await;
    let first = p
        .handle(
            ChatRequest::new("My Wi-Fi keeps disconnecting on my laptop").with_session("reword"),
        )
        .await
        .unwrap();
    assert!(first
        .solution_steps
        .iter()
        .any(|s| s.action.to_lowercase().contains("router")));

    let second = p
        .handle(ChatRequest::new("that didn't work").with_session("reword"))
        .await
        .unwrap();
    assert_eq!(second.kind, DiagnosisKind::Solution);
    assert_well_formed(&second);
    assert!(!second.solution_steps.is_empty());
    for step in &second.solution_steps {
        let action = step.action.to_lowercase();
        assert!(!action.contains("router"), "router restart suggested again: {}", step.action);
        assert!(!action.contains("airplane mode"), "Wi-Fi toggle suggested again: {}", step.action);
    }
}

#[tokio::test]
async fn caller_history_seeds_new_session() {
    let p = rule_pipeline().await;
    let mut request = ChatRequest::new("that didn't work").with_session("seeded");
    request.conversation_history = vec![
        HistoryMessage {
            role: "system".into(),
            content: "You are helpful".into(),
        },
        HistoryMessage {
            role: "user".into(),
            content: "printer is not printing anything".into(),
        },
        HistoryMessage {
            role: "assistant".into(),
            content: "Try restarting the printer".into(),
        },
    ];
    let d = p.handle(request).await.unwrap();
    assert_well_formed(&d);
    assert_eq!(d.kind, DiagnosisKind::Solution);
    assert_eq!(d.category, Category::Peripherals);

    let session = p.session("seeded").await.unwrap();
    // two seeded turns plus this exchange
    assert_eq!(session.turns().len(), 4);
}

#[tokio::test]
async fn concurrent_turns_on_one_session_both_land() {
    let p = Arc::new(rule_pipeline().await);
    let a = {
        let p = p.clone();
        tokio::spawn(async move {
            p.handle(ChatRequest::new("printer is not printing anything").with_session("busy"))
                .await
        })
    };
    let b = {
        let p = p.clone();
        tokio::spawn(async move {
            p.handle(ChatRequest::new("phone battery drains fast").with_session("busy"))
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let session = p.session("busy").await.unwrap();
    assert_eq!(session.turns().len(), 4);
    assert_eq!(session.diagnoses().count(), 2);
}

#[tokio::test]
async fn feedback_flow() {
    let p = rule_pipeline().await;
    p.handle(ChatRequest::new("phone battery drains fast").with_session("fb"))
        .await
        .unwrap();

    let outcome = p
        .record_feedback(FeedbackRequest {
            session_id: "fb".into(),
            rating: FeedbackRating::Helpful,
            solved: true,
            comment: Some("brightness was the culprit".into()),
        })
        .await
        .unwrap();
    assert!(outcome.resolved);
    assert_eq!(outcome.marked_attempted, 0);

    let unknown = p
        .record_feedback(FeedbackRequest {
            session_id: "never-seen".into(),
            rating: FeedbackRating::NotHelpful,
            solved: false,
            comment: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(unknown, PipelineError::UnknownSession(_)));
    assert!(unknown.is_caller_facing());
}

#[tokio::test]
async fn oversized_message_rejected() {
    let p = rule_pipeline().await;
    let err = p
        .handle(ChatRequest::new("x".repeat(2001)))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(p.sessions().is_empty().await);
}

// =============================================================================
// Degraded dependencies
// =============================================================================

#[tokio::test]
async fn broken_index_still_answers() {
    let p = Pipeline::new(
        &Config::default(),
        Arc::new(BrokenIndex),
        None,
        Arc::new(SessionStore::new()),
    );
    let d = p
        .handle(ChatRequest::new("My Wi-Fi keeps disconnecting on my laptop"))
        .await
        .unwrap();
    assert_well_formed(&d);
    assert!(d.reasoning_route.starts_with("no_kb_match+"));
    assert!(d.solution_steps.len() >= 3);
}

#[tokio::test]
async fn stalled_index_times_out() {
    let mut config = Config::default();
    config.retrieval.timeout_ms = 50;
    let p = Pipeline::new(&config, Arc::new(StalledIndex), None, Arc::new(SessionStore::new()));

    let started = Instant::now();
    let d = p
        .handle(ChatRequest::new("printer is not printing anything"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(d.reasoning_route.starts_with("no_kb_match+"));
    assert_well_formed(&d);

    let results = p.search("printer", 5, None, None).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn llm_output_is_used_when_valid() {
    let fake = Arc::new(
        FakeLlmClient::new()
            .with_response(
                "causes",
                Ok(json!({"causes": [
                    {"label": "Router firmware crashed", "confidence": 0.8, "supporting_passages": ["wifi_1"]},
                    {"label": "Wi-Fi adapter power saving", "confidence": 0.5}
                ]})),
            )
            .with_response(
                "steps",
                Ok(json!({"steps": [
                    {"action": "Restart the router", "explanation": "Clears a crashed firmware state", "risk_level": "safe"},
                    {"action": "Turn off power saving for the Wi-Fi adapter", "explanation": "Stops the adapter sleeping", "risk_level": "safe"},
                    {"action": "Move closer to the router", "explanation": "Rules out weak signal", "risk_level": "safe"}
                ]})),
            ),
    );
    let p = llm_pipeline(&Config::default(), fake.clone()).await;
    let d = p
        .handle(ChatRequest::new("My Wi-Fi keeps disconnecting on my laptop"))
        .await
        .unwrap();

    assert_well_formed(&d);
    assert!(d.reasoning_route.starts_with("rag+llm+"));
    assert_eq!(d.causes[0].label, "Router firmware crashed");
    assert_eq!(d.solution_steps[0].action, "Restart the router");
    assert_eq!(fake.call_count(), 2);
}

#[tokio::test]
async fn malformed_llm_output_falls_back_to_rules() {
    let fake = Arc::new(
        FakeLlmClient::new()
            .with_response("causes", Ok(json!({"answer": "probably the router"})))
            .with_response("steps", Ok(json!({"steps": []}))),
    );
    let p = llm_pipeline(&Config::default(), fake).await;
    let d = p
        .handle(ChatRequest::new("My Wi-Fi keeps disconnecting on my laptop"))
        .await
        .unwrap();

    assert_well_formed(&d);
    assert!(d.reasoning_route.starts_with("rag+rule_based+"));
    assert!(d.solution_steps.len() >= 3);
}

#[tokio::test]
async fn slow_llm_falls_back_to_rules() {
    let mut config = Config::default();
    config.llm.timeout_secs = 1;
    let fake = Arc::new(
        FakeLlmClient::new()
            .with_response("causes", Err(ProviderError::RateLimited))
            .with_delay(Duration::from_secs(3)),
    );
    let p = llm_pipeline(&config, fake).await;

    let started = Instant::now();
    let d = p
        .handle(ChatRequest::new("printer is not printing anything"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(d.reasoning_route.contains("+rule_based+"));
    assert_well_formed(&d);
}

// =============================================================================
// Analysis and search
// =============================================================================

#[tokio::test]
async fn analyze_reports_risk_profile() {
    let p = rule_pipeline().await;
    let reset = p
        .analyze("I want to factory reset my phone", None)
        .await
        .unwrap();
    assert!(reset.requires_data_backup);
    assert!(reset.safe_to_attempt);
    assert!(!reset.likely_causes.is_empty());

    let fire = p
        .analyze("My laptop makes a burning smell and sparks", None)
        .await
        .unwrap();
    assert!(!fire.safe_to_attempt);
}

#[tokio::test]
async fn search_filters_by_category() {
    let p = rule_pipeline().await;
    let results = p
        .search("slow computer", 10, Some(Category::Performance), None)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|r| r.metadata.category == Category::Performance));
    assert!(results
        .windows(2)
        .all(|w| w[0].similarity >= w[1].similarity));

    assert!(p.search("", 10, None, None).await.is_err());
}
