//! Solution composer.
//!
//! Builds the ordered step list for the top cause and the causes close to
//! it. Steps are bounded to `[min_steps, max_steps]`, skip anything the user
//! already tried, and each one records the cause it addresses so a later
//! "that didn't work" can down-rank that cause.

use crate::analyzer::{addressed_causes, AnalysisContext, ReasoningMode};
use crate::config::PipelineConfig;
use crate::embedding::content_terms;
use crate::llm::LlmClient;
use crate::normalizer::ProblemPattern;
use crate::prompts::{steps_prompt, STEPS_SCHEMA};
use deskmate_shared::diagnosis::renumber;
use deskmate_shared::session::attempt_key;
use deskmate_shared::{Category, Cause, ProviderError, RiskLevel, Step};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    /// Numbered 1..N
    pub steps: Vec<Step>,
    pub mode: ReasoningMode,
}

struct Remedy {
    action: &'static str,
    why: &'static str,
    risk: RiskLevel,
}

const fn safe(action: &'static str, why: &'static str) -> Remedy {
    Remedy {
        action,
        why,
        risk: RiskLevel::Safe,
    }
}

// =============================================================================
// Templates
// =============================================================================

const DISK_FORMAT_REMEDIES: &[Remedy] = &[
    safe(
        "Back up every file you want to keep to another drive or cloud storage",
        "Formatting erases everything on the drive",
    ),
    safe(
        "Confirm which drive is the target in Disk Management (Windows) or Disk Utility (macOS)",
        "Picking the wrong drive destroys the wrong data",
    ),
    Remedy {
        action: "Format the drive and choose a file system (NTFS, exFAT or APFS)",
        why: "Creates a clean, empty file system",
        risk: RiskLevel::Risky,
    },
    safe(
        "Copy your files back and check that the drive shows its full capacity",
        "Confirms the drive works after the change",
    ),
];

const FACTORY_RESET_REMEDIES: &[Remedy] = &[
    safe(
        "Back up photos, documents and app data to cloud storage or an external drive",
        "A factory reset erases all personal data",
    ),
    safe(
        "Sign out of accounts and note any software license keys",
        "Some licenses and activation locks are tied to the old install",
    ),
    Remedy {
        action: "Perform a factory reset from the device's recovery settings",
        why: "Returns the system to its original state",
        risk: RiskLevel::Risky,
    },
];

const WIFI_REMEDIES: &[Remedy] = &[
    safe(
        "Check that Wi-Fi is turned on and airplane mode is off",
        "Wi-Fi is often switched off by accident",
    ),
    safe(
        "Restart your router by unplugging it for 30 seconds",
        "Clears temporary glitches in the router",
    ),
    safe(
        "Forget the network and reconnect with the correct password",
        "Removes a stale or wrong saved network profile",
    ),
];

const NO_POWER_REMEDIES: &[Remedy] = &[
    safe(
        "Plug the device into a different outlet with a known good charger",
        "Rules out the outlet and the adapter",
    ),
    safe(
        "Hold the power button for 30 seconds, then try to start the device",
        "Clears residual power and forces a clean start",
    ),
    safe(
        "Leave it charging for at least 30 minutes before trying again",
        "A fully drained battery needs time before it can boot",
    ),
];

const PRINTER_REMEDIES: &[Remedy] = &[
    safe(
        "Check that the printer shows as online and has paper and ink",
        "The printer must be ready to accept jobs",
    ),
    safe(
        "Clear the print queue by cancelling all documents",
        "Stuck documents block new print jobs",
    ),
    safe(
        "Turn the printer off and on and reconnect its cable or Wi-Fi",
        "Resets the connection between computer and printer",
    ),
];

const SLOWNESS_REMEDIES: &[Remedy] = &[
    safe(
        "Open the task manager or activity monitor and close programs using the most resources",
        "Frees memory and CPU for what you are doing",
    ),
    safe(
        "Turn off programs that start automatically at login",
        "Fewer background programs means a faster system",
    ),
    safe(
        "Free up disk space by removing files and apps you no longer need",
        "A nearly full drive slows down the whole system",
    ),
];

fn pattern_remedies(pattern: ProblemPattern) -> &'static [Remedy] {
    match pattern {
        ProblemPattern::DiskFormat => DISK_FORMAT_REMEDIES,
        ProblemPattern::FactoryReset => FACTORY_RESET_REMEDIES,
        ProblemPattern::WifiConnectivity => WIFI_REMEDIES,
        ProblemPattern::NoPower => NO_POWER_REMEDIES,
        ProblemPattern::PrinterNotPrinting => PRINTER_REMEDIES,
        ProblemPattern::Slowness => SLOWNESS_REMEDIES,
        _ => &[],
    }
}

/// Remedies for the generic causes of the fallback tables, keyed by label.
const CAUSE_REMEDIES: &[(&str, Remedy)] = &[
    (
        "Router or modem needs a restart",
        safe(
            "Restart your router and modem by unplugging them for 30 seconds",
            "Clears stuck network equipment",
        ),
    ),
    (
        "Network adapter settings are wrong",
        safe(
            "Turn the network adapter off and on again in network settings",
            "Reloads the adapter configuration",
        ),
    ),
    (
        "Too many programs running in the background",
        safe(
            "Close programs you are not using and turn off ones that start at login",
            "Frees memory and CPU",
        ),
    ),
    (
        "Low free disk space",
        safe(
            "Free up disk space by emptying the trash and removing unused apps",
            "The system needs free space to run well",
        ),
    ),
    (
        "Pending or failed system update",
        safe(
            "Open the update settings and finish or retry any pending update",
            "A half-installed update leaves the system inconsistent",
        ),
    ),
    (
        "Corrupted system settings",
        safe(
            "Run the built-in troubleshooter for the feature that misbehaves",
            "Repairs common settings problems automatically",
        ),
    ),
    (
        "Loose or faulty connection",
        safe(
            "Unplug and firmly reconnect the cable, or re-pair the wireless device",
            "Most peripheral problems are connection problems",
        ),
    ),
    (
        "Outdated device driver",
        Remedy {
            action: "Install the latest driver from the manufacturer's website",
            why: "The device needs a driver that matches the system",
            risk: RiskLevel::Caution,
        },
    ),
    (
        "Background apps misbehaving",
        safe(
            "Check battery and app usage in settings and close or remove the worst offender",
            "One misbehaving app can slow or drain the whole phone",
        ),
    ),
    (
        "Outdated app or OS version",
        safe(
            "Update the app and the phone's operating system",
            "Newer versions fix known bugs",
        ),
    ),
    (
        "Power or cable problem",
        safe(
            "Try a different power outlet and cable",
            "Rules out the simplest points of failure",
        ),
    ),
    (
        "Failing hardware component",
        safe(
            "Note any lights, beeps or noises the device makes when you try to start it",
            "These signals tell a technician which part has failed",
        ),
    ),
];

fn cause_remedies(label: &str) -> &'static [Remedy] {
    CAUSE_REMEDIES
        .iter()
        .find(|(cause, _)| *cause == label)
        .map(|(_, remedy)| std::slice::from_ref(remedy))
        .unwrap_or(&[])
}

const CATEGORY_REMEDIES: &[(Category, Remedy)] = &[
    (
        Category::Networking,
        safe(
            "Check whether other devices can connect to the same network",
            "Tells a device problem apart from a network problem",
        ),
    ),
    (
        Category::Performance,
        safe(
            "Check how much memory and disk space are free",
            "Shortage of either slows everything down",
        ),
    ),
    (
        Category::Peripherals,
        safe(
            "Try the device on another port or another computer",
            "Separates a faulty device from a faulty connection",
        ),
    ),
    (
        Category::Mobile,
        safe(
            "Restart the phone by holding the power button and choosing restart",
            "Clears stuck apps and services",
        ),
    ),
    (
        Category::Hardware,
        safe(
            "Disconnect all accessories and try again with only power connected",
            "A faulty accessory can stop the device from working",
        ),
    ),
];

fn category_remedies(category: Category) -> &'static [Remedy] {
    CATEGORY_REMEDIES
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, remedy)| std::slice::from_ref(remedy))
        .unwrap_or(&[])
}

const GENERIC_REMEDIES: &[Remedy] = &[
    safe("Restart the device", "Clears temporary glitches"),
    safe(
        "Install any pending system and app updates",
        "Updates fix known bugs and compatibility problems",
    ),
    safe(
        "Think about what changed recently (new apps, settings or updates) and undo it if possible",
        "Problems often start right after a change",
    ),
    safe(
        "Write down the exact error message and when it appears",
        "Exact wording makes the next round of troubleshooting much faster",
    ),
    safe(
        "Contact the manufacturer's support or a local technician if the problem continues",
        "Some problems need hands-on diagnosis",
    ),
];

// =============================================================================
// Model output schema
// =============================================================================

#[derive(Debug, Deserialize)]
struct StepsOutput {
    steps: Vec<StepOutput>,
}

#[derive(Debug, Deserialize)]
struct StepOutput {
    action: String,
    #[serde(default)]
    explanation: String,
    risk_level: String,
    #[serde(default)]
    expected_outcome: Option<String>,
    #[serde(default)]
    troubleshooting_tips: Vec<String>,
}

fn parse_steps(value: serde_json::Value) -> Result<Vec<Step>, ProviderError> {
    let output: StepsOutput = serde_json::from_value(value)
        .map_err(|e| ProviderError::Malformed(format!("steps: {}", e)))?;
    if output.steps.is_empty() {
        return Err(ProviderError::Malformed("steps: empty list".to_string()));
    }
    output
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let action = raw.action.trim();
            if action.is_empty() {
                return Err(ProviderError::Malformed(format!("steps[{}]: empty action", i)));
            }
            let risk: RiskLevel = raw
                .risk_level
                .parse()
                .map_err(|e| ProviderError::Malformed(format!("steps[{}]: {}", i, e)))?;
            let mut step = Step::new(action, raw.explanation.trim(), risk).with_tips(
                raw.troubleshooting_tips
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
            );
            if let Some(outcome) = raw.expected_outcome.filter(|o| !o.trim().is_empty()) {
                step = step.with_outcome(outcome.trim());
            }
            Ok(step)
        })
        .collect()
}

// =============================================================================
// Composer
// =============================================================================

pub struct SolutionComposer {
    llm: Option<Arc<dyn LlmClient>>,
    llm_timeout: Duration,
    min_steps: usize,
    max_steps: usize,
    close_delta: f32,
}

impl SolutionComposer {
    pub fn new(
        llm: Option<Arc<dyn LlmClient>>,
        llm_timeout: Duration,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            llm,
            llm_timeout,
            min_steps: config.min_steps,
            max_steps: config.max_steps,
            close_delta: config.close_confidence_delta,
        }
    }

    /// The top cause and those within the close delta of it. `causes` must
    /// be ordered by confidence.
    pub fn close_causes<'c>(&self, causes: &'c [Cause]) -> &'c [Cause] {
        let Some(top) = causes.first() else {
            return causes;
        };
        let n = causes
            .iter()
            .take_while(|c| top.confidence - c.confidence <= self.close_delta + f32::EPSILON)
            .count();
        &causes[..n]
    }

    /// Ordered, numbered steps for this turn. Never fails.
    pub async fn compose(&self, ctx: &AnalysisContext<'_>, causes: &[Cause]) -> Composition {
        if let Some(client) = &self.llm {
            match self.compose_with_llm(client.as_ref(), ctx, causes).await {
                Ok(steps) => {
                    info!("composed {} steps with {}", steps.len(), client.name());
                    return Composition {
                        steps,
                        mode: ReasoningMode::Llm,
                    };
                }
                Err(e) => warn!(
                    "step composition via {} failed, using rules: {}",
                    client.name(),
                    e
                ),
            }
        }
        let steps = self.rule_based(ctx, causes);
        info!("composed {} steps from rules", steps.len());
        Composition {
            steps,
            mode: ReasoningMode::RuleBased,
        }
    }

    async fn compose_with_llm(
        &self,
        client: &dyn LlmClient,
        ctx: &AnalysisContext<'_>,
        causes: &[Cause],
    ) -> Result<Vec<Step>, ProviderError> {
        let close = self.close_causes(causes);
        let prompt = steps_prompt(ctx, close, self.min_steps, self.max_steps);
        let value = tokio::time::timeout(self.llm_timeout, client.generate(&prompt, &STEPS_SCHEMA))
            .await
            .map_err(|_| ProviderError::Timeout(self.llm_timeout.as_millis() as u64))??;

        let parsed = parse_steps(value)?;
        let mut builder = StepList::new(ctx.attempted, self.max_steps);
        for step in parsed {
            builder.push(step);
        }
        if builder.is_empty() {
            return Err(ProviderError::Malformed(
                "steps: every step was already attempted".to_string(),
            ));
        }
        pad_generic(&mut builder, self.min_steps);
        Ok(builder.finish(causes))
    }

    /// Deterministic steps from passages and templates.
    pub fn rule_based(&self, ctx: &AnalysisContext<'_>, causes: &[Cause]) -> Vec<Step> {
        let close = self.close_causes(causes);
        let mut builder = StepList::new(ctx.attempted, self.max_steps);

        // known solutions of each close cause's supporting passage, top cause first
        let mut used_passages = HashSet::new();
        for cause in close {
            let Some(id) = cause.supporting_passages.first() else {
                continue;
            };
            if !used_passages.insert(id.clone()) {
                continue;
            }
            if let Some(passage) = ctx.passages.iter().find(|p| p.source_id() == id) {
                for known in &passage.solutions {
                    builder.push(Step::new(
                        known.action.trim(),
                        known.why.trim(),
                        known.risk_level,
                    ));
                }
            }
        }

        // templates are reworded, so exact matching alone would repeat them
        let tried = addressed_causes(ctx.prior_steps, ctx.attempted);
        if builder.is_empty() {
            if let Some(pattern) = ctx.query.pattern {
                debug!("no passage solutions, using {} template", pattern.key());
                builder.extend_untried(pattern_remedies(pattern), causes, &tried);
            }
        }

        if builder.is_empty() {
            for cause in close {
                builder.extend_untried(cause_remedies(&cause.label), causes, &tried);
            }
            builder.extend(category_remedies(ctx.query.category));
        }

        pad_generic(&mut builder, self.min_steps);
        builder.finish(causes)
    }
}

fn pad_generic(builder: &mut StepList<'_>, min_steps: usize) {
    for remedy in GENERIC_REMEDIES {
        if builder.len() >= min_steps {
            break;
        }
        builder.push_remedy(remedy);
    }
}

impl Remedy {
    fn to_step(&self) -> Step {
        Step::new(self.action, self.why, self.risk)
    }
}

/// Share of the smaller term set two actions must have in common to count
/// as the same remedy.
const REWORDED_OVERLAP: f32 = 0.6;

/// Ordered step accumulator: skips attempted and duplicate actions, stops
/// at the cap.
struct StepList<'a> {
    attempted: &'a BTreeSet<String>,
    attempted_terms: Vec<HashSet<String>>,
    seen: HashSet<String>,
    steps: Vec<Step>,
    cap: usize,
}

impl<'a> StepList<'a> {
    fn new(attempted: &'a BTreeSet<String>, cap: usize) -> Self {
        Self {
            attempted,
            attempted_terms: attempted
                .iter()
                .map(|a| content_terms(a).into_iter().collect())
                .collect(),
            seen: HashSet::new(),
            steps: Vec::new(),
            cap,
        }
    }

    /// True when `action` is an attempted action in other words.
    fn rewords_attempt(&self, action: &str) -> bool {
        let terms: HashSet<String> = content_terms(action).into_iter().collect();
        self.attempted_terms.iter().any(|tried| {
            let shared = tried.intersection(&terms).count();
            let smaller = tried.len().min(terms.len());
            shared >= 2 && shared as f32 / smaller as f32 >= REWORDED_OVERLAP
        })
    }

    fn push_remedy(&mut self, remedy: &Remedy) {
        if self.rewords_attempt(remedy.action) {
            debug!("skipping '{}', already tried in other words", remedy.action);
            return;
        }
        self.push(remedy.to_step());
    }

    fn push(&mut self, step: Step) {
        if self.steps.len() >= self.cap {
            return;
        }
        let key = attempt_key(&step.action);
        if key.is_empty() || self.attempted.contains(&key) || !self.seen.insert(key) {
            return;
        }
        self.steps.push(step);
    }

    fn extend(&mut self, remedies: &[Remedy]) {
        for remedy in remedies {
            self.push_remedy(remedy);
        }
    }

    /// Like `extend`, but also drops remedies aimed at a cause whose earlier
    /// remedies the user already tried.
    fn extend_untried(
        &mut self,
        remedies: &[Remedy],
        causes: &[Cause],
        tried: &HashSet<String>,
    ) {
        for remedy in remedies {
            let step = remedy.to_step();
            if let Some(cause) = best_cause(&step, causes) {
                if tried.contains(&cause.label.to_lowercase()) {
                    debug!("skipping '{}', '{}' was already addressed", remedy.action, cause.label);
                    continue;
                }
            }
            self.push_remedy(remedy);
        }
    }

    fn len(&self) -> usize {
        self.steps.len()
    }

    fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Attribute each step to a cause and number the list.
    fn finish(self, causes: &[Cause]) -> Vec<Step> {
        let mut steps = self.steps;
        for step in steps.iter_mut() {
            if step.addresses.is_none() {
                step.addresses = attribute(step, causes);
            }
        }
        renumber(&mut steps);
        steps
    }
}

/// The cause whose label shares the largest share of terms with the step,
/// or the top cause when nothing overlaps.
fn attribute(step: &Step, causes: &[Cause]) -> Option<String> {
    best_cause(step, causes)
        .or_else(|| causes.first())
        .map(|c| c.label.clone())
}

/// The cause with the highest label-term overlap, if any term overlaps.
fn best_cause<'c>(step: &Step, causes: &'c [Cause]) -> Option<&'c Cause> {
    let step_terms: HashSet<String> =
        content_terms(&format!("{} {}", step.action, step.explanation))
            .into_iter()
            .collect();
    let mut best: Option<(&Cause, f32)> = None;
    for cause in causes {
        let label_terms = content_terms(&cause.label);
        if label_terms.is_empty() {
            continue;
        }
        let shared = label_terms.iter().filter(|t| step_terms.contains(*t)).count();
        let score = shared as f32 / label_terms.len() as f32;
        if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((cause, score));
        }
    }
    best.map(|(c, _)| c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeLlmClient;
    use crate::normalizer::NormalizedQuery;
    use deskmate_shared::{KnownStep, Passage, TechnicalLevel};
    use serde_json::json;

    fn query(category: Category, pattern: Option<ProblemPattern>) -> NormalizedQuery {
        NormalizedQuery {
            text: "x".into(),
            statement: "x".into(),
            category,
            pattern,
            is_follow_up: false,
            answered_clarification: false,
            follow_up_question: None,
        }
    }

    fn composer(llm: Option<Arc<dyn LlmClient>>) -> SolutionComposer {
        SolutionComposer::new(llm, Duration::from_millis(200), &PipelineConfig::default())
    }

    fn wifi_passage() -> Passage {
        let mut p = Passage::new("wifi_1", Category::Networking, "wifi");
        p.solutions = vec![
            KnownStep {
                action: "Check if Wi-Fi is enabled on your device".into(),
                why: "Wi-Fi might be disabled via airplane mode".into(),
                risk_level: RiskLevel::Safe,
            },
            KnownStep {
                action: "Restart your Wi-Fi router".into(),
                why: "Clears temporary glitches in the router".into(),
                risk_level: RiskLevel::Safe,
            },
            KnownStep {
                action: "Forget the network and reconnect with the correct password".into(),
                why: "Removes corrupted network settings".into(),
                risk_level: RiskLevel::Safe,
            },
        ];
        p
    }

    fn wifi_causes() -> Vec<Cause> {
        vec![
            Cause::new("Wi-Fi adapter disabled", 0.76).with_passages(vec!["wifi_1".into()]),
            Cause::new("Wrong password", 0.76).with_passages(vec!["wifi_1".into()]),
            Cause::new("Router issues", 0.52).with_passages(vec!["wifi_1".into()]),
        ]
    }

    fn ctx<'a>(
        q: &'a NormalizedQuery,
        passages: &'a [Passage],
        attempted: &'a BTreeSet<String>,
    ) -> AnalysisContext<'a> {
        AnalysisContext {
            query: q,
            passages,
            device: None,
            technical_level: TechnicalLevel::Beginner,
            attempted,
            prior_steps: &[],
        }
    }

    #[test]
    fn test_close_causes() {
        let c = composer(None);
        let causes = wifi_causes();
        assert_eq!(c.close_causes(&causes).len(), 2);
        assert!(c.close_causes(&[]).is_empty());
    }

    #[test]
    fn test_passage_solutions_attributed() {
        let q = query(Category::Networking, Some(ProblemPattern::WifiConnectivity));
        let passages = vec![wifi_passage()];
        let attempted = BTreeSet::new();
        let steps = composer(None).rule_based(&ctx(&q, &passages, &attempted), &wifi_causes());
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].addresses.as_deref(), Some("Wi-Fi adapter disabled"));
        assert_eq!(steps[1].addresses.as_deref(), Some("Router issues"));
        assert_eq!(steps[2].addresses.as_deref(), Some("Wrong password"));
        let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_attempted_steps_skipped_and_padded() {
        let q = query(Category::Networking, None);
        let passages = vec![wifi_passage()];
        let mut attempted = BTreeSet::new();
        attempted.insert(attempt_key("Restart your Wi-Fi router"));
        attempted.insert(attempt_key("Restart the device"));
        let steps = composer(None).rule_based(&ctx(&q, &passages, &attempted), &wifi_causes());
        let actions: Vec<&str> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(
            actions,
            vec![
                "Check if Wi-Fi is enabled on your device",
                "Forget the network and reconnect with the correct password",
                "Install any pending system and app updates",
            ]
        );
    }

    #[test]
    fn test_template_skips_remedies_for_tried_causes() {
        let q = query(Category::Networking, Some(ProblemPattern::WifiConnectivity));
        let mut enabled = Step::new(
            "Check if Wi-Fi is enabled on your device",
            "Wi-Fi might be disabled via airplane mode",
            RiskLevel::Safe,
        );
        enabled.addresses = Some("Wi-Fi adapter disabled".into());
        let mut router = Step::new(
            "Restart your Wi-Fi router by unplugging it for 30 seconds",
            "Clears temporary glitches in the router",
            RiskLevel::Safe,
        );
        router.addresses = Some("Router issues".into());
        let prior = vec![enabled, router];
        let attempted: BTreeSet<String> = prior.iter().map(|s| attempt_key(&s.action)).collect();

        let context = AnalysisContext {
            prior_steps: &prior,
            ..ctx(&q, &[], &attempted)
        };
        let steps = composer(None).rule_based(&context, &wifi_causes());
        let actions: Vec<&str> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(
            actions,
            vec![
                "Forget the network and reconnect with the correct password",
                "Restart the device",
                "Install any pending system and app updates",
            ]
        );
    }

    #[test]
    fn test_template_skips_reworded_attempts() {
        let q = query(Category::Networking, Some(ProblemPattern::WifiConnectivity));
        let mut attempted = BTreeSet::new();
        attempted.insert(attempt_key("Restart your Wi-Fi router by unplugging it for 30 seconds"));
        let steps = composer(None).rule_based(&ctx(&q, &[], &attempted), &wifi_causes());
        let actions: Vec<&str> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(
            actions,
            vec![
                "Check that Wi-Fi is turned on and airplane mode is off",
                "Forget the network and reconnect with the correct password",
                "Restart the device",
            ]
        );
    }

    #[test]
    fn test_pattern_template_without_passages() {
        let q = query(Category::Hardware, Some(ProblemPattern::DiskFormat));
        let attempted = BTreeSet::new();
        let causes = vec![Cause::new("Power or cable problem", 0.5)];
        let steps = composer(None).rule_based(&ctx(&q, &[], &attempted), &causes);
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().any(|s| s.risk_level == RiskLevel::Risky));
    }

    #[test]
    fn test_cause_and_category_templates() {
        let q = query(Category::Peripherals, None);
        let attempted = BTreeSet::new();
        let causes = vec![
            Cause::new("Loose or faulty connection", 0.5),
            Cause::new("Outdated device driver", 0.45),
        ];
        let steps = composer(None).rule_based(&ctx(&q, &[], &attempted), &causes);
        assert_eq!(steps.len(), 3);
        assert!(steps[0].action.starts_with("Unplug and firmly reconnect"));
        assert!(steps[1].action.starts_with("Install the latest driver"));
        assert_eq!(steps[1].addresses.as_deref(), Some("Outdated device driver"));
    }

    #[tokio::test]
    async fn test_llm_steps_truncated_in_order() {
        let steps: Vec<serde_json::Value> = (1..=12)
            .map(|i| {
                json!({"action": format!("Do thing {}", i), "explanation": "x", "risk_level": "safe"})
            })
            .collect();
        let fake = FakeLlmClient::new().with_response("steps", Ok(json!({ "steps": steps })));
        let q = query(Category::Networking, None);
        let attempted = BTreeSet::new();
        let out = composer(Some(Arc::new(fake)))
            .compose(&ctx(&q, &[], &attempted), &wifi_causes())
            .await;
        assert_eq!(out.mode, ReasoningMode::Llm);
        assert_eq!(out.steps.len(), 8);
        assert_eq!(out.steps[0].action, "Do thing 1");
        assert_eq!(out.steps[7].action, "Do thing 8");
    }

    #[tokio::test]
    async fn test_llm_short_plan_is_padded() {
        let fake = FakeLlmClient::new().with_response(
            "steps",
            Ok(json!({"steps": [{"action": "Reboot the router", "risk_level": "safe"}]})),
        );
        let q = query(Category::Networking, None);
        let attempted = BTreeSet::new();
        let out = composer(Some(Arc::new(fake)))
            .compose(&ctx(&q, &[], &attempted), &wifi_causes())
            .await;
        assert_eq!(out.mode, ReasoningMode::Llm);
        assert_eq!(out.steps.len(), 3);
        assert_eq!(out.steps[0].action, "Reboot the router");
    }

    #[tokio::test]
    async fn test_bad_llm_steps_fall_back() {
        for bad in [
            json!({"steps": []}),
            json!({"steps": [{"action": "x", "risk_level": "extreme"}]}),
            json!({"steps": [{"action": " ", "risk_level": "safe"}]}),
            json!({"plan": "restart"}),
        ] {
            let fake = FakeLlmClient::new().with_response("steps", Ok(bad));
            let q = query(Category::Networking, None);
            let passages = vec![wifi_passage()];
            let attempted = BTreeSet::new();
            let out = composer(Some(Arc::new(fake)))
                .compose(&ctx(&q, &passages, &attempted), &wifi_causes())
                .await;
            assert_eq!(out.mode, ReasoningMode::RuleBased);
            assert_eq!(out.steps.len(), 3);
        }
    }
}
