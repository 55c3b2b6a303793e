//! Diagnosis payload: causes, steps, warnings.
//!
//! A `Diagnosis` is the only thing the pipeline hands back to callers. Its
//! step list is always numbered 1..N and every risky step carries a warning
//! naming its hazard; `Diagnosis::check_invariants` verifies both.

use crate::category::Category;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Risk classification of a single step. Ordered: `Safe < Caution < Risky`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Caution,
    Risky,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Caution => "caution",
            Self::Risky => "risky",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "caution" => Ok(Self::Caution),
            "risky" => Ok(Self::Risky),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

/// Why a step was classified above `Safe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Hazard {
    DataLoss,
    PhysicalDanger,
    Firmware,
    Registry,
    BootConfig,
    SystemFiles,
    Drivers,
    Privileges,
    GeneralRisk,
}

impl Hazard {
    /// Label that appears in warning strings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DataLoss => "data-loss",
            Self::PhysicalDanger => "physical-danger",
            Self::Firmware => "firmware",
            Self::Registry => "registry",
            Self::BootConfig => "boot-config",
            Self::SystemFiles => "system-files",
            Self::Drivers => "drivers",
            Self::Privileges => "privileges",
            Self::GeneralRisk => "general-risk",
        }
    }
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A candidate cause with confidence in [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cause {
    pub label: String,
    pub confidence: f32,
    /// Source ids of the passages backing this cause
    #[serde(default)]
    pub supporting_passages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Cause {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            supporting_passages: Vec::new(),
            explanation: None,
        }
    }

    pub fn with_passages(mut self, passages: Vec<String>) -> Self {
        self.supporting_passages = passages;
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    /// Human label for the confidence band.
    pub fn likelihood_label(&self) -> &'static str {
        if self.confidence >= 0.7 {
            "high"
        } else if self.confidence >= 0.4 {
            "medium"
        } else {
            "low"
        }
    }
}

/// One remediation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_number: u32,
    pub action: String,
    pub explanation: String,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub troubleshooting_tips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hazard: Option<Hazard>,
    /// Label of the cause this step remedies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<String>,
}

impl Step {
    /// Build an unnumbered step; numbering happens once the list is final.
    pub fn new(
        action: impl Into<String>,
        explanation: impl Into<String>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            step_number: 0,
            action: action.into(),
            explanation: explanation.into(),
            risk_level,
            expected_outcome: None,
            troubleshooting_tips: Vec::new(),
            hazard: None,
            addresses: None,
        }
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = Some(outcome.into());
        self
    }

    pub fn with_tips(mut self, tips: Vec<String>) -> Self {
        self.troubleshooting_tips = tips;
        self
    }

    pub fn addressing(mut self, cause: impl Into<String>) -> Self {
        self.addresses = Some(cause.into());
        self
    }
}

/// Assign step numbers 1..N by position.
pub fn renumber(steps: &mut [Step]) {
    for (i, step) in steps.iter_mut().enumerate() {
        step.step_number = (i + 1) as u32;
    }
}

/// Which branch of the pipeline produced a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisKind {
    /// Full diagnosis with causes and steps
    Solution,
    /// Input too vague; asks one question, no steps
    Clarification,
    /// Greeting or small talk
    Onboarding,
}

/// The pipeline's response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Human-readable summary
    pub response: String,
    pub session_id: String,
    pub kind: DiagnosisKind,
    pub category: Category,
    pub problem_understanding: String,
    pub causes: Vec<Cause>,
    pub solution_steps: Vec<Step>,
    pub warnings: Vec<String>,
    pub next_steps: String,
    pub escalation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_question: Option<String>,
    pub reasoning_route: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Diagnosis {
    /// Diagnosis without steps, used for the clarification and onboarding branches.
    pub fn conversational(
        kind: DiagnosisKind,
        session_id: impl Into<String>,
        response: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        let question = question.into();
        Self {
            response: response.into(),
            session_id: session_id.into(),
            kind,
            category: Category::Unknown,
            problem_understanding: String::new(),
            causes: Vec::new(),
            solution_steps: Vec::new(),
            warnings: Vec::new(),
            next_steps: question.clone(),
            escalation: false,
            follow_up_question: Some(question),
            reasoning_route: kind_route(kind).to_string(),
            sources: Vec::new(),
        }
    }

    pub fn top_cause(&self) -> Option<&Cause> {
        self.causes.first()
    }

    /// Verify the outbound contract. Returns a description of the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (i, step) in self.solution_steps.iter().enumerate() {
            if step.step_number as usize != i + 1 {
                return Err(format!(
                    "step at position {} is numbered {}",
                    i + 1,
                    step.step_number
                ));
            }
            if step.risk_level == RiskLevel::Risky {
                let label = step.hazard.unwrap_or(Hazard::GeneralRisk).label();
                if !self.warnings.iter().any(|w| w.contains(label)) {
                    return Err(format!(
                        "risky step {} has no '{}' warning",
                        step.step_number, label
                    ));
                }
            }
        }
        for pair in self.causes.windows(2) {
            if pair[0].confidence < pair[1].confidence {
                return Err("causes are not ordered by confidence".to_string());
            }
        }
        Ok(())
    }
}

fn kind_route(kind: DiagnosisKind) -> &'static str {
    match kind {
        DiagnosisKind::Solution => "solution",
        DiagnosisKind::Clarification => "clarification",
        DiagnosisKind::Onboarding => "onboarding",
    }
}
