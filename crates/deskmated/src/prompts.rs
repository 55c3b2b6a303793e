//! Prompt building for the model-backed analyzer and composer.
//!
//! Prompts are capped at `MAX_PROMPT_CHARS`; passage excerpts are the part
//! that gets cut.

use crate::analyzer::AnalysisContext;
use crate::llm::{Prompt, ResponseSchema};
use deskmate_shared::{Cause, Passage};
use std::fmt::Write;

/// Upper bound on the user prompt size
pub const MAX_PROMPT_CHARS: usize = 6000;

/// Passages shown to the model
const MAX_PROMPT_PASSAGES: usize = 3;

/// Characters of passage text per excerpt
const EXCERPT_CHARS: usize = 400;

pub const CAUSES_SCHEMA: ResponseSchema = ResponseSchema {
    name: "causes",
    description: r#"{
  "causes": [
    {
      "label": "short cause name",
      "confidence": 0.0-1.0,
      "explanation": "one sentence",
      "supporting_passages": ["source id from the knowledge matches"]
    }
  ]
}"#,
};

pub const STEPS_SCHEMA: ResponseSchema = ResponseSchema {
    name: "steps",
    description: r#"{
  "steps": [
    {
      "action": "what the user does",
      "explanation": "why it helps",
      "risk_level": "safe|caution|risky",
      "expected_outcome": "what should happen",
      "troubleshooting_tips": ["optional tip"]
    }
  ]
}"#,
};

const CAUSES_SYSTEM: &str = "You are an IT support diagnostician. \
Rank the most likely causes of the user's problem. \
Use the knowledge base matches when they apply and cite their source ids. \
Causes the user already ruled out should rank lower. \
Confidence is a number between 0 and 1. Answer with JSON only.";

const STEPS_SYSTEM: &str = "You are an IT support technician writing a fix-it plan for a non-expert. \
Write ordered, concrete steps, safest first. \
Mark any step that can lose data, change firmware, or touch system settings as risky or caution. \
Never suggest opening a device or working on power supplies. \
Skip steps the user already tried. Answer with JSON only.";

fn context_header(ctx: &AnalysisContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Problem: {}", ctx.query.statement);
    if ctx.query.text != ctx.query.statement {
        let _ = writeln!(out, "User said: {}", ctx.query.text);
    }
    let _ = writeln!(out, "Category: {}", ctx.query.category);
    let device = ctx
        .device
        .map(|d| d.summary())
        .unwrap_or_else(|| "unknown device".to_string());
    let _ = writeln!(out, "Device: {}", device);
    let _ = writeln!(out, "Technical level: {}", ctx.technical_level);
    if !ctx.attempted.is_empty() {
        let _ = writeln!(out, "Already tried without success:");
        for attempt in ctx.attempted.iter() {
            let _ = writeln!(out, "- {}", attempt);
        }
    }
    out
}

fn knowledge_section(passages: &[Passage]) -> String {
    if passages.is_empty() {
        return "Knowledge base matches: none. Use general IT support expertise.\n".to_string();
    }
    let mut out = String::from("Knowledge base matches:\n");
    for (i, p) in passages.iter().take(MAX_PROMPT_PASSAGES).enumerate() {
        let _ = writeln!(
            out,
            "{}. [{}] {} (similarity {:.2})",
            i + 1,
            p.source_id(),
            p.display_title(),
            p.similarity
        );
        let _ = writeln!(out, "   {}", p.excerpt(EXCERPT_CHARS));
        if !p.causes.is_empty() {
            let causes: Vec<String> = p
                .causes
                .iter()
                .map(|c| format!("{} ({:?})", c.cause, c.likelihood).to_lowercase())
                .collect();
            let _ = writeln!(out, "   Known causes: {}", causes.join(", "));
        }
    }
    out
}

fn cap(mut prompt: String) -> String {
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        prompt = prompt.chars().take(MAX_PROMPT_CHARS).collect();
        prompt.push_str("\n[truncated]");
    }
    prompt
}

/// Prompt asking for ranked causes.
pub fn causes_prompt(ctx: &AnalysisContext<'_>, max_causes: usize) -> Prompt {
    let mut user = context_header(ctx);
    user.push('\n');
    user.push_str(&knowledge_section(ctx.passages));
    let _ = write!(
        user,
        "\nList at most {} likely causes, most likely first.",
        max_causes
    );
    Prompt {
        system: CAUSES_SYSTEM.to_string(),
        user: cap(user),
    }
}

/// Prompt asking for remediation steps for the given causes.
pub fn steps_prompt(
    ctx: &AnalysisContext<'_>,
    causes: &[Cause],
    min_steps: usize,
    max_steps: usize,
) -> Prompt {
    let mut user = context_header(ctx);
    user.push_str("\nLikely causes:\n");
    for cause in causes {
        let _ = writeln!(user, "- {} (confidence {:.2})", cause.label, cause.confidence);
    }
    user.push('\n');
    user.push_str(&knowledge_section(ctx.passages));
    let _ = write!(
        user,
        "\nWrite between {} and {} steps that address these causes.",
        min_steps, max_steps
    );
    Prompt {
        system: STEPS_SYSTEM.to_string(),
        user: cap(user),
    }
}
