//! User-facing text: fixed questions, the summary layout, next-steps guidance.
//!
//! The summary layout is stable so front ends can rely on it:
//! understanding, causes, steps, next steps, follow-up question.

use deskmate_shared::{Cause, Step};

/// The catalog of questions the pipeline may ask.
pub mod questions {
    pub const ONBOARDING: &str = "What can I help you fix today?";

    pub const EMPTY_MESSAGE: &str =
        "What problem are you running into? Describe what you expected and what happened.";

    pub const SHORT_PROBLEM: &str =
        "Quick clarifier: what device/OS is this on, and what exactly happens (any exact error message)?";

    pub const DEVICE_AND_OS: &str =
        "What type of device is this (laptop/desktop/phone/printer), and what OS are you using?";

    pub const OS: &str = "What operating system are you using? (Windows, macOS, Android, iOS, Linux)";

    pub const ALL: &[&str] = &[ONBOARDING, EMPTY_MESSAGE, SHORT_PROBLEM, DEVICE_AND_OS, OS];
}

pub const ONBOARDING_TEXT: &str = "Hi! I can help troubleshoot tech issues.

Tell me what's going wrong and I'll walk you through it. If you can, include:
- Your device type (laptop/desktop/phone/printer, etc.)
- Your OS (Windows/macOS/Android/iOS/Linux)
- Any exact error message

Example: 'My Windows laptop can't connect to Wi-Fi after an update.'";

pub const ONBOARDING_NEXT_STEPS: &str =
    "Describe the issue you want to fix (what you expected vs what happened).";

/// Shown when nothing specific could be found.
pub const GENERAL_GUIDANCE: &str =
    "I couldn't find a specific solution, here is general guidance.";

const NEXT_STEPS_PROFESSIONAL: &str = "If these steps don't resolve the issue, I recommend contacting a \
professional technician. The problem may require hardware repair or specialized tools.";

const NEXT_STEPS_LONG_PLAN: &str = "If the above steps don't work, let me know which step you got stuck on \
and I can provide more specific guidance or alternative solutions.";

const NEXT_STEPS_SHORT_PLAN: &str = "If these steps don't resolve the issue, please let me know:
1. Which step you completed
2. What happened when you tried it
3. Any error messages you saw

I'll provide more advanced troubleshooting steps.";

/// Guidance for when the plan does not work.
pub fn next_steps(step_count: usize, escalation: bool) -> &'static str {
    if escalation {
        NEXT_STEPS_PROFESSIONAL
    } else if step_count > 3 {
        NEXT_STEPS_LONG_PLAN
    } else {
        NEXT_STEPS_SHORT_PLAN
    }
}

/// Human-readable summary of a diagnosis.
pub fn summary(
    understanding: &str,
    causes: &[Cause],
    steps: &[Step],
    warnings: &[String],
    next_steps: &str,
    follow_up: Option<&str>,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push("1. **Problem Understanding**".to_string());
    lines.push(if understanding.trim().is_empty() {
        "(unknown)".to_string()
    } else {
        understanding.trim().to_string()
    });
    lines.push(String::new());

    lines.push("2. **Likely Causes**".to_string());
    if causes.is_empty() {
        lines.push("- (No specific causes found, using general troubleshooting)".to_string());
    }
    for cause in causes {
        let mut bullet = format!("- {} ({})", cause.label, cause.likelihood_label());
        if let Some(explanation) = cause.explanation.as_deref().filter(|e| !e.is_empty()) {
            bullet.push_str(": ");
            bullet.push_str(explanation);
        }
        lines.push(bullet);
    }
    lines.push(String::new());

    lines.push("3. **Step-by-Step Solution**".to_string());
    for step in steps {
        lines.push(format!("{}. {}", step.step_number, step.action));
        if !step.explanation.is_empty() {
            lines.push(format!("   - Why: {}", step.explanation));
        }
    }
    lines.push(String::new());

    if !warnings.is_empty() {
        lines.push("**Warnings**".to_string());
        for warning in warnings {
            lines.push(format!("- {}", warning));
        }
        lines.push(String::new());
    }

    lines.push("4. **Next Steps**".to_string());
    lines.push(next_steps.trim().to_string());
    lines.push(String::new());

    lines.push("5. **Follow-up Question**".to_string());
    lines.push(follow_up.unwrap_or("(None)").to_string());

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskmate_shared::RiskLevel;

    #[test]
    fn test_next_steps_variants() {
        assert!(next_steps(5, true).contains("professional"));
        assert!(next_steps(5, false).contains("stuck"));
        assert!(next_steps(3, false).contains("Which step"));
    }

    #[test]
    fn test_summary_layout() {
        let causes = vec![Cause::new("Router needs a restart", 0.8).with_explanation("common")];
        let mut step = Step::new("Restart the router", "Clears stale state", RiskLevel::Safe);
        step.step_number = 1;
        let text = summary("Wi-Fi connectivity issues", &causes, &[step], &[], "next", None);
        assert!(text.contains("1. **Problem Understanding**\nWi-Fi connectivity issues"));
        assert!(text.contains("- Router needs a restart (high): common"));
        assert!(text.contains("1. Restart the router\n   - Why: Clears stale state"));
        assert!(text.ends_with("(None)"));
        assert!(!text.contains("**Warnings**"));
    }

    #[test]
    fn test_questions_are_distinct() {
        let mut all = questions::ALL.to_vec();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), questions::ALL.len());
    }
}
