//! Safety validation for remediation steps.
//!
//! Deterministic keyword/pattern scoring, no model involved. Every
//! diagnosis with steps passes through `SafetyValidator::validate` before it
//! leaves the pipeline. Risk is only ever raised.

use deskmate_shared::diagnosis::renumber;
use deskmate_shared::{Hazard, RiskLevel, Step};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{info, warn};

// =============================================================================
// Step taxonomy
// =============================================================================

struct RiskRule {
    pattern: &'static str,
    risk: RiskLevel,
    hazard: Hazard,
    advice: &'static str,
}

/// Ordered by tier, risky first. The first rule of the highest tier wins.
const STEP_RULES: &[RiskRule] = &[
    RiskRule {
        pattern: r"\b(re)?format\w*",
        risk: RiskLevel::Risky,
        hazard: Hazard::DataLoss,
        advice: "This will erase all data on the drive. Back up first!",
    },
    RiskRule {
        pattern: r"\b(wipe[sd]?|wiping|erase[sd]?|erasing)\b",
        risk: RiskLevel::Risky,
        hazard: Hazard::DataLoss,
        advice: "Wiping removes data permanently. Back up first!",
    },
    RiskRule {
        pattern: r"\b(re)?partition",
        risk: RiskLevel::Risky,
        hazard: Hazard::DataLoss,
        advice: "Partitioning errors can cause data loss. Back up first!",
    },
    RiskRule {
        pattern: r"factory reset|reset .*to factory|factory settings|reset this pc",
        risk: RiskLevel::Risky,
        hazard: Hazard::DataLoss,
        advice: "A factory reset erases all data on the device. Back up first!",
    },
    RiskRule {
        pattern: r"reinstall(ing)? (the )?(os|operating system|windows|macos|linux|android|ios)|clean install",
        risk: RiskLevel::Risky,
        hazard: Hazard::DataLoss,
        advice: "Reinstalling the operating system may lose data. Back up important files first.",
    },
    RiskRule {
        pattern: r"\b(delete|remove|rm)\b.*(system files|system32|/system|/usr|/boot|/etc)",
        risk: RiskLevel::Risky,
        hazard: Hazard::SystemFiles,
        advice: "Deleting system files can leave the device unable to start. Double-check before proceeding.",
    },
    RiskRule {
        pattern: r"\bregistry\b|\bregedit\b",
        risk: RiskLevel::Risky,
        hazard: Hazard::Registry,
        advice: "Editing the registry can damage Windows. Create a restore point first.",
    },
    RiskRule {
        pattern: r"firmware|flash(ing)? (the )?(bios|uefi)|(bios|uefi) update|update (the )?(bios|uefi)",
        risk: RiskLevel::Risky,
        hazard: Hazard::Firmware,
        advice: "A failed firmware update can brick the device. Keep it on stable power.",
    },
    RiskRule {
        pattern: r"\bbcdedit\b|\bbootrec\b|bootloader|\bgrub\b|efibootmgr",
        risk: RiskLevel::Risky,
        hazard: Hazard::BootConfig,
        advice: "Boot configuration mistakes can prevent the system from starting.",
    },
    RiskRule {
        pattern: r"\bdrivers?\b",
        risk: RiskLevel::Caution,
        hazard: Hazard::Drivers,
        advice: "Note the current driver version so you can roll back if something breaks.",
    },
    RiskRule {
        pattern: r"\bbios\b|\buefi\b",
        risk: RiskLevel::Caution,
        hazard: Hazard::BootConfig,
        advice: "Incorrect BIOS settings can prevent boot. Only change what the step names.",
    },
    RiskRule {
        pattern: r"\buninstall",
        risk: RiskLevel::Caution,
        hazard: Hazard::GeneralRisk,
        advice: "Make sure you can reinstall the program before removing it.",
    },
    RiskRule {
        pattern: r"\bsudo\b|administrator|\badmin\b|elevated",
        risk: RiskLevel::Caution,
        hazard: Hazard::Privileges,
        advice: "This requires administrative privileges. Run only the exact command given.",
    },
];

const GENERAL_RISK_ADVICE: &str =
    "This action carries some risk. Proceed carefully and make sure you understand what it does.";

/// Steps that require opening hardware or working near power.
const PHYSICAL_STEP_PATTERN: &str = r"open(ing)? (the |your )?(case|chassis|laptop|computer|device|back cover|phone)|\bsolder|disassembl|remove (the )?screws|thermal paste|swollen|swelling|bulging|smok(e|ing)|burning|power supply|\bpsu\b|replace (the )?(motherboard|component)";

/// Problem descriptions that mean "stop using it now".
const PHYSICAL_PROBLEM_PATTERN: &str = r"\bsmok(e|es|ing|y)\b|burning|burnt|\bsparks?\b|sparking|swollen|swelling|bulging|melting|\bfire\b|electric shock|shocked me|liquid|water damage|spilled|got wet";

/// Problems that usually need a repair shop when there are few remedies.
const COMPLEX_HARDWARE_PHRASES: &[&str] = &[
    "won't turn on",
    "wont turn on",
    "no power",
    "physical damage",
    "dropped",
    "screen broken",
    "broken screen",
    "motherboard",
];

/// Commands that are never suggested.
const BLOCKED_COMMANDS: &[&str] = &[
    r"\brm\s+(-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|-r\s+-f|-f\s+-r)\s+(--no-preserve-root\s+)?/(\*|\s|$)",
    r"\bdd\s+.*if=/dev/(zero|u?random)\b.*of=/dev/",
    r"\bdel\s+/f\s+/s\s+/q\s+[a-z]:\\",
    r"\bformat\s+[a-z]:(\\|\s|$)",
    r"\bmkfs(\.\w+)?\s+(-\S+\s+)*/dev/(sd[a-z]|hd[a-z]|vd[a-z]|nvme\d+n\d+|mmcblk\d+)(\s|$)",
];

const COMMAND_RISK_PATTERNS: &[(&str, &str)] = &[
    (r"\breg\s+(add|delete)\b", "Modifying the Windows registry"),
    (r"\bchmod\s+(-r\s+)?777\b", "Opening full permissions is insecure"),
    (r"\bsudo\s+rm\b", "Deleting files with elevated privileges"),
];

struct Tables {
    rules: Vec<Regex>,
    physical_step: Regex,
    physical_problem: Regex,
    blocked: Vec<Regex>,
    command_risks: Vec<(Regex, &'static str)>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let compile = |re: &str| Regex::new(re).expect("static safety table");
        Tables {
            rules: STEP_RULES.iter().map(|r| compile(r.pattern)).collect(),
            physical_step: compile(PHYSICAL_STEP_PATTERN),
            physical_problem: compile(PHYSICAL_PROBLEM_PATTERN),
            blocked: BLOCKED_COMMANDS.iter().map(|re| compile(re)).collect(),
            command_risks: COMMAND_RISK_PATTERNS
                .iter()
                .map(|(re, desc)| (compile(re), *desc))
                .collect(),
        }
    })
}

/// Highest-tier rule matching `text`.
fn match_rule(text: &str) -> Option<&'static RiskRule> {
    let lowered = text.to_lowercase();
    let t = tables();
    let mut best: Option<&'static RiskRule> = None;
    for (rule, re) in STEP_RULES.iter().zip(&t.rules) {
        if !re.is_match(&lowered) {
            continue;
        }
        match best {
            Some(b) if b.risk >= rule.risk => {}
            _ => best = Some(rule),
        }
    }
    best
}

/// Risk tier and hazard implied by the text, if any.
pub fn classify_text(text: &str) -> Option<(RiskLevel, Hazard)> {
    match_rule(text).map(|r| (r.risk, r.hazard))
}

pub fn is_blocked_command(text: &str) -> bool {
    let lowered = text.to_lowercase();
    tables().blocked.iter().any(|re| re.is_match(&lowered))
}

pub fn requires_physical_work(text: &str) -> bool {
    tables().physical_step.is_match(&text.to_lowercase())
}

/// The problem itself describes a physical hazard.
pub fn problem_is_dangerous(problem: &str) -> bool {
    tables().physical_problem.is_match(&problem.to_lowercase())
}

fn advice_for(step: &Step) -> &'static str {
    match match_rule(&step.action) {
        Some(rule) if rule.hazard == step.hazard.unwrap_or(Hazard::GeneralRisk) => rule.advice,
        _ => match step.hazard {
            Some(Hazard::PhysicalDanger) => PROFESSIONAL_EXPLANATION,
            Some(Hazard::DataLoss) => "This can erase data. Back up your files before proceeding.",
            _ => GENERAL_RISK_ADVICE,
        },
    }
}

// =============================================================================
// Validation
// =============================================================================

const PROFESSIONAL_ACTION: &str =
    "Stop here and have a professional technician or the manufacturer handle this repair";

const PROFESSIONAL_EXPLANATION: &str = "This involves opening the device or working near power components, \
which can cause injury or permanent damage.";

const STOP_USING_WARNING: &str = "Stop using the device and disconnect it from power. \
Do not attempt a repair yourself; contact a professional technician or the manufacturer.";

/// Validated steps plus what the validator decided.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyReport {
    /// Numbered 1..N
    pub steps: Vec<Step>,
    pub warnings: Vec<String>,
    pub escalation: bool,
    /// Steps removed for containing a blocked command
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyValidator;

impl SafetyValidator {
    pub fn new() -> Self {
        Self
    }

    /// Classify, rewrite and annotate `steps` for `problem`.
    pub fn validate(&self, problem: &str, steps: Vec<Step>) -> SafetyReport {
        let mut warnings = Vec::new();
        let mut escalation = false;

        if problem_is_dangerous(problem) {
            warn!("physical hazard in problem statement, escalating");
            warnings.push(format!("[{}] {}", Hazard::PhysicalDanger.label(), STOP_USING_WARNING));
            escalation = true;
        }

        let before = steps.len();
        let mut kept: Vec<Step> = Vec::with_capacity(before);
        for step in steps {
            if is_blocked_command(&step.action) || is_blocked_command(&step.explanation) {
                warn!("removed step with blocked command: {}", step.action);
                warnings.push(format!(
                    "[{}] A step containing a destructive command was removed. Never run commands that erase whole drives.",
                    Hazard::DataLoss.label()
                ));
                continue;
            }
            kept.push(step);
        }
        let removed = before - kept.len();

        for step in kept.iter_mut() {
            let text = format!("{} {}", step.action, step.explanation);
            if requires_physical_work(&text) {
                step.action = PROFESSIONAL_ACTION.to_string();
                step.explanation = PROFESSIONAL_EXPLANATION.to_string();
                step.risk_level = RiskLevel::Risky;
                step.hazard = Some(Hazard::PhysicalDanger);
                step.troubleshooting_tips.clear();
                escalation = true;
                continue;
            }
            if let Some(rule) = match_rule(&step.action) {
                if rule.risk >= step.risk_level {
                    step.risk_level = rule.risk;
                    step.hazard = Some(rule.hazard);
                }
            }
            if step.risk_level == RiskLevel::Risky && step.hazard.is_none() {
                step.hazard = Some(Hazard::GeneralRisk);
            }
        }

        renumber(&mut kept);

        for step in &kept {
            if step.risk_level == RiskLevel::Safe {
                continue;
            }
            let hazard = step.hazard.unwrap_or(Hazard::GeneralRisk);
            let prefix = match step.risk_level {
                RiskLevel::Risky => "WARNING",
                _ => "CAUTION",
            };
            warnings.push(format!(
                "[{}] Step {}: {}: {}",
                hazard.label(),
                step.step_number,
                prefix,
                advice_for(step)
            ));
        }

        if kept.is_empty() {
            escalation = true;
        } else if kept.iter().all(|s| s.risk_level == RiskLevel::Risky) {
            info!("every remaining step is risky, escalating");
            escalation = true;
        }

        let lowered = problem.to_lowercase();
        if kept.len() < 3 && COMPLEX_HARDWARE_PHRASES.iter().any(|p| lowered.contains(p)) {
            escalation = true;
        }

        let mut seen = HashSet::new();
        warnings.retain(|w| seen.insert(w.clone()));

        SafetyReport {
            steps: kept,
            warnings,
            escalation,
            removed,
        }
    }
}

// =============================================================================
// Standalone command check
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAssessment {
    pub risk: RiskLevel,
    pub warnings: Vec<String>,
    pub requires_confirmation: bool,
    pub blocked: bool,
}

/// Assess a single command or action before someone runs it.
pub fn assess_command(command: &str) -> CommandAssessment {
    if is_blocked_command(command) {
        return CommandAssessment {
            risk: RiskLevel::Risky,
            warnings: vec!["DANGEROUS: This command can cause permanent data loss!".to_string()],
            requires_confirmation: true,
            blocked: true,
        };
    }

    let lowered = command.to_lowercase();
    let mut assessment = CommandAssessment {
        risk: RiskLevel::Safe,
        warnings: Vec::new(),
        requires_confirmation: false,
        blocked: false,
    };

    for (re, description) in &tables().command_risks {
        if re.is_match(&lowered) {
            assessment.risk = RiskLevel::Risky;
            assessment.warnings.push(format!("RISKY: {}", description));
            assessment.requires_confirmation = true;
        }
    }

    if let Some(rule) = match_rule(command) {
        assessment.risk = assessment.risk.max(rule.risk);
        let warning = format!("[{}] {}", rule.hazard.label(), rule.advice);
        if !assessment.warnings.contains(&warning) {
            assessment.warnings.push(warning);
        }
        if rule.risk == RiskLevel::Risky {
            assessment.requires_confirmation = true;
        }
    }

    assessment
}
