//! Query normalizer.
//!
//! Turns a raw utterance plus recent history into one of three outcomes:
//! an onboarding reply (greeting), a clarifying question (too vague), or a
//! `NormalizedQuery` that the rest of the pipeline analyzes. Follow-up
//! reports such as "that didn't work" reuse the previous problem text.

use crate::classifier::{words, CategoryClassifier};
use crate::render::questions;
use deskmate_shared::{Category, DeviceInfo, DiagnosisKind, Role, Turn};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Known problem shapes, each with a technical rephrasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemPattern {
    WifiConnectivity,
    Slowness,
    SystemCrash,
    NoPower,
    PrinterNotPrinting,
    BatteryDrain,
    PasswordRecovery,
    EmailClient,
    UpdateFailure,
    Malware,
    DiskFormat,
    FactoryReset,
}

impl ProblemPattern {
    pub fn key(&self) -> &'static str {
        match self {
            Self::WifiConnectivity => "wifi_connectivity",
            Self::Slowness => "slowness",
            Self::SystemCrash => "system_crash",
            Self::NoPower => "no_power",
            Self::PrinterNotPrinting => "printer_not_printing",
            Self::BatteryDrain => "battery_drain",
            Self::PasswordRecovery => "password_recovery",
            Self::EmailClient => "email_client",
            Self::UpdateFailure => "update_failure",
            Self::Malware => "malware",
            Self::DiskFormat => "disk_format",
            Self::FactoryReset => "factory_reset",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::WifiConnectivity => "Wi-Fi connectivity issues",
            Self::Slowness => "Computer performance issues - slow/freezing",
            Self::SystemCrash => "Blue Screen of Death (BSOD) - system crash",
            Self::NoPower => "Device power failure - won't turn on",
            Self::PrinterNotPrinting => "Printer not printing",
            Self::BatteryDrain => "Battery draining quickly",
            Self::PasswordRecovery => "Password recovery - locked out",
            Self::EmailClient => "Email client issues",
            Self::UpdateFailure => "Software update failure",
            Self::Malware => "Potential malware infection",
            Self::DiskFormat => "Disk formatting or wiping",
            Self::FactoryReset => "Factory reset of the device",
        }
    }

    /// Category implied by the pattern, used when the classifier has none.
    pub fn category(&self) -> Category {
        match self {
            Self::WifiConnectivity => Category::Networking,
            Self::Slowness => Category::Performance,
            Self::SystemCrash
            | Self::PasswordRecovery
            | Self::EmailClient
            | Self::UpdateFailure
            | Self::Malware
            | Self::FactoryReset => Category::Os,
            Self::NoPower | Self::DiskFormat => Category::Hardware,
            Self::PrinterNotPrinting => Category::Peripherals,
            Self::BatteryDrain => Category::Mobile,
        }
    }
}

fn pattern_table() -> &'static [(ProblemPattern, Regex)] {
    static TABLE: OnceLock<Vec<(ProblemPattern, Regex)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let raw = [
            (
                ProblemPattern::WifiConnectivity,
                r"(wifi|wi-fi|internet|network).*(not work|can't connect|cannot connect|won't connect|wont connect|keeps dropping|disconnect)",
            ),
            (ProblemPattern::Slowness, r"(slow|laggy|sluggish|freez|frozen)"),
            (ProblemPattern::SystemCrash, r"(blue screen|bsod|crash)"),
            (
                ProblemPattern::NoPower,
                r"(won't turn on|wont turn on|no power|\bdead\b|not starting)",
            ),
            (
                ProblemPattern::PrinterNotPrinting,
                r"printer.*(not work|won't print|wont print|not printing|offline)",
            ),
            (ProblemPattern::BatteryDrain, r"battery.*(drain|dying|fast|quick)"),
            (ProblemPattern::PasswordRecovery, r"(forgot|lost|reset).*password"),
            (
                ProblemPattern::EmailClient,
                r"e-?mail.*(not work|can't send|cannot send|can't receive|cannot receive)",
            ),
            (ProblemPattern::UpdateFailure, r"update.*(fail|error|stuck)"),
            (ProblemPattern::Malware, r"(virus|malware|infected)"),
            (
                ProblemPattern::DiskFormat,
                r"(format|wipe|erase|repartition|partition).*(drive|disk|ssd|hdd|usb|partition)",
            ),
            (
                ProblemPattern::FactoryReset,
                r"(factory reset|reset .*to factory|factory settings)",
            ),
        ];
        raw.into_iter()
            .map(|(p, re)| (p, Regex::new(re).expect("static pattern table")))
            .collect()
    })
}

/// First matching pattern for `text`.
pub fn match_pattern(text: &str) -> Option<ProblemPattern> {
    let lowered = text.to_lowercase();
    pattern_table()
        .iter()
        .find(|(_, re)| re.is_match(&lowered))
        .map(|(p, _)| *p)
}

const FOLLOW_UP_PHRASES: &[&str] = &[
    "didn't work",
    "didnt work",
    "did not work",
    "doesn't work",
    "still not working",
    "still doesn't",
    "still broken",
    "still happening",
    "same problem",
    "same issue",
    "didn't help",
    "did not help",
    "no luck",
    "not fixed",
];

/// Negative outcome report about earlier advice.
pub fn is_follow_up_report(text: &str) -> bool {
    let lowered = text.to_lowercase().replace('\u{2019}', "'");
    FOLLOW_UP_PHRASES.iter().any(|p| lowered.contains(p))
}

const TROUBLESHOOTING_TERMS: &[&str] = &[
    "wifi", "wi fi", "internet", "network", "slow", "lag", "freeze", "frozen", "crash",
    "bsod", "blue", "screen", "printer", "battery", "update", "error", "won't", "wont",
    "can't", "cant", "not", "broken", "stuck", "virus", "malware",
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "hiya", "yo", "howdy", "sup", "good morning", "good afternoon",
    "good evening", "how are you", "whats up", "what's up", "help",
];

const GREETING_OPENERS: &[&str] = &["hi", "hello", "hey", "hiya", "yo", "howdy", "sup"];

/// Pure greeting or small talk with no troubleshooting content.
pub fn is_greeting(text: &str) -> bool {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '\'' || c.is_whitespace() { c } else { ' ' })
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = cleaned.split(' ').collect();
    if tokens
        .iter()
        .any(|t| TROUBLESHOOTING_TERMS.contains(t) || t.ends_with("n't"))
        || cleaned.contains("wi fi")
    {
        return false;
    }
    if GREETINGS.contains(&cleaned.as_str()) {
        return true;
    }
    tokens.len() <= 3 && GREETING_OPENERS.contains(&tokens[0])
}

/// A query the pipeline will analyze.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    /// Text retrieval and analysis run on
    pub text: String,
    /// Technical problem statement
    pub statement: String,
    pub category: Category,
    pub pattern: Option<ProblemPattern>,
    /// The utterance reported that earlier advice failed
    pub is_follow_up: bool,
    /// The utterance answered a clarifying question
    pub answered_clarification: bool,
    /// Non-blocking question about missing details
    pub follow_up_question: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Onboarding,
    Clarify { question: String },
    Query(NormalizedQuery),
}

pub struct QueryNormalizer {
    classifier: Arc<dyn CategoryClassifier>,
    min_query_tokens: usize,
}

impl QueryNormalizer {
    pub fn new(classifier: Arc<dyn CategoryClassifier>, min_query_tokens: usize) -> Self {
        Self {
            classifier,
            min_query_tokens,
        }
    }

    /// `history` is the recent window of the session, oldest first, not
    /// including the current utterance.
    pub fn normalize(
        &self,
        raw: &str,
        history: &[Turn],
        device: Option<&DeviceInfo>,
    ) -> Normalized {
        let text = collapse_whitespace(raw);
        if text.is_empty() {
            return Normalized::Clarify {
                question: questions::EMPTY_MESSAGE.to_string(),
            };
        }

        if is_follow_up_report(&text) {
            if let Some(previous) = previous_problem(history) {
                debug!("follow-up report, reusing previous problem '{}'", previous);
                let mut query = self.query(&previous, device);
                query.is_follow_up = true;
                query.follow_up_question = None;
                return Normalized::Query(query);
            }
            if !self.classifier.classify(&text).is_known() {
                return Normalized::Clarify {
                    question: questions::SHORT_PROBLEM.to_string(),
                };
            }
        }

        if let Some(asked_about) = pending_clarification(history) {
            let merged = collapse_whitespace(&format!("{} {}", asked_about, text));
            let mut query = self.query(&merged, device);
            query.answered_clarification = true;
            return Normalized::Query(query);
        }

        if is_greeting(&text) {
            return Normalized::Onboarding;
        }

        let query = self.query(&text, device);
        let token_count = words(&text).len();
        if token_count < self.min_query_tokens && !query.category.is_known() {
            return Normalized::Clarify {
                question: questions::SHORT_PROBLEM.to_string(),
            };
        }
        Normalized::Query(query)
    }

    /// Normalize `text` as a problem statement, skipping the conversational
    /// checks.
    pub fn query(&self, text: &str, device: Option<&DeviceInfo>) -> NormalizedQuery {
        let pattern = match_pattern(text);
        let mut category = self.classifier.classify(text);
        if !category.is_known() {
            if let Some(p) = pattern {
                category = p.category();
            }
        }
        NormalizedQuery {
            text: text.to_string(),
            statement: rephrase(text, pattern, device),
            category,
            pattern,
            is_follow_up: false,
            answered_clarification: false,
            follow_up_question: missing_info_question(text, device),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Technical statement for the problem: the pattern's description, or the
/// cleaned text when nothing matches.
pub fn rephrase(
    text: &str,
    pattern: Option<ProblemPattern>,
    device: Option<&DeviceInfo>,
) -> String {
    match pattern {
        Some(p) => match device.and_then(|d| d.device_type.as_deref()) {
            Some(device_type) => format!("{} on {}", p.description(), device_type),
            None => p.description().to_string(),
        },
        None => collapse_whitespace(text),
    }
}

const DEVICE_WORDS: &[&str] = &[
    "computer", "pc", "laptop", "desktop", "phone", "iphone", "android", "tablet", "ipad",
    "mac", "macbook", "printer", "chromebook",
];

/// One targeted question about details that would sharpen the answer.
/// Never blocks the answer.
pub fn missing_info_question(text: &str, device: Option<&DeviceInfo>) -> Option<String> {
    let tokens = words(text);
    if tokens.len() < 4 {
        return Some(questions::SHORT_PROBLEM.to_string());
    }

    let device_type = device.and_then(|d| d.device_type.as_deref());
    if device_type.is_none() {
        if tokens.iter().any(|t| DEVICE_WORDS.contains(&t.as_str())) {
            return None;
        }
        return Some(questions::DEVICE_AND_OS.to_string());
    }

    let has_os = device.map(|d| d.os.is_some()).unwrap_or(false);
    if !has_os
        && tokens
            .iter()
            .any(|t| matches!(t.as_str(), "update" | "setting" | "system"))
    {
        return Some(questions::OS.to_string());
    }
    None
}

/// If the last assistant turn asked a clarifying question, the user text
/// that prompted it.
fn pending_clarification(history: &[Turn]) -> Option<String> {
    let last = history.last()?;
    if last.role() != Role::Assistant {
        return None;
    }
    let kind = last.diagnosis().map(|d| d.kind)?;
    if kind != DiagnosisKind::Clarification {
        return None;
    }
    let asked_about = history[..history.len() - 1]
        .iter()
        .rev()
        .find(|t| t.role() == Role::User)
        .map(|t| t.text().trim().to_string())
        .unwrap_or_default();
    Some(asked_about)
}

/// Most recent problem text that produced a solution, skipping follow-up
/// reports. A problem that answered a clarification is merged with the text
/// that was clarified. Caller-supplied assistant turns carry no diagnosis
/// and count as answers.
fn previous_problem(history: &[Turn]) -> Option<String> {
    for (i, turn) in history.iter().enumerate().rev() {
        if turn.role() != Role::Assistant {
            continue;
        }
        let solved = turn
            .diagnosis()
            .map(|d| d.kind == DiagnosisKind::Solution)
            .unwrap_or(true);
        if !solved || i == 0 {
            continue;
        }
        let user = &history[i - 1];
        if user.role() != Role::User || is_follow_up_report(user.text()) {
            continue;
        }
        let mut text = user.text().trim().to_string();
        if let Some(asked_about) = pending_clarification(&history[..i - 1]) {
            text = collapse_whitespace(&format!("{} {}", asked_about, text));
        }
        return Some(text);
    }
    None
}
