//! Inbound request contract and its validation.

use crate::error::PipelineError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Maximum accepted message length in characters
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Maximum accepted session id length
pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl DeviceInfo {
    pub fn is_empty(&self) -> bool {
        self.device_type.is_none()
            && self.os.is_none()
            && self.os_version.is_none()
            && self.manufacturer.is_none()
            && self.model.is_none()
    }

    /// One-line summary for prompts, e.g. "laptop, windows 11".
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = &self.device_type {
            parts.push(t.clone());
        }
        match (&self.os, &self.os_version) {
            (Some(os), Some(v)) => parts.push(format!("{} {}", os, v)),
            (Some(os), None) => parts.push(os.clone()),
            _ => {}
        }
        match (&self.manufacturer, &self.model) {
            (Some(m), Some(model)) => parts.push(format!("{} {}", m, model)),
            (Some(m), None) => parts.push(m.clone()),
            (None, Some(model)) => parts.push(model.clone()),
            _ => {}
        }
        if parts.is_empty() {
            "unknown device".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl fmt::Display for TechnicalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        };
        f.write_str(s)
    }
}

/// A prior message supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<HistoryMessage>,
    #[serde(default)]
    pub technical_level: TechnicalLevel,
}

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device_info = Some(device);
        self
    }

    /// Reject malformed requests before they enter the pipeline.
    /// An empty message is valid: the pipeline answers it with a
    /// clarifying question.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let len = self.message.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(PipelineError::Validation(format!(
                "message is {} characters, limit is {}",
                len, MAX_MESSAGE_CHARS
            )));
        }

        if let Some(id) = &self.session_id {
            validate_session_id(id)?;
        }

        for (i, msg) in self.conversation_history.iter().enumerate() {
            if !matches!(msg.role.as_str(), "user" | "assistant" | "system") {
                return Err(PipelineError::Validation(format!(
                    "conversation_history[{}] has unknown role '{}'",
                    i, msg.role
                )));
            }
            if msg.content.chars().count() > MAX_MESSAGE_CHARS {
                return Err(PipelineError::Validation(format!(
                    "conversation_history[{}] exceeds {} characters",
                    i, MAX_MESSAGE_CHARS
                )));
            }
        }

        Ok(())
    }
}

pub fn validate_session_id(id: &str) -> Result<(), PipelineError> {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(PipelineError::Validation(format!(
            "session_id must be 1..={} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id_pattern().is_match(id) {
        return Err(PipelineError::Validation(
            "session_id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}
