//! Conversation state: sessions and their turns.
//!
//! A session's history is append-only. Turns cannot be edited once
//! appended and nothing here removes them; eviction of a whole session is
//! the store's business.

use crate::diagnosis::Diagnosis;
use crate::request::DeviceInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    text: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diagnosis: Option<Diagnosis>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
            diagnosis: None,
        }
    }

    pub fn assistant(text: impl Into<String>, diagnosis: Option<Diagnosis>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            diagnosis,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        self.diagnosis.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device: Option<DeviceInfo>,
    attempted: BTreeSet<String>,
    #[serde(default)]
    resolved: bool,
}

/// Normalized form under which an attempted step is stored.
pub fn attempt_key(description: &str) -> String {
    description.trim().to_lowercase()
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            turns: Vec::new(),
            device: None,
            attempted: BTreeSet::new(),
            resolved: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// Record that a remedy was tried without success. Returns false if it
    /// was already recorded.
    pub fn mark_attempted(&mut self, step_description: &str) -> bool {
        let key = attempt_key(step_description);
        if key.is_empty() {
            return false;
        }
        self.attempted.insert(key)
    }

    pub fn attempted_solutions(&self) -> &BTreeSet<String> {
        &self.attempted
    }

    pub fn is_attempted(&self, step_description: &str) -> bool {
        self.attempted.contains(&attempt_key(step_description))
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Remember the device descriptor; later requests without one reuse it.
    pub fn set_device(&mut self, device: DeviceInfo) {
        if !device.is_empty() {
            self.device = Some(device);
        }
    }

    pub fn mark_resolved(&mut self) {
        self.resolved = true;
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Diagnoses produced so far, oldest first.
    pub fn diagnoses(&self) -> impl Iterator<Item = &Diagnosis> {
        self.turns.iter().filter_map(|t| t.diagnosis())
    }

    pub fn last_diagnosis(&self) -> Option<&Diagnosis> {
        self.turns.iter().rev().find_map(|t| t.diagnosis())
    }
}
