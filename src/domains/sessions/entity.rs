use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domains::agents::metadata::MetadataPatch;
use crate::domains::agents::AgentKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Closed => "closed",
        }
    }

    /// Active and Idle both mean "a PTY is attached".
    pub fn is_running(&self) -> bool {
        !matches!(self, SessionStatus::Closed)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "closed" => Ok(SessionStatus::Closed),
            _ => Err(format!("Invalid session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub working_dir: String,
    #[serde(default)]
    pub git_root: String,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub context_used: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub waiting_for_input: bool,
}

impl SessionMetadata {
    pub fn for_working_dir(working_dir: &str) -> Self {
        let path = std::path::Path::new(working_dir);
        Self {
            working_dir: working_dir.to_string(),
            git_root: crate::domains::git::resolve_git_root(path)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            git_branch: crate::domains::git::current_branch(path).unwrap_or_default(),
            ..Self::default()
        }
    }

    /// Merge an extractor patch field-by-field. Returns true when anything
    /// actually changed, which is what gates a `session:update` emission.
    pub fn apply_patch(&mut self, patch: &MetadataPatch) -> bool {
        let mut changed = false;
        if let Some(model) = &patch.model {
            if &self.model != model {
                self.model = model.clone();
                changed = true;
            }
        }
        if let Some(context_used) = &patch.context_used {
            if &self.context_used != context_used {
                self.context_used = context_used.clone();
                changed = true;
            }
        }
        if let Some(last_message) = &patch.last_message {
            if &self.last_message != last_message {
                self.last_message = last_message.clone();
                changed = true;
            }
        }
        if let Some(waiting) = patch.waiting_for_input {
            if self.waiting_for_input != waiting {
                self.waiting_for_input = waiting;
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    pub status: SessionStatus,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
}

/// The durable subset of a session. Transient runtime state never lands on
/// disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    pub working_dir: String,
}

impl From<&Session> for SavedSession {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            kind: session.kind,
            working_dir: session.metadata.working_dir.clone(),
        }
    }
}
