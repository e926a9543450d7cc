//! Shared contracts for session records and live state.
//!
//! These types define the persisted shape of a session (`task.json`,
//! `shared_state.json`) and the patch applied on every update. They must
//! remain stable: the filesystem is the system of record and older records
//! are read back across restarts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a session. `Running` transitions exactly once, and
/// only to one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Done,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

/// An automatically extracted `file:line` reference from agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    /// Full line of output the reference was found on.
    pub description: String,
    /// Referenced file (must carry an extension).
    pub file: String,
    /// `"12"` or `"12-15"`.
    pub line_range: String,
}

/// One produced artifact, indexed at session completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Record of a CLI argument dropped because the agent rejected it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub time: DateTime<Utc>,
    pub attempted_flag: String,
    pub reason: String,
    pub fallback_action: String,
}

/// Immutable task record, written once at session creation (`task.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub session_id: String,
    pub goal: String,
    /// Absolute, symlink-resolved workspace root.
    pub workspace_root: PathBuf,
    pub allowed_tools: Vec<String>,
    pub turns_max: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    /// First 16 hex of the prompt template digest.
    pub template_digest: String,
}

/// Live status record (`shared_state.json`), replaced atomically on every
/// update.
///
/// Unknown fields survive read-modify-write via the flattened `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub session_id: String,
    pub goal: String,
    pub status: SessionStatus,
    pub turns_completed: u32,
    pub turns_max: u32,
    pub progress: Vec<String>,
    pub blockers: Vec<Blocker>,
    /// Workspace-relative paths, replaced on finalization.
    pub files_changed: Vec<String>,
    pub artifacts: Vec<ArtifactEntry>,
    pub fallback_events: Vec<FallbackEvent>,
    pub cost_usd: Option<f64>,
    pub updated_at: DateTime<Utc>,
    /// Non-null exactly when the session reached a terminal state other
    /// than `done`.
    pub error_summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SharedState {
    /// Initial state for a freshly accepted task.
    pub fn initial(task: &TaskSpec) -> Self {
        Self {
            session_id: task.session_id.clone(),
            goal: task.goal.clone(),
            status: SessionStatus::Running,
            turns_completed: 0,
            turns_max: task.turns_max,
            progress: Vec::new(),
            blockers: Vec::new(),
            files_changed: Vec::new(),
            artifacts: Vec::new(),
            fallback_events: Vec::new(),
            cost_usd: None,
            updated_at: task.created_at,
            error_summary: None,
            extra: Map::new(),
        }
    }

    /// Shallow-merge a patch into this state.
    ///
    /// `session_id`, `goal`, and `turns_max` are not patchable by
    /// construction. `progress` and `fallback_events` are append-only;
    /// `turns_completed` never decreases; the remaining fields are replaced
    /// wholesale when present.
    pub fn apply(&mut self, patch: &StatePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(turns) = patch.turns_completed {
            self.turns_completed = self.turns_completed.max(turns);
        }
        if let Some(entries) = &patch.progress {
            self.progress.extend(entries.iter().cloned());
        }
        if let Some(blockers) = &patch.blockers {
            self.blockers = blockers.clone();
        }
        if let Some(files) = &patch.files_changed {
            self.files_changed = files.clone();
        }
        if let Some(artifacts) = &patch.artifacts {
            self.artifacts = artifacts.clone();
        }
        if let Some(events) = &patch.fallback_events {
            self.fallback_events.extend(events.iter().cloned());
        }
        if let Some(cost) = patch.cost_usd {
            self.cost_usd = Some(cost);
        }
        if let Some(summary) = &patch.error_summary {
            self.error_summary = Some(summary.clone());
        }
    }
}

/// Partial update applied through [`SharedState::apply`].
///
/// Absent fields leave the current value untouched. There is deliberately no
/// way to patch `session_id` or `goal`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<SessionStatus>,
    pub turns_completed: Option<u32>,
    /// Entries appended to `progress`.
    pub progress: Option<Vec<String>>,
    /// Replaces `blockers` wholesale.
    pub blockers: Option<Vec<Blocker>>,
    pub files_changed: Option<Vec<String>>,
    pub artifacts: Option<Vec<ArtifactEntry>>,
    /// Entries appended to `fallback_events`.
    pub fallback_events: Option<Vec<FallbackEvent>>,
    pub cost_usd: Option<f64>,
    pub error_summary: Option<String>,
}

/// Listing row returned by `GET /v1/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub goal: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
