//! Filesystem-backed session store.
//!
//! Layout under the data directory, one directory per session:
//!
//! ```text
//! <data_dir>/<session_id>/
//!   task.json            immutable task record
//!   shared_state.json    live state, replaced atomically on every update
//!   turns/NNNN/          per-turn audit logs
//!   out/                 derived deliverables
//! ```
//!
//! Only this module mutates session directories. State writes are temp-file
//! plus rename in the session directory so readers never observe a partial
//! document, and writes for the same session id are serialized through an
//! in-memory per-id lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::{SessionStatus, SessionSummary, SharedState, StatePatch, TaskSpec};

/// Directory under a workspace root where the agent drops artifacts.
pub const ARTIFACTS_SUBDIR: &str = ".agent-firewall/artifacts";

const TASK_FILE: &str = "task.json";
const STATE_FILE: &str = "shared_state.json";

pub struct SessionStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a session's records. Errors on malformed ids so a
    /// crafted id can never traverse out of the data directory.
    pub fn session_dir(&self, id: &str) -> Result<PathBuf> {
        if !valid_session_id(id) {
            return Err(anyhow!("invalid session id"));
        }
        Ok(self.root.join(id))
    }

    /// Create the session directory with its task record and initial state.
    ///
    /// Fails if the session already exists. The initial state is `running`
    /// with all sequences empty.
    pub fn create(&self, id: &str, task: &TaskSpec) -> Result<()> {
        let dir = self.session_dir(id)?;
        let lock = self.session_lock(id);
        let _guard = lock.lock().expect("session lock poisoned");

        if dir.join(TASK_FILE).exists() {
            return Err(anyhow!("session {id} already exists"));
        }
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        write_json_atomic(&dir.join(TASK_FILE), task)?;
        write_json_atomic(&dir.join(STATE_FILE), &SharedState::initial(task))?;
        debug!(session_id = id, "session created");
        Ok(())
    }

    /// Load the live state; `None` for absent sessions.
    pub fn get_state(&self, id: &str) -> Result<Option<SharedState>> {
        let path = self.session_dir(id)?.join(STATE_FILE);
        read_json_opt(&path)
    }

    /// Load the task record; `None` for absent sessions.
    pub fn get_task(&self, id: &str) -> Result<Option<TaskSpec>> {
        let path = self.session_dir(id)?.join(TASK_FILE);
        read_json_opt(&path)
    }

    /// Merge a patch into the live state and persist atomically.
    ///
    /// A terminal state is a fixpoint: patches against `done`/`failed`/
    /// `aborted` sessions are ignored and the stored state returned
    /// unchanged. Rejects nonexistent sessions.
    pub fn update_state(&self, id: &str, patch: &StatePatch) -> Result<SharedState> {
        let dir = self.session_dir(id)?;
        let lock = self.session_lock(id);
        let _guard = lock.lock().expect("session lock poisoned");

        let path = dir.join(STATE_FILE);
        let mut state: SharedState = read_json_opt(&path)?
            .ok_or_else(|| anyhow!("session {id} does not exist"))?;

        if state.status.is_terminal() {
            debug!(session_id = id, status = state.status.as_str(), "ignoring patch against terminal state");
            return Ok(state);
        }

        state.apply(patch);
        state.updated_at = Utc::now();
        write_json_atomic(&path, &state)?;
        Ok(state)
    }

    /// Summaries of every well-formed session directory. Malformed entries
    /// (bad id, missing or unparseable records) are skipped, not errored.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in
            fs::read_dir(&self.root).with_context(|| format!("read {}", self.root.display()))?
        {
            let entry = entry.with_context(|| format!("read entry in {}", self.root.display()))?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !valid_session_id(&id) || !entry.path().is_dir() {
                continue;
            }
            let task: TaskSpec = match read_json_opt(&entry.path().join(TASK_FILE)) {
                Ok(Some(task)) => task,
                _ => continue,
            };
            let state: SharedState = match read_json_opt(&entry.path().join(STATE_FILE)) {
                Ok(Some(state)) => state,
                _ => continue,
            };
            summaries.push(SessionSummary {
                id,
                status: state.status,
                goal: state.goal,
                created_at: task.created_at,
                updated_at: state.updated_at,
            });
        }

        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Transition every `running` session to `aborted`.
    ///
    /// Called once before the listener binds so a crash cannot leave
    /// sessions running forever. Returns the number of sessions recovered.
    pub fn mark_aborted_on_startup(&self) -> Result<usize> {
        let mut recovered = 0;
        for summary in self.list_sessions()? {
            if summary.status != SessionStatus::Running {
                continue;
            }
            let patch = StatePatch {
                status: Some(SessionStatus::Aborted),
                error_summary: Some("Server restarted while session was running".to_string()),
                ..Default::default()
            };
            match self.update_state(&summary.id, &patch) {
                Ok(_) => {
                    warn!(session_id = %summary.id, "recovered stale running session");
                    recovered += 1;
                }
                Err(err) => warn!(session_id = %summary.id, %err, "startup recovery failed"),
            }
        }
        Ok(recovered)
    }

    /// Resolve an artifact by name for download.
    ///
    /// The name must be a bare basename (no separators, no dot-segments) and
    /// must resolve to a regular, non-symlink file directly under the
    /// workspace's artifacts directory. Returns `None` otherwise.
    pub fn artifact_path(
        &self,
        id: &str,
        name: &str,
        workspace: Option<&Path>,
    ) -> Result<Option<PathBuf>> {
        if !safe_artifact_name(name) {
            return Ok(None);
        }

        let workspace = match workspace {
            Some(workspace) => workspace.to_path_buf(),
            None => match self.get_task(id)? {
                Some(task) => task.workspace_root,
                None => return Ok(None),
            },
        };

        let artifacts_dir = workspace.join(ARTIFACTS_SUBDIR);
        let Ok(canonical_dir) = artifacts_dir.canonicalize() else {
            return Ok(None);
        };
        let candidate = canonical_dir.join(name);
        let Ok(canonical) = candidate.canonicalize() else {
            return Ok(None);
        };
        if !canonical.starts_with(&canonical_dir) {
            return Ok(None);
        }
        let Ok(metadata) = fs::symlink_metadata(&candidate) else {
            return Ok(None);
        };
        if !metadata.is_file() {
            return Ok(None);
        }
        Ok(Some(canonical))
    }

    /// Per-id serializer: callers lock the returned mutex for the duration
    /// of a create/update so concurrent writers to the same session queue up
    /// while different sessions proceed independently.
    fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("session lock table poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// A downloadable artifact name must be exactly a file basename.
fn safe_artifact_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return false;
    }
    Path::new(name)
        .file_name()
        .is_some_and(|base| base == name)
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize to pretty JSON and replace the target via temp file + rename in
/// the same directory.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: &str, workspace: &Path) -> TaskSpec {
        TaskSpec {
            session_id: id.to_string(),
            goal: "test goal".to_string(),
            workspace_root: workspace.to_path_buf(),
            allowed_tools: Vec::new(),
            turns_max: 20,
            timeout_seconds: 600,
            created_at: Utc::now(),
            template_digest: "aabbccddeeff0011".to_string(),
        }
    }

    #[test]
    fn create_then_get_state_is_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        store
            .create("sess_1", &task("sess_1", temp.path()))
            .expect("create");

        let state = store.get_state("sess_1").expect("get").expect("present");
        assert_eq!(state.status, SessionStatus::Running);
        assert_eq!(state.goal, "test goal");
        assert_eq!(state.turns_completed, 0);
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        let record = task("sess_1", temp.path());
        store.create("sess_1", &record).expect("create");
        let err = store.create("sess_1", &record).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn create_rejects_malformed_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        for id in ["", "../escape", "a/b", "x".repeat(129).as_str(), "sp ace"] {
            assert!(store.create(id, &task(id, temp.path())).is_err(), "id {id:?}");
        }
    }

    #[test]
    fn absent_session_reads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        assert!(store.get_state("nope").expect("get").is_none());
        assert!(store.get_task("nope").expect("get").is_none());
    }

    #[test]
    fn update_state_merges_and_bumps_updated_at() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        store
            .create("sess_1", &task("sess_1", temp.path()))
            .expect("create");
        let before = store.get_state("sess_1").expect("get").expect("present");

        let state = store
            .update_state(
                "sess_1",
                &StatePatch {
                    turns_completed: Some(2),
                    progress: Some(vec!["step one".to_string()]),
                    ..Default::default()
                },
            )
            .expect("update");
        assert_eq!(state.turns_completed, 2);
        assert_eq!(state.progress, vec!["step one".to_string()]);
        assert!(state.updated_at >= before.updated_at);
        assert_eq!(state.session_id, "sess_1");
    }

    #[test]
    fn update_state_rejects_nonexistent_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        assert!(store.update_state("nope", &StatePatch::default()).is_err());
    }

    #[test]
    fn terminal_state_is_a_fixpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        store
            .create("sess_1", &task("sess_1", temp.path()))
            .expect("create");
        store
            .update_state(
                "sess_1",
                &StatePatch {
                    status: Some(SessionStatus::Done),
                    ..Default::default()
                },
            )
            .expect("finalize");

        let state = store
            .update_state(
                "sess_1",
                &StatePatch {
                    turns_completed: Some(99),
                    status: Some(SessionStatus::Failed),
                    ..Default::default()
                },
            )
            .expect("late patch");
        assert_eq!(state.status, SessionStatus::Done);
        assert_eq!(state.turns_completed, 0);
    }

    #[test]
    fn unknown_fields_survive_update() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        store
            .create("sess_1", &task("sess_1", temp.path()))
            .expect("create");

        // Simulate a newer writer having added a field.
        let path = temp.path().join("sessions").join("sess_1").join(STATE_FILE);
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        value["future_field"] = serde_json::json!({"x": 1});
        fs::write(&path, serde_json::to_string_pretty(&value).expect("ser")).expect("write");

        store
            .update_state(
                "sess_1",
                &StatePatch {
                    turns_completed: Some(1),
                    ..Default::default()
                },
            )
            .expect("update");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("future_field"));
    }

    #[test]
    fn list_sessions_skips_malformed_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("sessions");
        let store = SessionStore::new(&root);
        store
            .create("sess_ok", &task("sess_ok", temp.path()))
            .expect("create");

        // Directory without records, directory with bad id, stray file.
        fs::create_dir_all(root.join("sess_empty")).expect("mkdir");
        fs::create_dir_all(root.join("bad id")).expect("mkdir");
        fs::write(root.join("stray.txt"), "x").expect("write");

        let sessions = store.list_sessions().expect("list");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "sess_ok");
    }

    #[test]
    fn startup_recovery_aborts_running_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        store
            .create("sess_running", &task("sess_running", temp.path()))
            .expect("create");
        store
            .create("sess_done", &task("sess_done", temp.path()))
            .expect("create");
        store
            .update_state(
                "sess_done",
                &StatePatch {
                    status: Some(SessionStatus::Done),
                    ..Default::default()
                },
            )
            .expect("finalize");

        let recovered = store.mark_aborted_on_startup().expect("recover");
        assert_eq!(recovered, 1);

        let state = store.get_state("sess_running").expect("get").expect("present");
        assert_eq!(state.status, SessionStatus::Aborted);
        assert_eq!(
            state.error_summary.as_deref(),
            Some("Server restarted while session was running")
        );
        let done = store.get_state("sess_done").expect("get").expect("present");
        assert_eq!(done.status, SessionStatus::Done);
    }

    #[test]
    fn artifact_path_requires_bare_basename() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        let workspace = temp.path().join("wk");
        let artifacts = workspace.join(ARTIFACTS_SUBDIR);
        fs::create_dir_all(&artifacts).expect("mkdir");
        fs::write(artifacts.join("report.md"), "ok").expect("write");

        let found = store
            .artifact_path("sess_1", "report.md", Some(&workspace))
            .expect("resolve");
        assert!(found.is_some());

        for name in ["../report.md", "a/report.md", "..", ".", "sub\\file"] {
            let denied = store
                .artifact_path("sess_1", name, Some(&workspace))
                .expect("resolve");
            assert!(denied.is_none(), "name {name:?} should be rejected");
        }
    }

    #[cfg(unix)]
    #[test]
    fn artifact_path_rejects_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        let workspace = temp.path().join("wk");
        let artifacts = workspace.join(ARTIFACTS_SUBDIR);
        fs::create_dir_all(&artifacts).expect("mkdir");
        let outside = temp.path().join("secret.txt");
        fs::write(&outside, "secret").expect("write");
        std::os::unix::fs::symlink(&outside, artifacts.join("link.txt")).expect("symlink");

        let denied = store
            .artifact_path("sess_1", "link.txt", Some(&workspace))
            .expect("resolve");
        assert!(denied.is_none());
    }

    #[test]
    fn state_file_write_is_atomic_via_rename() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        store
            .create("sess_1", &task("sess_1", temp.path()))
            .expect("create");

        let dir = temp.path().join("sessions").join("sess_1");
        store
            .update_state(
                "sess_1",
                &StatePatch {
                    turns_completed: Some(1),
                    ..Default::default()
                },
            )
            .expect("update");

        // No temp file is left behind after a completed write.
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
