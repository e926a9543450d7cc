//! Single-slot concurrency gate for active sessions.
//!
//! At most one `(workspace, session_id)` pair holds the slot. Release is
//! owner-identified: a stale abort for a finished session cannot free the
//! slot out from under a newer one.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Default)]
pub struct Gate {
    slot: Mutex<Option<(PathBuf, String)>>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for `(workspace, session_id)`. Returns false when held.
    pub fn acquire(&self, workspace: &Path, session_id: &str) -> bool {
        let mut slot = self.slot.lock().expect("gate poisoned");
        if slot.is_some() {
            return false;
        }
        debug!(session_id, "gate acquired");
        *slot = Some((workspace.to_path_buf(), session_id.to_string()));
        true
    }

    /// Free the slot iff the stored pair matches. A mismatch is a no-op and
    /// returns false.
    pub fn release(&self, workspace: &Path, session_id: &str) -> bool {
        let mut slot = self.slot.lock().expect("gate poisoned");
        match slot.as_ref() {
            Some((held_workspace, held_id))
                if held_workspace == workspace && held_id == session_id =>
            {
                debug!(session_id, "gate released");
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Session id currently holding the slot, if any.
    pub fn active_session_id(&self) -> Option<String> {
        self.slot
            .lock()
            .expect("gate poisoned")
            .as_ref()
            .map(|(_, id)| id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_succeeds_only_when_empty() {
        let gate = Gate::new();
        assert!(gate.acquire(Path::new("/tmp/a"), "sess_1"));
        assert!(!gate.acquire(Path::new("/tmp/b"), "sess_2"));
        assert_eq!(gate.active_session_id().as_deref(), Some("sess_1"));
    }

    #[test]
    fn release_requires_matching_owner() {
        let gate = Gate::new();
        assert!(gate.acquire(Path::new("/tmp/a"), "sess_1"));

        // Wrong id, wrong workspace: both no-ops.
        assert!(!gate.release(Path::new("/tmp/a"), "sess_2"));
        assert!(!gate.release(Path::new("/tmp/b"), "sess_1"));
        assert_eq!(gate.active_session_id().as_deref(), Some("sess_1"));

        assert!(gate.release(Path::new("/tmp/a"), "sess_1"));
        assert!(gate.active_session_id().is_none());
    }

    #[test]
    fn slot_is_reusable_after_release() {
        let gate = Gate::new();
        assert!(gate.acquire(Path::new("/tmp/a"), "sess_1"));
        assert!(gate.release(Path::new("/tmp/a"), "sess_1"));
        assert!(gate.acquire(Path::new("/tmp/a"), "sess_2"));
    }

    #[test]
    fn stale_release_does_not_free_newer_session() {
        let gate = Gate::new();
        assert!(gate.acquire(Path::new("/tmp/a"), "sess_1"));
        assert!(gate.release(Path::new("/tmp/a"), "sess_1"));
        assert!(gate.acquire(Path::new("/tmp/a"), "sess_2"));

        // A late release from the finished session must not drop the slot.
        assert!(!gate.release(Path::new("/tmp/a"), "sess_1"));
        assert_eq!(gate.active_session_id().as_deref(), Some("sess_2"));
    }

    #[test]
    fn acquire_is_atomic_across_threads() {
        use std::sync::Arc;
        let gate = Arc::new(Gate::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let gate = gate.clone();
            handles.push(std::thread::spawn(move || {
                gate.acquire(Path::new("/tmp/a"), &format!("sess_{i}"))
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
