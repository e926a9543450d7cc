//! Shared application state for the HTTP surface.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

use crate::config::Config;
use crate::core::prompt::PromptBuilder;
use crate::gate::Gate;
use crate::io::store::SessionStore;
use crate::supervisor::Supervisor;

/// Cancellation flags for in-flight sessions, keyed by session id. The abort
/// route flips a flag; the supervisor's final step removes the entry.
pub type CancelFlags = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub gate: Arc<Gate>,
    pub supervisor: Arc<Supervisor>,
    pub prompts: Arc<PromptBuilder>,
    pub cancel_flags: CancelFlags,
}

impl AppState {
    pub fn cancel_flag(&self, session_id: &str) -> Option<Arc<AtomicBool>> {
        self.cancel_flags
            .lock()
            .expect("cancel flag table poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn register_cancel_flag(&self, session_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .expect("cancel flag table poisoned")
            .insert(session_id.to_string(), flag.clone());
        flag
    }

    pub fn remove_cancel_flag(&self, session_id: &str) {
        self.cancel_flags
            .lock()
            .expect("cancel flag table poisoned")
            .remove(session_id);
    }
}

/// Server-generated session id: UTC stamp plus a random suffix, matching the
/// store's accepted id grammar.
pub fn generate_session_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("sess_{stamp}_{suffix}")
}
