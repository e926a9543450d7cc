//! Test-only helpers: scripted agent runners and a wired app harness.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::config::{Config, DEFAULT_DENY_GLOBS};
use crate::core::prompt::PromptBuilder;
use crate::gate::Gate;
use crate::http::state::AppState;
use crate::io::store::SessionStore;
use crate::supervisor::{AgentInvocation, AgentRun, AgentRunner, Supervisor};

/// One scripted spawn result.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    /// Simulated run duration before the response is returned.
    pub delay: Option<Duration>,
}

/// Successful run with the given stdout.
pub fn done_response(stdout: &str) -> ScriptedResponse {
    ScriptedResponse {
        exit_code: 0,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        timed_out: false,
        delay: None,
    }
}

/// Failed run with the given exit code and stderr.
pub fn failed_response(exit_code: i32, stderr: &str) -> ScriptedResponse {
    ScriptedResponse {
        exit_code,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
        timed_out: false,
        delay: None,
    }
}

/// Run that hit the wall-clock timeout.
pub fn timed_out_response() -> ScriptedResponse {
    ScriptedResponse {
        exit_code: 124,
        stdout: Vec::new(),
        stderr: b"killed".to_vec(),
        timed_out: true,
        delay: None,
    }
}

/// Agent runner returning predetermined outputs without spawning processes.
///
/// Records every invocation so tests can assert on the argument ladder.
pub struct ScriptedAgentRunner {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedAgentRunner {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().expect("invocations poisoned").clone()
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn run(&self, invocation: &AgentInvocation) -> Result<AgentRun> {
        self.invocations
            .lock()
            .expect("invocations poisoned")
            .push(invocation.clone());
        let response = self
            .responses
            .lock()
            .expect("responses poisoned")
            .pop_front()
            .unwrap_or_else(|| done_response(""));
        if let Some(delay) = response.delay {
            std::thread::sleep(delay);
        }
        Ok(AgentRun {
            exit_code: Some(response.exit_code),
            stdout: response.stdout,
            stderr: response.stderr,
            timed_out: response.timed_out,
        })
    }
}

/// A fully wired application over a temp directory and a scripted runner.
pub struct TestHarness {
    /// Keeps the backing directory alive for the duration of the test.
    pub temp: tempfile::TempDir,
    /// A workspace directory under the allowed root.
    pub workspace: PathBuf,
    pub state: AppState,
    pub runner: Arc<ScriptedAgentRunner>,
}

/// Deterministic config rooted in a temp directory.
pub fn test_config(allowed_root: PathBuf, data_dir: PathBuf) -> Config {
    Config {
        bridge_token: "test-token".to_string(),
        allowed_roots: vec![allowed_root],
        port: 8787,
        bind: "127.0.0.1".to_string(),
        data_dir,
        deny_globs: DEFAULT_DENY_GLOBS.split(',').map(str::to_string).collect(),
        prompt_append: None,
        max_concurrent: 1,
        turns_cap: 50,
        timeout_cap_secs: 1800,
        logtail_max_lines: 200,
        excerpt_max_chars: 20_000,
        agent_bin: "agent-cli".to_string(),
        kill_grace_secs: 1,
        output_limit_bytes: 1_000_000,
    }
}

/// Build a harness whose agent plays back the given responses.
pub fn harness(responses: Vec<ScriptedResponse>) -> TestHarness {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonicalize tempdir");
    let workspace = root.join("wk");
    fs::create_dir_all(&workspace).expect("create workspace");

    let config = Arc::new(test_config(root, temp.path().join("sessions")));
    let store = Arc::new(SessionStore::new(config.data_dir.clone()));
    let gate = Arc::new(Gate::new());
    let runner = Arc::new(ScriptedAgentRunner::new(responses));
    let supervisor = Arc::new(Supervisor {
        store: store.clone(),
        gate: gate.clone(),
        runner: runner.clone(),
        agent_bin: config.agent_bin.clone(),
        output_limit_bytes: config.output_limit_bytes,
        kill_grace: config.kill_grace(),
    });
    let prompts =
        Arc::new(PromptBuilder::new(config.prompt_append.as_deref()).expect("prompt builder"));

    let state = AppState {
        config,
        store,
        gate,
        supervisor,
        prompts,
        cancel_flags: Arc::new(Mutex::new(HashMap::new())),
    };

    TestHarness {
        temp,
        workspace,
        state,
        runner,
    }
}
