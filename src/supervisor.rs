//! Subprocess lifecycle engine: one supervised agent turn per session.
//!
//! The supervisor owns every session mutation between acceptance and the
//! terminal state. Its protocol: materialize directories, spawn the agent
//! with the primary argument vector, walk the CLI-flag fallback ladder on
//! rejection, persist raw audit logs, parse structured output, derive
//! redacted deliverables, collect workspace side-effects, and write the
//! terminal state. The gate is released on every exit path; a cancellation
//! flag freezes state writes while leaving audit logs in place.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::RegexBuilder;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::blockers::extract_blockers;
use crate::core::redact::redact;
use crate::core::types::{
    ArtifactEntry, Blocker, FallbackEvent, SessionStatus, StatePatch,
};
use crate::gate::Gate;
use crate::io::artifacts::index_artifacts;
use crate::io::git::ChangeDetector;
use crate::io::process::run_command_with_timeout;
use crate::io::store::{ARTIFACTS_SUBDIR, SessionStore, write_json_atomic};

/// Environment variable carrying the session id into the agent subprocess.
pub const SESSION_ID_ENV: &str = "AGENTFW_SESSION_ID";

const FIRST_TURN: &str = "0001";
const PROMPT_ELIDED: &str = "<prompt elided>";
const STDERR_MARKER: &str = "\n--- stderr ---\n";
const TEST_REPORT_MAX_LINES: usize = 100;

static UNKNOWN_FLAG: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"unknown|unrecognized|not recognized|invalid (option|flag)")
        .case_insensitive(true)
        .build()
        .expect("unknown flag pattern")
});

/// One fully-specified agent spawn.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Extra variables on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub kill_grace: Duration,
}

/// Raw result of one agent spawn.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl AgentRun {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over the agent backend. Tests script this; production spawns
/// the configured binary.
pub trait AgentRunner: Send + Sync {
    fn run(&self, invocation: &AgentInvocation) -> Result<AgentRun>;
}

/// Spawns the agent executable by name (PATH lookup, no shell).
pub struct CliAgentRunner;

impl AgentRunner for CliAgentRunner {
    fn run(&self, invocation: &AgentInvocation) -> Result<AgentRun> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).current_dir(&invocation.workdir);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        let output = run_command_with_timeout(
            cmd,
            invocation.timeout,
            invocation.output_limit_bytes,
            invocation.kill_grace,
        )
        .context("run agent")?;
        Ok(AgentRun {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
        })
    }
}

/// Inputs for one session run.
#[derive(Clone)]
pub struct SessionRun {
    pub session_id: String,
    pub goal: String,
    pub prompt: String,
    pub workspace_root: PathBuf,
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
    /// Flipped by the abort route; freezes state writes when observed.
    pub cancel: Arc<AtomicBool>,
}

impl SessionRun {
    fn canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Session lifecycle engine wired to its collaborators.
pub struct Supervisor {
    pub store: Arc<SessionStore>,
    pub gate: Arc<Gate>,
    pub runner: Arc<dyn AgentRunner>,
    pub agent_bin: String,
    pub output_limit_bytes: usize,
    pub kill_grace: Duration,
}

impl Supervisor {
    /// Drive a session to its terminal state.
    ///
    /// Never returns an error to the caller: failures inside the engine
    /// become the session's `error_summary`. The gate is released on every
    /// exit path once the child has actually exited.
    #[instrument(skip_all, fields(session_id = %run.session_id))]
    pub fn run_session(&self, run: &SessionRun) {
        let outcome = self.execute(run);
        if let Err(err) = outcome {
            warn!(error = %format!("{err:#}"), "session execution failed");
            if !run.canceled() {
                let patch = StatePatch {
                    status: Some(SessionStatus::Failed),
                    error_summary: Some(format!("{err:#}")),
                    ..Default::default()
                };
                if let Err(err) = self.store.update_state(&run.session_id, &patch) {
                    warn!(error = %format!("{err:#}"), "failed to record session failure");
                }
            }
        }
        self.gate.release(&run.workspace_root, &run.session_id);
    }

    fn execute(&self, run: &SessionRun) -> Result<()> {
        let session_dir = self.store.session_dir(&run.session_id)?;
        let turn_dir = session_dir.join("turns").join(FIRST_TURN);
        let out_dir = session_dir.join("out");
        fs::create_dir_all(&turn_dir)
            .with_context(|| format!("create {}", turn_dir.display()))?;
        fs::create_dir_all(&out_dir).with_context(|| format!("create {}", out_dir.display()))?;

        let artifacts_dir = run.workspace_root.join(ARTIFACTS_SUBDIR);
        if let Err(err) = fs::create_dir_all(&artifacts_dir) {
            debug!(%err, "could not create artifacts dir");
        }

        let mut args = primary_args(&run.prompt, &run.allowed_tools);
        write_turn_request(&turn_dir, &args, false)?;

        let mut fallback_events = Vec::new();
        let mut output = self.spawn(run, &args)?;
        let mut tools_dropped = false;

        // Fallback rung 1: the agent rejected the allowed-tools flag.
        if !output.success() && !output.timed_out && !run.allowed_tools.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if UNKNOWN_FLAG.is_match(&stderr) && names_allowed_tools(&stderr) {
                info!("agent rejected --allowedTools, retrying without it");
                fallback_events.push(fallback_event(
                    "--allowedTools",
                    &stderr,
                    "retry without --allowedTools",
                ));
                tools_dropped = true;
                args = primary_args(&run.prompt, &[]);
                write_turn_request(&turn_dir, &args, true)?;
                output = self.spawn(run, &args)?;
            }
        }

        // Fallback rung 2: structured output rejected. Rung 1 already
        // removed the tools flag when it was the culprit, so keeping it here
        // cannot silently drop the restriction.
        if !output.success() && !output.timed_out {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if UNKNOWN_FLAG.is_match(&stderr) {
                info!("agent rejected --output-format, retrying with --print");
                fallback_events.push(fallback_event(
                    "--output-format",
                    &stderr,
                    "retry with --print and no structured output",
                ));
                args = print_args(
                    &run.prompt,
                    if tools_dropped { &[] } else { &run.allowed_tools },
                );
                write_turn_request(&turn_dir, &args, true)?;
                output = self.spawn(run, &args)?;
            }
        }

        // Raw audit bytes, never redacted.
        fs::write(turn_dir.join("stdout.log"), &output.stdout)
            .context("write stdout.log")?;
        fs::write(turn_dir.join("stderr.log"), &output.stderr)
            .context("write stderr.log")?;

        let stdout_text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr_text = String::from_utf8_lossy(&output.stderr).to_string();

        let parsed = parse_cli_output(&stdout_text);
        if let Some(value) = &parsed.value {
            write_json_atomic(&turn_dir.join("cli_output.json"), value)?;
        }

        let raw_output = format!("{stdout_text}{STDERR_MARKER}{stderr_text}");
        let redacted_output = redact(&raw_output);
        let blockers = extract_blockers(&redacted_output);

        // Cancellation freezes everything past the audit logs: no state
        // writes, no finalization outputs.
        if run.canceled() {
            info!("cancellation observed, skipping finalization");
            return Ok(());
        }

        {
            let patch = StatePatch {
                turns_completed: Some(parsed.turns_completed),
                blockers: Some(blockers.clone()),
                ..Default::default()
            };
            if let Err(err) = self.store.update_state(&run.session_id, &patch) {
                warn!(error = %format!("{err:#}"), "progress update failed");
            }
        }

        let detector = ChangeDetector::new(&run.workspace_root);
        let (files_changed, diff) = thread::scope(|scope| {
            let files = scope.spawn(|| detector.changed_files());
            let diff = scope.spawn(|| detector.diff_head());
            (
                files.join().unwrap_or_default(),
                diff.join()
                    .unwrap_or_else(|_| crate::io::git::UNAVAILABLE.to_string()),
            )
        });

        let (status, error_summary) = final_status(&output);
        let summary = render_summary(run, status, parsed.turns_completed, parsed.cost_usd, &blockers);
        let test_report = extract_test_report(&stdout_text, &stderr_text);

        // The output set lands both in the session's out/ directory and in
        // the workspace artifacts directory, so deliverables are fetchable
        // through the artifact routes.
        let artifact_entries = write_output_set(
            &out_dir,
            &artifacts_dir,
            &diff,
            &summary,
            test_report.as_deref(),
        )?;

        if !run.canceled() {
            let patch = StatePatch {
                status: Some(status),
                turns_completed: Some(parsed.turns_completed),
                blockers: Some(blockers),
                files_changed: Some(files_changed),
                artifacts: Some(artifact_entries),
                fallback_events: Some(fallback_events),
                cost_usd: parsed.cost_usd,
                error_summary,
                ..Default::default()
            };
            self.store
                .update_state(&run.session_id, &patch)
                .context("write terminal state")?;
        }

        info!(status = status.as_str(), "session finished");
        Ok(())
    }

    fn spawn(&self, run: &SessionRun, args: &[String]) -> Result<AgentRun> {
        let invocation = AgentInvocation {
            program: self.agent_bin.clone(),
            args: args.to_vec(),
            workdir: run.workspace_root.clone(),
            env: vec![(SESSION_ID_ENV.to_string(), run.session_id.clone())],
            timeout: run.timeout,
            output_limit_bytes: self.output_limit_bytes,
            kill_grace: self.kill_grace,
        };
        self.runner.run(&invocation)
    }
}

/// Write `patch.diff`, `summary.md`, `artifacts.json`, and the optional
/// `test_report.md`; return the final artifact index.
fn write_output_set(
    out_dir: &Path,
    artifacts_dir: &Path,
    diff: &str,
    summary: &str,
    test_report: Option<&str>,
) -> Result<Vec<ArtifactEntry>> {
    let mut deliverables = vec![("patch.diff", diff), ("summary.md", summary)];
    if let Some(report) = test_report {
        deliverables.push(("test_report.md", report));
    }

    for (name, contents) in &deliverables {
        fs::write(out_dir.join(name), contents)
            .with_context(|| format!("write out/{name}"))?;
        if artifacts_dir.is_dir() {
            if let Err(err) = fs::write(artifacts_dir.join(name), contents) {
                debug!(%err, name, "could not publish deliverable to artifacts dir");
            }
        }
    }

    // artifacts.json lists everything present before it is itself written;
    // the state index below then includes it too.
    let pre_index = index_artifacts(artifacts_dir).unwrap_or_default();
    write_json_atomic(&out_dir.join("artifacts.json"), &pre_index)?;
    if artifacts_dir.is_dir() {
        if let Err(err) = write_json_atomic(&artifacts_dir.join("artifacts.json"), &pre_index) {
            debug!(error = %format!("{err:#}"), "could not publish artifacts.json");
        }
    }

    Ok(index_artifacts(artifacts_dir).unwrap_or_default())
}

struct ParsedCliOutput {
    value: Option<Value>,
    turns_completed: u32,
    cost_usd: Option<f64>,
}

/// Try to parse stdout as a structured JSON object; defaults apply when the
/// agent emitted plain text.
fn parse_cli_output(stdout: &str) -> ParsedCliOutput {
    let value: Option<Value> = serde_json::from_str(stdout.trim())
        .ok()
        .filter(Value::is_object);

    let turns_completed = value
        .as_ref()
        .and_then(|v| {
            v.get("turn_count")
                .or_else(|| v.get("turns_completed"))
                .and_then(Value::as_u64)
        })
        .unwrap_or(1) as u32;

    let cost_usd = value.as_ref().and_then(|v| {
        v.get("cost_usd")
            .and_then(Value::as_f64)
            .or_else(|| v.pointer("/usage/cost").and_then(Value::as_f64))
    });

    ParsedCliOutput {
        value,
        turns_completed,
        cost_usd,
    }
}

fn primary_args(prompt: &str, allowed_tools: &[String]) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ];
    if !allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools.join(","));
    }
    args
}

fn print_args(prompt: &str, allowed_tools: &[String]) -> Vec<String> {
    let mut args = vec!["--print".to_string(), prompt.to_string()];
    if !allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools.join(","));
    }
    args
}

fn names_allowed_tools(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("allowedtools") || lower.contains("allowed-tools") || lower.contains("allowed_tools")
}

fn fallback_event(flag: &str, stderr: &str, action: &str) -> FallbackEvent {
    FallbackEvent {
        time: Utc::now(),
        attempted_flag: flag.to_string(),
        reason: stderr.lines().next().unwrap_or("").trim().to_string(),
        fallback_action: action.to_string(),
    }
}

fn final_status(output: &AgentRun) -> (SessionStatus, Option<String>) {
    if output.timed_out {
        return (SessionStatus::Failed, Some("Worker timed out".to_string()));
    }
    match output.exit_code {
        Some(0) => (SessionStatus::Done, None),
        Some(code) => (
            SessionStatus::Failed,
            Some(format!("Worker exited with code {code}")),
        ),
        None => (
            SessionStatus::Failed,
            Some("Worker terminated by signal".to_string()),
        ),
    }
}

#[derive(Serialize)]
struct TurnRequest {
    args: Vec<String>,
    is_fallback: bool,
}

/// Record the argument vector used for a spawn, with the prompt elided.
fn write_turn_request(turn_dir: &Path, args: &[String], is_fallback: bool) -> Result<()> {
    let mut recorded = args.to_vec();
    let mut elide_next = false;
    for arg in &mut recorded {
        if elide_next {
            *arg = PROMPT_ELIDED.to_string();
            elide_next = false;
        } else if arg == "-p" || arg == "--print" {
            elide_next = true;
        }
    }
    write_json_atomic(
        &turn_dir.join("request.json"),
        &TurnRequest {
            args: recorded,
            is_fallback,
        },
    )
}

fn render_summary(
    run: &SessionRun,
    status: SessionStatus,
    turns_completed: u32,
    cost_usd: Option<f64>,
    blockers: &[Blocker],
) -> String {
    let mut summary = String::new();
    summary.push_str("# Session summary\n\n");
    summary.push_str(&format!("- Goal: {}\n", redact(&run.goal)));
    summary.push_str(&format!("- Status: {}\n", status.as_str()));
    summary.push_str(&format!("- Turns completed: {turns_completed}\n"));
    match cost_usd {
        Some(cost) => summary.push_str(&format!("- Cost (USD): {cost}\n")),
        None => summary.push_str("- Cost (USD): n/a\n"),
    }
    summary.push_str("\n## Blockers\n\n");
    if blockers.is_empty() {
        summary.push_str("None.\n");
    } else {
        for blocker in blockers {
            summary.push_str(&format!(
                "- {}:{} ({})\n",
                blocker.file, blocker.line_range, blocker.description
            ));
        }
    }
    summary
}

const TEST_MARKERS: [&str; 6] = ["PASS", "FAIL", "✓", "✗", "Tests:", "Test Suites:"];

/// First 100 marker-matching output lines, or `None` when the output carries
/// no test markers at all.
fn extract_test_report(stdout: &str, stderr: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        if TEST_MARKERS.iter().any(|marker| line.contains(marker)) {
            lines.push(line);
            if lines.len() >= TEST_REPORT_MAX_LINES {
                break;
            }
        }
    }
    if lines.is_empty() {
        return None;
    }
    let mut report = String::from("# Test report\n\n");
    for line in lines {
        report.push_str(line);
        report.push('\n');
    }
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_args_include_tools_only_when_present() {
        let args = primary_args("do it", &[]);
        assert_eq!(args, vec!["-p", "do it", "--output-format", "json"]);

        let args = primary_args("do it", &["Edit".to_string(), "Bash".to_string()]);
        assert_eq!(args[4], "--allowedTools");
        assert_eq!(args[5], "Edit,Bash");
    }

    #[test]
    fn unknown_flag_pattern_matches_common_shapes() {
        for stderr in [
            "error: unknown option '--allowedTools'",
            "Unrecognized flag --output-format",
            "'--output-format' is not recognized",
            "invalid option: --allowedTools",
            "Invalid flag --output-format",
        ] {
            assert!(UNKNOWN_FLAG.is_match(stderr), "no match for {stderr:?}");
        }
        assert!(!UNKNOWN_FLAG.is_match("task failed: tests are red"));
    }

    #[test]
    fn allowed_tools_flag_naming_is_case_insensitive() {
        assert!(names_allowed_tools("unknown option --allowedTools"));
        assert!(names_allowed_tools("unknown option --ALLOWED-TOOLS"));
        assert!(names_allowed_tools("bad arg allowed_tools"));
        assert!(!names_allowed_tools("unknown option --output-format"));
    }

    #[test]
    fn parse_cli_output_reads_turns_and_cost() {
        let parsed = parse_cli_output(r#"{"turn_count": 3, "cost_usd": 0.42}"#);
        assert_eq!(parsed.turns_completed, 3);
        assert_eq!(parsed.cost_usd, Some(0.42));

        let parsed = parse_cli_output(r#"{"turns_completed": 2, "usage": {"cost": 0.1}}"#);
        assert_eq!(parsed.turns_completed, 2);
        assert_eq!(parsed.cost_usd, Some(0.1));
    }

    #[test]
    fn parse_cli_output_defaults_on_plain_text() {
        let parsed = parse_cli_output("did some work\nall done");
        assert!(parsed.value.is_none());
        assert_eq!(parsed.turns_completed, 1);
        assert_eq!(parsed.cost_usd, None);
    }

    #[test]
    fn parse_cli_output_ignores_non_object_json() {
        let parsed = parse_cli_output(r#"["not", "an", "object"]"#);
        assert!(parsed.value.is_none());
        assert_eq!(parsed.turns_completed, 1);
    }

    #[test]
    fn turn_request_elides_the_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let args = primary_args("secret goal text", &["Edit".to_string()]);
        write_turn_request(temp.path(), &args, false).expect("write");

        let raw = fs::read_to_string(temp.path().join("request.json")).expect("read");
        assert!(!raw.contains("secret goal text"));
        assert!(raw.contains(PROMPT_ELIDED));
        assert!(raw.contains("--allowedTools"));
        assert!(raw.contains("\"is_fallback\": false"));
    }

    #[test]
    fn final_status_maps_exits() {
        let done = AgentRun {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(final_status(&done).0, SessionStatus::Done);
        assert_eq!(final_status(&done).1, None);

        let failed = AgentRun {
            exit_code: Some(2),
            ..Default::default()
        };
        let (status, summary) = final_status(&failed);
        assert_eq!(status, SessionStatus::Failed);
        assert_eq!(summary.as_deref(), Some("Worker exited with code 2"));

        let timed_out = AgentRun {
            exit_code: Some(1),
            timed_out: true,
            ..Default::default()
        };
        let (status, summary) = final_status(&timed_out);
        assert_eq!(status, SessionStatus::Failed);
        assert_eq!(summary.as_deref(), Some("Worker timed out"));
    }

    #[test]
    fn test_report_collects_marker_lines_only() {
        let stdout = "setup\nPASS src/a.test.js\nnoise\nFAIL src/b.test.js\nTests: 2 total\n";
        let report = extract_test_report(stdout, "").expect("report");
        assert!(report.contains("PASS src/a.test.js"));
        assert!(report.contains("FAIL src/b.test.js"));
        assert!(report.contains("Tests: 2 total"));
        assert!(!report.contains("noise"));

        assert!(extract_test_report("no markers here", "").is_none());
    }

    #[test]
    fn test_report_caps_at_one_hundred_lines() {
        let stdout: String = (0..150).map(|i| format!("PASS test {i}\n")).collect();
        let report = extract_test_report(&stdout, "").expect("report");
        let matching = report.lines().filter(|l| l.starts_with("PASS")).count();
        assert_eq!(matching, TEST_REPORT_MAX_LINES);
    }
}
