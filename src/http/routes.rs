//! HTTP route handlers for the gateway API.

use std::fs;
use std::path::Path as FsPath;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::core::policy::{self, PolicyLimits};
use crate::core::redact::redact;
use crate::core::types::{SessionStatus, StatePatch, TaskSpec};
use crate::http::auth;
use crate::http::error::ApiError;
use crate::http::reply::RedactedJson;
use crate::http::state::{AppState, generate_session_id};
use crate::io::{logtail, paths};
use crate::supervisor::SessionRun;

/// Build the API router with Bearer auth on every route.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks", post(submit_task))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/{id}/state", get(get_state))
        .route("/v1/sessions/{id}/abort", post(abort_session))
        .route("/v1/sessions/{id}/excerpt", get(get_excerpt))
        .route("/v1/sessions/{id}/artifacts", get(list_artifacts))
        .route("/v1/sessions/{id}/artifacts/{name}", get(download_artifact))
        .route("/v1/sessions/{id}/logtail", get(get_logtail))
        .route("/v1/health", get(health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /v1/tasks - validate, acquire the gate, persist, spawn the
/// supervisor, answer 202.
async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|err| ApiError::invalid_field("body", err.to_string()))?;

    let limits = PolicyLimits {
        turns_cap: state.config.turns_cap,
        timeout_cap_secs: state.config.timeout_cap_secs,
    };
    let task = policy::validate_submission(
        &body,
        limits,
        &state.config.allowed_roots,
        &state.config.deny_globs,
    )
    .map_err(ApiError::InvalidInput)?;

    let prompt = state
        .prompts
        .build(
            &task.goal,
            &task.workspace_root.display().to_string(),
            &task.allowed_tools,
        )
        .map_err(|err| ApiError::invalid_field("goal", err.to_string()))?;

    let session_id = generate_session_id();
    if !state.gate.acquire(&task.workspace_root, &session_id) {
        return Err(ApiError::Busy {
            active_session: state.gate.active_session_id(),
        });
    }

    let record = TaskSpec {
        session_id: session_id.clone(),
        goal: task.goal.clone(),
        workspace_root: task.workspace_root.clone(),
        allowed_tools: task.allowed_tools.clone(),
        turns_max: task.turns_max,
        timeout_seconds: task.timeout_seconds,
        created_at: Utc::now(),
        template_digest: state.prompts.digest().to_string(),
    };
    if let Err(err) = state.store.create(&session_id, &record) {
        state.gate.release(&task.workspace_root, &session_id);
        return Err(ApiError::Internal(err));
    }

    let cancel = state.register_cancel_flag(&session_id);
    let run = SessionRun {
        session_id: session_id.clone(),
        goal: task.goal,
        prompt,
        workspace_root: task.workspace_root.clone(),
        allowed_tools: task.allowed_tools,
        timeout: Duration::from_secs(task.timeout_seconds),
        cancel,
    };

    let supervisor = state.supervisor.clone();
    let app = state.clone();
    let workspace_root = task.workspace_root;
    let spawned_id = session_id.clone();
    tokio::spawn(async move {
        let worker = supervisor.clone();
        let joined = tokio::task::spawn_blocking(move || worker.run_session(&run)).await;
        if joined.is_err() {
            // A panic inside the engine must not wedge the slot forever.
            warn!(session_id = %spawned_id, "supervisor task panicked");
            supervisor.gate.release(&workspace_root, &spawned_id);
            let patch = StatePatch {
                status: Some(SessionStatus::Failed),
                error_summary: Some("Internal supervisor failure".to_string()),
                ..Default::default()
            };
            let _ = supervisor.store.update_state(&spawned_id, &patch);
        }
        app.remove_cancel_flag(&spawned_id);
    });

    Ok((
        StatusCode::ACCEPTED,
        RedactedJson(json!({"session_id": session_id})),
    ))
}

/// GET /v1/sessions - summaries of every stored session.
async fn list_sessions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.store.list_sessions()?;
    Ok(RedactedJson(sessions))
}

/// GET /v1/sessions/:id/state - the full live state record.
async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let shared = lookup_state(&state, &id)?;
    Ok(RedactedJson(shared))
}

/// POST /v1/sessions/:id/abort - advisory cancellation.
///
/// Marks the session aborted immediately and flips the supervisor's cancel
/// flag; the gate stays held until the child actually exits.
async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let shared = lookup_state(&state, &id)?;
    if shared.status != SessionStatus::Running {
        return Err(ApiError::Conflict {
            status: shared.status,
        });
    }

    if let Some(flag) = state.cancel_flag(&id) {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    let patch = StatePatch {
        status: Some(SessionStatus::Aborted),
        error_summary: Some("Aborted by client request".to_string()),
        ..Default::default()
    };
    state.store.update_state(&id, &patch)?;
    Ok(RedactedJson(json!({"status": "aborted"})))
}

#[derive(Debug, Deserialize)]
struct ExcerptQuery {
    path: Option<String>,
    line_start: Option<usize>,
    start: Option<usize>,
    line_end: Option<usize>,
    end: Option<usize>,
    max_chars: Option<usize>,
}

/// GET /v1/sessions/:id/excerpt - redacted file excerpt scoped to the
/// session's own workspace root (never the global allowed roots).
async fn get_excerpt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExcerptQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.session_dir(&id).is_err() {
        return Err(ApiError::NotFound);
    }
    let task = state.store.get_task(&id)?.ok_or(ApiError::NotFound)?;

    let raw_path = query
        .path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::invalid_field("path", "is required"))?;

    let workspace_roots = vec![task.workspace_root.clone()];
    let resolved = match paths::validate(
        FsPath::new(raw_path),
        &workspace_roots,
        &state.config.deny_globs,
    ) {
        paths::PathDecision::Allowed(resolved) => resolved,
        paths::PathDecision::Denied(reason) => return Err(ApiError::PathDenied(reason)),
    };

    if !resolved.is_file() {
        return Err(ApiError::NotFound);
    }
    let bytes = fs::read(&resolved)
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err).context("read excerpt file")))?;
    let contents = String::from_utf8_lossy(&bytes);

    let line_start = query.line_start.or(query.start).unwrap_or(1).max(1);
    let line_end = query.line_end.or(query.end).unwrap_or(usize::MAX).max(line_start);
    let selected: Vec<&str> = contents
        .lines()
        .skip(line_start - 1)
        .take(line_end - line_start + 1)
        .collect();
    let actual_end = line_start + selected.len().saturating_sub(1);

    let cap = query
        .max_chars
        .unwrap_or(state.config.excerpt_max_chars)
        .min(state.config.excerpt_max_chars);
    let mut content = selected.join("\n");
    if content.chars().count() > cap {
        content = content.chars().take(cap).collect();
    }

    Ok(RedactedJson(json!({
        "path": resolved,
        "line_start": line_start,
        "line_end": actual_end,
        "content": redact(&content),
    })))
}

/// GET /v1/sessions/:id/artifacts - the indexed artifact list.
async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let shared = lookup_state(&state, &id)?;
    Ok(RedactedJson(json!({"artifacts": shared.artifacts})))
}

/// GET /v1/sessions/:id/artifacts/:name - stream one artifact.
///
/// The name must appear verbatim in the current state index and resolve to a
/// regular file under the workspace's artifacts directory.
async fn download_artifact(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let shared = lookup_state(&state, &id)?;
    if !shared.artifacts.iter().any(|entry| entry.name == name) {
        return Err(ApiError::NotFound);
    }

    let resolved = state
        .store
        .artifact_path(&id, &name, None)?
        .ok_or(ApiError::NotFound)?;
    let bytes = fs::read(&resolved)
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err).context("read artifact")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct LogtailQuery {
    stream: Option<String>,
    n: Option<usize>,
    grep: Option<String>,
}

/// GET /v1/sessions/:id/logtail - redacted tail of the newest turn's log.
async fn get_logtail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogtailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = query.stream.as_deref().unwrap_or("stdout");
    if stream != "stdout" && stream != "stderr" {
        return Err(ApiError::invalid_field(
            "stream",
            "must be stdout or stderr",
        ));
    }
    lookup_state(&state, &id)?;

    let n = query
        .n
        .unwrap_or(50)
        .clamp(1, state.config.logtail_max_lines);

    let turns_dir = state.store.session_dir(&id)?.join("turns");
    let lines = match latest_turn_dir(&turns_dir) {
        Some(turn_dir) => {
            let log_path = turn_dir.join(format!("{stream}.log"));
            logtail::tail_lines(&log_path, n, query.grep.as_deref())?
                .iter()
                .map(|line| redact(line))
                .collect()
        }
        None => Vec::new(),
    };

    Ok(RedactedJson(json!({
        "lines": lines,
        "stream": stream,
        "n": n,
    })))
}

/// GET /v1/health - liveness plus the current gate holder.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    RedactedJson(json!({
        "status": "ok",
        "active_session": state.gate.active_session_id(),
    }))
}

fn lookup_state(
    state: &AppState,
    id: &str,
) -> Result<crate::core::types::SharedState, ApiError> {
    // A malformed id is indistinguishable from an unknown session.
    if state.store.session_dir(id).is_err() {
        return Err(ApiError::NotFound);
    }
    match state.store.get_state(id)? {
        Some(shared) => Ok(shared),
        None => Err(ApiError::NotFound),
    }
}

/// Highest-numbered `turns/NNNN` directory, if any.
fn latest_turn_dir(turns_dir: &FsPath) -> Option<std::path::PathBuf> {
    let entries = fs::read_dir(turns_dir).ok()?;
    entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
        })
        .max_by_key(|entry| entry.file_name())
        .map(|entry| entry.path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_turn_dir_picks_highest_index() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["0001", "0002", "0010", "notes"] {
            fs::create_dir_all(temp.path().join(name)).expect("mkdir");
        }
        let latest = latest_turn_dir(temp.path()).expect("latest");
        assert!(latest.ends_with("0010"));
    }

    #[test]
    fn latest_turn_dir_handles_missing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(latest_turn_dir(&temp.path().join("absent")).is_none());
    }
}
