//! Task submission validation and sanitization.
//!
//! The HTTP handler parses the body into a permissive JSON value; this
//! module inspects it field by field, collecting every violation rather than
//! stopping at the first, and emits either a sanitized task or the full
//! error list.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::io::paths::{self, PathDecision};

/// Hard cap on goal size in UTF-8 bytes.
pub const GOAL_MAX_BYTES: usize = 4096;
/// Default per-task turn budget when the caller omits it.
pub const TURNS_DEFAULT: u32 = 20;
/// Default per-task timeout when the caller omits it.
pub const TIMEOUT_DEFAULT_SECS: u64 = 600;

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Sanitized submission: canonical workspace root, clamped budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedTask {
    pub goal: String,
    pub workspace_root: PathBuf,
    pub allowed_tools: Vec<String>,
    pub turns_max: u32,
    pub timeout_seconds: u64,
}

/// Caps applied during sanitization (from process configuration).
#[derive(Debug, Clone, Copy)]
pub struct PolicyLimits {
    pub turns_cap: u32,
    pub timeout_cap_secs: u64,
}

/// Validate a submission body against policy.
///
/// All-or-nothing: any error rejects the submission, and every detected
/// error is reported.
pub fn validate_submission(
    body: &Value,
    limits: PolicyLimits,
    allowed_roots: &[PathBuf],
    deny_globs: &[String],
) -> Result<SanitizedTask, Vec<FieldError>> {
    let mut errors = Vec::new();

    let goal = match body.get("goal") {
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                errors.push(FieldError::new("goal", "must be non-empty"));
                None
            } else if trimmed.len() > GOAL_MAX_BYTES {
                errors.push(FieldError::new(
                    "goal",
                    format!("exceeds {GOAL_MAX_BYTES} bytes"),
                ));
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(_) => {
            errors.push(FieldError::new("goal", "must be a string"));
            None
        }
        None => {
            errors.push(FieldError::new("goal", "is required"));
            None
        }
    };

    let workspace_root = match body.get("workspace_root") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => {
            match paths::validate(Path::new(raw.trim()), allowed_roots, deny_globs) {
                PathDecision::Allowed(canonical) => Some(canonical),
                PathDecision::Denied(reason) => {
                    errors.push(FieldError::new("workspace_root", reason));
                    None
                }
            }
        }
        Some(Value::String(_)) => {
            errors.push(FieldError::new("workspace_root", "must be non-empty"));
            None
        }
        Some(_) => {
            errors.push(FieldError::new("workspace_root", "must be a string"));
            None
        }
        None => {
            errors.push(FieldError::new("workspace_root", "is required"));
            None
        }
    };

    let allowed_tools = match body.get("allowed_tools") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| entry.as_str())
            .map(str::to_string)
            .collect(),
        Some(_) => {
            errors.push(FieldError::new("allowed_tools", "must be an array"));
            Vec::new()
        }
    };

    let turns_max = match clamp_integer(body.get("turns_max"), TURNS_DEFAULT as i64, 1, limits.turns_cap as i64)
    {
        Ok(value) => value as u32,
        Err(message) => {
            errors.push(FieldError::new("turns_max", message));
            TURNS_DEFAULT
        }
    };

    let timeout_seconds = match clamp_integer(
        body.get("timeout_seconds"),
        TIMEOUT_DEFAULT_SECS as i64,
        1,
        limits.timeout_cap_secs as i64,
    ) {
        Ok(value) => value as u64,
        Err(message) => {
            errors.push(FieldError::new("timeout_seconds", message));
            TIMEOUT_DEFAULT_SECS
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(SanitizedTask {
        goal: goal.expect("goal validated"),
        workspace_root: workspace_root.expect("workspace validated"),
        allowed_tools,
        turns_max,
        timeout_seconds,
    })
}

/// Missing or non-positive values take the default; in-range values clamp to
/// `[min, cap]`.
fn clamp_integer(value: Option<&Value>, default: i64, min: i64, cap: i64) -> Result<i64, String> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(default.min(cap)),
        Some(Value::Number(number)) => number
            .as_i64()
            .ok_or_else(|| "must be an integer".to_string())?,
        Some(_) => return Err("must be an integer".to_string()),
    };
    if raw <= 0 {
        return Ok(default.min(cap));
    }
    Ok(raw.clamp(min, cap))
}
