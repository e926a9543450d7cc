//! Gateway configuration loaded once from flat environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

const ENV_PREFIX: &str = "AGENTFW_";

pub const DEFAULT_DENY_GLOBS: &str = "**/.env,**/.ssh/**,**/credentials*,**/*.pem,**/*.key";

/// Process-wide configuration.
///
/// Initialized once at startup and immutable thereafter. `bridge_token` and
/// `allowed_roots` have no defaults and must be present in the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Shared secret for Bearer auth.
    pub bridge_token: String,
    /// Absolute paths a workspace root must canonicalize under.
    pub allowed_roots: Vec<PathBuf>,
    /// TCP port to listen on.
    pub port: u16,
    /// Interface to bind.
    pub bind: String,
    /// Session storage root.
    pub data_dir: PathBuf,
    /// Path patterns always rejected by the path guard.
    pub deny_globs: Vec<String>,
    /// Optional operator-supplied prompt suffix.
    pub prompt_append: Option<String>,
    /// Accepted but unused beyond 1 in v0.1.
    pub max_concurrent: u32,
    /// Upper bound on per-task turns.
    pub turns_cap: u32,
    /// Upper bound on per-task timeout in seconds.
    pub timeout_cap_secs: u64,
    /// Cap on `/logtail?n=`.
    pub logtail_max_lines: usize,
    /// Cap on `/excerpt` content size in chars.
    pub excerpt_max_chars: usize,
    /// Agent executable name, looked up on PATH.
    pub agent_bin: String,
    /// Grace between SIGTERM and SIGKILL on timeout.
    pub kill_grace_secs: u64,
    /// Per-stream capture bound for agent output.
    pub output_limit_bytes: usize,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Load configuration from a flat key/value map (testable entry point).
    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(&format!("{ENV_PREFIX}{key}")).map(String::as_str);

        let bridge_token = get("BRIDGE_TOKEN")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("{ENV_PREFIX}BRIDGE_TOKEN is required"))?
            .to_string();

        let allowed_roots = parse_roots(
            get("ALLOWED_ROOTS")
                .ok_or_else(|| anyhow!("{ENV_PREFIX}ALLOWED_ROOTS is required"))?,
        )?;

        let cfg = Self {
            bridge_token,
            allowed_roots,
            port: parse_or("PORT", get("PORT"), 8787)?,
            bind: get("BIND").unwrap_or("127.0.0.1").to_string(),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or("./data/sessions")),
            deny_globs: parse_globs(get("DENY_GLOBS").unwrap_or(DEFAULT_DENY_GLOBS)),
            prompt_append: get("PROMPT_APPEND")
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            max_concurrent: parse_or("MAX_CONCURRENT", get("MAX_CONCURRENT"), 1)?,
            turns_cap: parse_or("TURNS_CAP", get("TURNS_CAP"), 50)?,
            timeout_cap_secs: parse_or("TIMEOUT_CAP_SECS", get("TIMEOUT_CAP_SECS"), 1800)?,
            logtail_max_lines: parse_or("LOGTAIL_MAX_LINES", get("LOGTAIL_MAX_LINES"), 200)?,
            excerpt_max_chars: parse_or("EXCERPT_MAX_CHARS", get("EXCERPT_MAX_CHARS"), 20_000)?,
            agent_bin: get("AGENT_BIN").unwrap_or("claude").to_string(),
            kill_grace_secs: parse_or("KILL_GRACE_SECS", get("KILL_GRACE_SECS"), 5)?,
            output_limit_bytes: parse_or("OUTPUT_LIMIT_BYTES", get("OUTPUT_LIMIT_BYTES"), 10_000_000)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port must be in 1-65535"));
        }
        if self.allowed_roots.is_empty() {
            return Err(anyhow!("allowed_roots must name at least one directory"));
        }
        for root in &self.allowed_roots {
            if !root.is_absolute() {
                return Err(anyhow!("allowed root {} is not absolute", root.display()));
            }
        }
        if self.turns_cap == 0 {
            return Err(anyhow!("turns_cap must be > 0"));
        }
        if self.timeout_cap_secs == 0 {
            return Err(anyhow!("timeout_cap_secs must be > 0"));
        }
        if self.logtail_max_lines == 0 {
            return Err(anyhow!("logtail_max_lines must be > 0"));
        }
        if self.excerpt_max_chars == 0 {
            return Err(anyhow!("excerpt_max_chars must be > 0"));
        }
        if self.agent_bin.trim().is_empty() {
            return Err(anyhow!("agent_bin must be non-empty"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

fn parse_roots(raw: &str) -> Result<Vec<PathBuf>> {
    let roots: Vec<PathBuf> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if roots.is_empty() {
        return Err(anyhow!("{ENV_PREFIX}ALLOWED_ROOTS must name at least one path"));
    }
    Ok(roots)
}

fn parse_globs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(key: &str, value: Option<&str>, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("parse {ENV_PREFIX}{key}={raw}")),
    }
}
