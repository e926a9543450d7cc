//! Path resolution guard: symlink-safe canonicalization, allowed-root
//! containment, and deny-glob filtering.

use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};

/// Outcome of validating a path against roots and deny globs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    /// The canonical form of the validated path.
    Allowed(PathBuf),
    /// Human-readable denial reason.
    Denied(String),
}

impl PathDecision {
    pub fn allowed(&self) -> Option<&Path> {
        match self {
            PathDecision::Allowed(path) => Some(path),
            PathDecision::Denied(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PathDecision::Allowed(_) => None,
            PathDecision::Denied(reason) => Some(reason),
        }
    }
}

/// Validate `path` against `roots` and `deny_globs`.
///
/// The path is canonicalized leniently (see [`resolve_lenient`]), must land
/// under the canonical form of at least one root, and its root-relative form
/// must match no deny glob. Deny globs use conventional `**`/`*`/`?`
/// semantics against forward-slash separators, dot-files included.
pub fn validate(path: &Path, roots: &[PathBuf], deny_globs: &[String]) -> PathDecision {
    if path.as_os_str().is_empty() {
        return PathDecision::Denied("empty path".to_string());
    }
    if path.as_os_str().as_encoded_bytes().contains(&0) {
        return PathDecision::Denied("path contains a NUL byte".to_string());
    }

    let resolved = match resolve_lenient(path) {
        Ok(resolved) => resolved,
        Err(reason) => return PathDecision::Denied(reason),
    };

    let Some(root) = containing_root(&resolved, roots) else {
        return PathDecision::Denied(format!(
            "{} is not under any allowed root",
            resolved.display()
        ));
    };

    let relative = resolved
        .strip_prefix(&root)
        .unwrap_or(&resolved)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    for raw in deny_globs {
        let Ok(pattern) = Pattern::new(raw) else {
            continue;
        };
        if pattern.matches_with(&relative, options) {
            return PathDecision::Denied(format!("path matches deny pattern {raw}"));
        }
    }

    PathDecision::Allowed(resolved)
}

/// Canonicalize a path that may not exist yet.
///
/// An existing path canonicalizes directly (following symlinks). Otherwise
/// the nearest existing ancestor is canonicalized and the unresolved suffix
/// is rejoined, so a symlink escape anywhere in the existing prefix is still
/// caught. Parent-dir components in the unresolved suffix are rejected: they
/// could step back out of the canonicalized prefix.
pub fn resolve_lenient(path: &Path) -> Result<PathBuf, String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(err) => return Err(format!("cannot resolve relative path: {err}")),
        }
    };

    if let Ok(canonical) = absolute.canonicalize() {
        return Ok(canonical);
    }

    let mut ancestor = absolute.as_path();
    let mut suffix = Vec::new();
    loop {
        let Some(parent) = ancestor.parent() else {
            return Err(format!("no existing ancestor for {}", absolute.display()));
        };
        if let Some(name) = ancestor.file_name() {
            suffix.push(name.to_os_string());
        } else {
            return Err(format!("unresolvable path {}", absolute.display()));
        }
        ancestor = parent;
        if ancestor.exists() {
            break;
        }
    }

    let canonical_ancestor = ancestor
        .canonicalize()
        .map_err(|err| format!("canonicalize {}: {err}", ancestor.display()))?;

    let mut resolved = canonical_ancestor;
    for part in suffix.iter().rev() {
        let component = Path::new(part)
            .components()
            .next()
            .ok_or_else(|| format!("unresolvable component in {}", absolute.display()))?;
        match component {
            Component::Normal(name) => resolved.push(name),
            Component::CurDir => {}
            _ => {
                return Err(format!(
                    "refusing parent-dir traversal through nonexistent path {}",
                    absolute.display()
                ));
            }
        }
    }
    Ok(resolved)
}

/// Return the canonical root containing `target`, if any.
///
/// Containment is component-wise: `/a/b` is under `/a` but `/a/bc` is not
/// under `/a/b`.
fn containing_root(target: &Path, roots: &[PathBuf]) -> Option<PathBuf> {
    for root in roots {
        let canonical = match resolve_lenient(root) {
            Ok(canonical) => canonical,
            Err(_) => continue,
        };
        if target == canonical || target.starts_with(&canonical) {
            return Some(canonical);
        }
    }
    None
}
