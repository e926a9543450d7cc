//! Artifact indexing: size and SHA-256 listing of produced files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::core::types::ArtifactEntry;

/// Index the regular files directly under `dir`.
///
/// Subdirectories and symlinks are skipped; a missing directory yields an
/// empty list. Entries are sorted by name for stable output.
pub fn index_artifacts(dir: &Path) -> Result<Vec<ArtifactEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        let path = entry.path();

        // symlink_metadata so a link to a regular file is still skipped.
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?;
        if !metadata.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        entries.push(ArtifactEntry {
            name: name.to_string(),
            sha256: file_sha256(&path)?,
            bytes: metadata.len(),
            path,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_yields_empty_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = index_artifacts(&temp.path().join("absent")).expect("index");
        assert!(entries.is_empty());
    }

    #[test]
    fn indexes_regular_files_with_hash_and_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("b.txt"), "bbbb").expect("write");
        fs::write(temp.path().join("a.txt"), "aa").expect("write");

        let entries = index_artifacts(temp.path()).expect("index");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].bytes, 2);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].bytes, 4);
        assert_eq!(entries[0].sha256.len(), 64);
        assert_ne!(entries[0].sha256, entries[1].sha256);
    }

    #[test]
    fn subdirectories_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("nested")).expect("mkdir");
        fs::write(temp.path().join("nested").join("deep.txt"), "x").expect("write");
        fs::write(temp.path().join("top.txt"), "y").expect("write");

        let entries = index_artifacts(temp.path()).expect("index");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "top.txt");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let real = temp.path().join("real.txt");
        fs::write(&real, "x").expect("write");
        std::os::unix::fs::symlink(&real, temp.path().join("link.txt")).expect("symlink");

        let entries = index_artifacts(temp.path()).expect("index");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "real.txt");
    }
}
