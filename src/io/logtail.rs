//! Bounded-suffix log tail reader.
//!
//! Tail requests must not load arbitrarily large logs into memory: a suffix
//! of roughly `n * 512` bytes is read and the first possibly-partial line is
//! discarded when the read starts mid-file. For unusually long lines this
//! returns fewer than `n` lines rather than growing the buffer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

/// Bytes of suffix read per requested line.
const BYTES_PER_LINE: u64 = 512;

/// Return up to the last `n` lines of the file, oldest first.
///
/// `grep` filters to lines containing the literal substring before the count
/// cut. A missing file yields an empty list.
pub fn tail_lines(path: &Path, n: usize, grep: Option<&str>) -> Result<Vec<String>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let budget = (n as u64).saturating_mul(BYTES_PER_LINE);
    let offset = len.saturating_sub(budget);
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seek {}", path.display()))?;

    let mut buf = Vec::with_capacity(budget.min(len) as usize);
    file.read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<&str> = text.lines().collect();
    if offset > 0 && !lines.is_empty() {
        // Reading started mid-file; the first line is likely partial.
        lines.remove(0);
    }

    let filtered: Vec<String> = lines
        .into_iter()
        .filter(|line| grep.is_none_or(|needle| line.contains(needle)))
        .map(str::to_string)
        .collect();

    let skip = filtered.len().saturating_sub(n);
    Ok(filtered.into_iter().skip(skip).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_yields_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lines = tail_lines(&temp.path().join("absent.log"), 10, None).expect("tail");
        assert!(lines.is_empty());
    }

    #[test]
    fn returns_last_n_lines_oldest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let contents: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, contents).expect("write");

        let lines = tail_lines(&path, 3, None).expect("tail");
        assert_eq!(lines, vec!["line 8", "line 9", "line 10"]);
    }

    #[test]
    fn short_file_returns_all_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        fs::write(&path, "a\nb\n").expect("write");

        let lines = tail_lines(&path, 50, None).expect("tail");
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn partial_first_line_is_discarded_when_reading_mid_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        // 2000 lines of 10+ bytes each guarantees the 2-line budget starts
        // mid-file.
        let contents: String = (1..=2000).map(|i| format!("entry {i:06}\n")).collect();
        fs::write(&path, contents).expect("write");

        let lines = tail_lines(&path, 2, None).expect("tail");
        assert_eq!(lines, vec!["entry 001999", "entry 002000"]);
    }

    #[test]
    fn grep_filters_before_the_count_cut() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        fs::write(&path, "keep 1\nskip\nkeep 2\nskip\nkeep 3\n").expect("write");

        let lines = tail_lines(&path, 2, Some("keep")).expect("tail");
        assert_eq!(lines, vec!["keep 2", "keep 3"]);
    }

    #[test]
    fn oversized_lines_return_fewer_than_n() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let long = "x".repeat(4000);
        fs::write(&path, format!("{long}\n{long}\n{long}\n")).expect("write");

        // Budget for 2 lines is 1024 bytes; a 4000-byte line cannot fit two.
        let lines = tail_lines(&path, 2, None).expect("tail");
        assert!(lines.len() < 2);
    }
}
