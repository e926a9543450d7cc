//! Extraction of `file:line` references from agent output.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Blocker;

/// At most this many blockers are reported per session.
pub const MAX_BLOCKERS: usize = 10;

// A filename must carry an extension; the line may be a single number or a
// `start-end` range.
static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_][A-Za-z0-9_./-]*\.[A-Za-z][A-Za-z0-9]*):([0-9]+(?:-[0-9]+)?)")
        .expect("file:line pattern")
});

/// Scan text for `file.ext:NN` / `file.ext:NN-MM` references.
///
/// Each unique `file:range` key yields one blocker whose description is the
/// full containing line; duplicates keep their first occurrence. Output is
/// capped at [`MAX_BLOCKERS`] in first-occurrence order.
pub fn extract_blockers(text: &str) -> Vec<Blocker> {
    let mut seen = HashSet::new();
    let mut blockers = Vec::new();

    for line in text.lines() {
        for caps in FILE_LINE.captures_iter(line) {
            let file = caps[1].to_string();
            let line_range = caps[2].to_string();
            let key = format!("{file}:{line_range}");
            if !seen.insert(key) {
                continue;
            }
            blockers.push(Blocker {
                description: line.trim().to_string(),
                file,
                line_range,
            });
            if blockers.len() >= MAX_BLOCKERS {
                return blockers;
            }
        }
    }

    blockers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_reference_with_containing_line() {
        let blockers = extract_blockers("TODO left in src/main.rs:42 needs a fix");
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].file, "src/main.rs");
        assert_eq!(blockers[0].line_range, "42");
        assert_eq!(blockers[0].description, "TODO left in src/main.rs:42 needs a fix");
    }

    #[test]
    fn extracts_line_ranges() {
        let blockers = extract_blockers("failing assertions in tests/api.rs:10-25");
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].line_range, "10-25");
    }

    #[test]
    fn requires_an_extension() {
        assert!(extract_blockers("Makefile:3 is not a match").is_empty());
        assert!(extract_blockers("listening on localhost:8080").is_empty());
    }

    #[test]
    fn deduplicates_on_file_and_range() {
        let text = "a.rs:1 first mention\nagain a.rs:1 later\na.rs:2 other line";
        let blockers = extract_blockers(text);
        assert_eq!(blockers.len(), 2);
        assert_eq!(blockers[0].description, "a.rs:1 first mention");
        assert_eq!(blockers[1].line_range, "2");
    }

    #[test]
    fn caps_at_ten_in_first_occurrence_order() {
        let text: String = (1..=15).map(|i| format!("f{i}.rs:{i} broken\n")).collect();
        let blockers = extract_blockers(&text);
        assert_eq!(blockers.len(), MAX_BLOCKERS);
        assert_eq!(blockers[0].file, "f1.rs");
        assert_eq!(blockers[9].file, "f10.rs");
    }

    #[test]
    fn multiple_references_on_one_line() {
        let blockers = extract_blockers("compare a.rs:1 with b.rs:2");
        assert_eq!(blockers.len(), 2);
        assert_eq!(blockers[0].file, "a.rs");
        assert_eq!(blockers[1].file, "b.rs");
    }
}
