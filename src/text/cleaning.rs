//! Repeated-line removal for OCR markdown
//!
//! Running headers, footers and bylines show up once per page in OCR output.
//! Any trimmed line that occurs at least [`REPETITION_THRESHOLD`] times is
//! dropped everywhere, unless it matches one of [`PROTECTED_PATTERNS`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Minimum number of occurrences for a line to count as boilerplate
pub const REPETITION_THRESHOLD: usize = 3;

/// Label reported alongside cleaned output
pub const CLEANING_METHOD: &str = "frequency_based_line_removal";

/// A named shape that exempts a line from removal
pub struct ProtectedPattern {
    pub name: &'static str,
    pub regex: Regex,
}

impl ProtectedPattern {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("protected pattern must compile"),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Protected line shapes, checked in order against the trimmed line.
pub static PROTECTED_PATTERNS: Lazy<Vec<ProtectedPattern>> = Lazy::new(|| {
    vec![
        ProtectedPattern::new("page_marker", r"(?i)^page\s+[0-9]+"),
        ProtectedPattern::new("footnote_marker", r"^\[[0-9]+\]"),
        ProtectedPattern::new("doi_reference", r"(?i)doi:"),
        ProtectedPattern::new("bare_page_number", r"^[0-9]+$"),
    ]
});

/// Name of the first protected pattern matching `line`, if any.
pub fn protected_by(line: &str) -> Option<&'static str> {
    PROTECTED_PATTERNS
        .iter()
        .find(|p| p.matches(line))
        .map(|p| p.name)
}

/// Result of a cleaning pass with bookkeeping for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleaningOutcome {
    pub text: String,
    pub method: &'static str,
    /// Lines in the input, counting empty ones
    pub original_lines: usize,
    pub lines_removed: usize,
}

/// Remove repeated boilerplate lines from `document`.
///
/// Line identity is the trimmed content, compared case-sensitively. Empty
/// lines are never counted and never removed. Returns the cleaned text and
/// [`CLEANING_METHOD`].
pub fn clean_repetitions(document: &str) -> (String, &'static str) {
    let outcome = clean_repetitions_with_stats(document);
    (outcome.text, outcome.method)
}

/// Same as [`clean_repetitions`], also reporting how many lines were dropped.
pub fn clean_repetitions_with_stats(document: &str) -> CleaningOutcome {
    let lines: Vec<&str> = document.split('\n').collect();
    let original_lines = lines.len();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for line in &lines {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            *counts.entry(trimmed).or_insert(0) += 1;
        }
    }

    let repetitive: HashSet<&str> = counts
        .into_iter()
        .filter(|&(line, count)| count >= REPETITION_THRESHOLD && protected_by(line).is_none())
        .map(|(line, _)| line)
        .collect();

    if repetitive.is_empty() {
        return CleaningOutcome {
            text: document.to_string(),
            method: CLEANING_METHOD,
            original_lines,
            lines_removed: 0,
        };
    }

    let kept: Vec<&str> = lines
        .into_iter()
        .filter(|line| !repetitive.contains(line.trim()))
        .collect();

    CleaningOutcome {
        lines_removed: original_lines - kept.len(),
        text: kept.join("\n"),
        method: CLEANING_METHOD,
        original_lines,
    }
}
