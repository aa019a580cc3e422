//! Markdown to plain text conversion
//!
//! Steps run in a fixed order: images are removed before links are
//! unwrapped, otherwise `![alt](src)` would leave a stray `!alt` behind.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[.*?\]\(.*?\)").unwrap());

static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(.*?)\]\(.*?\)").unwrap());

static RE_MARKERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[#*_`~]").unwrap());

static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Strip markdown syntax down to plain text.
///
/// Marker characters (`#`, `*`, `_`, backtick, `~`) are removed wherever
/// they occur, including inside prose. Link text is matched up to the first
/// `]`, so bracketed link text is not supported.
pub fn markdown_to_plain_text(markdown: &str) -> String {
    let text = RE_IMAGE.replace_all(markdown, "");
    let text = RE_LINK.replace_all(&text, "$1");
    let text = RE_MARKERS.replace_all(&text, "");
    let text = RE_BLANK_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}
