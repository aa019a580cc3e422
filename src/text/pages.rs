//! Page selection parsing
//!
//! Turns a human-authored selection such as `"1,5,10-15"` into a sorted,
//! de-duplicated set of 1-indexed page numbers.

use std::collections::BTreeSet;
use thiserror::Error;

/// Set of selected page numbers (1-indexed). Iterates in ascending order.
pub type PageSet = BTreeSet<u32>;

/// Largest page number accepted in a page specification
pub const MAX_PAGE_NUMBER: u32 = 1_000_000;

/// Validation errors for page specifications
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageSpecError {
    /// Zero or negative page number
    #[error("page numbers must be positive: '{token}'")]
    NotPositive { token: String },

    /// Range token that does not split into exactly `start-end`
    #[error("invalid page range format '{token}': expected start-end")]
    InvalidRangeFormat { token: String },

    /// Range whose start is after its end
    #[error("invalid page range: start must be <= end (got {start}-{end})")]
    InvertedRange { start: u32, end: u32 },

    /// Token that is not a base-10 integer
    #[error("invalid page number: '{token}'")]
    InvalidNumber { token: String },

    /// Page number above [`MAX_PAGE_NUMBER`]
    #[error("page number {page} exceeds the maximum of {max}")]
    PageTooLarge { page: u32, max: u32 },
}

/// Parse a page specification into a [`PageSet`].
///
/// Tokens are comma separated and trimmed. Each token is either a single
/// page (`"7"`) or an inclusive range (`"3-9"`). The whole specification
/// either parses or fails; there is no partial result.
pub fn parse_page_spec(spec: &str) -> Result<PageSet, PageSpecError> {
    let mut pages = PageSet::new();

    for token in spec.split(',') {
        let token = token.trim();

        if token.contains('-') {
            if token.starts_with('-') {
                return Err(PageSpecError::NotPositive {
                    token: token.to_string(),
                });
            }

            let parts: Vec<&str> = token.split('-').collect();
            if parts.len() != 2 {
                return Err(PageSpecError::InvalidRangeFormat {
                    token: token.to_string(),
                });
            }

            let start = parse_page_number(parts[0])?;
            let end = parse_page_number(parts[1])?;

            if start > end {
                return Err(PageSpecError::InvertedRange { start, end });
            }

            pages.extend(start..=end);
        } else {
            pages.insert(parse_page_number(token)?);
        }
    }

    Ok(pages)
}

fn parse_page_number(raw: &str) -> Result<u32, PageSpecError> {
    let raw = raw.trim();
    if raw.starts_with('+') {
        return Err(PageSpecError::InvalidNumber {
            token: raw.to_string(),
        });
    }

    let value: i64 = raw.parse().map_err(|_| PageSpecError::InvalidNumber {
        token: raw.to_string(),
    })?;

    if value < 1 {
        return Err(PageSpecError::NotPositive {
            token: raw.to_string(),
        });
    }

    if value > i64::from(MAX_PAGE_NUMBER) {
        return Err(PageSpecError::PageTooLarge {
            page: u32::try_from(value).unwrap_or(u32::MAX),
            max: MAX_PAGE_NUMBER,
        });
    }

    // Bounded by MAX_PAGE_NUMBER above
    Ok(value as u32)
}

/// Requested pages that do not exist in a document of `total_pages` pages,
/// in ascending order.
pub fn out_of_range(requested: &PageSet, total_pages: u32) -> Vec<u32> {
    requested
        .iter()
        .copied()
        .filter(|&page| page > total_pages)
        .collect()
}
