//! Pure text utilities
//!
//! Page selection parsing, repeated-line cleanup, markdown to plain text
//! conversion and table detection. Nothing here performs I/O.

pub mod cleaning;
pub mod convert;
pub mod pages;
pub mod tables;

pub use cleaning::{
    clean_repetitions, clean_repetitions_with_stats, protected_by, CleaningOutcome,
    CLEANING_METHOD, PROTECTED_PATTERNS,
};
pub use convert::markdown_to_plain_text;
pub use pages::{out_of_range, parse_page_spec, PageSet, PageSpecError};
pub use tables::{extract_markdown_tables, MarkdownTable};
