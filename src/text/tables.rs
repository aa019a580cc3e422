//! GFM table detection in OCR markdown

use serde::Serialize;

/// A pipe table found in markdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkdownTable {
    /// Header cells
    pub headers: Vec<String>,
    /// Body rows (separator rows excluded)
    pub rows: Vec<Vec<String>>,
    /// The table's original markdown lines
    pub markdown: String,
}

impl MarkdownTable {
    /// Render the table as CSV, header row first.
    pub fn to_csv(&self) -> String {
        std::iter::once(&self.headers)
            .chain(self.rows.iter())
            .map(|row| {
                row.iter()
                    .map(|cell| csv_field(cell))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn csv_field(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn is_table_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let cells = split_cells(line);
    !cells.is_empty()
        && cells.iter().all(|c| {
            c.contains('-') && c.chars().all(|ch| matches!(ch, '-' | ':' | ' '))
        })
}

/// Split a table row on unescaped pipes, dropping the outer delimiters.
fn split_cells(line: &str) -> Vec<String> {
    let line = line.trim();
    let line = line.strip_prefix('|').unwrap_or(line);
    let line = line.strip_suffix('|').filter(|_| !line.ends_with("\\|")).unwrap_or(line);

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

/// Find every pipe table in `markdown`, in document order.
///
/// A table is a run of at least two lines starting with `|` whose second
/// line is a separator row such as `|---|:--:|`.
pub fn extract_markdown_tables(markdown: &str) -> Vec<MarkdownTable> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut tables = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !is_table_row(lines[i]) {
            i += 1;
            continue;
        }

        let start = i;
        while i < lines.len() && is_table_row(lines[i]) {
            i += 1;
        }
        let block = &lines[start..i];

        if block.len() < 2 || !is_separator_row(block[1]) {
            continue;
        }

        let headers = split_cells(block[0]);
        let rows = block[2..]
            .iter()
            .filter(|line| !is_separator_row(line))
            .map(|line| split_cells(line))
            .collect();

        tables.push(MarkdownTable {
            headers,
            rows,
            markdown: block.join("\n"),
        });
    }

    tables
}
