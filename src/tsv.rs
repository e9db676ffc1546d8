//! Reading and writing the tab-separated index files.
//!
//! The format is deliberately dumb: UTF-8, one header line, LF endings,
//! literal tabs between fields. Tabs, newlines and carriage returns inside a
//! field are backslash-escaped so a row is always exactly one line.

use anyhow::{Context, Result, ensure};

/// Escapes a single field for embedding in a TSV row.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`]. Unknown escape sequences are preserved verbatim.
pub fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Renders a header plus rows into a complete TSV document.
pub fn render(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    out.push_str(&header.join("\t"));
    out.push('\n');
    for row in rows {
        let escaped: Vec<String> = row.iter().map(|f| escape(f)).collect();
        out.push_str(&escaped.join("\t"));
        out.push('\n');
    }
    out
}

/// A parsed TSV document: the header fields and the unescaped data rows.
#[derive(Debug, Clone)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Index of a named column.
    pub fn column(&self, name: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("missing column `{name}`"))
    }
}

/// Parses a TSV document produced by [`render`].
///
/// # Errors
/// Errors when the document is empty or a data row has a different field
/// count than the header.
pub fn parse(content: &str) -> Result<Table> {
    let mut lines = content.lines();
    let header: Vec<String> = lines
        .next()
        .context("empty TSV document")?
        .split('\t')
        .map(str::to_owned)
        .collect();

    let mut rows = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        let row: Vec<String> = line.split('\t').map(unescape).collect();
        ensure!(
            row.len() == header.len(),
            "row {} has {} fields, header has {}",
            lineno + 2,
            row.len(),
            header.len()
        );
        rows.push(row);
    }

    Ok(Table { header, rows })
}
