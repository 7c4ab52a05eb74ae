//! Docs structured-content renderer.
//!
//! Turns a Docs API `documents.get` response into plain text: body first,
//! then footnotes, then headers and footers, joined by blank lines and run
//! through [`clean_text`].
//!
//! - Paragraphs render as their concatenated text runs followed by a blank
//!   line. Empty paragraphs render as nothing.
//! - Tables are flattened row by row, cell by cell.
//! - Tables of contents are skipped.
//! - Footnotes, headers and footers render in id order.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A `documents.get` response, reduced to the fields the renderer reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocsDocument {
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<Body>,
    #[serde(default)]
    pub footnotes: BTreeMap<String, Section>,
    #[serde(default)]
    pub headers: BTreeMap<String, Section>,
    #[serde(default)]
    pub footers: BTreeMap<String, Section>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub content: Vec<StructuralElement>,
}

/// Footnote, header, or footer content.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub content: Vec<StructuralElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralElement {
    #[serde(default)]
    pub paragraph: Option<Paragraph>,
    #[serde(default)]
    pub table: Option<Table>,
    #[serde(default)]
    pub table_of_contents: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub elements: Vec<ParagraphElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphElement {
    #[serde(default)]
    pub text_run: Option<TextRun>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextRun {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub table_rows: Vec<TableRow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    #[serde(default)]
    pub table_cells: Vec<TableCell>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableCell {
    #[serde(default)]
    pub content: Vec<StructuralElement>,
}

/// Render one structural element.
pub fn extract_text(element: &StructuralElement) -> String {
    if element.table_of_contents.is_some() {
        return String::new();
    }
    if let Some(paragraph) = &element.paragraph {
        let text: String = paragraph
            .elements
            .iter()
            .filter_map(|e| e.text_run.as_ref())
            .map(|run| run.content.as_str())
            .collect();
        let text = text.trim_end_matches('\n');
        if text.trim().is_empty() {
            return String::new();
        }
        return format!("{text}\n\n");
    }
    if let Some(table) = &element.table {
        return table
            .table_rows
            .iter()
            .flat_map(|row| row.table_cells.iter())
            .flat_map(|cell| cell.content.iter())
            .map(extract_text)
            .collect();
    }
    String::new()
}

fn render_content(content: &[StructuralElement]) -> String {
    content.iter().map(extract_text).collect()
}

/// All footnotes, in footnote-id order.
pub fn footnotes(doc: &DocsDocument) -> String {
    doc.footnotes
        .values()
        .map(|s| render_content(&s.content))
        .collect()
}

/// All headers, then all footers, each in id order.
pub fn headers_and_footers(doc: &DocsDocument) -> String {
    doc.headers
        .values()
        .chain(doc.footers.values())
        .map(|s| render_content(&s.content))
        .collect()
}

/// Full cleaned text of a document.
pub fn render(doc: &DocsDocument) -> String {
    let body = doc
        .body
        .as_ref()
        .map(|b| render_content(&b.content))
        .unwrap_or_default();
    clean_text(&format!(
        "{}\n\n{}\n\n{}",
        body,
        footnotes(doc),
        headers_and_footers(doc)
    ))
}

/// Normalize whitespace and strip rendering artifacts.
///
/// Vertical tabs become newlines, zero-width characters are removed,
/// non-breaking spaces become spaces, runs of spaces and tabs collapse to
/// one space, lines lose trailing whitespace, three or more newlines
/// collapse to a blank line, and the result is trimmed.
pub fn clean_text(raw: &str) -> String {
    let normalized: String = raw
        .chars()
        .filter_map(|c| match c {
            '\u{000B}' | '\r' => Some('\n'),
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => None,
            '\u{00A0}' | '\u{202F}' => Some(' '),
            other => Some(other),
        })
        .collect();

    let mut out = String::with_capacity(normalized.len());
    let mut newlines = 0usize;
    for line in normalized.split('\n') {
        let line = collapse_blanks(line);
        let line = line.trim_end();
        if line.is_empty() {
            newlines += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if newlines >= 2 { "\n\n" } else { "\n" });
        }
        out.push_str(line);
        newlines = 1;
    }
    out.trim().to_string()
}

fn collapse_blanks(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_blank = false;
    for c in line.chars() {
        if c == ' ' || c == '\t' {
            if !in_blank {
                out.push(' ');
            }
            in_blank = true;
        } else {
            out.push(c);
            in_blank = false;
        }
    }
    out
}
