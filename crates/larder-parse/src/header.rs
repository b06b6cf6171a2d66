//! Locating the registration header of an artifact.

use larder_types::{Dialect, RecipeError, Result};
use regex::Regex;

use crate::compiler::CompileOptions;

/// Where the header sits in an artifact and what it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSpan {
    /// Byte offset where the header begins (the opening marker or annotation line).
    pub start: usize,
    /// Byte offset just past the header (the closing marker, or the payload line).
    pub end: usize,
    /// Byte offset where the payload begins. Always `>= end`.
    pub body_start: usize,
    /// Header text between the markers, with comment prefixes removed.
    pub interior: String,
    /// 1-based line on which `interior` begins.
    pub interior_line: usize,
}

impl HeaderSpan {
    /// 1-based artifact line of a byte offset into `interior`.
    pub fn line_at(&self, offset: usize) -> usize {
        let offset = offset.min(self.interior.len());
        self.interior_line + self.interior[..offset].matches('\n').count()
    }
}

/// Find the registration header of `text` for the given dialect.
pub fn extract_header(text: &str, dialect: Dialect, options: &CompileOptions) -> Result<HeaderSpan> {
    match dialect.markers() {
        None => extract_native_header(text, options),
        Some((open, close)) => extract_marked_header(text, open, close, dialect.has_comment_prefix()),
    }
}

/// Iterate lines with their starting byte offsets and 1-based line numbers.
pub(crate) fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').enumerate().map(move |(idx, line)| {
        let start = offset;
        offset += line.len();
        (idx + 1, start, line)
    })
}

fn extract_native_header(text: &str, options: &CompileOptions) -> Result<HeaderSpan> {
    let annotation = introducer(&format!(r"^\s*@{}\s*\(", regex::escape(&options.annotation)))?;
    let payload = introducer(&format!(
        r"^\s*def\s+{}\s*\(",
        regex::escape(&options.payload_function)
    ))?;

    let mut annotations = Vec::new();
    let mut payloads = Vec::new();
    for (line_no, offset, line) in lines_with_offsets(text) {
        if annotation.is_match(line) {
            annotations.push((line_no, offset));
        }
        if payload.is_match(line) {
            payloads.push((line_no, offset));
        }
    }

    if annotations.len() != 1 || payloads.len() != 1 {
        return Err(RecipeError::AmbiguousRecipe {
            message: format!(
                "expected exactly one '@{}(' line and one 'def {}(' line, found {} at lines {:?} and {} at lines {:?}",
                options.annotation,
                options.payload_function,
                annotations.len(),
                annotations.iter().map(|(l, _)| *l).collect::<Vec<_>>(),
                payloads.len(),
                payloads.iter().map(|(l, _)| *l).collect::<Vec<_>>(),
            ),
        });
    }

    let (annotation_line, start) = annotations[0];
    let (payload_line, body_start) = payloads[0];
    if start > body_start {
        return Err(RecipeError::AmbiguousRecipe {
            message: format!(
                "annotation at line {annotation_line} must precede 'def {}' at line {payload_line}",
                options.payload_function
            ),
        });
    }

    Ok(HeaderSpan {
        start,
        end: body_start,
        body_start,
        interior: text[start..body_start].to_string(),
        interior_line: annotation_line,
    })
}

fn introducer(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| RecipeError::Other(format!("invalid introducer pattern: {e}")))
}

fn extract_marked_header(text: &str, open: &str, close: &str, comment_prefixed: bool) -> Result<HeaderSpan> {
    if !text.starts_with(open) {
        let found: String = text.chars().take(open.len()).collect();
        return Err(RecipeError::MalformedArtifact {
            line: 1,
            message: format!("artifact must start with '{open}', found '{}'", found.escape_debug()),
        });
    }

    let interior_start = open.len();
    let close_at = text[interior_start..]
        .find(close)
        .map(|pos| interior_start + pos)
        .ok_or_else(|| RecipeError::MalformedArtifact {
            line: 1,
            message: format!("header opened with '{open}' is never closed with '{close}'"),
        })?;

    let raw = &text[interior_start..close_at];
    let interior = if comment_prefixed {
        strip_comment_prefix(raw)
    } else {
        raw.to_string()
    };
    let end = close_at + close.len();

    tracing::trace!(start = 0, end, "Header located");

    Ok(HeaderSpan {
        start: 0,
        end,
        body_start: end,
        interior,
        interior_line: 1,
    })
}

/// Remove the `#` comment prefix from every header line, keeping line count intact.
fn strip_comment_prefix(raw: &str) -> String {
    raw.split('\n')
        .map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .strip_prefix("# ")
                .or_else(|| trimmed.strip_prefix('#'))
                .unwrap_or(line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
