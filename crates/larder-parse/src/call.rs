//! Registration calls: `@register(handle, Constraint, key=value, ...)`.
//!
//! Arguments are split by the winnow item grammar in [`crate::expression`],
//! which skips bracketed groups, quoted strings and `#` comments, so commas
//! inside `args={...}` or inside string literals never split an argument.

use larder_types::{RecipeError, Result};

use crate::expression::{argument_items, string_value};

/// A slice of call text together with its byte offset in the scanned source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub text: String,
}

/// What a registration call declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Name after the `@`.
    pub name: String,
    /// Constraint names bound by this recipe, in declaration order.
    pub constraints: Vec<String>,
    /// The raw `args={...}` literal, if present.
    pub args: Option<Segment>,
    pub entrypoint: Option<String>,
    pub preamble: Option<String>,
    pub requirements: Vec<String>,
    /// Byte offset of the call's `@`.
    pub start: usize,
    /// Byte offset just past the call's closing `)`.
    pub end: usize,
}

/// Byte offsets of every character outside string literals and comments.
pub(crate) fn structural_chars(text: &str) -> Vec<(usize, char)> {
    scan_structure(text).0
}

/// Like [`structural_chars`], also reporting a triple quote left open at the end of `text`.
pub(crate) fn scan_structure(text: &str) -> (Vec<(usize, char)>, Option<&'static str>) {
    let mut out = Vec::new();
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        let Some(c) = rest.chars().next() else { break };
        let triple = ["\"\"\"", "'''"].into_iter().find(|q| rest.starts_with(*q));
        if let Some(quote) = triple {
            i += 3;
            match text[i..].find(quote) {
                Some(pos) => i += pos + 3,
                None => return (out, Some(quote)),
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                i += 1;
                while i < text.len() {
                    let Some(ch) = text[i..].chars().next() else { break };
                    i += ch.len_utf8();
                    if ch == '\\' {
                        if let Some(escaped) = text[i..].chars().next() {
                            i += escaped.len_utf8();
                        }
                    } else if ch == c {
                        break;
                    }
                }
            }
            '#' => {
                i = text[i..].find('\n').map(|pos| i + pos).unwrap_or(text.len());
            }
            _ => {
                out.push((i, c));
                i += c.len_utf8();
            }
        }
    }
    (out, None)
}

/// Offset of the bracket closing the one at `open`, if it is closed.
pub(crate) fn matching_close(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (pos, c) in structural_chars(&text[open..]) {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + pos);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse the first registration call found in `header`.
///
/// `line_of` maps a byte offset in `header` to an artifact line for error reports.
pub fn parse_registration(header: &str, line_of: &dyn Fn(usize) -> usize) -> Result<Registration> {
    let start = find_call_start(header).ok_or_else(|| RecipeError::MalformedArtifact {
        line: line_of(0),
        message: "header has no registration call ('@name(...)')".into(),
    })?;
    let malformed = |offset: usize, message: String| RecipeError::MalformedArtifact {
        line: line_of(offset),
        message,
    };

    let after_at = &header[start + 1..];
    let name_len = after_at
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(after_at.len());
    let name = after_at[..name_len].to_string();
    let open = header[start + 1 + name_len..]
        .find('(')
        .map(|pos| start + 1 + name_len + pos)
        .ok_or_else(|| malformed(start, format!("'@{name}' is not followed by '('")))?;
    let close = matching_close(header, open)
        .ok_or_else(|| malformed(start, format!("registration call '@{name}(' is never closed")))?;

    let inner = &header[open + 1..close];
    let mut positional = Vec::new();
    let mut registration = Registration {
        name,
        constraints: Vec::new(),
        args: None,
        entrypoint: None,
        preamble: None,
        requirements: Vec::new(),
        start,
        end: close + 1,
    };

    let items = argument_items(inner).map_err(|offset| {
        malformed(
            open + 1 + offset,
            format!("cannot split the arguments of '@{}(...)'", registration.name),
        )
    })?;
    let mut seen = Vec::new();
    for (keyword, mut value) in items {
        value.offset += open + 1;
        let Some(key) = keyword else {
            positional.push(value);
            continue;
        };
        if seen.contains(&key) {
            return Err(malformed(value.offset, format!("duplicate argument '{key}'")));
        }
        seen.push(key.clone());
        match key.as_str() {
            "args" => registration.args = Some(value),
            "entrypoint" => {
                registration.entrypoint = Some(string_value(&value.text).ok_or_else(|| {
                    malformed(value.offset, format!("entrypoint must be a string literal, found '{}'", value.text))
                })?)
            }
            "preamble" => {
                registration.preamble = Some(string_value(&value.text).ok_or_else(|| {
                    malformed(value.offset, "preamble must be a string literal".into())
                })?)
            }
            "pip_requirements" | "requirements" => {
                registration.requirements = string_list(&value).ok_or_else(|| {
                    malformed(value.offset, format!("{key} must be a list of string literals"))
                })?
            }
            other => {
                tracing::warn!(keyword = %other, line = line_of(value.offset), "Ignoring unknown registration keyword");
            }
        }
    }

    if positional.len() < 2 {
        return Err(malformed(
            start,
            format!(
                "registration call needs a registry handle and a constraint, found {} positional argument(s)",
                positional.len()
            ),
        ));
    }
    let target = &positional[1];
    registration.constraints = constraint_names(&target.text)
        .ok_or_else(|| malformed(target.offset, format!("'{}' is not a constraint name or list of names", target.text)))?;

    Ok(registration)
}

/// Offset of the `@` that starts the first line beginning with `@name(`.
fn find_call_start(header: &str) -> Option<usize> {
    crate::header::lines_with_offsets(header).find_map(|(_, offset, line)| {
        let trimmed = line.trim_start();
        let rest = trimmed.strip_prefix('@')?;
        let ident_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if ident_len == 0 || !rest[ident_len..].trim_start().starts_with('(') {
            return None;
        }
        Some(offset + (line.len() - trimmed.len()))
    })
}

/// `Name`, `"Name"`, or `[A, B]`.
fn constraint_names(text: &str) -> Option<Vec<String>> {
    let one = |item: &str| -> Option<String> {
        let item = item.trim();
        if is_identifier(item) {
            Some(item.to_string())
        } else {
            string_value(item).filter(|s| is_identifier(s))
        }
    };
    match text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        Some(inner) => {
            let names = argument_items(inner)
                .ok()?
                .iter()
                .map(|(keyword, s)| if keyword.is_some() { None } else { one(&s.text) })
                .collect::<Option<Vec<_>>>()?;
            (!names.is_empty()).then_some(names)
        }
        None => one(text).map(|name| vec![name]),
    }
}

fn string_list(value: &Segment) -> Option<Vec<String>> {
    let inner = value.text.strip_prefix('[')?.strip_suffix(']')?;
    argument_items(inner)
        .ok()?
        .iter()
        .map(|(keyword, s)| if keyword.is_some() { None } else { string_value(&s.text) })
        .collect()
}
