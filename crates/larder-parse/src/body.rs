//! Slicing the executable payload out of an artifact.

use larder_types::{Dialect, RecipeError, Result};

use crate::call::{matching_close, scan_structure, structural_chars};
use crate::header::HeaderSpan;

/// Extract the payload that follows `span`.
///
/// Native artifacts yield the interior of the payload function's block; every
/// other dialect yields the trimmed text after the closing marker.
pub fn slice_body(text: &str, span: &HeaderSpan, dialect: Dialect) -> Result<String> {
    let rest = &text[span.body_start..];
    let body = match dialect {
        Dialect::Native => slice_block(rest)?,
        _ => rest.trim().to_string(),
    };
    if body.is_empty() {
        return Err(RecipeError::EmptyRecipeBody);
    }
    Ok(body)
}

/// Return the dedented block of the `def` that starts `source`.
///
/// Re-wrapping the result in a `def` with any deeper indent and slicing again
/// yields the same text.
pub fn slice_block(source: &str) -> Result<String> {
    let def_line = source.lines().next().unwrap_or_default();
    let def_indent = indent_width(def_line);

    let open = source.find('(').ok_or_else(|| malformed_signature("has no parameter list"))?;
    let close = matching_close(source, open).ok_or_else(|| malformed_signature("parameter list is never closed"))?;
    let colon = signature_colon(source, close + 1).ok_or_else(|| malformed_signature("has no ':'"))?;

    let after_colon = &source[colon + 1..];
    let (same_line, following) = match after_colon.find('\n') {
        Some(pos) => (&after_colon[..pos], &after_colon[pos + 1..]),
        None => (after_colon, ""),
    };
    let suite = same_line.trim();
    if !suite.is_empty() && !suite.starts_with('#') {
        return Ok(suite.to_string());
    }

    let lines = block_lines(following, def_indent);
    let min_indent = lines
        .iter()
        .filter(|l| l.kind == LineKind::Code)
        .map(|l| indent_width(l.text))
        .min()
        .ok_or(RecipeError::EmptyRecipeBody)?;

    let mut out: Vec<String> = lines
        .iter()
        .map(|l| match l.kind {
            LineKind::Blank => String::new(),
            LineKind::Code => l.text[min_indent..].trim_end().to_string(),
            LineKind::Comment | LineKind::InString => {
                let strip = indent_width(l.text).min(min_indent);
                l.text[strip..].trim_end_matches(['\r', '\n']).to_string()
            }
        })
        .collect();

    let kinds: Vec<LineKind> = lines.iter().map(|l| l.kind).collect();
    let last_code = kinds
        .iter()
        .rposition(|k| matches!(k, LineKind::Code | LineKind::InString))
        .unwrap_or(0);
    let first_code = kinds.iter().position(|k| *k != LineKind::Blank).unwrap_or(0);
    out.truncate(last_code + 1);
    Ok(out.split_off(first_code).join("\n"))
}

fn malformed_signature(problem: &str) -> RecipeError {
    RecipeError::MalformedArtifact {
        line: 1,
        message: format!("payload signature {problem}"),
    }
}

/// First `:` at bracket depth zero after `from` (skips return annotations).
fn signature_colon(source: &str, from: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (pos, c) in structural_chars(&source[from..]) {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth == 0 => return Some(from + pos),
            '\n' if depth == 0 => return None,
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Blank,
    Comment,
    Code,
    /// Continuation line of a triple-quoted string.
    InString,
}

struct BlockLine<'a> {
    text: &'a str,
    kind: LineKind,
}

/// Collect lines that belong to a block whose header is indented `def_indent`.
fn block_lines(following: &str, def_indent: usize) -> Vec<BlockLine<'_>> {
    let mut lines = Vec::new();
    let mut open_quote: Option<&'static str> = None;

    for text in following.split('\n') {
        let text = text.trim_end_matches('\r');
        let kind = if open_quote.is_some() {
            LineKind::InString
        } else if text.trim().is_empty() {
            LineKind::Blank
        } else if text.trim_start().starts_with('#') {
            LineKind::Comment
        } else if indent_width(text) <= def_indent {
            break;
        } else {
            LineKind::Code
        };
        if matches!(kind, LineKind::Code | LineKind::InString) {
            open_quote = track_triple_quotes(text, open_quote);
        }
        lines.push(BlockLine { text, kind });
    }
    lines
}

/// Update the open triple-quote state after scanning `line`.
fn track_triple_quotes(line: &str, open: Option<&'static str>) -> Option<&'static str> {
    let rest = match open {
        Some(quote) => match line.find(quote) {
            Some(pos) => &line[pos + 3..],
            None => return open,
        },
        None => line,
    };
    scan_structure(rest).1
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrap(body: &str) -> String {
        let indented: Vec<String> = body
            .lines()
            .map(|l| if l.is_empty() { String::new() } else { format!("        {l}") })
            .collect();
        format!("    def recipe(x):\n{}\n", indented.join("\n"))
    }

    #[test]
    fn slices_indented_block_and_stops_at_dedent() {
        let source = "def recipe(path, mode=\"a\"):\n    import os\n\n    os.makedirs(path)\n\nprint('outside')\n";
        let body = slice_block(source).unwrap();
        assert_eq!(body, "import os\n\nos.makedirs(path)");
    }

    #[test]
    fn same_line_suite() {
        assert_eq!(slice_block("def recipe(x): return x + 1\n").unwrap(), "return x + 1");
    }

    #[test]
    fn return_annotation_and_multiline_signature() {
        let source = "def recipe(\n    a,\n    b: dict,\n) -> Dict[str, int]:\n    return {a: b}\n";
        assert_eq!(slice_block(source).unwrap(), "return {a: b}");
    }

    #[test]
    fn triple_quoted_string_does_not_end_block() {
        let source = "def recipe():\n    query = \"\"\"\nSELECT *\nFROM t\n\"\"\"\n    run(query)\nafter()\n";
        let body = slice_block(source).unwrap();
        assert_eq!(body, "query = \"\"\"\nSELECT *\nFROM t\n\"\"\"\nrun(query)");
    }

    #[test]
    fn hash_inside_a_string_does_not_hide_a_triple_quote() {
        let source = "def recipe():\n    x = \"#\" + \"\"\"\nfoo\n\"\"\"\n    run(x)\nafter()\n";
        let body = slice_block(source).unwrap();
        assert_eq!(body, "x = \"#\" + \"\"\"\nfoo\n\"\"\"\nrun(x)");
    }

    #[test]
    fn triple_quote_after_a_comment_is_ignored() {
        let source = "def recipe():\n    go()  # not a \"\"\" string\n    done()\nafter()\n";
        assert_eq!(slice_block(source).unwrap(), "go()  # not a \"\"\" string\ndone()");
    }

    #[test]
    fn trailing_comments_and_blanks_are_trimmed() {
        let source = "def recipe():\n    go()\n    # done\n\n# next section\n";
        assert_eq!(slice_block(source).unwrap(), "go()");
    }

    #[test]
    fn slicing_is_idempotent() {
        let sources = [
            "def recipe(path):\n    if path:\n        mkdir(path)\n    # note\n    return path\n",
            "def recipe():\n    sql = '''\n      SELECT 1\n    '''\n    run(sql)\n",
            "def recipe(): return 1\n",
        ];
        for source in sources {
            let once = slice_block(source).unwrap();
            let twice = slice_block(&rewrap(&once)).unwrap();
            assert_eq!(once, twice, "slicing {source:?}");
        }
    }

    #[test]
    fn empty_block_is_an_error() {
        let err = slice_block("def recipe():\n    # nothing\n\nother()\n").unwrap_err();
        assert!(matches!(err, RecipeError::EmptyRecipeBody));
    }

    #[test]
    fn non_native_body_is_trimmed_text_after_marker() {
        let text = "###+\n# @register(REG, MakeDir)\n###+\n\nmkdir -p {path}\n\n";
        let span = HeaderSpan {
            start: 0,
            end: 35,
            body_start: 35,
            interior: String::new(),
            interior_line: 1,
        };
        assert_eq!(&text[31..35], "###+");
        assert_eq!(slice_body(text, &span, Dialect::Shell).unwrap(), "mkdir -p {path}");
    }

    #[test]
    fn whitespace_only_body_is_empty() {
        let text = "/***\n@register(REG, A)\n***/\n   \n";
        let span = HeaderSpan {
            start: 0,
            end: 27,
            body_start: 27,
            interior: String::new(),
            interior_line: 1,
        };
        let err = slice_body(text, &span, Dialect::Query).unwrap_err();
        assert!(matches!(err, RecipeError::EmptyRecipeBody));
    }
}
