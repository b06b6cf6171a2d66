//! Restricted expression grammar for argument rules.
//!
//! A rule value `lambda f1, f2: <expr>` is parsed in two stages: a winnow
//! grammar produces a [`Syntax`] tree covering literals, names, attribute
//! access, calls, `+`, conditionals and tuples; lowering then maps the tree
//! onto [`Expression`] and rejects everything outside the supported shapes.

use larder_types::{RecipeError, Result, TypeTag};
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, take_till, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::{
    escape_template_text, parse_template, ArgumentRule, Expression, FormatArg, Literal, TemplatePiece,
    CONTEXT_PARAMETER,
};
use crate::call::Segment;

const KEYWORDS: &[&str] = &["if", "else", "lambda", "for", "in", "not", "and", "or", "is"];

const CONTEXT_PRIMITIVES: &[&str] = &[
    "capture",
    "capture_str",
    "capture_int",
    "capture_bool",
    "get",
    "get_str",
    "get_int",
    "get_bool",
];

#[derive(Debug, Clone, PartialEq)]
enum Syntax {
    Str(String),
    Int(i64),
    Bool(bool),
    None,
    Name(String),
    Attr(Box<Syntax>, String),
    Call { func: Box<Syntax>, args: Vec<CallArg> },
    Macro { name: String, args: Vec<CallArg> },
    Concat(Vec<Syntax>),
    Ternary {
        then: Box<Syntax>,
        condition: Box<Syntax>,
        otherwise: Box<Syntax>,
    },
    Tuple(Vec<Syntax>),
}

#[derive(Debug, Clone, PartialEq)]
struct CallArg {
    name: Option<String>,
    value: Syntax,
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn backtrack<T>() -> ModalResult<T> {
    Err(ErrMode::Backtrack(ContextError::new()))
}

fn spaces<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

fn line_comment<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_till(0.., '\n').parse_next(input)
}

/// Whitespace and `#` line comments.
fn ws(input: &mut &str) -> ModalResult<()> {
    loop {
        spaces.parse_next(input)?;
        if !input.starts_with('#') {
            return Ok(());
        }
        line_comment.parse_next(input)?;
    }
}

fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// An identifier that is not a reserved word.
fn name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let checkpoint = *input;
    let id = identifier.parse_next(input)?;
    if KEYWORDS.contains(&id) {
        *input = checkpoint;
        return backtrack();
    }
    Ok(id)
}

/// Consume `kw` if it appears next as a whole word.
fn keyword(input: &mut &str, kw: &str) -> bool {
    let current = *input;
    match current.strip_prefix(kw) {
        Some(rest) if !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') => {
            *input = rest;
            true
        }
        _ => false,
    }
}

/// Single, double, or triple quoted string with backslash escapes.
fn string_literal(input: &mut &str) -> ModalResult<String> {
    let quote = alt(("\"\"\"", "'''", "\"", "'")).parse_next(input)?;
    let mut s = String::new();
    loop {
        let current = *input;
        if let Some(rest) = current.strip_prefix(quote) {
            *input = rest;
            return Ok(s);
        }
        let c = any.parse_next(input)?;
        match c {
            '\\' => {
                let esc = any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' | '"' | '\'' => s.push(esc),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            '\n' if quote.len() == 1 => return Err(make_cut_error("closing quote on the same line")),
            other => s.push(other),
        }
    }
}

fn integer(input: &mut &str) -> ModalResult<i64> {
    let digits = (opt('-'), digit1).take().parse_next(input)?;
    digits
        .parse()
        .map_err(|_| make_cut_error("integer that fits in 64 bits"))
}

fn primary(input: &mut &str) -> ModalResult<Syntax> {
    ws.parse_next(input)?;
    if input.starts_with(['"', '\'']) {
        return string_literal.map(Syntax::Str).parse_next(input);
    }
    if input.starts_with('(') {
        return parenthesized.parse_next(input);
    }
    if input.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return integer.map(Syntax::Int).parse_next(input);
    }
    let id = name.parse_next(input)?;
    Ok(match id {
        "True" | "true" => Syntax::Bool(true),
        "False" | "false" => Syntax::Bool(false),
        "None" => Syntax::None,
        _ if input.starts_with("!(") => {
            '!'.parse_next(input)?;
            let args = call_args.parse_next(input)?;
            Syntax::Macro {
                name: id.to_string(),
                args,
            }
        }
        _ => Syntax::Name(id.to_string()),
    })
}

/// `( expr )` groups; `( a, b )` and `( a, )` are tuples.
fn parenthesized(input: &mut &str) -> ModalResult<Syntax> {
    '('.parse_next(input)?;
    let mut items = Vec::new();
    let mut trailing_comma = false;
    loop {
        ws.parse_next(input)?;
        if input.starts_with(')') {
            break;
        }
        items.push(expr.parse_next(input)?);
        ws.parse_next(input)?;
        trailing_comma = input.starts_with(',');
        if trailing_comma {
            ','.parse_next(input)?;
        } else if !input.starts_with(')') {
            return Err(make_cut_error("',' or ')'"));
        }
    }
    ')'.parse_next(input)?;
    if items.len() == 1 && !trailing_comma {
        return Ok(items.remove(0));
    }
    Ok(Syntax::Tuple(items))
}

fn call_args(input: &mut &str) -> ModalResult<Vec<CallArg>> {
    '('.parse_next(input)?;
    let mut args = Vec::new();
    loop {
        ws.parse_next(input)?;
        if input.starts_with(')') {
            break;
        }
        args.push(call_arg.parse_next(input)?);
        ws.parse_next(input)?;
        if input.starts_with(',') {
            ','.parse_next(input)?;
        } else if !input.starts_with(')') {
            return Err(make_cut_error("',' or ')'"));
        }
    }
    ')'.parse_next(input)?;
    Ok(args)
}

/// `name=value` or a positional expression.
fn call_arg(input: &mut &str) -> ModalResult<CallArg> {
    let checkpoint = *input;
    if let Ok(id) = name.parse_next(input) {
        let _ = ws.parse_next(input);
        if input.starts_with('=') && !input.starts_with("==") {
            '='.parse_next(input)?;
            let value = expr.parse_next(input)?;
            return Ok(CallArg {
                name: Some(id.to_string()),
                value,
            });
        }
    }
    *input = checkpoint;
    Ok(CallArg {
        name: None,
        value: expr.parse_next(input)?,
    })
}

/// Attribute access and calls, left to right.
fn postfix(input: &mut &str) -> ModalResult<Syntax> {
    let mut node = primary.parse_next(input)?;
    loop {
        let checkpoint = *input;
        ws.parse_next(input)?;
        if input.starts_with('.') {
            '.'.parse_next(input)?;
            ws.parse_next(input)?;
            let field = name.parse_next(input)?;
            node = Syntax::Attr(Box::new(node), field.to_string());
        } else if input.starts_with('(') {
            let args = call_args.parse_next(input)?;
            node = Syntax::Call {
                func: Box::new(node),
                args,
            };
        } else {
            *input = checkpoint;
            return Ok(node);
        }
    }
}

fn concat(input: &mut &str) -> ModalResult<Syntax> {
    let mut parts = vec![postfix.parse_next(input)?];
    loop {
        let checkpoint = *input;
        ws.parse_next(input)?;
        if input.starts_with('+') {
            '+'.parse_next(input)?;
            parts.push(postfix.parse_next(input)?);
        } else {
            *input = checkpoint;
            break;
        }
    }
    Ok(if parts.len() == 1 {
        parts.remove(0)
    } else {
        Syntax::Concat(parts)
    })
}

/// `then if condition else otherwise`, right associative.
fn expr(input: &mut &str) -> ModalResult<Syntax> {
    let then = concat.parse_next(input)?;
    let checkpoint = *input;
    ws.parse_next(input)?;
    if !keyword(input, "if") {
        *input = checkpoint;
        return Ok(then);
    }
    let condition = concat.parse_next(input)?;
    ws.parse_next(input)?;
    if !keyword(input, "else") {
        return Err(make_cut_error("'else' in conditional expression"));
    }
    let otherwise = expr.parse_next(input)?;
    Ok(Syntax::Ternary {
        then: Box::new(then),
        condition: Box::new(condition),
        otherwise: Box::new(otherwise),
    })
}

/// `lambda f1, f2: <expr>`; returns the formals and the body.
fn lambda(input: &mut &str) -> ModalResult<(Vec<String>, Syntax)> {
    let formals = lambda_formals.parse_next(input)?;
    let body = expr.parse_next(input)?;
    Ok((formals, body))
}

/// `lambda f1, f2:` up to and including the colon.
fn lambda_formals(input: &mut &str) -> ModalResult<Vec<String>> {
    ws.parse_next(input)?;
    if !keyword(input, "lambda") {
        return backtrack();
    }
    let mut formals = Vec::new();
    loop {
        ws.parse_next(input)?;
        if input.starts_with(':') {
            break;
        }
        formals.push(name.parse_next(input)?.to_string());
        ws.parse_next(input)?;
        if input.starts_with(',') {
            ','.parse_next(input)?;
        } else if !input.starts_with(':') {
            return Err(make_cut_error("',' or ':' after lambda parameter"));
        }
    }
    ':'.parse_next(input)?;
    Ok(formals)
}

/// The value of `text` if it is exactly one string literal.
pub(crate) fn string_value(text: &str) -> Option<String> {
    let mut input = text.trim();
    let value = string_literal.parse_next(&mut input).ok()?;
    input.is_empty().then_some(value)
}

// ---------------------------------------------------------------------------
// Argument lists and the args dict
// ---------------------------------------------------------------------------

fn next_char(input: &mut &str) -> ModalResult<char> {
    any.parse_next(input)
}

/// One value, up to the next `,` or closing bracket at depth zero. Trailing
/// whitespace and comments are consumed but not part of the returned text.
fn raw_value<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let start = *input;
    let mut end = 0;
    loop {
        match input.chars().next() {
            None | Some(',' | ')' | ']' | '}') => break,
            Some('#') => {
                line_comment.parse_next(input)?;
                continue;
            }
            Some(c) if c.is_whitespace() => {
                next_char.parse_next(input)?;
                continue;
            }
            Some('"' | '\'') => {
                string_literal.parse_next(input)?;
            }
            Some('(' | '[' | '{') => bracketed.parse_next(input)?,
            Some(_) => {
                next_char.parse_next(input)?;
            }
        }
        end = start.len() - input.len();
    }
    Ok(&start[..end])
}

/// A `(...)`, `[...]` or `{...}` group, contents included.
fn bracketed(input: &mut &str) -> ModalResult<()> {
    let close = match next_char.parse_next(input)? {
        '(' => ')',
        '[' => ']',
        _ => '}',
    };
    loop {
        raw_value.parse_next(input)?;
        match input.chars().next() {
            Some(',') => {
                next_char.parse_next(input)?;
            }
            Some(c) if c == close => {
                next_char.parse_next(input)?;
                return Ok(());
            }
            Some(_) => return Err(make_cut_error("matching closing bracket")),
            None => return Err(make_cut_error("closing bracket")),
        }
    }
}

/// `name =` in front of a keyword argument (but not `name ==`).
fn keyword_prefix<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let id = identifier.parse_next(input)?;
    ws.parse_next(input)?;
    if !input.starts_with('=') || input.starts_with("==") {
        return backtrack();
    }
    '='.parse_next(input)?;
    ws.parse_next(input)?;
    Ok(id)
}

/// Split a comma separated argument list (brackets excluded) into
/// `(keyword, value)` items. On failure, returns the offending offset.
pub(crate) fn argument_items(text: &str) -> std::result::Result<Vec<(Option<String>, Segment)>, usize> {
    let mut input = text;
    let mut items = Vec::new();
    loop {
        let _ = ws.parse_next(&mut input);
        if input.is_empty() {
            return Ok(items);
        }
        let checkpoint = input;
        let keyword = match keyword_prefix.parse_next(&mut input) {
            Ok(name) => Some(name.to_string()),
            Err(_) => {
                input = checkpoint;
                None
            }
        };
        let offset = text.len() - input.len();
        let value = raw_value.parse_next(&mut input).map_err(|_| offset)?;
        items.push((
            keyword,
            Segment {
                offset,
                text: value.to_string(),
            },
        ));
        match input.chars().next() {
            None => return Ok(items),
            Some(',') => input = &input[1..],
            Some(_) => return Err(text.len() - input.len()),
        }
    }
}

/// A `"key": value` entry of the args dict, located in the dict text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DictEntry {
    pub key: String,
    pub key_offset: usize,
    pub value: Segment,
}

/// Parse a `{"key": lambda a, b: ..., ...}` literal into its entries.
///
/// A value's lambda parameter list is consumed before looking for the comma
/// that ends the entry. On failure, returns the offset and what was expected.
pub(crate) fn dict_entries(text: &str) -> std::result::Result<Vec<DictEntry>, (usize, &'static str)> {
    let mut input = text;
    let at = |input: &str| text.len() - input.len();

    let _ = ws.parse_next(&mut input);
    if !input.starts_with('{') {
        return Err((at(input), "args must be a dict literal"));
    }
    input = &input[1..];

    let mut entries = Vec::new();
    loop {
        let _ = ws.parse_next(&mut input);
        if let Some(rest) = input.strip_prefix('}') {
            input = rest;
            break;
        }

        let key_offset = at(input);
        let key = string_literal
            .parse_next(&mut input)
            .map_err(|_| (key_offset, "args key must be a string literal"))?;
        let _ = ws.parse_next(&mut input);
        input = input.strip_prefix(':').ok_or((at(input), "':' after args key"))?;
        let _ = ws.parse_next(&mut input);

        let value_offset = at(input);
        let checkpoint = input;
        if lambda_formals.parse_next(&mut input).is_err() {
            input = checkpoint;
        }
        let tail_offset = at(input);
        let tail = raw_value
            .parse_next(&mut input)
            .map_err(|_| (tail_offset, "balanced brackets and quotes in args value"))?;
        let end = tail_offset + tail.len();
        entries.push(DictEntry {
            key,
            key_offset,
            value: Segment {
                offset: value_offset,
                text: text[value_offset..end].trim_end().to_string(),
            },
        });

        match input.chars().next() {
            Some(',') => input = &input[1..],
            Some('}') => {}
            _ => return Err((at(input), "',' or '}' after args entry")),
        }
    }

    let _ = ws.parse_next(&mut input);
    if !input.is_empty() {
        return Err((at(input), "end of args after '}'"));
    }
    Ok(entries)
}

/// Compile one `lambda ...: <expr>` rule value.
///
/// `line_of` maps a byte offset in `text` to an artifact line.
pub fn compile_rule(parameter: &str, text: &str, line_of: &dyn Fn(usize) -> usize) -> Result<ArgumentRule> {
    let unsupported = |construct: String, offset: usize| RecipeError::UnsupportedExpression {
        parameter: parameter.to_string(),
        construct,
        line: line_of(offset),
    };

    let trimmed = text.trim_start();
    let start = text.len() - trimmed.len();
    if !trimmed.starts_with("lambda") {
        return Err(unsupported(
            format!("rule value must be a lambda, found {}", snippet(trimmed)),
            start,
        ));
    }

    let mut input = text;
    let parsed = lambda.parse_next(&mut input);
    let _ = ws.parse_next(&mut input);
    let offset = text.len() - input.len();
    let (formals, body) = match parsed {
        Ok(parsed) if input.is_empty() => parsed,
        _ => return Err(unsupported(describe_construct(input), offset)),
    };

    let lowering = Lowering {
        parameter,
        formals: &formals,
        line: line_of(start),
    };
    let expression = lowering.lower(&body)?;
    Ok(ArgumentRule {
        parameter_name: parameter.to_string(),
        declared_dependencies: formals,
        expression,
    })
}

/// Name the construct at the start of unparsed input.
fn describe_construct(rest: &str) -> String {
    let rest = rest.trim_start();
    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    match word.as_str() {
        "lambda" => return "nested lambda".into(),
        "for" => return "comprehension".into(),
        "not" | "and" | "or" | "is" | "in" => return format!("operator '{word}'"),
        "if" | "else" => return format!("misplaced '{word}'"),
        _ => {}
    }
    const OPERATORS: &str = "*/%-<>=!&|^~@";
    match rest.chars().next() {
        None => "incomplete expression".into(),
        Some('[') if rest.contains(" for ") => "comprehension".into(),
        Some('[') => "list literal or subscript".into(),
        Some('{') => "dict or block literal".into(),
        Some(_) if rest.starts_with("!(") => "macro invocation".into(),
        Some(_) if rest.starts_with("::") => "path expression".into(),
        Some(c) if OPERATORS.contains(c) => {
            let op: String = rest.chars().take_while(|c| OPERATORS.contains(*c)).collect();
            format!("operator '{op}'")
        }
        Some(_) => snippet(rest),
    }
}

fn snippet(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let short: String = line.chars().take(32).collect();
    if short.len() < line.len() {
        format!("'{short}...'")
    } else {
        format!("'{short}'")
    }
}

fn type_name(name: &str) -> Option<TypeTag> {
    match name {
        "str" | "string" | "String" => Some(TypeTag::String),
        "int" | "i64" | "Int" => Some(TypeTag::Int),
        "bool" | "Bool" => Some(TypeTag::Bool),
        _ => None,
    }
}

struct Lowering<'a> {
    parameter: &'a str,
    formals: &'a [String],
    line: usize,
}

impl Lowering<'_> {
    fn unsupported(&self, construct: impl Into<String>) -> RecipeError {
        RecipeError::UnsupportedExpression {
            parameter: self.parameter.to_string(),
            construct: construct.into(),
            line: self.line,
        }
    }

    fn has_formal(&self, name: &str) -> bool {
        self.formals.iter().any(|f| f == name)
    }

    fn lower(&self, node: &Syntax) -> Result<Expression> {
        match node {
            Syntax::Str(s) => Ok(literal(Literal::String(s.clone()))),
            Syntax::Int(i) => Ok(literal(Literal::Int(*i))),
            Syntax::Bool(b) => Ok(literal(Literal::Bool(*b))),
            Syntax::None => Ok(literal(Literal::None)),
            Syntax::Name(_) | Syntax::Attr(..) => self.field_access(node),
            Syntax::Call { func, args } => self.call(func, args),
            Syntax::Macro { name, args } => match (name.as_str(), args.split_first()) {
                (
                    "format",
                    Some((
                        CallArg {
                            name: None,
                            value: Syntax::Str(template),
                        },
                        rest,
                    )),
                ) => self.format(template, rest),
                ("format", _) => Err(self.unsupported("format! without a literal template")),
                (other, _) => Err(self.unsupported(format!("macro '{other}!'"))),
            },
            Syntax::Concat(parts) => {
                // `a + b + "x"` adds `a + b` before any string is involved.
                if !parts.iter().take(2).any(is_textual) {
                    return Err(self.unsupported("operator '+'"));
                }
                let mut template = String::new();
                let mut args = Vec::new();
                for part in parts {
                    match part {
                        Syntax::Str(text) => template.push_str(&escape_template_text(text)),
                        other => {
                            template.push_str("{}");
                            args.push(FormatArg {
                                name: None,
                                value: self.lower(other)?,
                            });
                        }
                    }
                }
                Ok(Expression::Format { template, args })
            }
            Syntax::Ternary {
                then,
                condition,
                otherwise,
            } => Ok(Expression::Conditional {
                condition: Box::new(self.lower(condition)?),
                then: Box::new(self.lower(then)?),
                otherwise: Box::new(self.lower(otherwise)?),
            }),
            Syntax::Tuple(items) => match items.as_slice() {
                [value, Syntax::Name(ctx)] if ctx == CONTEXT_PARAMETER && self.has_formal(CONTEXT_PARAMETER) => {
                    self.lower(value)
                }
                _ => Err(self.unsupported(format!("tuple of {} elements", items.len()))),
            },
        }
    }

    fn field_access(&self, node: &Syntax) -> Result<Expression> {
        let mut path = Vec::new();
        let mut current = node;
        let base = loop {
            match current {
                Syntax::Name(base) => break base,
                Syntax::Attr(inner, field) => {
                    path.push(field.clone());
                    current = inner;
                }
                _ => return Err(self.unsupported("attribute access on a computed value")),
            }
        };
        path.reverse();

        if base == CONTEXT_PARAMETER && self.has_formal(CONTEXT_PARAMETER) {
            return Err(self.unsupported(if path.is_empty() {
                "'context' used as a value".to_string()
            } else {
                format!("field access 'context.{}'", path.join("."))
            }));
        }
        if !self.has_formal(base) {
            return Err(self.unsupported(format!("unknown name '{base}'")));
        }
        Ok(Expression::FieldAccess {
            base: base.clone(),
            path,
        })
    }

    fn call(&self, func: &Syntax, args: &[CallArg]) -> Result<Expression> {
        match func {
            Syntax::Name(f) if f == "str" => match args {
                [CallArg { name: None, value }] => Ok(Expression::Format {
                    template: "{}".into(),
                    args: vec![FormatArg {
                        name: None,
                        value: self.lower(value)?,
                    }],
                }),
                _ => Err(self.unsupported(format!("str() with {} arguments", args.len()))),
            },
            Syntax::Name(f) if CONTEXT_PRIMITIVES.contains(&f.as_str()) => self.context_primitive(f, args),
            Syntax::Name(f) => Err(self.unsupported(format!("call to '{f}()'"))),
            Syntax::Attr(base, method) => match (&**base, method.as_str()) {
                (Syntax::Name(ctx), m) if ctx == CONTEXT_PARAMETER && CONTEXT_PRIMITIVES.contains(&m) => {
                    self.context_primitive(m, args)
                }
                (Syntax::Str(template), "format") => self.format(template, args),
                (_, m) => Err(self.unsupported(format!("method call '.{m}()'"))),
            },
            _ => Err(self.unsupported("call of a computed value")),
        }
    }

    /// A `Format` whose placeholders are checked against `args`.
    fn format(&self, template: &str, args: &[CallArg]) -> Result<Expression> {
        let pieces = parse_template(template).map_err(|e| self.unsupported(format!("format template: {e}")))?;
        let args = args
            .iter()
            .map(|a| -> Result<FormatArg> {
                Ok(FormatArg {
                    name: a.name.clone(),
                    value: self.lower(&a.value)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let positional = args.iter().filter(|a| a.name.is_none()).count();
        let mut next = 0;
        for piece in &pieces {
            let missing = match piece {
                TemplatePiece::Text(_) => None,
                TemplatePiece::Next => {
                    next += 1;
                    (next > positional).then(|| format!("{next} positional arguments"))
                }
                TemplatePiece::Index(i) => (*i >= positional).then(|| format!("positional argument {i}")),
                TemplatePiece::Named(n) => (!args.iter().any(|a| a.name.as_deref() == Some(n.as_str())))
                    .then(|| format!("argument '{n}'")),
            };
            if let Some(missing) = missing {
                return Err(self.unsupported(format!("format template \"{template}\" needs {missing}")));
            }
        }

        Ok(Expression::Format {
            template: template.to_string(),
            args,
        })
    }

    fn context_primitive(&self, primitive: &str, args: &[CallArg]) -> Result<Expression> {
        if !self.has_formal(CONTEXT_PARAMETER) {
            return Err(self.unsupported(format!(
                "'{primitive}' without a '{CONTEXT_PARAMETER}' parameter"
            )));
        }
        let (op, suffix) = primitive.split_once('_').unwrap_or((primitive, ""));
        let implied = type_name(suffix);

        let positional: Vec<&Syntax> = args.iter().filter(|a| a.name.is_none()).map(|a| &a.value).collect();
        let named = |key: &str| {
            args.iter()
                .find(|a| a.name.as_deref() == Some(key))
                .map(|a| &a.value)
        };
        let max_positional = if op == "capture" { 3 } else { 2 };
        if positional.len() > max_positional {
            return Err(self.unsupported(format!("'{primitive}' with {} arguments", positional.len())));
        }

        let key = match positional.first().copied().or_else(|| named("key")) {
            Some(Syntax::Str(key)) => key.clone(),
            _ => return Err(self.unsupported(format!("'{primitive}' key must be a string literal"))),
        };
        let type_position = if op == "capture" { 2 } else { 1 };
        let explicit = match positional.get(type_position).copied().or_else(|| named("type")) {
            None => None,
            Some(Syntax::Name(t) | Syntax::Str(t)) => {
                Some(type_name(t).ok_or_else(|| self.unsupported(format!("unknown context type '{t}'")))?)
            }
            Some(_) => return Err(self.unsupported(format!("'{primitive}' type must be a name or string"))),
        };
        if let (Some(a), Some(b)) = (implied, explicit) {
            if a != b {
                return Err(self.unsupported(format!("'{primitive}' given conflicting type '{b}'")));
            }
        }

        if op == "get" {
            return Ok(Expression::ContextGet {
                key,
                type_tag: implied.or(explicit).unwrap_or(TypeTag::String),
            });
        }

        let value = positional
            .get(1)
            .copied()
            .or_else(|| named("value"))
            .ok_or_else(|| self.unsupported(format!("'{primitive}' without a value")))?;
        let inferred = match value {
            Syntax::Bool(_) => TypeTag::Bool,
            Syntax::Int(_) => TypeTag::Int,
            _ => TypeTag::String,
        };
        Ok(Expression::ContextCapture {
            key,
            value: Box::new(self.lower(value)?),
            type_tag: implied.or(explicit).unwrap_or(inferred),
        })
    }
}

/// Whether `node` is statically a string, making `+` a concatenation.
fn is_textual(node: &Syntax) -> bool {
    match node {
        Syntax::Str(_) => true,
        Syntax::Macro { name, .. } => name == "format",
        Syntax::Call { func, .. } => match &**func {
            Syntax::Name(f) => f == "str",
            Syntax::Attr(base, method) => method == "format" && matches!(**base, Syntax::Str(_)),
            _ => false,
        },
        _ => false,
    }
}

fn literal(value: Literal) -> Expression {
    Expression::Literal { value }
}
