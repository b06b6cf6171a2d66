use std::path::Path;

use larder_types::{Dialect, Result, TypeTag};
use serde::{Deserialize, Serialize};

/// One artifact as loaded from disk or memory, before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArtifact {
    pub text: String,
    pub dialect: Dialect,
    pub source_id: String,
}

impl RawArtifact {
    pub fn new(text: impl Into<String>, dialect: Dialect, source_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            dialect,
            source_id: source_id.into(),
        }
    }

    /// Read an artifact fully from `path`. The file handle is closed before returning.
    pub fn load(path: &Path, dialect: Dialect) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(text, dialect, path.display().to_string()))
    }
}

/// Compiled, uniform representation of one recipe implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub constraint_name: String,
    pub entrypoint: String,
    pub dialect: Dialect,
    pub preamble: String,
    pub body: String,
    pub argument_rules: Vec<ArgumentRule>,
    pub extra_requirements: Vec<String>,
    pub source_id: String,
}

impl ProgramDescriptor {
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.argument_rules.iter().map(|r| r.parameter_name.as_str())
    }
}

/// How to compute one recipe parameter from ancestry data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentRule {
    pub parameter_name: String,
    /// Ancestry node types (or `context`) the rule reads, in declaration order.
    pub declared_dependencies: Vec<String>,
    pub expression: Expression,
}

impl ArgumentRule {
    pub fn uses_context(&self) -> bool {
        self.declared_dependencies.iter().any(|d| d == CONTEXT_PARAMETER)
    }
}

/// The formal parameter name that gives a rule access to the context store.
pub const CONTEXT_PARAMETER: &str = "context";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expression {
    FieldAccess {
        base: String,
        path: Vec<String>,
    },
    Format {
        template: String,
        args: Vec<FormatArg>,
    },
    Literal {
        value: Literal,
    },
    ContextCapture {
        key: String,
        value: Box<Expression>,
        type_tag: TypeTag,
    },
    ContextGet {
        key: String,
        type_tag: TypeTag,
    },
    Conditional {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
}

impl Expression {
    /// Visit every sub-expression, children before parents, in the order a
    /// binder evaluates them. Both branches of a conditional are visited.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expression)) {
        match self {
            Expression::FieldAccess { .. }
            | Expression::Literal { .. }
            | Expression::ContextGet { .. } => {}
            Expression::Format { args, .. } => {
                for arg in args {
                    arg.value.walk(visit);
                }
            }
            Expression::ContextCapture { value, .. } => value.walk(visit),
            Expression::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.walk(visit);
                then.walk(visit);
                otherwise.walk(visit);
            }
        }
        visit(self);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatArg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    String(String),
}

impl Literal {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::None => serde_json::Value::Null,
            Literal::Bool(b) => serde_json::Value::Bool(*b),
            Literal::Int(i) => serde_json::Value::from(*i),
            Literal::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// A piece of a format template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePiece {
    Text(String),
    /// `{}`: the next positional argument.
    Next,
    /// `{0}`
    Index(usize),
    /// `{name}`
    Named(String),
}

/// Split a format template into text and placeholders.
///
/// Supports `{}`, `{N}`, `{name}` and the `{{` / `}}` escapes. Format specs
/// (`{:>4}`, `{!r}`) are rejected.
pub fn parse_template(template: &str) -> std::result::Result<Vec<TemplatePiece>, String> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '}' => return Err(format!("single '}}' in template \"{template}\"")),
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => return Err(format!("unclosed '{{' in template \"{template}\"")),
                    }
                }
                if !text.is_empty() {
                    pieces.push(TemplatePiece::Text(std::mem::take(&mut text)));
                }
                let field = field.trim();
                if field.is_empty() {
                    pieces.push(TemplatePiece::Next);
                } else if let Ok(index) = field.parse::<usize>() {
                    pieces.push(TemplatePiece::Index(index));
                } else if field.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
                    && !field.starts_with(|ch: char| ch.is_ascii_digit())
                {
                    pieces.push(TemplatePiece::Named(field.to_string()));
                } else {
                    return Err(format!("format spec in placeholder '{{{field}}}'"));
                }
            }
            other => text.push(other),
        }
    }
    if !text.is_empty() {
        pieces.push(TemplatePiece::Text(text));
    }
    Ok(pieces)
}

/// Escape braces so `text` survives as literal template text.
pub fn escape_template_text(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_pieces() {
        let pieces = parse_template("{}_{0}/{name}.csv").unwrap();
        assert_eq!(
            pieces,
            vec![
                TemplatePiece::Next,
                TemplatePiece::Text("_".into()),
                TemplatePiece::Index(0),
                TemplatePiece::Text("/".into()),
                TemplatePiece::Named("name".into()),
                TemplatePiece::Text(".csv".into()),
            ]
        );
    }

    #[test]
    fn template_escapes() {
        let pieces = parse_template("{{literal}} {}").unwrap();
        assert_eq!(
            pieces,
            vec![TemplatePiece::Text("{literal} ".into()), TemplatePiece::Next]
        );
        let escaped = escape_template_text("a{b}");
        assert_eq!(parse_template(&escaped).unwrap(), vec![TemplatePiece::Text("a{b}".into())]);
    }

    #[test]
    fn template_rejects_format_specs_and_stray_braces() {
        assert!(parse_template("{:>4}").is_err());
        assert!(parse_template("{0!r}").is_err());
        assert!(parse_template("oops }").is_err());
        assert!(parse_template("{unclosed").is_err());
    }

    #[test]
    fn expression_serializes_with_kind_tag() {
        let expr = Expression::ContextGet {
            key: "delimiter".into(),
            type_tag: TypeTag::String,
        };
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "context_get", "key": "delimiter", "type_tag": "string"})
        );
        let back: Expression = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn walk_visits_children_before_parents() {
        let expr = Expression::ContextCapture {
            key: "k".into(),
            value: Box::new(Expression::ContextGet {
                key: "j".into(),
                type_tag: TypeTag::String,
            }),
            type_tag: TypeTag::String,
        };
        let mut kinds = Vec::new();
        expr.walk(&mut |e| {
            kinds.push(match e {
                Expression::ContextGet { .. } => "get",
                Expression::ContextCapture { .. } => "capture",
                _ => "other",
            })
        });
        assert_eq!(kinds, vec!["get", "capture"]);
    }

    #[test]
    fn raw_artifact_load_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mkdir.sh");
        std::fs::write(&path, "###+\n# @register(REG, MakeDir)\n###+\nmkdir -p {path}\n").unwrap();
        let artifact = RawArtifact::load(&path, Dialect::Shell).unwrap();
        assert!(artifact.text.starts_with("###+"));
        assert_eq!(artifact.source_id, path.display().to_string());
    }
}
