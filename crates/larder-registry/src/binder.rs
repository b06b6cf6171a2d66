//! Binding a descriptor's argument rules against ancestry data.
//!
//! Rules are evaluated strictly in declaration order against one fresh
//! [`ContextStore`], so a `get` only sees what earlier rules captured (or what
//! upstream constraints seeded).

use std::collections::HashMap;

use indexmap::IndexMap;
use larder_parse::{parse_template, ArgumentRule, Expression, ProgramDescriptor, TemplatePiece, CONTEXT_PARAMETER};
use larder_types::{json_type_name, ContextStore, RecipeError, Result, TypedValue};
use serde::Serialize;
use serde_json::Value;

/// Ancestor name → its data, as seen from the node being compiled.
pub type AncestryGraph = IndexMap<String, Value>;

/// Bound arguments plus the context slots left at the end of the pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub arguments: IndexMap<String, Value>,
    pub context: HashMap<String, TypedValue>,
}

/// Evaluate every argument rule of `descriptor`, in declared order.
pub fn bind(descriptor: &ProgramDescriptor, ancestry: &AncestryGraph) -> Result<IndexMap<String, Value>> {
    Ok(bind_with_context(descriptor, ancestry, &HashMap::new())?.arguments)
}

/// Like [`bind`], but the pass starts from slots captured upstream.
pub fn bind_with_context(
    descriptor: &ProgramDescriptor,
    ancestry: &AncestryGraph,
    seed: &HashMap<String, TypedValue>,
) -> Result<Binding> {
    let mut store = ContextStore::seeded(seed.clone());
    let mut arguments = IndexMap::new();

    for rule in &descriptor.argument_rules {
        check_ancestors(rule, ancestry)?;
        let mut evaluator = Evaluator {
            parameter: &rule.parameter_name,
            ancestry,
            store: &mut store,
        };
        let value = evaluator.eval(&rule.expression)?;
        arguments.insert(rule.parameter_name.clone(), value);
    }

    tracing::debug!(
        constraint = %descriptor.constraint_name,
        source = %descriptor.source_id,
        arguments = arguments.len(),
        context_slots = store.len(),
        "Bound descriptor"
    );
    Ok(Binding {
        arguments,
        context: store.close(),
    })
}

/// Combine the context slots of upstream constraints, in order; later
/// constraints win on conflicting keys.
pub fn merge_upstream_contexts<'a>(
    upstream: impl IntoIterator<Item = (&'a str, &'a HashMap<String, TypedValue>)>,
) -> HashMap<String, TypedValue> {
    let mut store = ContextStore::new();
    for (constraint, slots) in upstream {
        store.merge_from(slots, constraint);
    }
    store.close()
}

fn check_ancestors(rule: &ArgumentRule, ancestry: &AncestryGraph) -> Result<()> {
    for dependency in &rule.declared_dependencies {
        if dependency != CONTEXT_PARAMETER && !ancestry.contains_key(dependency) {
            return Err(RecipeError::MissingAncestor {
                parameter: rule.parameter_name.clone(),
                name: dependency.clone(),
            });
        }
    }
    Ok(())
}

struct Evaluator<'a> {
    parameter: &'a str,
    ancestry: &'a AncestryGraph,
    store: &'a mut ContextStore,
}

impl Evaluator<'_> {
    fn eval(&mut self, expression: &Expression) -> Result<Value> {
        match expression {
            Expression::FieldAccess { base, path } => self.field(base, path),
            Expression::Literal { value } => Ok(value.to_json()),
            Expression::Format { template, args } => {
                let mut positional = Vec::new();
                let mut named = HashMap::new();
                for arg in args {
                    let value = self.eval(&arg.value)?;
                    match &arg.name {
                        Some(name) => {
                            named.insert(name.as_str(), value);
                        }
                        None => positional.push(value),
                    }
                }
                render(template, &positional, &named).map(Value::String)
            }
            Expression::ContextCapture { key, value, type_tag } => {
                let value = self.eval(value)?;
                let typed = TypedValue::from_json(&value, *type_tag).ok_or_else(|| RecipeError::TypeMismatch {
                    key: key.clone(),
                    expected: *type_tag,
                    found: json_type_name(&value).to_string(),
                })?;
                self.store.capture(key.clone(), typed);
                Ok(value)
            }
            Expression::ContextGet { key, type_tag } => Ok(self.store.get(key, *type_tag)?.to_json()),
            Expression::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if truthy(&self.eval(condition)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn field(&self, base: &str, path: &[String]) -> Result<Value> {
        let mut current = self.ancestry.get(base).ok_or_else(|| RecipeError::MissingAncestor {
            parameter: self.parameter.to_string(),
            name: base.to_string(),
        })?;
        for (depth, field) in path.iter().enumerate() {
            current = current.get(field.as_str()).ok_or_else(|| RecipeError::MissingField {
                parameter: self.parameter.to_string(),
                base: base.to_string(),
                path: path[..=depth].join("."),
            })?;
        }
        Ok(current.clone())
    }
}

fn render(template: &str, positional: &[Value], named: &HashMap<&str, Value>) -> Result<String> {
    let pieces = parse_template(template).map_err(RecipeError::Other)?;
    let mut out = String::new();
    let mut next = 0;
    for piece in pieces {
        let value = match &piece {
            TemplatePiece::Text(text) => {
                out.push_str(text);
                continue;
            }
            TemplatePiece::Next => {
                next += 1;
                positional.get(next - 1)
            }
            TemplatePiece::Index(i) => positional.get(*i),
            TemplatePiece::Named(name) => named.get(name.as_str()),
        };
        let value = value.ok_or_else(|| {
            RecipeError::Other(format!("template \"{template}\" has no value for placeholder {piece:?}"))
        })?;
        out.push_str(&stringify(value));
    }
    Ok(out)
}

/// Text form of a value inside a formatted string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
