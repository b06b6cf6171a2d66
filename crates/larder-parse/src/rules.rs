//! Compiling the `args={...}` map of a registration call.

use larder_types::{RecipeError, Result};

use crate::ast::ArgumentRule;
use crate::call::Segment;
use crate::expression::{compile_rule, dict_entries};

/// Compile every `"param": lambda ...: expr` entry of `args`, in declaration order.
///
/// `line_of` maps a byte offset in the header to an artifact line; `args.offset`
/// is the position of the dict literal in that header.
pub fn compile_argument_rules(args: &Segment, line_of: &dyn Fn(usize) -> usize) -> Result<Vec<ArgumentRule>> {
    let entries = dict_entries(&args.text).map_err(|(offset, expected)| RecipeError::MalformedArtifact {
        line: line_of(args.offset + offset),
        message: format!("expected {expected} in args '{}'", args.text),
    })?;

    let mut rules: Vec<ArgumentRule> = Vec::new();
    for entry in entries {
        let parameter = entry.key;
        if rules.iter().any(|r| r.parameter_name == parameter) {
            return Err(RecipeError::MalformedArtifact {
                line: line_of(args.offset + entry.key_offset),
                message: format!("duplicate argument '{parameter}'"),
            });
        }

        let value_offset = args.offset + entry.value.offset;
        let rule = compile_rule(&parameter, &entry.value.text, &|offset| line_of(value_offset + offset))?;
        tracing::trace!(parameter = %parameter, dependencies = ?rule.declared_dependencies, "Compiled argument rule");
        rules.push(rule);
    }
    Ok(rules)
}
