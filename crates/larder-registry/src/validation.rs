//! Registry validation: lint rules and diagnostics.
//!
//! Checks a built [`ConstraintProgramRegistry`] for problems that only surface
//! at bind time or in the downstream compiler: context keys read but never
//! captured, conflicting slot types, ambiguous same-dialect candidates, and
//! malformed hand-built descriptors. Call [`validate`] for advisory
//! diagnostics or [`validate_or_raise`] to fail on any `Error`-severity issue.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use larder_parse::{parse_template, Dialect, Expression, ProgramDescriptor, TemplatePiece, CONTEXT_PARAMETER};
use larder_types::{RecipeError, Result, TypeTag};
use serde::{Deserialize, Serialize};

use crate::registry::ConstraintProgramRegistry;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub constraint: Option<String>,
    pub source_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

/// Knobs for rules that need facts outside the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LintConfig {
    /// Ancestor names the host model can provide. `None` disables `unknown_ancestor`.
    pub known_ancestors: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, registry: &ConstraintProgramRegistry, config: &LintConfig) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn diagnostic(
    rule: &dyn LintRule,
    severity: Severity,
    descriptor: &ProgramDescriptor,
    message: String,
    fix: Option<String>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        constraint: Some(descriptor.constraint_name.clone()),
        source_id: Some(descriptor.source_id.clone()),
        fix,
    }
}

/// Every sub-expression of every rule, in evaluation order.
fn expressions(descriptor: &ProgramDescriptor) -> Vec<&Expression> {
    let mut out = Vec::new();
    for rule in &descriptor.argument_rules {
        rule.expression.walk(&mut |e| out.push(e));
    }
    out
}

/// Context keys captured per source artifact, with the tags they are captured as.
fn captures_by_source(registry: &ConstraintProgramRegistry) -> IndexMap<&str, Vec<(&str, TypeTag)>> {
    let mut seen = HashSet::new();
    let mut out: IndexMap<&str, Vec<(&str, TypeTag)>> = IndexMap::new();
    for descriptor in registry.descriptors() {
        if !seen.insert(descriptor.source_id.as_str()) {
            continue;
        }
        let captures = out.entry(descriptor.source_id.as_str()).or_default();
        for expression in expressions(descriptor) {
            if let Expression::ContextCapture { key, type_tag, .. } = expression {
                captures.push((key.as_str(), *type_tag));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct GetWithoutCaptureRule;
impl LintRule for GetWithoutCaptureRule {
    fn name(&self) -> &str { "get_without_capture" }
    fn apply(&self, registry: &ConstraintProgramRegistry, _config: &LintConfig) -> Vec<Diagnostic> {
        let captures = captures_by_source(registry);
        let mut diags = Vec::new();
        for descriptor in registry.descriptors() {
            let elsewhere = |key: &str| {
                captures
                    .iter()
                    .filter(|(source, _)| **source != descriptor.source_id)
                    .any(|(_, keys)| keys.iter().any(|(k, _)| *k == key))
            };
            let mut captured_here = HashSet::new();
            for expression in expressions(descriptor) {
                match expression {
                    Expression::ContextCapture { key, .. } => {
                        captured_here.insert(key.as_str());
                    }
                    Expression::ContextGet { key, .. } if !captured_here.contains(key.as_str()) && !elsewhere(key.as_str()) => {
                        diags.push(diagnostic(
                            self,
                            Severity::Warning,
                            descriptor,
                            format!(
                                "'{}' from '{}' reads context key '{key}', which no earlier rule or other recipe captures",
                                descriptor.constraint_name, descriptor.source_id
                            ),
                            Some(format!("Capture '{key}' in an earlier argument rule")),
                        ));
                    }
                    _ => {}
                }
            }
        }
        diags
    }
}

struct CaptureTypeConflictRule;
impl LintRule for CaptureTypeConflictRule {
    fn name(&self) -> &str { "capture_type_conflict" }
    fn apply(&self, registry: &ConstraintProgramRegistry, _config: &LintConfig) -> Vec<Diagnostic> {
        let mut tags: IndexMap<&str, Vec<TypeTag>> = IndexMap::new();
        for captures in captures_by_source(registry).values() {
            for (key, tag) in captures {
                let entry = tags.entry(*key).or_default();
                if !entry.contains(tag) {
                    entry.push(*tag);
                }
            }
        }
        tags.into_iter()
            .filter(|(_, tags)| tags.len() > 1)
            .map(|(key, tags)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Context key '{key}' is captured as {}",
                    tags.iter().map(ToString::to_string).collect::<Vec<_>>().join(" and ")
                ),
                constraint: None,
                source_id: None,
                fix: Some(format!("Capture '{key}' with a single type everywhere")),
            })
            .collect()
    }
}

struct GetTypeMismatchRule;
impl LintRule for GetTypeMismatchRule {
    fn name(&self) -> &str { "get_type_mismatch" }
    fn apply(&self, registry: &ConstraintProgramRegistry, _config: &LintConfig) -> Vec<Diagnostic> {
        let mut produced: HashMap<&str, Vec<TypeTag>> = HashMap::new();
        for captures in captures_by_source(registry).values() {
            for (key, tag) in captures {
                produced.entry(*key).or_default().push(*tag);
            }
        }
        let mut diags = Vec::new();
        for descriptor in registry.descriptors() {
            for expression in expressions(descriptor) {
                let Expression::ContextGet { key, type_tag } = expression else {
                    continue;
                };
                if let Some(tags) = produced.get(key.as_str()) {
                    if !tags.contains(type_tag) {
                        diags.push(diagnostic(
                            self,
                            Severity::Warning,
                            descriptor,
                            format!("Context key '{key}' is read as {type_tag} but only captured as {}", tags[0]),
                            Some(format!("Read '{key}' as {}", tags[0])),
                        ));
                    }
                }
            }
        }
        diags
    }
}

struct SameDialectCandidatesRule;
impl LintRule for SameDialectCandidatesRule {
    fn name(&self) -> &str { "same_dialect_candidates" }
    fn apply(&self, registry: &ConstraintProgramRegistry, _config: &LintConfig) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (constraint, candidates) in registry.iter() {
            let mut counts: IndexMap<Dialect, usize> = IndexMap::new();
            for candidate in candidates {
                *counts.entry(candidate.dialect).or_default() += 1;
            }
            for (dialect, count) in counts.into_iter().filter(|(_, n)| *n > 1) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Info,
                    message: format!(
                        "Constraint '{constraint}' has {count} {dialect} candidates; the first registered is preferred"
                    ),
                    constraint: Some(constraint.to_string()),
                    source_id: None,
                    fix: None,
                });
            }
        }
        diags
    }
}

struct UnknownAncestorRule;
impl LintRule for UnknownAncestorRule {
    fn name(&self) -> &str { "unknown_ancestor" }
    fn apply(&self, registry: &ConstraintProgramRegistry, config: &LintConfig) -> Vec<Diagnostic> {
        let Some(known) = &config.known_ancestors else {
            return vec![];
        };
        let mut diags = Vec::new();
        for descriptor in registry.descriptors() {
            for rule in &descriptor.argument_rules {
                for dependency in &rule.declared_dependencies {
                    if dependency != CONTEXT_PARAMETER && !known.contains(dependency) {
                        diags.push(diagnostic(
                            self,
                            Severity::Warning,
                            descriptor,
                            format!(
                                "Argument '{}' depends on '{dependency}', which is not a known ancestor",
                                rule.parameter_name
                            ),
                            Some(format!("Rename the lambda parameter or add '{dependency}' to known_ancestors")),
                        ));
                    }
                }
            }
        }
        diags
    }
}

struct EmptyEntrypointRule;
impl LintRule for EmptyEntrypointRule {
    fn name(&self) -> &str { "empty_entrypoint" }
    fn apply(&self, registry: &ConstraintProgramRegistry, _config: &LintConfig) -> Vec<Diagnostic> {
        registry
            .descriptors()
            .filter(|d| d.dialect != Dialect::Query && d.entrypoint.trim().is_empty())
            .map(|d| {
                diagnostic(
                    self,
                    Severity::Warning,
                    d,
                    format!("{} recipe for '{}' has no entrypoint", d.dialect, d.constraint_name),
                    Some("Add entrypoint=\"...\" to the registration call".into()),
                )
            })
            .collect()
    }
}

/// Descriptors handed in by a host loader skip compile-time checks; this
/// re-checks what the compiler would have rejected.
struct RuleWellFormedRule;
impl LintRule for RuleWellFormedRule {
    fn name(&self) -> &str { "rule_well_formed" }
    fn apply(&self, registry: &ConstraintProgramRegistry, _config: &LintConfig) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for descriptor in registry.descriptors() {
            for rule in &descriptor.argument_rules {
                let mut problems = Vec::new();
                rule.expression.walk(&mut |e| match e {
                    Expression::FieldAccess { base, .. }
                        if base == CONTEXT_PARAMETER || !rule.declared_dependencies.contains(base) =>
                    {
                        problems.push(format!("reads '{base}', which is not a declared dependency"));
                    }
                    Expression::ContextCapture { .. } | Expression::ContextGet { .. } if !rule.uses_context() => {
                        problems.push(format!("uses the context without a '{CONTEXT_PARAMETER}' parameter"));
                    }
                    Expression::Format { template, args } => {
                        if let Err(problem) = check_template(template, args.iter().map(|a| a.name.as_deref())) {
                            problems.push(problem);
                        }
                    }
                    _ => {}
                });
                for problem in problems {
                    diags.push(diagnostic(
                        self,
                        Severity::Error,
                        descriptor,
                        format!("Argument '{}' {problem}", rule.parameter_name),
                        None,
                    ));
                }
            }
        }
        diags
    }
}

fn check_template<'a>(template: &str, args: impl Iterator<Item = Option<&'a str>>) -> std::result::Result<(), String> {
    let pieces = parse_template(template)?;
    let names: Vec<Option<&str>> = args.collect();
    let positional = names.iter().filter(|n| n.is_none()).count();
    let mut next = 0;
    for piece in &pieces {
        let ok = match piece {
            TemplatePiece::Text(_) => true,
            TemplatePiece::Next => {
                next += 1;
                next <= positional
            }
            TemplatePiece::Index(i) => *i < positional,
            TemplatePiece::Named(n) => names.contains(&Some(n.as_str())),
        };
        if !ok {
            return Err(format!("has template \"{template}\" with an unfilled placeholder"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(registry: &ConstraintProgramRegistry, config: &LintConfig) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(RuleWellFormedRule),
        Box::new(GetWithoutCaptureRule),
        Box::new(CaptureTypeConflictRule),
        Box::new(GetTypeMismatchRule),
        Box::new(SameDialectCandidatesRule),
        Box::new(UnknownAncestorRule),
        Box::new(EmptyEntrypointRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(registry, config));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(registry: &ConstraintProgramRegistry, config: &LintConfig) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(registry, config);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(RecipeError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use larder_parse::{compile_artifact, ArgumentRule, FormatArg, RawArtifact};

    fn query(source: &str, constraint: &str, args: &str) -> ProgramDescriptor {
        let text = format!("/***\n@register(REG, {constraint}, args={{\n{args}\n}})\n***/\nSELECT 1;\n");
        compile_artifact(&RawArtifact::new(text, Dialect::Query, source))
            .unwrap()
            .remove(0)
    }

    fn registry(descriptors: Vec<ProgramDescriptor>) -> ConstraintProgramRegistry {
        let mut builder = RegistryBuilder::new();
        for d in descriptors {
            builder.register(d.constraint_name.clone(), d);
        }
        builder.build()
    }

    fn rules_fired(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn clean_registry_has_no_diagnostics() {
        let r = registry(vec![query(
            "a.sql",
            "A",
            "\"d\": lambda t, context: capture('delim', t.delim),\n\"s\": lambda context: get('delim'),",
        )]);
        assert!(validate(&r, &LintConfig::default()).is_empty());
    }

    #[test]
    fn get_without_capture_warns() {
        let r = registry(vec![query("a.sql", "A", "\"s\": lambda context: get('delim'),")]);
        let diags = validate(&r, &LintConfig::default());
        assert_eq!(rules_fired(&diags), vec!["get_without_capture"]);
        assert_eq!(diags[0].severity, Severity::Warning);
    }

    #[test]
    fn capture_in_another_recipe_satisfies_get() {
        let r = registry(vec![
            query("up.sql", "Up", "\"d\": lambda context: capture('delim', ','),"),
            query("down.sql", "Down", "\"s\": lambda context: get('delim'),"),
        ]);
        assert!(validate(&r, &LintConfig::default()).is_empty());
    }

    #[test]
    fn type_conflicts_and_mismatched_reads() {
        let r = registry(vec![
            query("a.sql", "A", "\"d\": lambda context: capture('n', 1),"),
            query("b.sql", "B", "\"d\": lambda context: capture('n', 'one'),"),
            query("c.sql", "C", "\"g\": lambda context: get_bool('n'),"),
        ]);
        let diags = validate(&r, &LintConfig::default());
        let fired = rules_fired(&diags);
        assert!(fired.contains(&"capture_type_conflict"));
        assert!(fired.contains(&"get_type_mismatch"));
    }

    #[test]
    fn same_dialect_candidates_is_info() {
        let r = registry(vec![query("a1.sql", "C", "\"x\": lambda t: t.x,"), query("a2.sql", "C", "\"x\": lambda t: t.x,")]);
        let diags = validate(&r, &LintConfig::default());
        assert_eq!(rules_fired(&diags), vec!["same_dialect_candidates"]);
        assert_eq!(diags[0].severity, Severity::Info);
    }

    #[test]
    fn unknown_ancestor_only_with_config() {
        let r = registry(vec![query("a.sql", "A", "\"x\": lambda tabel: tabel.name,")]);
        assert!(validate(&r, &LintConfig::default()).is_empty());
        let config = LintConfig {
            known_ancestors: Some(vec!["table".into()]),
        };
        assert_eq!(rules_fired(&validate(&r, &config)), vec!["unknown_ancestor"]);
    }

    #[test]
    fn empty_entrypoint_warns_for_shell() {
        let mut d = query("a.sh", "A", "");
        d.dialect = Dialect::Shell;
        let diags = validate(&registry(vec![d]), &LintConfig::default());
        assert_eq!(rules_fired(&diags), vec!["empty_entrypoint"]);
    }

    #[test]
    fn hand_built_descriptor_errors_fail_validate_or_raise() {
        let mut d = query("host", "A", "");
        d.argument_rules.push(ArgumentRule {
            parameter_name: "p".into(),
            declared_dependencies: vec!["t".into()],
            expression: Expression::Format {
                template: "{}-{}".into(),
                args: vec![FormatArg {
                    name: None,
                    value: Expression::FieldAccess {
                        base: "u".into(),
                        path: vec![],
                    },
                }],
            },
        });
        let r = registry(vec![d]);
        let diags = validate(&r, &LintConfig::default());
        assert_eq!(rules_fired(&diags), vec!["rule_well_formed", "rule_well_formed"]);
        let err = validate_or_raise(&r, &LintConfig::default()).unwrap_err();
        assert!(matches!(err, RecipeError::ValidationError(_)));
    }
}
