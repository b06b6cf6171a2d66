//! Artifact compilation: header, body and rules into program descriptors.

use larder_types::{Dialect, Result};
use serde::{Deserialize, Serialize};

use crate::ast::{ProgramDescriptor, RawArtifact};
use crate::body::slice_body;
use crate::call::{parse_registration, Registration};
use crate::header::{extract_header, lines_with_offsets, HeaderSpan};
use crate::rules::compile_argument_rules;

/// Names that introduce a native recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Decorator name: `@<annotation>(...)`.
    pub annotation: String,
    /// Payload function name: `def <payload_function>(...)`.
    pub payload_function: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            annotation: "register".into(),
            payload_function: "recipe".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactCompiler {
    options: CompileOptions,
}

impl ArtifactCompiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile one artifact into a descriptor per constraint it registers for.
    pub fn compile(&self, artifact: &RawArtifact) -> Result<Vec<ProgramDescriptor>> {
        let text = artifact.text.as_str();
        let span = extract_header(text, artifact.dialect, &self.options)?;
        let line_of = |offset: usize| span.line_at(offset);
        let registration = parse_registration(&span.interior, &line_of)?;
        let body = slice_body(text, &span, artifact.dialect)?;
        let argument_rules = match &registration.args {
            Some(args) => compile_argument_rules(args, &line_of)?,
            None => Vec::new(),
        };
        let entrypoint = self.entrypoint(artifact.dialect, &span, &registration);

        tracing::debug!(
            artifact = %artifact.source_id,
            dialect = %artifact.dialect,
            constraints = ?registration.constraints,
            rules = argument_rules.len(),
            "Compiled artifact"
        );

        Ok(registration
            .constraints
            .iter()
            .map(|constraint| ProgramDescriptor {
                constraint_name: constraint.clone(),
                entrypoint: entrypoint.clone(),
                dialect: artifact.dialect,
                preamble: registration.preamble.clone().unwrap_or_default(),
                body: body.clone(),
                argument_rules: argument_rules.clone(),
                extra_requirements: registration.requirements.clone(),
                source_id: artifact.source_id.clone(),
            })
            .collect())
    }

    fn entrypoint(&self, dialect: Dialect, span: &HeaderSpan, registration: &Registration) -> String {
        if let Some(entrypoint) = &registration.entrypoint {
            return entrypoint.clone();
        }
        match dialect {
            Dialect::Native => self.options.payload_function.clone(),
            d if d.entrypoint_from_header() => header_entrypoint(&span.interior, registration),
            _ => String::new(),
        }
    }
}

/// Compile with the default native introducers.
pub fn compile_artifact(artifact: &RawArtifact) -> Result<Vec<ProgramDescriptor>> {
    ArtifactCompiler::default().compile(artifact)
}

/// Last non-empty header line after the registration call, or else the last
/// line of the call itself.
fn header_entrypoint(interior: &str, registration: &Registration) -> String {
    let last_line = |text: &str| {
        lines_with_offsets(text)
            .map(|(_, _, line)| line.trim())
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
    };
    last_line(&interior[registration.end..])
        .or_else(|| last_line(&interior[..registration.end]))
        .unwrap_or_default()
}
