//! The constraint program registry.

use indexmap::IndexMap;
use larder_parse::ProgramDescriptor;
use serde::{Deserialize, Serialize};

/// Constraint name → candidate implementations, in registration order.
///
/// Built only through [`RegistryBuilder`]; read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintProgramRegistry {
    entries: IndexMap<String, Vec<ProgramDescriptor>>,
}

impl ConstraintProgramRegistry {
    /// Candidates registered for `constraint`; empty when none are.
    pub fn candidates_for(&self, constraint: &str) -> &[ProgramDescriptor] {
        self.entries.get(constraint).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Constraint names in first-registration order.
    pub fn constraint_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of constraints with at least one candidate.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of registered descriptors.
    pub fn program_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ProgramDescriptor])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Every descriptor, grouped by constraint.
    pub fn descriptors(&self) -> impl Iterator<Item = &ProgramDescriptor> {
        self.entries.values().flatten()
    }
}

/// Accumulates descriptors in order and produces a registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: IndexMap<String, Vec<ProgramDescriptor>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `descriptor` to the candidates of `constraint`.
    pub fn register(&mut self, constraint: impl Into<String>, descriptor: ProgramDescriptor) {
        let constraint = constraint.into();
        tracing::trace!(constraint = %constraint, source = %descriptor.source_id, "Registered candidate");
        self.entries.entry(constraint).or_default().push(descriptor);
    }

    pub fn build(self) -> ConstraintProgramRegistry {
        ConstraintProgramRegistry { entries: self.entries }
    }
}
