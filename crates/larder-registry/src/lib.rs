//! Constraint program registry, ancestry binder, and registry lint.
//!
//! Builds a [`ConstraintProgramRegistry`] from compiled recipe artifacts,
//! binds a chosen candidate's argument rules against ancestry data, and lints
//! a registry for context slots that cannot be satisfied.

pub mod binder;
pub mod manifest;
pub mod registry;
pub mod sources;
pub mod validation;

pub use binder::{bind, bind_with_context, merge_upstream_contexts, stringify, truthy, AncestryGraph, Binding};
pub use manifest::RegistryManifest;
pub use registry::{ConstraintProgramRegistry, RegistryBuilder};
pub use sources::{
    build_registry, build_registry_concurrent, build_registry_from_sources, compile_native_sources,
    ArtifactSources,
};
pub use validation::{validate, validate_or_raise, Diagnostic, LintConfig, LintRule, Severity};
