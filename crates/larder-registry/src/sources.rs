//! Loading artifacts from disk and assembling the registry.
//!
//! [`build_registry`] is the serial, all-or-nothing build: host-loaded native
//! descriptors first, then shell, query and statistical artifacts in the order
//! given. [`build_registry_concurrent`] reads and compiles every artifact in
//! parallel and merges the results in the same order, so both produce
//! identical registries.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use larder_parse::{ArtifactCompiler, CompileOptions, ProgramDescriptor, RawArtifact};
use larder_types::{Dialect, RecipeError, Result};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};

use crate::registry::{ConstraintProgramRegistry, RegistryBuilder};

/// Artifact paths per dialect, plus the options used to compile native ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSources {
    pub native: Vec<PathBuf>,
    pub shell: Vec<PathBuf>,
    pub query: Vec<PathBuf>,
    pub statistical: Vec<PathBuf>,
    pub options: CompileOptions,
}

impl ArtifactSources {
    pub fn paths(&self, dialect: Dialect) -> &[PathBuf] {
        match dialect {
            Dialect::Native => &self.native,
            Dialect::Shell => &self.shell,
            Dialect::Query => &self.query,
            Dialect::Statistical => &self.statistical,
        }
    }

    pub fn artifact_count(&self) -> usize {
        Dialect::ALL.iter().map(|d| self.paths(*d).len()).sum()
    }
}

/// Build a registry from host-provided native descriptors and artifact paths.
///
/// Native pairs are registered first, then every shell, query and statistical
/// artifact in order. The first failing artifact aborts the build with
/// [`RecipeError::RegistryBuild`] naming it.
pub fn build_registry(
    native: Vec<(String, ProgramDescriptor)>,
    shell_paths: &[PathBuf],
    query_paths: &[PathBuf],
    statistical_paths: &[PathBuf],
) -> Result<ConstraintProgramRegistry> {
    let compiler = ArtifactCompiler::default();
    let mut builder = RegistryBuilder::new();

    let native_count = native.len();
    for (constraint, descriptor) in native {
        builder.register(constraint, descriptor);
    }

    let categories = [
        (Dialect::Shell, shell_paths),
        (Dialect::Query, query_paths),
        (Dialect::Statistical, statistical_paths),
    ];
    for (dialect, paths) in categories {
        for path in paths {
            for descriptor in compile_path(&compiler, path, dialect)? {
                builder.register(descriptor.constraint_name.clone(), descriptor);
            }
        }
    }

    let registry = builder.build();
    tracing::info!(
        constraints = registry.len(),
        programs = registry.program_count(),
        native = native_count,
        "Registry built"
    );
    Ok(registry)
}

/// Serial build of everything listed in `sources`, native artifacts included.
pub fn build_registry_from_sources(sources: &ArtifactSources) -> Result<ConstraintProgramRegistry> {
    let native = compile_native_sources(&sources.native, &sources.options)?;
    build_registry(native, &sources.shell, &sources.query, &sources.statistical)
}

/// Compile native artifacts into `(constraint, descriptor)` pairs, in order.
pub fn compile_native_sources(
    paths: &[PathBuf],
    options: &CompileOptions,
) -> Result<Vec<(String, ProgramDescriptor)>> {
    let compiler = ArtifactCompiler::new(options.clone());
    let mut pairs = Vec::new();
    for path in paths {
        for descriptor in compile_path(&compiler, path, Dialect::Native)? {
            pairs.push((descriptor.constraint_name.clone(), descriptor));
        }
    }
    Ok(pairs)
}

fn compile_path(compiler: &ArtifactCompiler, path: &Path, dialect: Dialect) -> Result<Vec<ProgramDescriptor>> {
    let artifact_id = path.display().to_string();
    let artifact = RawArtifact::load(path, dialect).map_err(|e| e.in_artifact(&artifact_id))?;
    compiler.compile(&artifact).map_err(|e| e.in_artifact(artifact_id))
}

/// Read and compile every artifact concurrently, then merge in
/// (dialect, position) order.
///
/// The result is identical to [`build_registry_from_sources`]. When several
/// artifacts fail, the error reported is the one the serial build would hit first.
pub async fn build_registry_concurrent(sources: &ArtifactSources) -> Result<ConstraintProgramRegistry> {
    let mut tasks = JoinSet::new();
    let mut positions = HashMap::new();
    for (category, dialect) in Dialect::ALL.into_iter().enumerate() {
        for (index, path) in sources.paths(dialect).iter().enumerate() {
            let compiler = ArtifactCompiler::new(sources.options.clone());
            let task_path = path.clone();
            let handle = tasks.spawn(async move { compile_path_async(&compiler, &task_path, dialect).await });
            positions.insert(handle.id(), ((category, index), path.display().to_string()));
        }
    }

    let mut compiled = BTreeMap::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => {
                let id = e.id();
                let artifact_id = positions.get(&id).map(|(_, a)| a.as_str()).unwrap_or_default();
                (id, Err(task_failure(e, artifact_id)))
            }
        };
        if let Some((position, _)) = positions.remove(&id) {
            compiled.insert(position, result);
        }
    }

    let mut builder = RegistryBuilder::new();
    for (_, result) in compiled {
        for descriptor in result? {
            builder.register(descriptor.constraint_name.clone(), descriptor);
        }
    }

    let registry = builder.build();
    tracing::info!(
        constraints = registry.len(),
        programs = registry.program_count(),
        artifacts = sources.artifact_count(),
        "Registry built concurrently"
    );
    Ok(registry)
}

/// A compile task that panicked or was cancelled, attributed to its artifact.
fn task_failure(err: JoinError, artifact_id: &str) -> RecipeError {
    RecipeError::Other(format!("artifact compile task failed: {err}")).in_artifact(artifact_id)
}

async fn compile_path_async(
    compiler: &ArtifactCompiler,
    path: &Path,
    dialect: Dialect,
) -> Result<Vec<ProgramDescriptor>> {
    let artifact_id = path.display().to_string();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RecipeError::from(e).in_artifact(&artifact_id))?;
    tracing::debug!(artifact = %artifact_id, bytes = text.len(), "Artifact read");
    let artifact = RawArtifact::new(text, dialect, artifact_id.clone());
    compiler.compile(&artifact).map_err(|e| e.in_artifact(artifact_id))
}
