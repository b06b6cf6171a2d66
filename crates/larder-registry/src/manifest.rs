//! JSON registry manifests: which artifacts to load, and lint facts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sources::ArtifactSources;
use crate::validation::LintConfig;

/// A manifest file listing artifact paths per dialect.
///
/// ```json
/// {
///   "native": ["recipes/upload.py"],
///   "shell": ["recipes/mkdir.sh"],
///   "query": ["recipes/schema.sql"],
///   "options": { "annotation": "register", "payload_function": "recipe" },
///   "known_ancestors": ["table", "universe"]
/// }
/// ```
///
/// Relative paths resolve against the manifest's directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryManifest {
    #[serde(flatten)]
    pub sources: ArtifactSources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_ancestors: Option<Vec<String>>,
}

impl RegistryManifest {
    pub async fn load(path: &Path) -> larder_types::Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let mut manifest: RegistryManifest = serde_json::from_str(&json)?;
        if let Some(dir) = path.parent() {
            manifest.resolve_relative_to(dir);
        }
        tracing::debug!(
            path = %path.display(),
            artifacts = manifest.sources.artifact_count(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    fn resolve_relative_to(&mut self, dir: &Path) {
        let sources = &mut self.sources;
        for paths in [
            &mut sources.native,
            &mut sources.shell,
            &mut sources.query,
            &mut sources.statistical,
        ] {
            for path in paths.iter_mut() {
                if path.is_relative() {
                    *path = dir.join(&*path);
                }
            }
        }
    }

    pub fn lint_config(&self) -> LintConfig {
        LintConfig {
            known_ancestors: self.known_ancestors.clone(),
        }
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &PathBuf> {
        larder_types::Dialect::ALL
            .into_iter()
            .flat_map(move |d| self.sources.paths(d).iter())
    }
}
