//! CLI binary for compiling, registering, linting, and binding recipes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use larder_parse::{ArtifactCompiler, CompileOptions, ProgramDescriptor, RawArtifact};
use larder_registry::{
    bind_with_context, build_registry_concurrent, build_registry_from_sources, validate, AncestryGraph,
    ConstraintProgramRegistry, RegistryManifest, Severity,
};
use larder_types::{Dialect, TypedValue};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "larder", version, about = "Constraint recipe compiler and registry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile one artifact and print its descriptors as JSON
    Compile {
        /// Path to the artifact
        artifact: PathBuf,

        /// Artifact dialect (default: inferred from the file extension)
        #[arg(short, long)]
        dialect: Option<Dialect>,

        /// Annotation name that introduces a native registration
        #[arg(long)]
        annotation: Option<String>,

        /// Name of the native payload function
        #[arg(long)]
        payload_function: Option<String>,
    },

    /// Build the registry described by a manifest and summarize it
    Build {
        /// Path to the registry manifest (.json)
        manifest: PathBuf,

        /// Read and compile artifacts concurrently
        #[arg(long)]
        concurrent: bool,

        /// Print the whole registry as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the candidates registered for a constraint
    Candidates {
        /// Path to the registry manifest (.json)
        manifest: PathBuf,

        /// Constraint name
        constraint: String,
    },

    /// Bind a candidate's argument rules against ancestry data
    Bind {
        /// Path to the registry manifest (.json)
        manifest: PathBuf,

        /// Constraint name
        constraint: String,

        /// Ancestry JSON object: ancestor name -> data
        #[arg(short, long)]
        ancestry: PathBuf,

        /// Which candidate to bind, in registration order
        #[arg(short, long, default_value = "0")]
        candidate: usize,

        /// Context slots captured upstream (JSON object)
        #[arg(long)]
        context: Option<PathBuf>,
    },

    /// Lint the registry described by a manifest
    Lint {
        /// Path to the registry manifest (.json)
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Compile {
            artifact,
            dialect,
            annotation,
            payload_function,
        } => {
            cmd_compile(&artifact, dialect, annotation, payload_function)?;
        }
        Commands::Build {
            manifest,
            concurrent,
            json,
        } => {
            cmd_build(&manifest, concurrent, json).await?;
        }
        Commands::Candidates { manifest, constraint } => {
            cmd_candidates(&manifest, &constraint).await?;
        }
        Commands::Bind {
            manifest,
            constraint,
            ancestry,
            candidate,
            context,
        } => {
            cmd_bind(&manifest, &constraint, &ancestry, candidate, context.as_deref()).await?;
        }
        Commands::Lint { manifest } => {
            cmd_lint(&manifest).await?;
        }
    }

    Ok(())
}

async fn load_registry(path: &Path, concurrent: bool) -> anyhow::Result<(RegistryManifest, ConstraintProgramRegistry)> {
    let manifest = RegistryManifest::load(path)
        .await
        .with_context(|| format!("loading manifest {}", path.display()))?;
    let registry = if concurrent {
        build_registry_concurrent(&manifest.sources).await?
    } else {
        build_registry_from_sources(&manifest.sources)?
    };
    tracing::debug!(manifest = %path.display(), concurrent, "Registry loaded");
    Ok((manifest, registry))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn cmd_compile(
    path: &Path,
    dialect: Option<Dialect>,
    annotation: Option<String>,
    payload_function: Option<String>,
) -> anyhow::Result<()> {
    let dialect = match dialect.or_else(|| Dialect::from_path(path)) {
        Some(d) => d,
        None => anyhow::bail!("Cannot infer dialect of {}; pass --dialect", path.display()),
    };

    let mut options = CompileOptions::default();
    if let Some(annotation) = annotation {
        options.annotation = annotation;
    }
    if let Some(payload_function) = payload_function {
        options.payload_function = payload_function;
    }

    let artifact = RawArtifact::load(path, dialect)?;
    let descriptors = ArtifactCompiler::new(options).compile(&artifact)?;
    println!("{}", serde_json::to_string_pretty(&descriptors)?);
    Ok(())
}

async fn cmd_build(path: &Path, concurrent: bool, json: bool) -> anyhow::Result<()> {
    let (_, registry) = load_registry(path, concurrent).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&registry)?);
        return Ok(());
    }

    println!("Constraints: {}", registry.len());
    println!("Programs: {}", registry.program_count());
    println!("\nConstraints:");
    for (constraint, candidates) in registry.iter() {
        let dialects: Vec<_> = candidates.iter().map(|d| d.dialect.as_str()).collect();
        println!("  {} [{}]", constraint, dialects.join(", "));
    }
    Ok(())
}

#[derive(Serialize)]
struct CandidateSummary<'a> {
    index: usize,
    dialect: Dialect,
    entrypoint: &'a str,
    source: &'a str,
    parameters: Vec<&'a str>,
}

impl<'a> CandidateSummary<'a> {
    fn new(index: usize, descriptor: &'a ProgramDescriptor) -> Self {
        Self {
            index,
            dialect: descriptor.dialect,
            entrypoint: &descriptor.entrypoint,
            source: &descriptor.source_id,
            parameters: descriptor.parameter_names().collect(),
        }
    }
}

async fn cmd_candidates(path: &Path, constraint: &str) -> anyhow::Result<()> {
    let (_, registry) = load_registry(path, false).await?;
    let candidates = registry.candidates_for(constraint);
    if candidates.is_empty() {
        println!("No candidates registered for {constraint}");
        return Ok(());
    }

    let summaries: Vec<_> = candidates
        .iter()
        .enumerate()
        .map(|(i, d)| CandidateSummary::new(i, d))
        .collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

async fn cmd_bind(
    path: &Path,
    constraint: &str,
    ancestry: &Path,
    candidate: usize,
    context: Option<&Path>,
) -> anyhow::Result<()> {
    let (_, registry) = load_registry(path, false).await?;
    let candidates = registry.candidates_for(constraint);
    let descriptor = candidates.get(candidate).with_context(|| {
        format!(
            "Constraint {constraint} has {} candidate(s); no candidate {candidate}",
            candidates.len()
        )
    })?;

    let ancestry: AncestryGraph = read_json(ancestry)?;
    let seed: HashMap<String, TypedValue> = match context {
        Some(p) => read_json(p)?,
        None => HashMap::new(),
    };

    let binding = bind_with_context(descriptor, &ancestry, &seed)?;
    let context: BTreeMap<_, _> = binding.context.iter().collect();
    let output = serde_json::json!({
        "constraint": constraint,
        "source": descriptor.source_id,
        "arguments": binding.arguments,
        "context": context,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_lint(path: &Path) -> anyhow::Result<()> {
    let (manifest, registry) = load_registry(path, false).await?;
    let diagnostics = validate(&registry, &manifest.lint_config());

    if diagnostics.is_empty() {
        println!("Registry is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.source_id {
            Some(source) => println!("[{}] {} ({}): {}", severity, diag.rule, source, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bind_defaults_to_first_candidate() {
        let cli = Cli::parse_from(["larder", "bind", "larder.json", "MakeDir", "--ancestry", "a.json"]);
        match cli.command {
            Commands::Bind { candidate, context, .. } => {
                assert_eq!(candidate, 0);
                assert!(context.is_none());
            }
            _ => panic!("expected bind"),
        }
    }

    #[test]
    fn dialect_flag_accepts_aliases() {
        let cli = Cli::parse_from(["larder", "compile", "x.txt", "--dialect", "sql"]);
        match cli.command {
            Commands::Compile { dialect, .. } => assert_eq!(dialect, Some(Dialect::Query)),
            _ => panic!("expected compile"),
        }
    }
}
