//! End-to-end tests: artifacts on disk -> registry -> lint -> bind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use larder_registry::{
    bind, bind_with_context, build_registry, build_registry_concurrent, build_registry_from_sources,
    merge_upstream_contexts, validate, AncestryGraph, ArtifactSources, RegistryManifest, Severity,
};
use larder_types::{Dialect, RecipeError, TypedValue};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn ancestry(pairs: &[(&str, serde_json::Value)]) -> AncestryGraph {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

const LOAD_SQL: &str = "/***\n@register(REG, LoadCsv, args={\n    \"delim\": lambda table, context: capture('delim', table.delim),\n    \"target\": lambda table: \"{}.{}\".format(table.schema, table.name),\n    \"sep\": lambda context: get('delim'),\n})\n***/\nCOPY {target} FROM STDIN DELIMITER '{sep}';\n";

const REVERSED_SQL: &str = "/***\n@register(REG, LoadCsv, args={\n    \"sep\": lambda context: get('delim'),\n    \"delim\": lambda table, context: capture('delim', table.delim),\n})\n***/\nCOPY t FROM STDIN DELIMITER '{sep}';\n";

const MKDIR_SH: &str = "###+\n# @register(REG, MakeDir, args={\"path\": lambda d: d.path})\n# make_dir\n###+\nmkdir -p {path}\n";

const MKDIR_PY: &str = "@register(programs, MakeDir, args={\"path\": lambda d: d.path})\ndef recipe(path):\n    os.makedirs(path, exist_ok=True)\n";

const MKDIR_SQL: &str = "/***\n@register(REG, MakeDir)\n***/\nCREATE SCHEMA IF NOT EXISTS x;\n";

const MKDIR_R: &str = "###+\n# @register(\n#     REG,\n#     MakeDir,\n#     args={\"path\": lambda d: d.path},\n#     preamble=\"library(fs)\",\n# )\n# make_dir\n###+\nmake_dir <- function(path) dir_create(path)\n";

fn fixture(dir: &Path) -> ArtifactSources {
    ArtifactSources {
        native: vec![write(dir, "mkdir.py", MKDIR_PY)],
        shell: vec![write(dir, "mkdir.sh", MKDIR_SH)],
        query: vec![write(dir, "mkdir.sql", MKDIR_SQL), write(dir, "load.sql", LOAD_SQL)],
        statistical: vec![write(dir, "mkdir.R", MKDIR_R)],
        options: Default::default(),
    }
}

// ---------------------------------------------------------------------------
// Registry assembly
// ---------------------------------------------------------------------------

#[test]
fn candidates_follow_category_then_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = build_registry_from_sources(&fixture(dir.path())).unwrap();

    let dialects: Vec<_> = registry.candidates_for("MakeDir").iter().map(|d| d.dialect).collect();
    assert_eq!(
        dialects,
        vec![Dialect::Native, Dialect::Shell, Dialect::Query, Dialect::Statistical]
    );
    assert_eq!(registry.candidates_for("MakeDir")[1].entrypoint, "make_dir");

    let statistical = &registry.candidates_for("MakeDir")[3];
    assert_eq!(statistical.entrypoint, "make_dir");
    assert_eq!(statistical.preamble, "library(fs)");
    assert_eq!(statistical.body, "make_dir <- function(path) dir_create(path)");
    assert_eq!(statistical.parameter_names().collect::<Vec<_>>(), vec!["path"]);
    assert_eq!(registry.constraint_names().collect::<Vec<_>>(), vec!["MakeDir", "LoadCsv"]);
    assert!(registry.candidates_for("DropTable").is_empty());
}

#[test]
fn same_name_artifacts_keep_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let a1 = write(dir.path(), "a1.sql", &MKDIR_SQL.replace("x;", "a1;"));
    let a2 = write(dir.path(), "a2.sql", &MKDIR_SQL.replace("x;", "a2;"));

    let registry = build_registry(Vec::new(), &[], &[a1.clone(), a2.clone()], &[]).unwrap();
    let sources: Vec<_> = registry.candidates_for("MakeDir").iter().map(|d| d.source_id.clone()).collect();
    assert_eq!(sources, vec![a1.display().to_string(), a2.display().to_string()]);
}

#[test]
fn one_bad_artifact_fails_the_whole_build() {
    let dir = tempfile::tempdir().unwrap();
    let good = write(dir.path(), "good.sql", MKDIR_SQL);
    let bad = write(
        dir.path(),
        "bad.sql",
        "/***\n@register(REG, Count, args={\"n\": lambda t: t.rows * 2})\n***/\nSELECT 1;\n",
    );

    let err = build_registry(Vec::new(), &[], &[good, bad.clone()], &[]).unwrap_err();
    assert_eq!(err.artifact_id(), Some(bad.display().to_string().as_str()));
    match err {
        RecipeError::RegistryBuild { cause, .. } => {
            assert!(cause.is_parse_error());
            assert!(matches!(*cause, RecipeError::UnsupportedExpression { line: 2, .. }));
        }
        other => panic!("expected RegistryBuild, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_build_matches_serial_build() {
    let dir = tempfile::tempdir().unwrap();
    let sources = fixture(dir.path());

    let serial = build_registry_from_sources(&sources).unwrap();
    let concurrent = build_registry_concurrent(&sources).await.unwrap();
    assert_eq!(serial, concurrent);
}

#[tokio::test]
async fn concurrent_build_reports_first_failure_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let sources = ArtifactSources {
        shell: vec![dir.path().join("missing.sh")],
        query: vec![write(dir.path(), "empty.sql", "/***\n@register(REG, A)\n***/\n   \n")],
        ..Default::default()
    };

    let err = build_registry_concurrent(&sources).await.unwrap_err();
    assert_eq!(err.artifact_id(), Some(dir.path().join("missing.sh").display().to_string().as_str()));
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

#[test]
fn capture_then_get_binds_in_declared_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = build_registry_from_sources(&fixture(dir.path())).unwrap();
    let load = &registry.candidates_for("LoadCsv")[0];

    let arguments = bind(
        load,
        &ancestry(&[("table", json!({"delim": "|", "schema": "raw", "name": "trips"}))]),
    )
    .unwrap();
    assert_eq!(arguments.keys().collect::<Vec<_>>(), vec!["delim", "target", "sep"]);
    assert_eq!(arguments["target"], json!("raw.trips"));
    assert_eq!(arguments["sep"], json!("|"));
}

#[test]
fn get_before_capture_is_unbound() {
    let dir = tempfile::tempdir().unwrap();
    let registry = build_registry(Vec::new(), &[], &[write(dir.path(), "rev.sql", REVERSED_SQL)], &[]).unwrap();

    let err = bind(
        &registry.candidates_for("LoadCsv")[0],
        &ancestry(&[("table", json!({"delim": ","}))]),
    )
    .unwrap_err();
    assert!(err.is_bind_error());
    assert!(matches!(err, RecipeError::UnboundContextKey { ref key } if key == "delim"));
}

#[test]
fn upstream_context_seeds_downstream_binding() {
    let dir = tempfile::tempdir().unwrap();
    let downstream = write(
        dir.path(),
        "down.sql",
        "/***\n@register(REG, Export, args={\"sep\": lambda context: get('delim')})\n***/\nSELECT '{sep}';\n",
    );
    let registry = build_registry(Vec::new(), &[], &[write(dir.path(), "load.sql", LOAD_SQL), downstream], &[]).unwrap();

    let upstream = bind_with_context(
        &registry.candidates_for("LoadCsv")[0],
        &ancestry(&[("table", json!({"delim": ";", "schema": "s", "name": "n"}))]),
        &HashMap::new(),
    )
    .unwrap();
    let seed = merge_upstream_contexts([("LoadCsv", &upstream.context)]);
    assert_eq!(seed.get("delim"), Some(&TypedValue::String(";".into())));

    let export = bind_with_context(&registry.candidates_for("Export")[0], &AncestryGraph::new(), &seed).unwrap();
    assert_eq!(export.arguments["sep"], json!(";"));
}

// ---------------------------------------------------------------------------
// Manifest + lint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manifest_build_and_lint() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "load.sql", LOAD_SQL);
    write(dir.path(), "rev.sql", REVERSED_SQL);
    let manifest_path = write(
        dir.path(),
        "larder.json",
        r#"{"query": ["load.sql", "rev.sql"], "known_ancestors": ["table"]}"#,
    );

    let manifest = RegistryManifest::load(&manifest_path).await.unwrap();
    let registry = build_registry_concurrent(&manifest.sources).await.unwrap();
    assert_eq!(registry.candidates_for("LoadCsv").len(), 2);

    let diagnostics = validate(&registry, &manifest.lint_config());
    let rules: Vec<_> = diagnostics.iter().map(|d| d.rule.as_str()).collect();
    assert_eq!(rules, vec!["same_dialect_candidates"]);
    assert_eq!(diagnostics[0].severity, Severity::Info);
}
