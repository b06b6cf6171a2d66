//! Shared types, errors, and the context store for the Larder recipe registry.
//!
//! This crate provides the foundational types used across all other Larder crates:
//! - `RecipeError`: unified error taxonomy for parsing, registry builds and binding
//! - `Dialect`: the surface syntax family of a recipe artifact
//! - `TypedValue` / `TypeTag`: the values a context slot can hold
//! - `ContextStore`: typed scratchpad threaded through one bind pass

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Unified error type for all Larder subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    // === Artifact Errors ===
    #[error("Malformed artifact at line {line}: {message}")]
    MalformedArtifact { line: usize, message: String },

    #[error("Ambiguous recipe: {message}")]
    AmbiguousRecipe { message: String },

    #[error("Recipe body is empty")]
    EmptyRecipeBody,

    #[error("Unsupported expression for argument '{parameter}' at line {line}: {construct}")]
    UnsupportedExpression {
        parameter: String,
        construct: String,
        line: usize,
    },

    // === Binding Errors ===
    #[error("Context key '{key}' read before it was captured")]
    UnboundContextKey { key: String },

    #[error("Context key '{key}' holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: TypeTag,
        found: String,
    },

    #[error("Argument '{parameter}' needs ancestor '{name}', which is not in the ancestry graph")]
    MissingAncestor { parameter: String, name: String },

    #[error("Argument '{parameter}': field '{path}' not found on '{base}'")]
    MissingField {
        parameter: String,
        base: String,
        path: String,
    },

    // === Registry Errors ===
    #[error("Failed to register artifact '{artifact_id}': {cause}")]
    RegistryBuild {
        artifact_id: String,
        #[source]
        cause: Box<RecipeError>,
    },

    #[error("Registry validation failed: {0}")]
    ValidationError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RecipeError {
    /// Wrap an error with the identity of the artifact that produced it.
    pub fn in_artifact(self, artifact_id: impl Into<String>) -> Self {
        RecipeError::RegistryBuild {
            artifact_id: artifact_id.into(),
            cause: Box::new(self),
        }
    }

    /// Returns `true` for errors raised while turning artifact text into descriptors.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            RecipeError::MalformedArtifact { .. }
                | RecipeError::AmbiguousRecipe { .. }
                | RecipeError::EmptyRecipeBody
                | RecipeError::UnsupportedExpression { .. }
        )
    }

    /// Returns `true` for errors raised while binding a descriptor for one
    /// pipeline node. These are fatal to that node only, not to the whole run.
    pub fn is_bind_error(&self) -> bool {
        matches!(
            self,
            RecipeError::UnboundContextKey { .. }
                | RecipeError::TypeMismatch { .. }
                | RecipeError::MissingAncestor { .. }
                | RecipeError::MissingField { .. }
        )
    }

    /// The artifact an error is attributed to, if it was raised during a registry build.
    pub fn artifact_id(&self) -> Option<&str> {
        match self {
            RecipeError::RegistryBuild { artifact_id, .. } => Some(artifact_id),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, RecipeError>`.
pub type Result<T> = std::result::Result<T, RecipeError>;

// ---------------------------------------------------------------------------
// Dialect: surface syntax family of an artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Native,
    Shell,
    Query,
    Statistical,
}

impl Dialect {
    /// All dialects in registration order.
    pub const ALL: [Dialect; 4] = [
        Dialect::Native,
        Dialect::Shell,
        Dialect::Query,
        Dialect::Statistical,
    ];

    /// Opening and closing header markers. Native artifacts carry no markers.
    pub fn markers(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Dialect::Native => None,
            Dialect::Shell | Dialect::Statistical => Some(("###+", "###+")),
            Dialect::Query => Some(("/***", "***/")),
        }
    }

    /// Whether each header line carries a `#` comment prefix.
    pub fn has_comment_prefix(&self) -> bool {
        matches!(self, Dialect::Shell | Dialect::Statistical)
    }

    /// Whether the header's last line names the entrypoint.
    pub fn entrypoint_from_header(&self) -> bool {
        matches!(self, Dialect::Shell | Dialect::Statistical)
    }

    /// Infer the dialect from a file extension.
    pub fn from_path(path: &Path) -> Option<Dialect> {
        match path.extension()?.to_str()? {
            "py" => Some(Dialect::Native),
            "sh" => Some(Dialect::Shell),
            "sql" => Some(Dialect::Query),
            "R" | "r" => Some(Dialect::Statistical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Native => "native",
            Dialect::Shell => "shell",
            Dialect::Query => "query",
            Dialect::Statistical => "statistical",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "python" => Ok(Dialect::Native),
            "shell" | "bash" => Ok(Dialect::Shell),
            "query" | "presto" | "sql" => Ok(Dialect::Query),
            "statistical" | "r" => Ok(Dialect::Statistical),
            other => Err(RecipeError::Other(format!("unknown dialect '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// TypedValue: what a context slot can hold
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    String,
    Bool,
    Int,
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeTag::String => f.write_str("string"),
            TypeTag::Bool => f.write_str("bool"),
            TypeTag::Int => f.write_str("int"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl TypedValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            TypedValue::String(_) => TypeTag::String,
            TypedValue::Bool(_) => TypeTag::Bool,
            TypedValue::Int(_) => TypeTag::Int,
        }
    }

    /// Convert a JSON value into a slot of the requested type. Returns `None`
    /// when the JSON value's type does not match `tag`.
    pub fn from_json(value: &serde_json::Value, tag: TypeTag) -> Option<TypedValue> {
        match (tag, value) {
            (TypeTag::String, serde_json::Value::String(s)) => Some(TypedValue::String(s.clone())),
            (TypeTag::Bool, serde_json::Value::Bool(b)) => Some(TypedValue::Bool(*b)),
            (TypeTag::Int, serde_json::Value::Number(n)) => n.as_i64().map(TypedValue::Int),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TypedValue::String(s) => serde_json::Value::String(s.clone()),
            TypedValue::Bool(b) => serde_json::Value::Bool(*b),
            TypedValue::Int(i) => serde_json::Value::from(*i),
        }
    }
}

impl std::fmt::Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::String(s) => s.fmt(f),
            TypedValue::Bool(b) => b.fmt(f),
            TypedValue::Int(i) => i.fmt(f),
        }
    }
}

/// Name of a JSON value's type, as used in mismatch messages.
pub fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// ContextStore: typed scratchpad for one bind pass
// ---------------------------------------------------------------------------

/// Typed key/value store shared by the argument rules of one descriptor
/// during a single bind pass.
///
/// The store is `Open` while it is owned; [`close`](ContextStore::close)
/// consumes it, so no capture or get can follow the end of the pass.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    slots: HashMap<String, TypedValue>,
}

impl ContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with slots captured by upstream constraints.
    pub fn seeded(slots: HashMap<String, TypedValue>) -> Self {
        Self { slots }
    }

    /// Write a slot. The last write for a key wins.
    pub fn capture(&mut self, key: impl Into<String>, value: TypedValue) -> TypedValue {
        let key = key.into();
        match self.slots.insert(key.clone(), value.clone()) {
            Some(old) if old != value => {
                tracing::debug!(key = %key, old = %old, new = %value, "Context slot overwritten");
            }
            _ => tracing::debug!(key = %key, value = %value, "Captured"),
        }
        value
    }

    /// Read a slot that must exist and hold a value of type `tag`.
    pub fn get(&self, key: &str, tag: TypeTag) -> Result<TypedValue> {
        self.get_optional(key, tag)?
            .ok_or_else(|| RecipeError::UnboundContextKey { key: key.to_string() })
    }

    /// Read a slot that may be absent. A present slot must still match `tag`.
    pub fn get_optional(&self, key: &str, tag: TypeTag) -> Result<Option<TypedValue>> {
        match self.slots.get(key) {
            None => Ok(None),
            Some(value) if value.tag() == tag => Ok(Some(value.clone())),
            Some(value) => Err(RecipeError::TypeMismatch {
                key: key.to_string(),
                expected: tag,
                found: value.tag().to_string(),
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Merge slots captured while binding an upstream constraint. Differing
    /// values replace the existing ones.
    pub fn merge_from(&mut self, upstream: &HashMap<String, TypedValue>, constraint: &str) {
        for (key, value) in upstream {
            match self.slots.get(key) {
                Some(existing) if existing == value => {}
                Some(existing) => {
                    tracing::debug!(
                        key = %key,
                        old = %existing,
                        new = %value,
                        constraint = %constraint,
                        "Replaced context slot from upstream constraint"
                    );
                    self.slots.insert(key.clone(), value.clone());
                }
                None => {
                    tracing::debug!(key = %key, value = %value, constraint = %constraint, "Inserted context slot from upstream constraint");
                    self.slots.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// End the pass and hand back every slot that was captured or seeded.
    pub fn close(self) -> HashMap<String, TypedValue> {
        self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_malformed_artifact() {
        let err = RecipeError::MalformedArtifact {
            line: 3,
            message: "missing closing marker '***/'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed artifact at line 3: missing closing marker '***/'"
        );
    }

    #[test]
    fn error_display_unsupported_expression() {
        let err = RecipeError::UnsupportedExpression {
            parameter: "columns".into(),
            construct: "call to 'dumps'".into(),
            line: 12,
        };
        assert_eq!(
            err.to_string(),
            "Unsupported expression for argument 'columns' at line 12: call to 'dumps'"
        );
    }

    #[test]
    fn error_display_type_mismatch() {
        let err = RecipeError::TypeMismatch {
            key: "is_json".into(),
            expected: TypeTag::Int,
            found: "bool".into(),
        };
        assert_eq!(err.to_string(), "Context key 'is_json' holds bool, expected int");
    }

    #[test]
    fn error_display_registry_build_wraps_cause() {
        let err = RecipeError::EmptyRecipeBody.in_artifact("recipes/mkdir.sh");
        assert_eq!(
            err.to_string(),
            "Failed to register artifact 'recipes/mkdir.sh': Recipe body is empty"
        );
        assert_eq!(err.artifact_id(), Some("recipes/mkdir.sh"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn classification_helpers() {
        assert!(RecipeError::EmptyRecipeBody.is_parse_error());
        assert!(!RecipeError::EmptyRecipeBody.is_bind_error());
        let unbound = RecipeError::UnboundContextKey { key: "k".into() };
        assert!(unbound.is_bind_error());
        assert!(!unbound.is_parse_error());
        assert_eq!(unbound.artifact_id(), None);
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RecipeError = io_err.into();
        assert!(matches!(err, RecipeError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    // --- Dialect ---

    #[test]
    fn dialect_markers() {
        assert_eq!(Dialect::Native.markers(), None);
        assert_eq!(Dialect::Shell.markers(), Some(("###+", "###+")));
        assert_eq!(Dialect::Statistical.markers(), Some(("###+", "###+")));
        assert_eq!(Dialect::Query.markers(), Some(("/***", "***/")));
    }

    #[test]
    fn dialect_from_path() {
        assert_eq!(Dialect::from_path(Path::new("r/upload.py")), Some(Dialect::Native));
        assert_eq!(Dialect::from_path(Path::new("mkdir.sh")), Some(Dialect::Shell));
        assert_eq!(
            Dialect::from_path(Path::new("schemas_created.presto.sql")),
            Some(Dialect::Query)
        );
        assert_eq!(Dialect::from_path(Path::new("download.R")), Some(Dialect::Statistical));
        assert_eq!(Dialect::from_path(Path::new("README")), None);
    }

    #[test]
    fn dialect_parses_aliases() {
        assert_eq!("bash".parse::<Dialect>().unwrap(), Dialect::Shell);
        assert_eq!("Presto".parse::<Dialect>().unwrap(), Dialect::Query);
        assert_eq!("R".parse::<Dialect>().unwrap(), Dialect::Statistical);
        assert!("cobol".parse::<Dialect>().is_err());
    }

    #[test]
    fn dialect_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&Dialect::Statistical).unwrap(),
            "\"statistical\""
        );
    }

    // --- TypedValue ---

    #[test]
    fn typed_value_from_json_respects_tag() {
        let v = serde_json::json!(true);
        assert_eq!(TypedValue::from_json(&v, TypeTag::Bool), Some(TypedValue::Bool(true)));
        assert_eq!(TypedValue::from_json(&v, TypeTag::String), None);
        let n = serde_json::json!(3);
        assert_eq!(TypedValue::from_json(&n, TypeTag::Int), Some(TypedValue::Int(3)));
    }

    #[test]
    fn typed_value_deserializes_untagged() {
        let slots: HashMap<String, TypedValue> =
            serde_json::from_str(r#"{"a": true, "b": 7, "c": ","}"#).unwrap();
        assert_eq!(slots["a"], TypedValue::Bool(true));
        assert_eq!(slots["b"], TypedValue::Int(7));
        assert_eq!(slots["c"], TypedValue::String(",".into()));
    }

    #[test]
    fn json_type_names() {
        assert_eq!(json_type_name(&serde_json::json!(1)), "int");
        assert_eq!(json_type_name(&serde_json::json!(1.5)), "float");
        assert_eq!(json_type_name(&serde_json::json!({})), "object");
    }

    // --- ContextStore ---

    #[test]
    fn capture_then_get_round_trip() {
        let mut ctx = ContextStore::new();
        ctx.capture("k", TypedValue::String("v".into()));
        assert_eq!(
            ctx.get("k", TypeTag::String).unwrap(),
            TypedValue::String("v".into())
        );
    }

    #[test]
    fn get_before_capture_is_unbound() {
        let ctx = ContextStore::new();
        let err = ctx.get("k", TypeTag::String).unwrap_err();
        assert!(matches!(err, RecipeError::UnboundContextKey { ref key } if key == "k"));
    }

    #[test]
    fn get_with_wrong_tag_is_type_mismatch() {
        let mut ctx = ContextStore::new();
        ctx.capture("is_json", TypedValue::Bool(true));
        let err = ctx.get("is_json", TypeTag::Int).unwrap_err();
        match err {
            RecipeError::TypeMismatch { key, expected, found } => {
                assert_eq!(key, "is_json");
                assert_eq!(expected, TypeTag::Int);
                assert_eq!(found, "bool");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn last_capture_wins() {
        let mut ctx = ContextStore::new();
        ctx.capture("delimiter", TypedValue::String(",".into()));
        ctx.capture("delimiter", TypedValue::String("\t".into()));
        assert_eq!(
            ctx.get("delimiter", TypeTag::String).unwrap(),
            TypedValue::String("\t".into())
        );
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn get_optional_absent_is_none() {
        let ctx = ContextStore::new();
        assert_eq!(ctx.get_optional("missing", TypeTag::Int).unwrap(), None);
    }

    #[test]
    fn merge_from_upstream_replaces_differing_values() {
        let mut ctx = ContextStore::new();
        ctx.capture("keep", TypedValue::Int(1));
        ctx.capture("replace", TypedValue::Int(1));

        let mut upstream = HashMap::new();
        upstream.insert("replace".to_string(), TypedValue::Int(2));
        upstream.insert("added".to_string(), TypedValue::Bool(false));
        ctx.merge_from(&upstream, "UploadDataToSQLite");

        let slots = ctx.close();
        assert_eq!(slots["keep"], TypedValue::Int(1));
        assert_eq!(slots["replace"], TypedValue::Int(2));
        assert_eq!(slots["added"], TypedValue::Bool(false));
    }

    #[test]
    fn seeded_store_serves_gets() {
        let mut seed = HashMap::new();
        seed.insert("file_to_replicate".to_string(), TypedValue::String("/tmp/x".into()));
        let ctx = ContextStore::seeded(seed);
        assert!(ctx.contains("file_to_replicate"));
        assert!(!ctx.is_empty());
    }
}
