//! JSON-Schema contracts for file-level, experiment-level and catalog-level metadata.
//!
//! A [`Schema`] is compiled once when the pipeline is assembled and passed by
//! reference to whatever needs it. Validation never fails: it returns the full
//! list of [`Violation`]s, empty when the instance conforms.

use std::fmt;
use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::Record;
use crate::error::CatalogError;

const FILE_SCHEMA: &str = include_str!("../data/metadata_schema_file.json");
const EXPERIMENT_SCHEMA: &str = include_str!("../data/metadata_schema_experiment.json");

/// Columns every file-level record must carry before it enters a datastore.
pub const FILE_REQUIRED_COLUMNS: &[&str] = &["path", "realm", "frequency", "variable"];

const RELATIVE_ID_BASE: &str = "json-schema:///";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Missing,
    Unexpected,
    Invalid,
}

/// One reason an instance does not conform to a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// JSON pointer to the offending value, `/` for the document root.
    pub location: String,
    /// Property the violation is about, when it concerns a single key.
    pub property: Option<String>,
    pub kind: ViolationKind,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

pub fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| format!("  - {violation}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Identity recorded in catalog descriptors so builds can tell whether two
/// catalogs share a structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIdentity {
    pub id: String,
    pub columns: Vec<String>,
}

#[derive(Clone)]
pub struct Schema {
    id: String,
    raw: Value,
    compiled: Arc<JSONSchema>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("id", &self.id).finish()
    }
}

impl Schema {
    pub fn from_value(raw: Value) -> Result<Self, CatalogError> {
        let id = raw
            .get("$id")
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_string();
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&resolvable(&raw, &id))
            .map_err(|err| CatalogError::SchemaLoad(format!("{id}: {err}")))?;
        Ok(Self {
            id,
            raw,
            compiled: Arc::new(compiled),
        })
    }

    pub fn from_path(path: &Utf8Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| CatalogError::SchemaLoad(format!("{path}: {err}")))?;
        let raw: Value = serde_json::from_str(&content)
            .map_err(|err| CatalogError::SchemaLoad(format!("{path}: {err}")))?;
        Self::from_value(raw)
    }

    /// Schema for one discovered file, with the core file columns required.
    pub fn file() -> Result<Self, CatalogError> {
        let raw = bundled(FILE_SCHEMA)?;
        Self::with_required(&Self::from_value(raw)?, FILE_REQUIRED_COLUMNS)
    }

    /// Schema an experiment metadata document must satisfy.
    pub fn experiment() -> Result<Self, CatalogError> {
        Self::from_value(bundled(EXPERIMENT_SCHEMA)?)
    }

    /// Schema for master catalog rows: the experiment schema with `columns` required.
    pub fn catalog(columns: &[&str]) -> Result<Self, CatalogError> {
        Self::with_required(&Self::experiment()?, columns)
    }

    /// Copy `base` with its `required` list replaced by the members of
    /// `required` that the schema declares. Undeclared names are skipped.
    pub fn with_required(base: &Schema, required: &[&str]) -> Result<Self, CatalogError> {
        let mut raw = base.raw.clone();
        let properties = raw.get("properties").and_then(Value::as_object);
        let mut kept = Vec::new();
        for column in required {
            if properties.is_some_and(|props| props.contains_key(*column)) {
                kept.push(Value::String((*column).to_string()));
            } else {
                warn!(
                    schema = %base.id,
                    column = *column,
                    "required column does not exist in schema; entries will not be validated"
                );
            }
        }
        if let Some(object) = raw.as_object_mut() {
            object.insert("required".to_string(), Value::Array(kept));
        }
        Self::from_value(raw)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn identity(&self, columns: &[String]) -> SchemaIdentity {
        SchemaIdentity {
            id: self.id.clone(),
            columns: columns.to_vec(),
        }
    }

    pub fn required(&self) -> Vec<String> {
        self.raw
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Declared properties in document order, with their schema fragments.
    pub fn properties(&self) -> Vec<(String, Value)> {
        self.raw
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, fragment)| (name.clone(), fragment.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the schema lets `column` hold an array.
    pub fn can_be_array(&self, column: &str) -> bool {
        self.raw
            .pointer(&format!("/properties/{column}"))
            .is_some_and(fragment_allows_array)
    }

    pub fn validate(&self, instance: &Value) -> Vec<Violation> {
        let mut violations = match self.compiled.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.flat_map(|err| to_violations(&err)).collect(),
        };
        violations.sort_by(|a, b| a.location.cmp(&b.location).then(a.message.cmp(&b.message)));
        violations.dedup();
        violations
    }

    pub fn validate_record(&self, record: &Record) -> Vec<Violation> {
        let instance = Value::Object(record.clone().into_iter().collect());
        self.validate(&instance)
    }

    /// Validate and turn a non-empty violation list into a `SchemaViolation` error.
    pub fn check(&self, context: &str, instance: &Value) -> Result<(), CatalogError> {
        let violations = self.validate(instance);
        if violations.is_empty() {
            return Ok(());
        }
        Err(CatalogError::SchemaViolation {
            context: context.to_string(),
            violations,
        })
    }
}

/// Free-standing form of [`Schema::validate`].
pub fn validate(record: &Value, schema: &Schema) -> Vec<Violation> {
    schema.validate(record)
}

/// The compiler only accepts absolute `$id`s; relative ones are anchored
/// under [`RELATIVE_ID_BASE`]. The schema keeps reporting the id as written.
fn resolvable(raw: &Value, id: &str) -> Value {
    let mut document = raw.clone();
    if !has_scheme(id)
        && let Some(object) = document.as_object_mut()
        && object.contains_key("$id")
    {
        object.insert(
            "$id".to_string(),
            Value::String(format!("{RELATIVE_ID_BASE}{}", id.trim_start_matches('/'))),
        );
    }
    document
}

fn has_scheme(id: &str) -> bool {
    let Some((scheme, _)) = id.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn bundled(content: &str) -> Result<Value, CatalogError> {
    serde_json::from_str(content).map_err(|err| CatalogError::SchemaLoad(err.to_string()))
}

fn fragment_allows_array(fragment: &Value) -> bool {
    let type_allows = match fragment.get("type") {
        Some(Value::String(kind)) => kind == "array",
        Some(Value::Array(kinds)) => kinds.iter().any(|kind| kind == "array"),
        _ => false,
    };
    type_allows
        || fragment
            .get("oneOf")
            .and_then(Value::as_array)
            .is_some_and(|branches| branches.iter().any(fragment_allows_array))
}

fn to_violations(err: &jsonschema::ValidationError<'_>) -> Vec<Violation> {
    let location = match err.instance_path.to_string() {
        path if path.is_empty() => "/".to_string(),
        path => path,
    };
    match &err.kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            vec![Violation {
                location,
                message: format!("missing required property '{name}'"),
                property: Some(name),
                kind: ViolationKind::Missing,
            }]
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => unexpected
            .iter()
            .map(|name| Violation {
                location: location.clone(),
                property: Some(name.clone()),
                kind: ViolationKind::Unexpected,
                message: format!("unexpected property '{name}'"),
            })
            .collect(),
        _ => vec![Violation {
            property: location
                .rsplit('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
            location,
            kind: ViolationKind::Invalid,
            message: err.to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bundled_schemas_compile() {
        assert_eq!(Schema::file().unwrap().required(), FILE_REQUIRED_COLUMNS);
        let experiment = Schema::experiment().unwrap();
        assert!(experiment.id().starts_with("https://"));
        assert!(experiment.id().contains("experiment"));
    }

    #[test]
    fn relative_ids_are_anchored_for_compilation() {
        assert!(has_scheme("https://schemas.metacat.dev/x.json"));
        assert!(has_scheme("urn:metacat:x"));
        assert!(!has_scheme("metacat/file-metadata/1-0-0"));
        assert!(!has_scheme("/abs/path"));

        let anchored = resolvable(&json!({"$id": "custom/1"}), "custom/1");
        assert_eq!(anchored["$id"], "json-schema:///custom/1");
        let untouched = resolvable(&json!({"type": "object"}), "anonymous");
        assert!(untouched.get("$id").is_none());
    }

    #[test]
    fn with_required_skips_undeclared_columns() {
        let schema = Schema::catalog(&["name", "not_a_column"]).unwrap();
        assert_eq!(schema.required(), vec!["name".to_string()]);
    }

    #[test]
    fn can_be_array_follows_one_of() {
        let schema = Schema::experiment().unwrap();
        assert!(schema.can_be_array("model"));
        assert!(schema.can_be_array("keywords"));
        assert!(!schema.can_be_array("name"));
        assert!(!schema.can_be_array("nope"));
    }

    #[test]
    fn non_object_instance_reports_instead_of_failing() {
        let schema = Schema::experiment().unwrap();
        let violations = schema.validate(&json!("just a string"));
        assert!(!violations.is_empty());
        assert_eq!(violations[0].location, "/");
    }
}
