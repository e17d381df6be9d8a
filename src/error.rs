use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::schema::{Violation, render_violations};

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("{context} failed schema validation:\n{}", render_violations(.violations))]
    #[diagnostic(help("fix every listed problem and re-run; the list is complete"))]
    SchemaViolation {
        context: String,
        violations: Vec<Violation>,
    },

    #[error("failed to parse asset {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("experiment_uuid {uuid} is already registered by a different datastore ({existing})")]
    DuplicateIdentifier { uuid: String, existing: String },

    #[error("dataset name {name} is already registered by a different datastore ({existing})")]
    DuplicateName { name: String, existing: String },

    #[error("duplicate {field} across inputs: {values:?}")]
    DuplicateInput { field: String, values: Vec<String> },

    #[error("catalog version {0} already exists in the build path")]
    #[diagnostic(help("pass --overwrite to rebuild an existing version"))]
    VersionConflict(String),

    #[error("invalid catalog version: {0} (expected vYYYY-MM-DD)")]
    InvalidVersion(String),

    #[error("catalog version {0} has not been built")]
    VersionNotBuilt(String),

    #[error("datastore reference does not exist: {0}")]
    InvalidReference(Utf8PathBuf),

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("no valid assets found for {0}")]
    NoValidAssets(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("unknown translator: {0}")]
    UnknownTranslator(String),

    #[error("invalid aggregation: {0}")]
    InvalidAggregation(String),

    #[error("failed to load schema: {0}")]
    SchemaLoad(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("catalog storage error: {0}")]
    Storage(String),
}

impl CatalogError {
    /// True for failures the user can fix by correcting their input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CatalogError::SchemaViolation { .. }
                | CatalogError::DuplicateIdentifier { .. }
                | CatalogError::DuplicateName { .. }
                | CatalogError::DuplicateInput { .. }
                | CatalogError::VersionConflict(_)
                | CatalogError::InvalidVersion(_)
        )
    }
}
