//! The master catalog: canonical rows from every registered dataset, each
//! carrying a reference to the datastore it was translated from.

use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::domain::{CatalogVersion, NAME_COLUMN, REFERENCE_COLUMN, Record, UUID_COLUMN, as_text};
use crate::error::CatalogError;
use crate::schema::{Schema, SchemaIdentity, Violation};
use crate::store::{read_json, write_json_atomic};
use crate::table::{read_table_file, write_table_file};
use crate::translator::{TranslationSource, Translator, TranslatorKind};

/// Canonical columns of the master catalog, in table order.
pub const CORE_COLUMNS: &[&str] = &[
    "name",
    "experiment_uuid",
    "model",
    "description",
    "realm",
    "frequency",
    "variable",
];

/// Columns translated rows are merged on.
pub const GROUPBY_COLUMNS: &[&str] = &["model", "realm", "frequency"];

pub const CATALOG_FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogTableDescriptor {
    format_version: String,
    schema: SchemaIdentity,
    version: Option<CatalogVersion>,
    catalog_file: String,
    groupby: Vec<String>,
    columns_with_iterables: Vec<String>,
    name_column: String,
    reference_column: String,
    saved_at: String,
}

#[derive(Debug, Clone)]
pub struct CatalogManager {
    columns: Vec<String>,
    groupby: Vec<String>,
    schema: Schema,
    version: Option<CatalogVersion>,
    rows: Vec<Record>,
}

impl PartialEq for CatalogManager {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.groupby == other.groupby
            && self.schema.id() == other.schema.id()
            && self.version == other.version
            && self.rows == other.rows
    }
}

impl CatalogManager {
    /// Empty catalog over the default canonical columns.
    pub fn new() -> Result<Self, CatalogError> {
        Self::with_columns(
            CORE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            GROUPBY_COLUMNS.iter().map(|c| c.to_string()).collect(),
        )
    }

    pub fn with_columns(columns: Vec<String>, groupby: Vec<String>) -> Result<Self, CatalogError> {
        Self::with_schema(&Schema::experiment()?, columns, groupby)
    }

    /// Catalog whose rows must satisfy `base` with every column in `columns` required.
    pub fn with_schema(
        base: &Schema,
        columns: Vec<String>,
        groupby: Vec<String>,
    ) -> Result<Self, CatalogError> {
        let required: Vec<&str> = columns.iter().map(String::as_str).collect();
        let schema = Schema::with_required(base, &required)?;
        Ok(Self {
            columns,
            groupby,
            schema,
            version: None,
            rows: Vec::new(),
        })
    }

    pub fn with_version(mut self, version: CatalogVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn version(&self) -> Option<&CatalogVersion> {
        self.version.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Table columns: the canonical columns followed by the datastore reference.
    pub fn table_columns(&self) -> Vec<String> {
        let mut columns = self.columns.clone();
        columns.push(REFERENCE_COLUMN.to_string());
        columns
    }

    /// Schema identity used to decide whether two catalog builds share a structure.
    pub fn identity(&self) -> SchemaIdentity {
        self.schema.identity(&self.table_columns())
    }

    /// Distinct dataset names, in row order.
    pub fn names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.rows
            .iter()
            .filter_map(|row| row.get(NAME_COLUMN).and_then(as_text))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Translate `source` and append its rows, referencing the datastore at
    /// `reference`. Nothing is inserted unless every row validates and the
    /// dataset's name and experiment_uuid are not claimed by another datastore.
    /// Re-adding a dataset under the same reference replaces its rows.
    pub fn add(
        &mut self,
        source: &TranslationSource,
        reference: &Utf8Path,
        kind: TranslatorKind,
    ) -> Result<usize, CatalogError> {
        if !reference.as_std_path().is_file() {
            return Err(CatalogError::InvalidReference(reference.to_path_buf()));
        }
        let translator = Translator::new(kind, self.columns.clone(), self.groupby.clone());
        let rows = translator.translate(source, &self.schema)?;

        let mut violations: Vec<Violation> = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            for mut violation in self.schema.validate_record(row) {
                violation.location = format!("/{index}{}", violation.location.trim_end_matches('/'));
                violations.push(violation);
            }
        }
        if !violations.is_empty() {
            let context = match single_name(&rows) {
                Ok(name) => format!("catalog rows for {name}"),
                Err(_) => "catalog rows".to_string(),
            };
            return Err(CatalogError::SchemaViolation {
                context,
                violations,
            });
        }
        let name = single_name(&rows)?;

        let reference_text = reference.to_string();
        let uuids: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| row.get(UUID_COLUMN).and_then(as_text))
            .collect();
        for existing in &self.rows {
            let existing_ref = existing
                .get(REFERENCE_COLUMN)
                .and_then(as_text)
                .unwrap_or_default();
            if existing_ref == reference_text {
                continue;
            }
            if let Some(uuid) = existing.get(UUID_COLUMN).and_then(as_text) {
                if uuids.contains(&uuid) {
                    return Err(CatalogError::DuplicateIdentifier {
                        uuid,
                        existing: existing_ref,
                    });
                }
            }
            if existing.get(NAME_COLUMN).and_then(as_text).as_deref() == Some(name.as_str()) {
                return Err(CatalogError::DuplicateName {
                    name,
                    existing: existing_ref,
                });
            }
        }

        self.rows.retain(|row| {
            row.get(REFERENCE_COLUMN).and_then(as_text).as_deref() != Some(reference_text.as_str())
        });
        let added = rows.len();
        for mut row in rows {
            row.insert(
                REFERENCE_COLUMN.to_string(),
                Value::String(reference_text.clone()),
            );
            self.rows.push(row);
        }
        info!(dataset = %name, rows = added, translator = %kind, "added dataset to catalog");
        Ok(added)
    }

    /// Replace the rows of dataset `name`. On error the catalog is unchanged.
    pub fn update(
        &mut self,
        name: &str,
        source: &TranslationSource,
        reference: &Utf8Path,
        kind: TranslatorKind,
    ) -> Result<usize, CatalogError> {
        let mut staged = self.clone();
        staged.remove(name);
        let added = staged.add(source, reference, kind)?;
        *self = staged;
        Ok(added)
    }

    /// Drop every row of dataset `name`. Returns how many rows were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.rows.len();
        self.rows
            .retain(|row| row.get(NAME_COLUMN).and_then(as_text).as_deref() != Some(name));
        before - self.rows.len()
    }

    /// Re-point references under `from` at the same file names under `to`.
    /// Returns how many rows changed.
    pub fn relocate_references(&mut self, from: &Utf8Path, to: &Utf8Path) -> usize {
        let mut moved = 0;
        for row in &mut self.rows {
            let Some(reference) = row.get(REFERENCE_COLUMN).and_then(as_text) else {
                continue;
            };
            if let Ok(relative) = Utf8Path::new(&reference).strip_prefix(from) {
                row.insert(
                    REFERENCE_COLUMN.to_string(),
                    Value::String(to.join(relative).to_string()),
                );
                moved += 1;
            }
        }
        moved
    }

    /// Write the table to `path` and its descriptor next to it (`.json`).
    pub fn save(&self, path: &Utf8Path) -> Result<Utf8PathBuf, CatalogError> {
        let catalog_file = path
            .file_name()
            .ok_or_else(|| CatalogError::Storage(format!("not a file path: {path}")))?
            .to_string();
        let columns_with_iterables = self
            .columns
            .iter()
            .filter(|column| self.schema.can_be_array(column))
            .cloned()
            .collect();
        let descriptor = CatalogTableDescriptor {
            format_version: CATALOG_FORMAT_VERSION.to_string(),
            schema: self.identity(),
            version: self.version.clone(),
            catalog_file,
            groupby: self.groupby.clone(),
            columns_with_iterables,
            name_column: NAME_COLUMN.to_string(),
            reference_column: REFERENCE_COLUMN.to_string(),
            saved_at: Utc::now().to_rfc3339(),
        };
        write_table_file(path, &self.table_columns(), &self.rows)?;
        let descriptor_path = descriptor_path(path);
        write_json_atomic(&descriptor_path, &descriptor)?;
        info!(path = %path, rows = self.rows.len(), "saved catalog");
        Ok(descriptor_path)
    }

    /// Load a catalog written by [`CatalogManager::save`].
    pub fn load(path: &Utf8Path) -> Result<Self, CatalogError> {
        Self::load_with_schema(path, &Schema::experiment()?)
    }

    pub fn load_with_schema(path: &Utf8Path, base: &Schema) -> Result<Self, CatalogError> {
        let descriptor: CatalogTableDescriptor = read_json(&descriptor_path(path))?;
        let dir = path.parent().unwrap_or(Utf8Path::new("."));
        let (table_columns, rows) = read_table_file(&dir.join(&descriptor.catalog_file))?;
        if table_columns != descriptor.schema.columns {
            return Err(CatalogError::Storage(format!(
                "{path}: table columns {table_columns:?} do not match descriptor {:?}",
                descriptor.schema.columns
            )));
        }
        let columns = table_columns
            .into_iter()
            .filter(|column| column != &descriptor.reference_column)
            .collect();
        let mut manager = Self::with_schema(base, columns, descriptor.groupby)?;
        manager.version = descriptor.version;
        manager.rows = rows;
        Ok(manager)
    }

    /// Load the catalog at `path` (or start an empty one), apply `change`, and
    /// save the result atomically. Readers see the old or the new catalog.
    pub fn modify<F>(path: &Utf8Path, change: F) -> Result<Self, CatalogError>
    where
        F: FnOnce(&mut CatalogManager) -> Result<(), CatalogError>,
    {
        let mut manager = if descriptor_path(path).as_std_path().is_file() {
            Self::load(path)?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
            }
            Self::new()?
        };
        change(&mut manager)?;
        manager.save(path)?;
        Ok(manager)
    }
}

/// Descriptor path for a catalog table: same stem, `.json` extension.
pub fn descriptor_path(table_path: &Utf8Path) -> Utf8PathBuf {
    table_path.with_extension("json")
}

fn single_name(rows: &[Record]) -> Result<String, CatalogError> {
    let names: BTreeSet<String> = rows
        .iter()
        .filter_map(|row| row.get(NAME_COLUMN).and_then(as_text))
        .collect();
    let mut names = names.into_iter();
    match (names.next(), names.next()) {
        (Some(name), None) => Ok(name),
        (None, _) => Err(CatalogError::Translation(
            "source translated to no rows with a name".to_string(),
        )),
        (Some(first), Some(second)) => Err(CatalogError::Translation(format!(
            "source translated to more than one name ({first}, {second}, ...)"
        ))),
    }
}
