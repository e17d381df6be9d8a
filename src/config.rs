use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::builder::BuilderKind;
use crate::domain::{NAME_COLUMN, Record, UUID_COLUMN, as_text};
use crate::error::CatalogError;
use crate::schema::Schema;
use crate::translator::TranslatorKind;

/// A configuration document: one builder/translator pair and the sources that use it.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub builder: Option<String>,
    #[serde(default)]
    pub translator: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntry {
    pub path: PathEntry,
    pub metadata_yaml: String,
    /// Extra builder options, e.g. `ensemble: true`.
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PathEntry {
    Single(String),
    Many(Vec<String>),
}

impl PathEntry {
    fn into_vec(self) -> Vec<String> {
        match self {
            PathEntry::Single(path) => vec![path],
            PathEntry::Many(paths) => paths,
        }
    }
}

/// What to do with a source: crawl and build a new datastore, or load a pre-built one.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMethod {
    Build(BuilderKind),
    Load,
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub name: String,
    pub description: String,
    pub method: SourceMethod,
    pub translator: TranslatorKind,
    pub paths: Vec<Utf8PathBuf>,
    pub metadata: Record,
    pub options: Record,
    pub config_path: Utf8PathBuf,
}

impl ResolvedSource {
    pub fn experiment_uuid(&self) -> Option<String> {
        self.metadata.get(UUID_COLUMN).and_then(as_text)
    }
}

/// A dataset excluded from a build, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub sources: Vec<ResolvedSource>,
    pub failures: Vec<DatasetFailure>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: &Utf8Path) -> Result<Config, CatalogError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| CatalogError::ConfigRead(path.to_path_buf()))?;
        serde_yaml::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(format!("{path}: {err}")))
    }

    /// Load every configuration document and resolve its sources. Sources whose
    /// experiment metadata fails validation are reported, not raised.
    pub fn resolve_all(
        paths: &[Utf8PathBuf],
        experiment_schema: &Schema,
    ) -> Result<ResolvedConfig, CatalogError> {
        let mut resolved = ResolvedConfig::default();
        for path in paths {
            let config = Self::load(path)?;
            let base_dir = path.parent().unwrap_or(Utf8Path::new("."));
            let mut partial = Self::resolve_config(config, path, base_dir, experiment_schema)?;
            resolved.sources.append(&mut partial.sources);
            resolved.failures.append(&mut partial.failures);
        }
        Ok(resolved)
    }

    pub fn resolve_config(
        config: Config,
        config_path: &Utf8Path,
        base_dir: &Utf8Path,
        experiment_schema: &Schema,
    ) -> Result<ResolvedConfig, CatalogError> {
        let method = match &config.builder {
            Some(name) => SourceMethod::Build(name.parse()?),
            None => SourceMethod::Load,
        };
        let translator = match &config.translator {
            Some(name) => name.parse()?,
            None => TranslatorKind::Default,
        };

        let mut resolved = ResolvedConfig::default();
        for entry in config.sources {
            let metadata_path = resolve_path(base_dir, &entry.metadata_yaml);
            let metadata = match load_metadata(&metadata_path, experiment_schema) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(metadata = %metadata_path, "skipping source with invalid metadata");
                    resolved.failures.push(DatasetFailure {
                        name: metadata_path.to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            let name = metadata.get(NAME_COLUMN).and_then(as_text).unwrap_or_default();
            let description = metadata
                .get("description")
                .and_then(as_text)
                .unwrap_or_default();
            resolved.sources.push(ResolvedSource {
                name,
                description,
                method: method.clone(),
                translator,
                paths: entry
                    .path
                    .into_vec()
                    .iter()
                    .map(|path| resolve_path(base_dir, path))
                    .collect(),
                metadata,
                options: entry.options.into_iter().collect(),
                config_path: config_path.to_path_buf(),
            });
        }
        Ok(resolved)
    }
}

/// Load an experiment metadata document and validate it, reporting every violation.
pub fn load_metadata(path: &Utf8Path, schema: &Schema) -> Result<Record, CatalogError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|_| CatalogError::ConfigRead(path.to_path_buf()))?;
    let document: Value = serde_yaml::from_str(&content)
        .map_err(|err| CatalogError::ConfigParse(format!("{path}: {err}")))?;
    schema.check(path.as_str(), &document)?;
    match document {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(CatalogError::ConfigParse(format!(
            "{path}: metadata document must be a mapping"
        ))),
    }
}

/// Reject input sets in which two sources share a name or an experiment_uuid.
pub fn check_unique(sources: &[ResolvedSource]) -> Result<(), CatalogError> {
    let names = duplicates(sources.iter().map(|source| source.name.clone()));
    if !names.is_empty() {
        return Err(CatalogError::DuplicateInput {
            field: NAME_COLUMN.to_string(),
            values: names,
        });
    }
    let uuids = duplicates(sources.iter().filter_map(ResolvedSource::experiment_uuid));
    if !uuids.is_empty() {
        let named = sources
            .iter()
            .filter(|source| {
                source
                    .experiment_uuid()
                    .is_some_and(|uuid| uuids.contains(&uuid))
            })
            .map(|source| source.name.clone())
            .collect();
        return Err(CatalogError::DuplicateInput {
            field: UUID_COLUMN.to_string(),
            values: named,
        });
    }
    Ok(())
}

fn duplicates(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut dupes = BTreeSet::new();
    for value in values {
        if !seen.insert(value.clone()) {
            dupes.insert(value);
        }
    }
    dupes.into_iter().collect()
}

fn resolve_path(base_dir: &Utf8Path, value: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
