use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::builder::{AssetFailure, Datastore, DatastoreBuilder};
use crate::config::{
    ConfigLoader, DatasetFailure, ResolvedConfig, ResolvedSource, SourceMethod, check_unique,
    load_metadata,
};
use crate::domain::CatalogVersion;
use crate::error::CatalogError;
use crate::manager::{CORE_COLUMNS, CatalogManager, GROUPBY_COLUMNS, descriptor_path};
use crate::parser::AssetParser;
use crate::pool::WorkerPool;
use crate::schema::Schema;
use crate::store::{CatalogStructure, DescriptorAction, Store, remove_dir_if_exists};
use crate::translator::TranslationSource;

pub const DEFAULT_CATALOG_NAME: &str = "metacatalog";
pub const DEFAULT_CATALOG_DESCRIPTION: &str =
    "Catalog of climate model output and observational datasets";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// `vYYYY-MM-DD`; today when unset.
    pub version: Option<String>,
    pub overwrite: bool,
    pub no_concretize: bool,
}

/// Name and description written into the live descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogInfo {
    pub name: String,
    pub description: String,
}

impl Default for CatalogInfo {
    fn default() -> Self {
        Self {
            name: DEFAULT_CATALOG_NAME.to_string(),
            description: DEFAULT_CATALOG_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetAssetFailures {
    pub name: String,
    pub failures: Vec<AssetFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub version: CatalogVersion,
    pub catalog_path: Utf8PathBuf,
    pub added: Vec<String>,
    pub failed: Vec<DatasetFailure>,
    pub asset_failures: Vec<DatasetAssetFailures>,
    pub concretized: Option<ConcretizeReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcretizeReport {
    pub version: CatalogVersion,
    pub live_descriptor: Utf8PathBuf,
    #[serde(flatten)]
    pub action: DescriptorAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateReport {
    pub path: Utf8PathBuf,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Orchestrates builds against one [`Store`], parsing assets with `P`.
#[derive(Clone)]
pub struct App<P: AssetParser + Clone + 'static> {
    store: Store,
    parser: P,
    pool: WorkerPool,
    info: CatalogInfo,
    columns: Vec<String>,
    groupby: Vec<String>,
    file_schema: Schema,
    experiment_schema: Schema,
}

impl<P: AssetParser + Clone + 'static> App<P> {
    pub fn new(store: Store, parser: P) -> Result<Self, CatalogError> {
        Ok(Self {
            store,
            parser,
            pool: WorkerPool::default(),
            info: CatalogInfo::default(),
            columns: CORE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            groupby: GROUPBY_COLUMNS.iter().map(|c| c.to_string()).collect(),
            file_schema: Schema::file()?,
            experiment_schema: Schema::experiment()?,
        })
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_info(mut self, info: CatalogInfo) -> Self {
        self.info = info;
        self
    }

    /// Canonical catalog columns and the subset rows are merged on.
    pub fn with_columns(mut self, columns: Vec<String>, groupby: Vec<String>) -> Self {
        self.columns = columns;
        self.groupby = groupby;
        self
    }

    /// Swap the bundled schemas, e.g. for a newer schema release.
    pub fn with_schemas(mut self, file_schema: Schema, experiment_schema: Schema) -> Self {
        self.file_schema = file_schema;
        self.experiment_schema = experiment_schema;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Build a catalog version from `configs`. Datasets that fail are reported
    /// in the result; the build fails only when nothing could be added.
    pub fn build(
        &self,
        configs: &[Utf8PathBuf],
        options: &BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BuildReport, CatalogError> {
        let started = Instant::now();
        let version = match &options.version {
            Some(raw) => raw.parse::<CatalogVersion>()?,
            None => CatalogVersion::today(),
        };
        if self.store.version_exists(&version) && !options.overwrite {
            return Err(CatalogError::VersionConflict(version.to_string()));
        }

        sink.event(ProgressEvent {
            message: format!("phase=Resolve; reading {} config file(s)", configs.len()),
            elapsed: None,
        });
        let resolved = ConfigLoader::resolve_all(configs, &self.experiment_schema)?;
        check_unique(&resolved.sources)?;

        let fresh = self.store.claim_version(&version, options.overwrite)?;
        let built = self.build_version(&version, resolved, started, sink);
        if built.is_err() {
            let cleanup = if fresh {
                remove_dir_if_exists(&self.store.version_dir(&version))
            } else {
                self.store.discard_staging(&version)
            };
            if let Err(err) = cleanup {
                warn!(%version, error = %err, "could not clean up failed build");
            }
        }
        let mut report = built?;

        report.concretized = if options.no_concretize {
            info!(%version, "catalog built; skipping concretize");
            None
        } else {
            Some(self.concretize(&version)?)
        };
        Ok(report)
    }

    /// Build every datastore into the staging directory, then publish them
    /// together with the catalog table. Until then `source/` is untouched.
    fn build_version(
        &self,
        version: &CatalogVersion,
        resolved: ResolvedConfig,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> Result<BuildReport, CatalogError> {
        let staging = self.store.prepare_staging(version)?;
        let mut manager = CatalogManager::with_schema(
            &self.experiment_schema,
            self.columns.clone(),
            self.groupby.clone(),
        )?
        .with_version(version.clone());
        let mut added = Vec::new();
        let mut failed = resolved.failures;
        let mut asset_failures = Vec::new();
        for source in &resolved.sources {
            sink.event(ProgressEvent {
                message: format!("phase=Build; dataset={}", source.name),
                elapsed: Some(started.elapsed()),
            });
            match self.add_source(&mut manager, source, &staging) {
                Ok(failures) => {
                    added.push(source.name.clone());
                    if !failures.is_empty() {
                        asset_failures.push(DatasetAssetFailures {
                            name: source.name.clone(),
                            failures,
                        });
                    }
                }
                Err(err) => {
                    warn!(dataset = %source.name, error = %err, "dataset excluded from catalog");
                    failed.push(DatasetFailure {
                        name: source.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if manager.is_empty() {
            return Err(CatalogError::NoValidAssets(format!("catalog {version}")));
        }

        manager.relocate_references(&staging, &self.store.source_dir(version));
        let catalog_path = self.store.catalog_path(version);
        self.store
            .publish_staged(version, || manager.save(&catalog_path))?;
        sink.event(ProgressEvent {
            message: format!("phase=Save; catalog={catalog_path}"),
            elapsed: Some(started.elapsed()),
        });

        Ok(BuildReport {
            version: version.clone(),
            catalog_path,
            added,
            failed,
            asset_failures,
            concretized: None,
        })
    }

    /// Add one dataset to `manager`. Built datastores are written to `dir` and
    /// removed again when the catalog rejects them.
    fn add_source(
        &self,
        manager: &mut CatalogManager,
        source: &ResolvedSource,
        dir: &Utf8Path,
    ) -> Result<Vec<AssetFailure>, CatalogError> {
        let (datastore, reference, failures, written) = match &source.method {
            SourceMethod::Build(kind) => {
                let config = kind.config(&source.options)?;
                let parser = kind.parser(self.parser.clone())?;
                let builder = DatastoreBuilder::new(config, parser, self.file_schema.clone())
                    .with_pool(self.pool);
                let outcome = builder.build(&source.name, &source.description, &source.paths)?;
                let reference = outcome.datastore.save(dir)?;
                (outcome.datastore, reference, outcome.failures, true)
            }
            SourceMethod::Load => {
                let reference = source.paths.first().cloned().ok_or_else(|| {
                    CatalogError::ConfigParse(format!("{}: no datastore path", source.name))
                })?;
                (Datastore::load(&reference)?, reference, Vec::new(), false)
            }
        };
        let translation = TranslationSource::from_datastore(&datastore, &source.metadata);
        if let Err(err) = manager.add(&translation, &reference, source.translator) {
            if written {
                datastore.remove(dir)?;
            }
            return Err(err);
        }
        Ok(failures)
    }

    /// Publish a built version through the live descriptor.
    pub fn concretize(&self, version: &CatalogVersion) -> Result<ConcretizeReport, CatalogError> {
        let catalog_path = self.store.catalog_path(version);
        if !descriptor_path(&catalog_path).as_std_path().is_file() {
            return Err(CatalogError::VersionNotBuilt(version.to_string()));
        }
        let manager = CatalogManager::load_with_schema(&catalog_path, &self.experiment_schema)?;
        let structure = CatalogStructure {
            name: self.info.name.clone(),
            description: self.info.description.clone(),
            path: self.store.path_template(),
            catalog_file: self.store.catalog_file().to_string(),
            schema: manager.identity(),
        };
        let action = self.store.concretize_descriptor(version, structure)?;
        Ok(ConcretizeReport {
            version: version.clone(),
            live_descriptor: self.store.live_descriptor_path(),
            action,
        })
    }

    /// Validate an experiment metadata document, failing with every violation.
    pub fn validate(&self, path: &Utf8Path) -> Result<ValidateReport, CatalogError> {
        load_metadata(path, &self.experiment_schema)?;
        Ok(ValidateReport {
            path: path.to_path_buf(),
            valid: true,
        })
    }

    /// Empty experiment metadata document as YAML.
    pub fn template(&self) -> Result<String, CatalogError> {
        template(&self.experiment_schema)
    }
}

/// YAML skeleton of `schema`: required properties first, each mapped to its
/// description, list-valued properties wrapped in a one-element list.
pub fn template(schema: &Schema) -> Result<String, CatalogError> {
    let required = schema.required();
    let mut properties = schema.properties();
    properties.sort_by_key(|(name, _)| {
        required
            .iter()
            .position(|req| req == name)
            .unwrap_or(usize::MAX)
    });

    let mut document = serde_yaml::Mapping::new();
    for (name, fragment) in properties {
        let description = fragment
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or(name.as_str());
        let placeholder = if required.contains(&name) {
            format!("<REQUIRED {description}>")
        } else {
            format!("<{description}>")
        };
        let value = if schema.can_be_array(&name) {
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::String(placeholder)])
        } else {
            serde_yaml::Value::String(placeholder)
        };
        document.insert(serde_yaml::Value::String(name), value);
    }
    serde_yaml::to_string(&document).map_err(|err| CatalogError::Storage(err.to_string()))
}
