use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{info, warn};

use crate::domain::CatalogVersion;
use crate::error::CatalogError;
use crate::schema::SchemaIdentity;

pub const LIVE_DESCRIPTOR: &str = "catalog.yaml";
pub const DEFAULT_CATALOG_FILE: &str = "metacatalog.csv";
pub const SOURCE_DIR: &str = "source";
const STAGING_DIR: &str = "source.staging";
const PREVIOUS_DIR: &str = "source.previous";

/// On-disk layout of a versioned catalog.
///
/// ```text
/// <build_base>/<version>/<catalog_file>       master table
/// <build_base>/<version>/<catalog stem>.json  master table descriptor
/// <build_base>/<version>/source/              one datastore per dataset
/// <build_base>/<version>/source.staging/      datastores of a build in progress
/// <catalog_base>/catalog.yaml                 live descriptor
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    build_base: Utf8PathBuf,
    catalog_base: Utf8PathBuf,
    catalog_file: String,
}

impl Store {
    pub fn new(build_base: Utf8PathBuf, catalog_base: Utf8PathBuf) -> Self {
        Self {
            build_base,
            catalog_base,
            catalog_file: DEFAULT_CATALOG_FILE.to_string(),
        }
    }

    pub fn with_catalog_file(mut self, catalog_file: impl Into<String>) -> Self {
        self.catalog_file = catalog_file.into();
        self
    }

    pub fn build_base(&self) -> &Utf8Path {
        &self.build_base
    }

    pub fn catalog_base(&self) -> &Utf8Path {
        &self.catalog_base
    }

    pub fn catalog_file(&self) -> &str {
        &self.catalog_file
    }

    pub fn version_dir(&self, version: &CatalogVersion) -> Utf8PathBuf {
        self.build_base.join(version.as_str())
    }

    pub fn source_dir(&self, version: &CatalogVersion) -> Utf8PathBuf {
        self.version_dir(version).join(SOURCE_DIR)
    }

    pub fn catalog_path(&self, version: &CatalogVersion) -> Utf8PathBuf {
        self.version_dir(version).join(&self.catalog_file)
    }

    pub fn live_descriptor_path(&self) -> Utf8PathBuf {
        self.catalog_base.join(LIVE_DESCRIPTOR)
    }

    /// Path template readers substitute a version into.
    pub fn path_template(&self) -> String {
        self.build_base
            .join("{{version}}")
            .join(&self.catalog_file)
            .to_string()
    }

    pub fn version_exists(&self, version: &CatalogVersion) -> bool {
        self.version_dir(version).as_std_path().exists()
    }

    pub fn staging_dir(&self, version: &CatalogVersion) -> Utf8PathBuf {
        self.version_dir(version).join(STAGING_DIR)
    }

    /// Create the version directory. An existing one is a `VersionConflict`
    /// unless `overwrite` is set. Returns whether this call created it.
    pub fn claim_version(
        &self,
        version: &CatalogVersion,
        overwrite: bool,
    ) -> Result<bool, CatalogError> {
        fs::create_dir_all(self.build_base.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        match fs::create_dir(self.version_dir(version).as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && overwrite => {
                warn!(%version, "overwriting existing catalog version");
                Ok(false)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(CatalogError::VersionConflict(version.to_string()))
            }
            Err(err) => Err(CatalogError::Filesystem(err.to_string())),
        }
    }

    /// Empty staging directory for the datastores of a new build.
    pub fn prepare_staging(&self, version: &CatalogVersion) -> Result<Utf8PathBuf, CatalogError> {
        let staging = self.staging_dir(version);
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(staging.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Ok(staging)
    }

    pub fn discard_staging(&self, version: &CatalogVersion) -> Result<(), CatalogError> {
        remove_dir_if_exists(&self.staging_dir(version))
    }

    /// Swap the staged datastores in as `source/`, then run `commit`. When
    /// `commit` fails the previous `source/` is restored.
    pub fn publish_staged<T>(
        &self,
        version: &CatalogVersion,
        commit: impl FnOnce() -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        let source = self.source_dir(version);
        let previous = self.version_dir(version).join(PREVIOUS_DIR);
        remove_dir_if_exists(&previous)?;
        let had_previous = source.as_std_path().exists();
        if had_previous {
            rename_dir(&source, &previous)?;
        }
        if let Err(err) = rename_dir(&self.staging_dir(version), &source) {
            if had_previous {
                restore(&source, &previous);
            }
            return Err(err);
        }
        match commit() {
            Ok(value) => {
                if had_previous {
                    remove_dir_if_exists(&previous)?;
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(cleanup) = remove_dir_if_exists(&source) {
                    warn!(error = %cleanup, "could not remove unpublished datastores");
                }
                if had_previous {
                    restore(&source, &previous);
                }
                Err(err)
            }
        }
    }

    /// Versions under the build base that hold this store's catalog file.
    pub fn list_versions(&self) -> Result<Vec<CatalogVersion>, CatalogError> {
        if !self.build_base.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(self.build_base.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::Filesystem(err.to_string()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(version) = name.parse::<CatalogVersion>() else {
                continue;
            };
            if version.as_str() == name && self.catalog_path(&version).as_std_path().is_file() {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn read_live_descriptor(&self) -> Result<Option<CatalogDescriptor>, CatalogError> {
        let path = self.live_descriptor_path();
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        read_yaml(&path).map(Some)
    }

    /// Publish `version` by creating, extending or forking the live descriptor.
    ///
    /// Forking renames the current descriptor to an archival name keyed by its
    /// version range; snapshot directories are never touched.
    pub fn concretize_descriptor(
        &self,
        version: &CatalogVersion,
        structure: CatalogStructure,
    ) -> Result<DescriptorAction, CatalogError> {
        fs::create_dir_all(self.catalog_base.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        let live_path = self.live_descriptor_path();

        let (descriptor, action) = match self.read_live_descriptor()? {
            None => {
                let mut versions = self.list_versions()?;
                versions.push(version.clone());
                versions.sort();
                let min = versions.first().cloned().unwrap_or_else(|| version.clone());
                let max = versions.last().cloned().unwrap_or_else(|| version.clone());
                info!(%version, %min, %max, "creating live catalog descriptor");
                (
                    CatalogDescriptor::new(structure, min, max, version.clone()),
                    DescriptorAction::Created,
                )
            }
            Some(live) if live.structure == structure => {
                let min = live.parameters.version.min.clone().min(version.clone());
                let max = live.parameters.version.max.clone().max(version.clone());
                info!(%version, %min, %max, "extending live catalog descriptor");
                (
                    CatalogDescriptor::new(structure, min, max, version.clone()),
                    DescriptorAction::Extended,
                )
            }
            Some(live) => {
                let archived = self.catalog_base.join(archive_name(
                    &live.parameters.version.min,
                    &live.parameters.version.max,
                ));
                if archived.as_std_path().exists() {
                    return Err(CatalogError::Storage(format!(
                        "cannot archive live descriptor: {archived} already exists"
                    )));
                }
                fs::rename(live_path.as_std_path(), archived.as_std_path())
                    .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
                info!(%version, archived = %archived, "catalog structure changed; forked live descriptor");
                (
                    CatalogDescriptor::new(structure, version.clone(), version.clone(), version.clone()),
                    DescriptorAction::Forked { archived },
                )
            }
        };

        write_yaml_atomic(&live_path, &descriptor)?;
        Ok(action)
    }
}

/// Everything about a catalog except which versions exist. Two builds with
/// the same structure can share one live descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStructure {
    pub name: String,
    pub description: String,
    pub path: String,
    pub catalog_file: String,
    pub schema: SchemaIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: CatalogVersion,
    pub max: CatalogVersion,
    pub default: CatalogVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionParameters {
    pub version: VersionRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDescriptor {
    #[serde(flatten)]
    pub structure: CatalogStructure,
    pub parameters: VersionParameters,
    pub updated_at: String,
}

impl CatalogDescriptor {
    fn new(
        structure: CatalogStructure,
        min: CatalogVersion,
        max: CatalogVersion,
        default: CatalogVersion,
    ) -> Self {
        Self {
            structure,
            parameters: VersionParameters {
                version: VersionRange { min, max, default },
            },
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DescriptorAction {
    Created,
    Extended,
    Forked { archived: Utf8PathBuf },
}

pub fn archive_name(min: &CatalogVersion, max: &CatalogVersion) -> String {
    if min == max {
        format!("catalog-{min}.yaml")
    } else {
        format!("catalog-{min}-{max}.yaml")
    }
}

pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<(), CatalogError> {
    match fs::remove_dir_all(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CatalogError::Filesystem(format!("remove {path}: {err}"))),
    }
}

fn rename_dir(from: &Utf8Path, to: &Utf8Path) -> Result<(), CatalogError> {
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| CatalogError::Filesystem(format!("rename {from} to {to}: {err}")))
}

fn restore(source: &Utf8Path, previous: &Utf8Path) {
    if let Err(err) = rename_dir(previous, source) {
        warn!(error = %err, "could not restore previous datastores");
    }
}

/// Write `content` to a temp file next to `path`, then rename over it, so a
/// concurrent reader sees either the old or the new file.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CatalogError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".metacat-tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    std::io::Write::write_all(&mut temp, content)
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), CatalogError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| CatalogError::Storage(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn write_yaml_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), CatalogError> {
    let content =
        serde_yaml::to_string(value).map_err(|err| CatalogError::Storage(err.to_string()))?;
    write_bytes_atomic(path, content.as_bytes())
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, CatalogError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| CatalogError::Storage(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| CatalogError::Storage(format!("{path}: {err}")))
}

pub fn read_yaml<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, CatalogError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| CatalogError::Storage(format!("read {path}: {err}")))?;
    serde_yaml::from_str(&content).map_err(|err| CatalogError::Storage(format!("{path}: {err}")))
}
