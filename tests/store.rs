use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use metacat_manager::domain::CatalogVersion;
use metacat_manager::error::CatalogError;
use metacat_manager::schema::SchemaIdentity;
use metacat_manager::store::{CatalogStructure, DescriptorAction, Store};

fn version(raw: &str) -> CatalogVersion {
    raw.parse().unwrap()
}

fn structure(columns: &[&str]) -> CatalogStructure {
    CatalogStructure {
        name: "metacatalog".to_string(),
        description: "test catalog".to_string(),
        path: "/build/{{version}}/metacatalog.csv".to_string(),
        catalog_file: "metacatalog.csv".to_string(),
        schema: SchemaIdentity {
            id: "https://schemas.metacat.dev/experiment-metadata/1-0-0.json".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        },
    }
}

fn store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new(root.join("build"), root.join("catalog"));
    (temp, store)
}

fn fake_build(store: &Store, raw: &str) {
    let version = version(raw);
    store.claim_version(&version, false).unwrap();
    fs::write(store.catalog_path(&version), b"name\n").unwrap();
}

#[test]
fn list_versions_only_counts_built_versions() {
    let (_temp, store) = store();
    fake_build(&store, "v2024-06-01");
    fake_build(&store, "v2024-01-01");
    fs::create_dir_all(store.build_base().join("v2024-03-01")).unwrap();
    fs::create_dir_all(store.build_base().join("scratch")).unwrap();

    assert_eq!(
        store.list_versions().unwrap(),
        vec![version("v2024-01-01"), version("v2024-06-01")]
    );
}

#[test]
fn first_concretize_spans_existing_snapshots() {
    let (_temp, store) = store();
    fake_build(&store, "v2024-01-01");
    fake_build(&store, "v2024-06-01");

    let action = store
        .concretize_descriptor(&version("v2024-06-01"), structure(&["name"]))
        .unwrap();
    assert_eq!(action, DescriptorAction::Created);

    let live = store.read_live_descriptor().unwrap().unwrap();
    assert_eq!(live.parameters.version.min, version("v2024-01-01"));
    assert_eq!(live.parameters.version.max, version("v2024-06-01"));
    assert_eq!(live.parameters.version.default, version("v2024-06-01"));
}

#[test]
fn same_structure_extends_live_descriptor() {
    let (_temp, store) = store();
    fake_build(&store, "v2024-01-01");
    store
        .concretize_descriptor(&version("v2024-01-01"), structure(&["name"]))
        .unwrap();
    fake_build(&store, "v2024-02-01");
    let action = store
        .concretize_descriptor(&version("v2024-02-01"), structure(&["name"]))
        .unwrap();
    assert_eq!(action, DescriptorAction::Extended);

    let live = store.read_live_descriptor().unwrap().unwrap();
    assert_eq!(live.parameters.version.min, version("v2024-01-01"));
    assert_eq!(live.parameters.version.max, version("v2024-02-01"));
    assert_eq!(live.parameters.version.default, version("v2024-02-01"));
}

#[test]
fn changed_structure_forks_and_archives() {
    let (_temp, store) = store();
    fake_build(&store, "v2024-01-01");
    fake_build(&store, "v2024-02-01");
    store
        .concretize_descriptor(&version("v2024-02-01"), structure(&["name"]))
        .unwrap();
    fake_build(&store, "v2024-03-01");

    let action = store
        .concretize_descriptor(&version("v2024-03-01"), structure(&["name", "model"]))
        .unwrap();
    let archived = store
        .catalog_base()
        .join("catalog-v2024-01-01-v2024-02-01.yaml");
    assert_eq!(action, DescriptorAction::Forked { archived: archived.clone() });
    assert!(archived.as_std_path().is_file());

    let live = store.read_live_descriptor().unwrap().unwrap();
    assert_eq!(live.parameters.version.min, version("v2024-03-01"));
    assert_eq!(live.parameters.version.max, version("v2024-03-01"));
    assert_eq!(live.structure.schema.columns, vec!["name", "model"]);
    for built in ["v2024-01-01", "v2024-02-01", "v2024-03-01"] {
        assert!(store.catalog_path(&version(built)).as_std_path().is_file());
    }
}

#[test]
fn fork_refuses_to_overwrite_an_archive() {
    let (_temp, store) = store();
    fake_build(&store, "v2024-01-01");
    store
        .concretize_descriptor(&version("v2024-01-01"), structure(&["name"]))
        .unwrap();
    fs::write(store.catalog_base().join("catalog-v2024-01-01.yaml"), b"old").unwrap();

    let result = store.concretize_descriptor(&version("v2024-01-01"), structure(&["model"]));
    assert_matches!(result, Err(CatalogError::Storage(_)));
    assert!(store.live_descriptor_path().as_std_path().is_file());
}

#[test]
fn version_can_be_claimed_once() {
    let (_temp, store) = store();
    let v = version("v2024-01-01");
    assert!(store.claim_version(&v, false).unwrap());
    assert_matches!(
        store.claim_version(&v, false),
        Err(CatalogError::VersionConflict(ref raw)) if raw == "v2024-01-01"
    );
    assert!(!store.claim_version(&v, true).unwrap());
}

#[test]
fn failed_publish_restores_previous_sources() {
    let (_temp, store) = store();
    let v = version("v2024-01-01");
    store.claim_version(&v, false).unwrap();
    fs::create_dir_all(store.source_dir(&v)).unwrap();
    fs::write(store.source_dir(&v).join("old.json"), b"{}").unwrap();

    let staging = store.prepare_staging(&v).unwrap();
    fs::write(staging.join("new.json"), b"{}").unwrap();
    let err = store
        .publish_staged(&v, || -> Result<(), CatalogError> {
            Err(CatalogError::Storage("disk full".to_string()))
        })
        .unwrap_err();
    assert_matches!(err, CatalogError::Storage(_));
    assert!(store.source_dir(&v).join("old.json").as_std_path().is_file());
    assert!(!store.source_dir(&v).join("new.json").as_std_path().exists());

    let staging = store.prepare_staging(&v).unwrap();
    fs::write(staging.join("new.json"), b"{}").unwrap();
    store.publish_staged(&v, || Ok(())).unwrap();
    assert!(store.source_dir(&v).join("new.json").as_std_path().is_file());
    assert!(!store.source_dir(&v).join("old.json").as_std_path().exists());
    assert!(!staging.as_std_path().exists());
}
