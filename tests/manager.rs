use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use metacat_manager::builder::Datastore;
use metacat_manager::domain::{CatalogVersion, Record};
use metacat_manager::error::CatalogError;
use metacat_manager::manager::CatalogManager;
use metacat_manager::translator::{TranslationSource, TranslatorKind};

const UUID_A: &str = "214e8e6d-0ab5-4ea1-8d4a-be94e3b2e8b1";
const UUID_B: &str = "5b1e0c4e-0a1f-4a77-9a5e-2d6a0c6f9b3d";

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn source(name: &str, uuid: &str, frequencies: &[&str]) -> TranslationSource {
    let records = frequencies
        .iter()
        .map(|frequency| {
            record(&[
                ("realm", json!("ocean")),
                ("frequency", json!(frequency)),
                ("variable", json!(["temp"])),
            ])
        })
        .collect();
    let datastore = Datastore::new(name, "42", Vec::new(), Vec::new(), records);
    let metadata = record(&[
        ("name", json!(name)),
        ("experiment_uuid", json!(uuid)),
        ("description", json!("42")),
        ("long_description", json!("Long text")),
        ("model", json!("ACCESS-OM2")),
    ]);
    TranslationSource::from_datastore(&datastore, &metadata)
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Self { _temp: temp, root }
    }

    /// An existing datastore descriptor file to reference.
    fn reference(&self, name: &str) -> Utf8PathBuf {
        let path = self.root.join(format!("{name}.json"));
        fs::write(&path, b"{}").unwrap();
        path
    }
}

#[test]
fn add_appends_one_row_per_group() {
    let fixture = Fixture::new();
    let mut manager = CatalogManager::new().unwrap();
    let added = manager
        .add(
            &source("om2", UUID_A, &["1mon", "1day", "1mon"]),
            &fixture.reference("om2"),
            TranslatorKind::Default,
        )
        .unwrap();
    assert_eq!(added, 2);
    assert_eq!(manager.rows().len(), 2);
    assert_eq!(manager.names(), vec!["om2".to_string()]);
    assert_eq!(
        manager.rows()[0]["datastore"],
        json!(fixture.root.join("om2.json").to_string())
    );
}

#[test]
fn missing_reference_is_rejected() {
    let fixture = Fixture::new();
    let mut manager = CatalogManager::new().unwrap();
    let err = manager
        .add(
            &source("om2", UUID_A, &["1mon"]),
            &fixture.root.join("missing.json"),
            TranslatorKind::Default,
        )
        .unwrap_err();
    assert_matches!(err, CatalogError::InvalidReference(_));
    assert!(manager.is_empty());
}

#[test]
fn invalid_rows_reject_whole_dataset() {
    let fixture = Fixture::new();
    let mut manager = CatalogManager::new().unwrap();
    let err = manager
        .add(
            &source("om2", UUID_A, &["1mon", "monthly"]),
            &fixture.reference("om2"),
            TranslatorKind::Default,
        )
        .unwrap_err();
    assert_matches!(err, CatalogError::SchemaViolation { .. });
    assert!(manager.is_empty());
}

#[test]
fn duplicate_uuid_under_other_reference_is_rejected() {
    let fixture = Fixture::new();
    let mut manager = CatalogManager::new().unwrap();
    manager
        .add(&source("om2", UUID_A, &["1mon"]), &fixture.reference("om2"), TranslatorKind::Default)
        .unwrap();
    let before = manager.clone();

    let err = manager
        .add(&source("copy", UUID_A, &["1mon"]), &fixture.reference("copy"), TranslatorKind::Default)
        .unwrap_err();
    assert_matches!(err, CatalogError::DuplicateIdentifier { ref uuid, .. } if uuid == UUID_A);
    assert!(err.is_validation());
    assert_eq!(manager, before);

    let err = manager
        .add(&source("om2", UUID_B, &["1mon"]), &fixture.reference("other"), TranslatorKind::Default)
        .unwrap_err();
    assert_matches!(err, CatalogError::DuplicateName { .. });
}

#[test]
fn re_adding_same_reference_replaces_rows() {
    let fixture = Fixture::new();
    let reference = fixture.reference("om2");
    let mut manager = CatalogManager::new().unwrap();
    manager
        .add(&source("om2", UUID_A, &["1mon", "1day"]), &reference, TranslatorKind::Default)
        .unwrap();
    manager
        .add(&source("om2", UUID_A, &["1yr"]), &reference, TranslatorKind::Default)
        .unwrap();
    assert_eq!(manager.rows().len(), 1);
    assert_eq!(manager.rows()[0]["frequency"], json!(["1yr"]));
}

#[test]
fn remove_then_add_matches_update() {
    let fixture = Fixture::new();
    let om2 = fixture.reference("om2");
    let esm = fixture.reference("esm");
    let mut base = CatalogManager::new().unwrap();
    base.add(&source("om2", UUID_A, &["1mon"]), &om2, TranslatorKind::Default)
        .unwrap();
    base.add(&source("esm", UUID_B, &["1day"]), &esm, TranslatorKind::Default)
        .unwrap();

    let replacement = source("om2", UUID_A, &["1mon", "1yr"]);
    let mut updated = base.clone();
    updated
        .update("om2", &replacement, &om2, TranslatorKind::Default)
        .unwrap();

    let mut manual = base.clone();
    assert_eq!(manual.remove("om2"), 1);
    manual
        .add(&replacement, &om2, TranslatorKind::Default)
        .unwrap();

    assert_eq!(updated, manual);
    assert_eq!(updated.names(), vec!["esm".to_string(), "om2".to_string()]);
}

#[test]
fn failed_update_leaves_catalog_unchanged() {
    let fixture = Fixture::new();
    let om2 = fixture.reference("om2");
    let mut manager = CatalogManager::new().unwrap();
    manager
        .add(&source("om2", UUID_A, &["1mon"]), &om2, TranslatorKind::Default)
        .unwrap();
    let before = manager.clone();

    let err = manager
        .update("om2", &source("om2", UUID_A, &["weekly"]), &om2, TranslatorKind::Default)
        .unwrap_err();
    assert_matches!(err, CatalogError::SchemaViolation { .. });
    assert_eq!(manager, before);
}

#[test]
fn remove_absent_is_a_no_op() {
    let mut manager = CatalogManager::new().unwrap();
    assert_eq!(manager.remove("nothing"), 0);
    assert!(manager.is_empty());
}

#[test]
fn save_load_round_trip_is_exact() {
    let fixture = Fixture::new();
    let mut manager = CatalogManager::new()
        .unwrap()
        .with_version("v2025-01-01".parse::<CatalogVersion>().unwrap());
    manager
        .add(&source("om2", UUID_A, &["1mon", "1day"]), &fixture.reference("om2"), TranslatorKind::Default)
        .unwrap();
    let mut no_model = source("esm", UUID_B, &["1mon"]);
    no_model.metadata.remove("model");
    manager
        .add(&no_model, &fixture.reference("esm"), TranslatorKind::Default)
        .unwrap();

    let path = fixture.root.join("v2025-01-01").join("metacatalog.csv");
    let descriptor = manager.save(&path).unwrap();
    assert!(descriptor.as_std_path().is_file());

    let loaded = CatalogManager::load(&path).unwrap();
    assert_eq!(loaded, manager);
    assert_eq!(loaded.rows()[0]["description"], json!("42"));
    assert_eq!(loaded.rows()[2]["model"], Value::Null);
}

#[test]
fn modify_loads_applies_and_saves() {
    let fixture = Fixture::new();
    let path = fixture.root.join("metacatalog.csv");
    let om2 = fixture.reference("om2");

    CatalogManager::modify(&path, |catalog| {
        catalog
            .add(&source("om2", UUID_A, &["1mon"]), &om2, TranslatorKind::Default)
            .map(|_| ())
    })
    .unwrap();
    let err = CatalogManager::modify(&path, |catalog| {
        catalog.remove("om2");
        Err(CatalogError::Storage("abort".to_string()))
    })
    .unwrap_err();
    assert_matches!(err, CatalogError::Storage(_));

    let loaded = CatalogManager::load(&path).unwrap();
    assert_eq!(loaded.names(), vec!["om2".to_string()]);
}
