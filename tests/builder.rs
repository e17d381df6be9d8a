use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use metacat_manager::builder::{
    Aggregation, BuilderConfig, BuilderKind, Datastore, DatastoreBuilder, group_records,
};
use metacat_manager::domain::Record;
use metacat_manager::error::CatalogError;
use metacat_manager::parser::{AssetParser, SidecarParser, complete_record};
use metacat_manager::pool::WorkerPool;
use metacat_manager::schema::Schema;

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn file(path: &str, variable: &str, frequency: &str) -> Record {
    record(&[
        ("path", json!(path)),
        ("realm", json!("atmos")),
        ("frequency", json!(frequency)),
        ("variable", json!(variable)),
    ])
}

fn utf8_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}

/// Parses by file name; any name containing `bad` fails, `norealm` drops the realm.
#[derive(Clone)]
struct NameParser;

impl AssetParser for NameParser {
    fn parse(&self, path: &Utf8Path) -> Result<Record, String> {
        let name = path.file_name().unwrap_or_default();
        if name.contains("bad") {
            return Err("corrupt header".to_string());
        }
        let frequency = if name.contains("daily") { "1day" } else { "1mon" };
        let mut parsed = record(&[
            ("realm", json!("ocean")),
            ("frequency", json!(frequency)),
            ("variable", json!(["temp", "salt"])),
        ]);
        if name.contains("norealm") {
            parsed.remove("realm");
        }
        complete_record(&mut parsed, path);
        Ok(parsed)
    }
}

fn generic_config() -> BuilderConfig {
    BuilderConfig {
        include_patterns: vec!["*.nc".to_string()],
        ..BuilderConfig::default()
    }
}

#[test]
fn distinct_frequencies_form_distinct_groups() {
    let schema = Schema::file().unwrap();
    let files = vec![
        file("/data/ts_mon.nc", "ts", "1mon"),
        file("/data/ts_day.nc", "ts", "1day"),
    ];
    let groupby = vec!["variable".to_string(), "frequency".to_string()];
    let outcome = group_records(files, &groupby, &[], &schema);

    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.records.len(), 2);
    let frequencies: Vec<&Value> = outcome.records.iter().map(|r| &r["frequency"]).collect();
    assert!(frequencies.contains(&&json!("1mon")));
    assert!(frequencies.contains(&&json!("1day")));
}

#[test]
fn grouping_keys_are_unique_in_output() {
    let schema = Schema::file().unwrap();
    let files = vec![
        file("/data/c.nc", "ts", "1mon"),
        file("/data/a.nc", "ts", "1mon"),
        file("/data/b.nc", "pr", "1mon"),
    ];
    let groupby = vec!["variable".to_string(), "frequency".to_string()];
    let outcome = group_records(files, &groupby, &[], &schema);

    assert_eq!(outcome.records.len(), 2);
    let ts = outcome
        .records
        .iter()
        .find(|r| r["variable"] == json!("ts"))
        .unwrap();
    assert_eq!(ts["path"], json!(["/data/a.nc", "/data/c.nc"]));
    assert_eq!(ts["file_count"], json!(2));
}

#[test]
fn missing_group_key_is_its_own_group() {
    let schema = Schema::file().unwrap();
    let mut with_member = file("/data/a.nc", "ts", "1mon");
    with_member.insert("member".to_string(), json!("r1i1p1f1"));
    let without_member = file("/data/b.nc", "ts", "1mon");
    let groupby = vec!["variable".to_string(), "member".to_string()];

    let outcome = group_records(vec![with_member, without_member], &groupby, &[], &schema);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(
        outcome
            .records
            .iter()
            .filter(|r| !r.contains_key("member"))
            .count(),
        1
    );
}

#[test]
fn invalid_records_are_reported_not_kept() {
    let schema = Schema::file().unwrap();
    let mut broken = file("/data/broken.nc", "ts", "1mon");
    broken.remove("realm");
    let files = vec![file("/data/ok.nc", "ts", "1mon"), broken];
    let outcome = group_records(files, &["variable".to_string()], &[], &schema);

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].path, "/data/broken.nc");
    assert!(outcome.failures[0].reason.contains("realm"));
}

#[test]
fn union_and_join_new_collapse_attributes() {
    let schema = Schema::file().unwrap();
    let mut first = file("/data/a.nc", "ts", "1mon");
    first.insert("member".to_string(), json!("r2"));
    let mut second = file("/data/b.nc", "ts", "1mon");
    second.insert("member".to_string(), json!("r1"));
    second.insert("variable".to_string(), json!(["ts", "pr"]));

    let outcome = group_records(
        vec![second, first],
        &["frequency".to_string()],
        &[Aggregation::join_new("member"), Aggregation::union("variable")],
        &schema,
    );
    assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
    let merged = &outcome.records[0];
    assert_eq!(merged["member"], json!(["r2", "r1"]));
    assert_eq!(merged["variable"], json!(["ts", "pr"]));
}

#[test]
fn permuted_input_serializes_identically() {
    let schema = Schema::file().unwrap();
    let files = vec![
        file("/data/a.nc", "ts", "1mon"),
        file("/data/b.nc", "ts", "1mon"),
        file("/data/c.nc", "pr", "1day"),
        file("/data/d.nc", "ts", "1day"),
    ];
    let mut reversed = files.clone();
    reversed.reverse();
    let groupby = vec!["variable".to_string(), "frequency".to_string()];

    let left_dir = tempfile::tempdir().unwrap();
    let right_dir = tempfile::tempdir().unwrap();
    for (records, dir) in [(files, &left_dir), (reversed, &right_dir)] {
        let outcome = group_records(records, &groupby, &[], &schema);
        Datastore::new("exp", "test", groupby.clone(), Vec::new(), outcome.records)
            .save(&utf8_dir(dir))
            .unwrap();
    }
    for name in ["exp.json", "exp.csv.gz"] {
        let left = fs::read(left_dir.path().join(name)).unwrap();
        let right = fs::read(right_dir.path().join(name)).unwrap();
        assert_eq!(left, right, "{name} differs");
    }
}

#[test]
fn failing_file_is_excluded_and_listed() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_dir(&temp);
    for name in ["ocean_month_1990.nc", "ocean_month_1991.nc", "ocean_daily_1990.nc", "bad_1990.nc"] {
        fs::write(root.join(name), b"").unwrap();
    }
    fs::write(root.join("notes.txt"), b"").unwrap();

    let builder = DatastoreBuilder::new(generic_config(), NameParser, Schema::file().unwrap())
        .with_pool(WorkerPool::with_workers(2));
    let outcome = builder.build("exp", "test", &[root.clone()]).unwrap();

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].path, root.join("bad_1990.nc").to_string());
    assert_eq!(outcome.failures[0].reason, "corrupt header");

    let datastore = outcome.datastore;
    assert_eq!(datastore.records.len(), 2);
    let monthly = datastore
        .records
        .iter()
        .find(|r| r["frequency"] == json!("1mon"))
        .unwrap();
    assert_eq!(monthly["file_id"], json!("ocean_month_XXXX"));
    assert_eq!(monthly["file_count"], json!(2));
    assert!(!monthly.contains_key("filename"));
}

#[test]
fn crawl_respects_depth_and_excludes() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_dir(&temp);
    let deep = root.join("output000").join("ocean");
    fs::create_dir_all(&deep).unwrap();
    fs::write(root.join("top.nc"), b"").unwrap();
    fs::write(deep.join("ocean.nc"), b"").unwrap();
    fs::write(deep.join("ocean_restart.nc"), b"").unwrap();

    let shallow = DatastoreBuilder::new(generic_config(), NameParser, Schema::file().unwrap());
    assert_eq!(shallow.get_assets(&[root.clone()]).unwrap(), vec![root.join("top.nc")]);

    let config = BuilderConfig {
        depth: 2,
        exclude_patterns: vec!["*restart*".to_string()],
        ..generic_config()
    };
    let deep_builder = DatastoreBuilder::new(config, NameParser, Schema::file().unwrap());
    assert_eq!(
        deep_builder.get_assets(&[root.clone()]).unwrap(),
        vec![deep.join("ocean.nc"), root.join("top.nc")]
    );
}

#[test]
fn no_valid_assets_fails_the_build() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_dir(&temp);
    fs::write(root.join("bad.nc"), b"").unwrap();

    let builder = DatastoreBuilder::new(generic_config(), NameParser, Schema::file().unwrap());
    let err = builder.build("exp", "test", &[root]).unwrap_err();
    assert_matches!(err, CatalogError::NoValidAssets(name) if name == "exp");
}

#[test]
fn om2_layout_is_parsed_from_sidecars_and_path() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_dir(&temp);
    let ice = root.join("1deg_jra55").join("run1").join("output000").join("ice");
    fs::create_dir_all(&ice).unwrap();
    for (year, start, end) in [("1990", "1990-01-01", "1991-01-01"), ("1991", "1991-01-01", "1992-01-01")] {
        let data = ice.join(format!("iceh.{year}-01.nc"));
        fs::write(&data, b"").unwrap();
        let sidecar = json!({
            "frequency": "1mon",
            "variable": ["aice"],
            "start_date": format!("{start}, 00:00:00"),
            "end_date": format!("{end}, 00:00:00"),
        });
        fs::write(SidecarParser::sidecar_path(&data), sidecar.to_string()).unwrap();
    }
    fs::write(ice.join("iced.restart.nc"), b"").unwrap();

    let kind: BuilderKind = "AccessOm2Builder".parse().unwrap();
    let config = kind.config(&Record::new()).unwrap();
    let parser = kind.parser(SidecarParser::new()).unwrap();
    let builder = DatastoreBuilder::new(config, parser, Schema::file().unwrap());
    let outcome = builder
        .build("om2", "test", &[root.join("1deg_jra55")])
        .unwrap();

    assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
    let records = &outcome.datastore.records;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["realm"], json!("seaIce"));
    assert_eq!(records[0]["file_id"], json!("iceh_XXXX_XX"));
    assert_eq!(records[0]["start_date"], json!("1990-01-01, 00:00:00"));
    assert_eq!(records[0]["end_date"], json!("1992-01-01, 00:00:00"));
    assert_eq!(records[0]["file_count"], json!(2));
}

#[test]
fn datastore_save_and_load() {
    let schema = Schema::file().unwrap();
    let groupby = vec!["variable".to_string(), "frequency".to_string()];
    let outcome = group_records(
        vec![file("/data/a.nc", "ts", "1mon"), file("/data/b.nc", "42", "1day")],
        &groupby,
        &[],
        &schema,
    );
    let datastore = Datastore::new("exp", "test run", groupby, Vec::new(), outcome.records);

    let temp = tempfile::tempdir().unwrap();
    let descriptor = datastore.save(&utf8_dir(&temp)).unwrap();
    assert!(descriptor.ends_with("exp.json"));
    let loaded = Datastore::load(&descriptor).unwrap();
    assert_eq!(loaded, datastore);
    assert!(loaded.columns_with_iterables().contains("path"));
}

#[test]
fn invalid_first_asset_is_reported_not_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_dir(&temp);
    for name in ["a_norealm_1990.nc", "ocean_month_1990.nc", "ocean_month_1991.nc"] {
        fs::write(root.join(name), b"").unwrap();
    }

    let builder = DatastoreBuilder::new(generic_config(), NameParser, Schema::file().unwrap());
    let outcome = builder.build("exp", "test", &[root.clone()]).unwrap();

    assert_eq!(outcome.datastore.records.len(), 1);
    assert_eq!(outcome.datastore.records[0]["file_count"], json!(2));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].path, root.join("a_norealm_1990.nc").to_string());
    assert!(outcome.failures[0].reason.contains("realm"));
}

#[test]
fn no_schema_valid_asset_fails_the_build() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_dir(&temp);
    for name in ["a_bad_1990.nc", "b_norealm_1990.nc"] {
        fs::write(root.join(name), b"").unwrap();
    }

    let builder = DatastoreBuilder::new(generic_config(), NameParser, Schema::file().unwrap());
    assert_matches!(
        builder.validate_parser("exp", &builder.get_assets(&[root.clone()]).unwrap()),
        Err(CatalogError::NoValidAssets(_))
    );
    let err = builder.build("exp", "test", &[root]).unwrap_err();
    assert_matches!(err, CatalogError::NoValidAssets(name) if name == "exp");
}

#[test]
fn numeric_coordinates_join_in_numeric_order() {
    let schema = Schema::file().unwrap();
    let mut late = file("/d/a.nc", "ts", "1yr");
    late.insert("start_year".to_string(), json!(10));
    late.insert("end_year".to_string(), json!(11));
    let mut early = file("/d/b.nc", "ts", "1yr");
    early.insert("start_year".to_string(), json!(9));
    early.insert("end_year".to_string(), json!(10));

    let outcome = group_records(
        vec![late, early],
        &["variable".to_string()],
        &[Aggregation::join_existing("start_year", "time")],
        &schema,
    );
    assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
    let joined = &outcome.records[0];
    assert_eq!(joined["start_year"], json!(9));
    assert_eq!(joined["end_year"], json!(11));
    assert_eq!(joined["path"], json!(["/d/b.nc", "/d/a.nc"]));
}
