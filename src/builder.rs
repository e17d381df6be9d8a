//! Datastore builder: crawl source paths, parse every asset on a worker pool,
//! then group file records into one aggregated record per grouping-key tuple.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::{
    FILE_COUNT_COLUMN, PATH_COLUMN, Record, group_key, push_unique, value_items,
};
use crate::error::CatalogError;
use crate::parser::{AssetParser, PathPatternParser};
use crate::pool::{WorkerPool, isolate};
use crate::schema::Schema;
use crate::store::{read_json, write_json_atomic};
use crate::table::{read_table_file, write_table_file};

pub const DATASTORE_FORMAT_VERSION: &str = "0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Concatenate files along an existing, monotonically ordered coordinate.
    JoinExisting,
    /// Stack files along a new dimension labelled by a categorical attribute.
    JoinNew,
    /// Collapse a repeated attribute into its distinct values.
    Union,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(rename = "type")]
    pub kind: AggregationKind,
    pub attribute_name: String,
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

impl Aggregation {
    pub fn join_existing(attribute_name: &str, dim: &str) -> Self {
        let mut options = serde_json::Map::new();
        options.insert("dim".to_string(), Value::String(dim.to_string()));
        options.insert("combine".to_string(), Value::String("by_coords".to_string()));
        Self {
            kind: AggregationKind::JoinExisting,
            attribute_name: attribute_name.to_string(),
            options,
        }
    }

    pub fn join_new(attribute_name: &str) -> Self {
        Self {
            kind: AggregationKind::JoinNew,
            attribute_name: attribute_name.to_string(),
            options: serde_json::Map::new(),
        }
    }

    pub fn union(attribute_name: &str) -> Self {
        Self {
            kind: AggregationKind::Union,
            attribute_name: attribute_name.to_string(),
            options: serde_json::Map::new(),
        }
    }

    /// Attribute closing the range opened by `attribute_name` in a join_existing.
    fn end_attribute(&self) -> String {
        self.options
            .get("end_attribute_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.attribute_name.replace("start", "end"))
    }
}

/// Crawl and grouping settings for one builder variant.
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderConfig {
    pub depth: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub data_format: String,
    pub groupby: Vec<String>,
    pub aggregations: Vec<Aggregation>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            depth: 0,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            data_format: "netcdf".to_string(),
            groupby: vec!["file_id".to_string(), "frequency".to_string()],
            aggregations: Vec::new(),
        }
    }
}

/// The closed set of builder variants, selected by name in configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    AccessOm2,
    AccessEsm15,
    AccessCm2,
    Generic,
}

impl BuilderKind {
    pub fn config(&self, options: &Record) -> Result<BuilderConfig, CatalogError> {
        let time_join = Aggregation::join_existing("start_date", "time");
        match self {
            BuilderKind::AccessOm2 => Ok(BuilderConfig {
                depth: 3,
                include_patterns: vec!["*.nc".to_string()],
                exclude_patterns: vec!["*restart*".to_string(), "*o2i.nc".to_string()],
                aggregations: vec![time_join],
                ..BuilderConfig::default()
            }),
            BuilderKind::AccessEsm15 | BuilderKind::AccessCm2 => {
                let mut aggregations = vec![time_join];
                if options.get("ensemble").and_then(Value::as_bool).unwrap_or(false) {
                    aggregations.push(Aggregation::join_new("member"));
                }
                Ok(BuilderConfig {
                    depth: 3,
                    include_patterns: vec!["*.nc*".to_string()],
                    exclude_patterns: vec!["*restart*".to_string()],
                    aggregations,
                    ..BuilderConfig::default()
                })
            }
            BuilderKind::Generic => generic_config(options),
        }
    }

    /// Wrap `inner` with the path conventions of this variant.
    pub fn parser<P: AssetParser + 'static>(
        &self,
        inner: P,
    ) -> Result<Box<dyn AssetParser>, CatalogError> {
        let realm_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        match self {
            BuilderKind::AccessOm2 => Ok(Box::new(PathPatternParser::new(
                compile(r".*/([^/]*)/([^/]*)/output\d+/(?P<realm>[^/]*)/.*\.nc")?,
                realm_map(&[("ice", "seaIce")]),
                inner,
            ))),
            BuilderKind::AccessEsm15 | BuilderKind::AccessCm2 => Ok(Box::new(
                PathPatternParser::new(
                    compile(r".*/(?P<member>[^/]*)/history/(?P<realm>[^/]*)/.*\.nc")?,
                    realm_map(&[("atm", "atmos"), ("ocn", "ocean"), ("ice", "seaIce")]),
                    inner,
                )
                .strip_from_file_id("member"),
            )),
            BuilderKind::Generic => Ok(Box::new(inner)),
        }
    }
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderKind::AccessOm2 => write!(f, "AccessOm2Builder"),
            BuilderKind::AccessEsm15 => write!(f, "AccessEsm15Builder"),
            BuilderKind::AccessCm2 => write!(f, "AccessCm2Builder"),
            BuilderKind::Generic => write!(f, "GenericBuilder"),
        }
    }
}

impl FromStr for BuilderKind {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "AccessOm2Builder" | "access-om2" => Ok(BuilderKind::AccessOm2),
            "AccessEsm15Builder" | "access-esm1.5" => Ok(BuilderKind::AccessEsm15),
            "AccessCm2Builder" | "access-cm2" => Ok(BuilderKind::AccessCm2),
            "GenericBuilder" | "generic" => Ok(BuilderKind::Generic),
            _ => Err(CatalogError::UnknownBuilder(value.to_string())),
        }
    }
}

fn generic_config(options: &Record) -> Result<BuilderConfig, CatalogError> {
    let strings = |key: &str| -> Vec<String> {
        options
            .get(key)
            .map(value_items)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    };
    let mut config = BuilderConfig {
        depth: options
            .get("depth")
            .and_then(Value::as_u64)
            .map(|depth| depth as usize)
            .unwrap_or(0),
        include_patterns: strings("include_patterns"),
        exclude_patterns: strings("exclude_patterns"),
        ..BuilderConfig::default()
    };
    if let Some(format) = options.get("data_format").and_then(Value::as_str) {
        config.data_format = format.to_string();
    }
    let groupby = strings("groupby_attrs");
    if !groupby.is_empty() {
        config.groupby = groupby;
    }
    if let Some(raw) = options.get("aggregations") {
        config.aggregations = serde_json::from_value(raw.clone())
            .map_err(|err| CatalogError::InvalidAggregation(err.to_string()))?;
    }
    Ok(config)
}

fn compile(pattern: &str) -> Result<Regex, CatalogError> {
    Regex::new(pattern).map_err(|err| CatalogError::ConfigParse(err.to_string()))
}

/// An asset left out of a datastore, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFailure {
    pub path: String,
    pub reason: String,
}

/// Result of grouping: the aggregated records plus everything that was dropped.
#[derive(Debug, Clone, Default)]
pub struct GroupOutcome {
    pub records: Vec<Record>,
    pub failures: Vec<AssetFailure>,
}

/// Group validated file records by `groupby` and apply `aggregations` to each group.
///
/// Input records failing `schema` are dropped and reported; so are aggregated
/// records failing it. Output order depends only on the grouping-key values.
pub fn group_records(
    records: Vec<Record>,
    groupby: &[String],
    aggregations: &[Aggregation],
    schema: &Schema,
) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();
    let mut valid = Vec::with_capacity(records.len());
    for record in records {
        let violations = schema.validate_record(&record);
        if violations.is_empty() {
            valid.push(record);
        } else {
            outcome.failures.push(AssetFailure {
                path: record_path(&record),
                reason: describe(&violations),
            });
        }
    }
    valid.sort_by_key(record_path);

    let mut groups: BTreeMap<Vec<String>, Vec<Record>> = BTreeMap::new();
    for record in valid {
        let key = groupby
            .iter()
            .map(|column| group_key(record.get(column)))
            .collect();
        groups.entry(key).or_default().push(record);
    }

    for members in groups.into_values() {
        let aggregated = aggregate_group(members, groupby, aggregations, schema);
        let violations = schema.validate_record(&aggregated);
        if violations.is_empty() {
            outcome.records.push(aggregated);
        } else {
            outcome.failures.push(AssetFailure {
                path: record_path(&aggregated),
                reason: describe(&violations),
            });
        }
    }
    outcome
}

fn aggregate_group(
    mut members: Vec<Record>,
    groupby: &[String],
    aggregations: &[Aggregation],
    schema: &Schema,
) -> Record {
    let mut handled: BTreeSet<String> = groupby.iter().cloned().collect();
    handled.insert(PATH_COLUMN.to_string());
    handled.insert(FILE_COUNT_COLUMN.to_string());

    // Order along the concatenated coordinate; path breaks ties.
    if let Some(join) = aggregations
        .iter()
        .find(|agg| agg.kind == AggregationKind::JoinExisting)
    {
        members.sort_by(|a, b| {
            coordinate_cmp(a.get(&join.attribute_name), b.get(&join.attribute_name))
                .then_with(|| record_path(a).cmp(&record_path(b)))
        });
    }

    let mut aggregated = Record::new();
    for column in groupby {
        if let Some(value) = members.first().and_then(|first| first.get(column)) {
            aggregated.insert(column.clone(), value.clone());
        }
    }

    for aggregation in aggregations {
        let column = &aggregation.attribute_name;
        handled.insert(column.clone());
        match aggregation.kind {
            AggregationKind::JoinExisting => {
                let end_column = aggregation.end_attribute();
                handled.insert(end_column.clone());
                let starts = members.iter().filter_map(|m| m.get(column)).filter(|v| !v.is_null());
                let ends = members.iter().filter_map(|m| m.get(&end_column)).filter(|v| !v.is_null());
                if let Some(start) = starts.min_by(|a, b| coordinate_cmp(Some(*a), Some(*b))) {
                    aggregated.insert(column.clone(), start.clone());
                }
                if let Some(end) = ends.max_by(|a, b| coordinate_cmp(Some(*a), Some(*b))) {
                    aggregated.insert(end_column, end.clone());
                }
            }
            AggregationKind::JoinNew => {
                let mut values = Vec::new();
                for value in members.iter().filter_map(|m| m.get(column)) {
                    if !value.is_null() {
                        push_unique(&mut values, value.clone());
                    }
                }
                aggregated.insert(column.clone(), Value::Array(values));
            }
            AggregationKind::Union => {
                let mut values = Vec::new();
                for value in members.iter().filter_map(|m| m.get(column)) {
                    for item in value_items(value) {
                        push_unique(&mut values, item);
                    }
                }
                aggregated.insert(column.clone(), Value::Array(values));
            }
        }
    }

    let columns: BTreeSet<&String> = members.iter().flat_map(|m| m.keys()).collect();
    for column in columns {
        if handled.contains(column) {
            continue;
        }
        if let Some(value) = collapse(&members, column, schema.can_be_array(column)) {
            aggregated.insert(column.clone(), value);
        } else {
            debug!(column = %column, "dropping per-file attribute that varies within a group");
        }
    }

    let paths: Vec<Value> = members
        .iter()
        .map(|member| Value::String(record_path(member)))
        .collect();
    aggregated.insert(FILE_COUNT_COLUMN.to_string(), Value::from(paths.len()));
    aggregated.insert(PATH_COLUMN.to_string(), Value::Array(paths));
    aggregated
}

/// Order of two coordinate values: numbers numerically, strings lexically,
/// anything else by its grouping key.
fn coordinate_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => group_key(a).cmp(&group_key(b)),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => group_key(a).cmp(&group_key(b)),
    }
}

/// One value for `column` across a group: the shared value when all members
/// agree, the distinct values when the column may hold a list, otherwise none.
fn collapse(members: &[Record], column: &str, can_be_array: bool) -> Option<Value> {
    let present: Vec<&Value> = members
        .iter()
        .filter_map(|member| member.get(column))
        .collect();
    let first = present.first()?;
    if present.len() == members.len() && present.iter().all(|value| value == first) {
        return Some((*first).clone());
    }
    if !can_be_array {
        return None;
    }
    let mut values = Vec::new();
    for value in present {
        for item in value_items(value) {
            push_unique(&mut values, item);
        }
    }
    Some(Value::Array(values))
}

fn record_path(record: &Record) -> String {
    match record.get(PATH_COLUMN) {
        Some(Value::String(path)) => path.clone(),
        Some(other) => other.to_string(),
        None => "<unknown>".to_string(),
    }
}

fn describe(violations: &[crate::schema::Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a datastore build: the datastore and every asset that was left out.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub datastore: Datastore,
    pub failures: Vec<AssetFailure>,
}

pub struct DatastoreBuilder<P: AssetParser> {
    config: BuilderConfig,
    parser: P,
    schema: Schema,
    pool: WorkerPool,
}

impl<P: AssetParser> DatastoreBuilder<P> {
    pub fn new(config: BuilderConfig, parser: P, schema: Schema) -> Self {
        Self {
            config,
            parser,
            schema,
            pool: WorkerPool::default(),
        }
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Files under `paths` (up to the configured depth) that pass the include
    /// and exclude patterns, sorted and de-duplicated.
    pub fn get_assets(&self, paths: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>, CatalogError> {
        let include = patterns(&self.config.include_patterns)?;
        let exclude = patterns(&self.config.exclude_patterns)?;
        let mut assets = BTreeSet::new();
        for root in paths {
            if !root.as_std_path().exists() {
                warn!(path = %root, "source path does not exist");
                continue;
            }
            for entry in WalkDir::new(root.as_std_path()).max_depth(self.config.depth + 1) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable directory entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(path) = entry.path().to_str() else {
                    continue;
                };
                if path.ends_with(".json") && self.parser_owns_sidecar(path) {
                    continue;
                }
                let included = include.is_empty() || include.iter().any(|p| p.matches(path));
                let excluded = exclude.iter().any(|p| p.matches(path));
                if included && !excluded {
                    assets.insert(Utf8PathBuf::from(path));
                }
            }
        }
        Ok(assets.into_iter().collect())
    }

    fn parser_owns_sidecar(&self, path: &str) -> bool {
        let data_path = &path[..path.len() - ".json".len()];
        Utf8Path::new(data_path).as_std_path().is_file()
    }

    /// Parse every asset on the worker pool. Results are in asset order.
    pub fn parse_assets(
        &self,
        assets: &[Utf8PathBuf],
    ) -> Result<(Vec<Record>, Vec<AssetFailure>), CatalogError> {
        let results = self.pool.map(assets, |asset| self.parser.parse(asset))?;
        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (asset, result) in assets.iter().zip(results) {
            match result {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!(path = %asset, %reason, "failed to parse asset");
                    failures.push(AssetFailure {
                        path: asset.to_string(),
                        reason,
                    });
                }
            }
        }
        Ok((records, failures))
    }

    /// Parse assets in order until one yields a valid record, so a parser that
    /// cannot produce anything usable fails before the full crawl. Assets that
    /// do not parse or validate here are left for the crawl to report.
    pub fn validate_parser(&self, name: &str, assets: &[Utf8PathBuf]) -> Result<(), CatalogError> {
        for asset in assets {
            let Ok(record) = isolate(|| self.parser.parse(asset)) else {
                continue;
            };
            let violations = self.schema.validate_record(&record);
            if violations.is_empty() {
                return Ok(());
            }
            debug!(path = %asset, reason = %describe(&violations), "asset fails schema; trying next");
        }
        Err(CatalogError::NoValidAssets(name.to_string()))
    }

    pub fn build(
        &self,
        name: &str,
        description: &str,
        paths: &[Utf8PathBuf],
    ) -> Result<BuildOutcome, CatalogError> {
        let assets = self.get_assets(paths)?;
        info!(dataset = name, assets = assets.len(), "discovered assets");
        if assets.is_empty() {
            return Err(CatalogError::NoValidAssets(name.to_string()));
        }

        self.validate_parser(name, &assets)?;

        let (records, mut failures) = self.parse_assets(&assets)?;
        let outcome = group_records(
            records,
            &self.config.groupby,
            &self.config.aggregations,
            &self.schema,
        );
        failures.extend(outcome.failures);
        if outcome.records.is_empty() {
            return Err(CatalogError::NoValidAssets(name.to_string()));
        }

        let datastore = Datastore::new(
            name,
            description,
            self.config.groupby.clone(),
            self.config.aggregations.clone(),
            outcome.records,
        )
        .with_format(&self.config.data_format);
        info!(
            dataset = name,
            records = datastore.records.len(),
            failures = failures.len(),
            "built datastore"
        );
        Ok(BuildOutcome {
            datastore,
            failures,
        })
    }
}

fn patterns(raw: &[String]) -> Result<Vec<Pattern>, CatalogError> {
    raw.iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|err| CatalogError::ConfigParse(format!("{pattern}: {err}")))
        })
        .collect()
}

/// Per-dataset catalog of aggregated asset records.
#[derive(Debug, Clone, PartialEq)]
pub struct Datastore {
    pub name: String,
    pub description: String,
    pub data_format: String,
    pub groupby: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatastoreDescriptor {
    esmcat_version: String,
    id: String,
    description: String,
    catalog_file: String,
    data_format: String,
    groupby_attrs: Vec<String>,
    aggregations: Vec<Aggregation>,
    columns_with_iterables: Vec<String>,
}

impl Datastore {
    pub fn new(
        name: &str,
        description: &str,
        groupby: Vec<String>,
        aggregations: Vec<Aggregation>,
        records: Vec<Record>,
    ) -> Self {
        let mut columns: Vec<String> = records
            .iter()
            .flat_map(|record| record.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|column| column != PATH_COLUMN)
            .collect();
        columns.insert(0, PATH_COLUMN.to_string());
        Self {
            name: name.to_string(),
            description: description.to_string(),
            data_format: "netcdf".to_string(),
            groupby,
            aggregations,
            columns,
            records,
        }
    }

    pub fn with_format(mut self, data_format: &str) -> Self {
        self.data_format = data_format.to_string();
        self
    }

    /// Columns holding a list in at least one record.
    pub fn columns_with_iterables(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|record| record.iter())
            .filter(|(_, value)| value.is_array())
            .map(|(column, _)| column.clone())
            .collect()
    }

    /// Write `<dir>/<name>.json` and its `<name>.csv.gz` table. Returns the descriptor path.
    pub fn save(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, CatalogError> {
        let table_name = format!("{}.csv.gz", self.name);
        let descriptor = DatastoreDescriptor {
            esmcat_version: DATASTORE_FORMAT_VERSION.to_string(),
            id: self.name.clone(),
            description: self.description.clone(),
            catalog_file: table_name.clone(),
            data_format: self.data_format.clone(),
            groupby_attrs: self.groupby.clone(),
            aggregations: self.aggregations.clone(),
            columns_with_iterables: self.columns_with_iterables().into_iter().collect(),
        };
        write_table_file(&dir.join(&table_name), &self.columns, &self.records)?;
        let descriptor_path = dir.join(format!("{}.json", self.name));
        write_json_atomic(&descriptor_path, &descriptor)?;
        Ok(descriptor_path)
    }

    /// Delete the files [`Datastore::save`] wrote to `dir`.
    pub fn remove(&self, dir: &Utf8Path) -> Result<(), CatalogError> {
        for file in [format!("{}.json", self.name), format!("{}.csv.gz", self.name)] {
            let path = dir.join(file);
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CatalogError::Filesystem(format!("remove {path}: {err}"))),
            }
        }
        Ok(())
    }

    pub fn load(descriptor_path: &Utf8Path) -> Result<Self, CatalogError> {
        let descriptor: DatastoreDescriptor = read_json(descriptor_path)?;
        let dir = descriptor_path.parent().unwrap_or(Utf8Path::new("."));
        let (columns, rows) = read_table_file(&dir.join(&descriptor.catalog_file))?;
        let records = rows
            .into_iter()
            .map(|row| row.into_iter().filter(|(_, value)| !value.is_null()).collect())
            .collect();
        Ok(Self {
            name: descriptor.id,
            description: descriptor.description,
            data_format: descriptor.data_format,
            groupby: descriptor.groupby_attrs,
            aggregations: descriptor.aggregations,
            columns,
            records,
        })
    }
}
