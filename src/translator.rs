//! Map a datastore's native vocabulary onto the canonical catalog columns.
//!
//! Every target column is resolved per datastore record by an ordered list of
//! lookups (record, source attributes, experiment metadata); a translator
//! variant may put a rule in front of that chain for columns whose values need
//! remapping. Rows are then collapsed to one per grouping-column tuple.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::builder::Datastore;
use crate::domain::{NAME_COLUMN, PATH_COLUMN, Record, group_key, push_unique, value_items};
use crate::error::CatalogError;
use crate::schema::Schema;

const FREQUENCY_TRANSLATIONS: &[(&str, &str)] = &[
    ("monthly-averaged-by-hour", "1hr"),
    ("monthly-averaged-by-day", "1hr"),
    ("3hrPt", "3hr"),
    ("6hrPt", "6hr"),
    ("daily", "1day"),
    ("day", "1day"),
    ("mon", "1mon"),
    ("monthly-averaged", "1mon"),
    ("monC", "1mon"),
    ("monClim", "1mon"),
    ("monPt", "1mon"),
    ("sem", "3mon"),
    ("subhrPt", "subhr"),
    ("yr", "1yr"),
    ("yrPt", "1yr"),
];

/// ERA5 product directories whose frequency is not spelled out.
const ERA5_FREQUENCY_TRANSLATIONS: &[(&str, &str)] = &[
    ("reanalysis", "1hr"),
    ("v3-1", "1day"),
    ("v4-0", "1day"),
    ("v1-1", "1hr"),
];

const REALM_TRANSLATIONS: &[(&str, &str)] = &[
    ("na", "none"),
    ("landonly", "land"),
    ("ocnBgChem", "ocnBgchem"),
    ("seaice", "seaIce"),
];

fn lookup_table(table: &'static [(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
}

/// Everything a translator can read a column from.
#[derive(Debug, Clone, Default)]
pub struct TranslationSource {
    /// Aggregated datastore records, one translated row each.
    pub records: Vec<Record>,
    /// Top-level attributes of the source itself (`name`, `description`, ...).
    pub attributes: Record,
    /// The experiment metadata document attached to the source.
    pub metadata: Record,
}

impl TranslationSource {
    pub fn from_datastore(datastore: &Datastore, metadata: &Record) -> Self {
        let mut attributes = Record::new();
        attributes.insert(NAME_COLUMN.to_string(), Value::String(datastore.name.clone()));
        attributes.insert(
            "description".to_string(),
            Value::String(datastore.description.clone()),
        );
        Self {
            records: datastore.records.clone(),
            attributes,
            metadata: metadata.clone(),
        }
    }

    /// Source made of already-canonical rows, for re-translation.
    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }
}

type Lookup = fn(&TranslationSource, &Record, &str) -> Option<Value>;

/// Base lookup order, first hit wins.
const BASE_LOOKUPS: &[Lookup] = &[lookup_record, lookup_attributes, lookup_metadata];

fn lookup_record(_: &TranslationSource, record: &Record, column: &str) -> Option<Value> {
    record.get(column).filter(|value| !value.is_null()).cloned()
}

fn lookup_attributes(source: &TranslationSource, _: &Record, column: &str) -> Option<Value> {
    source
        .attributes
        .get(column)
        .filter(|value| !value.is_null())
        .cloned()
}

fn lookup_metadata(source: &TranslationSource, _: &Record, column: &str) -> Option<Value> {
    source
        .metadata
        .get(column)
        .filter(|value| !value.is_null())
        .cloned()
}

fn base_lookup(source: &TranslationSource, record: &Record, column: &str) -> Option<Value> {
    BASE_LOOKUPS
        .iter()
        .find_map(|lookup| lookup(source, record, column))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    Identity,
    Realm,
    Frequency,
    Era5Frequency,
}

impl Transform {
    fn apply(self, raw: &str) -> Vec<String> {
        match self {
            Transform::Identity => vec![raw.to_string()],
            Transform::Realm => raw
                .split(' ')
                .filter(|realm| !realm.is_empty())
                .map(|realm| lookup_table(REALM_TRANSLATIONS, realm).unwrap_or(realm).to_string())
                .collect(),
            Transform::Frequency => {
                vec![lookup_table(FREQUENCY_TRANSLATIONS, raw).unwrap_or(raw).to_string()]
            }
            Transform::Era5Frequency => {
                let product = lookup_table(ERA5_FREQUENCY_TRANSLATIONS, raw).unwrap_or(raw);
                Transform::Frequency.apply(product)
            }
        }
    }

    fn apply_value(self, value: &Value) -> Value {
        let mut mapped = Vec::new();
        for item in value_items(value) {
            match item {
                Value::String(text) => {
                    for out in self.apply(&text) {
                        push_unique(&mut mapped, Value::String(out));
                    }
                }
                other => push_unique(&mut mapped, other),
            }
        }
        match (value, mapped.len()) {
            (Value::Array(_), _) => Value::Array(mapped),
            (_, 1) => mapped.remove(0),
            _ => Value::Array(mapped),
        }
    }
}

/// Where a specialized translator reads a canonical column from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    /// Read another column and remap its values.
    Rename {
        from: &'static str,
        transform: Transform,
    },
    Constant(&'static str),
    /// A segment of the first constituent path, split on `/`.
    PathSegment { index: usize, transform: Transform },
}

impl Rule {
    /// The rule's value, or `None` when its input is absent so the base
    /// lookups apply. Keeps re-translation of canonical rows stable.
    fn apply(self, source: &TranslationSource, record: &Record) -> Option<Value> {
        match self {
            Rule::Rename { from, transform } => {
                base_lookup(source, record, from).map(|value| transform.apply_value(&value))
            }
            Rule::Constant(value) => Some(Value::String(value.to_string())),
            Rule::PathSegment { index, transform } => {
                let first = record
                    .get(PATH_COLUMN)
                    .map(value_items)
                    .and_then(|items| items.into_iter().next())?;
                let segment = first.as_str()?.split('/').nth(index)?.to_string();
                Some(transform.apply_value(&Value::String(segment)))
            }
        }
    }
}

const fn rename(from: &'static str, transform: Transform) -> Rule {
    Rule::Rename { from, transform }
}

const CMIP6_RULES: &[(&str, Rule)] = &[
    ("model", rename("source_id", Transform::Identity)),
    ("realm", rename("realm", Transform::Realm)),
    ("frequency", rename("frequency", Transform::Frequency)),
    ("variable", rename("variable_id", Transform::Identity)),
];

const CMIP5_RULES: &[(&str, Rule)] = &[
    ("model", rename("model", Transform::Identity)),
    ("realm", rename("realm", Transform::Realm)),
    ("frequency", rename("frequency", Transform::Frequency)),
    ("variable", rename("variable", Transform::Identity)),
];

const BARPA_RULES: &[(&str, Rule)] = &[
    ("model", rename("source_id", Transform::Identity)),
    ("realm", Rule::Constant("none")),
    ("frequency", rename("freq", Transform::Frequency)),
    ("variable", rename("variable_id", Transform::Identity)),
];

const CORDEX_RULES: &[(&str, Rule)] = &[
    ("model", rename("source_id", Transform::Identity)),
    ("realm", Rule::Constant("none")),
    ("variable", rename("variable_id", Transform::Identity)),
];

const ERA5_RULES: &[(&str, Rule)] = &[
    (
        "model",
        Rule::PathSegment {
            index: 4,
            transform: Transform::Identity,
        },
    ),
    ("realm", Rule::Constant("none")),
    (
        "frequency",
        Rule::PathSegment {
            index: 6,
            transform: Transform::Era5Frequency,
        },
    ),
    ("variable", rename("variable", Transform::Identity)),
];

const CCAM_RULES: &[(&str, Rule)] = &[
    ("model", rename("project_id", Transform::Identity)),
    ("realm", Rule::Constant("none")),
    ("frequency", rename("frequency", Transform::Frequency)),
    ("variable", rename("variable_id", Transform::Identity)),
];

const NARCLIM_RULES: &[(&str, Rule)] = &[
    ("model", rename("source_id", Transform::Identity)),
    ("realm", Rule::Constant("atmos")),
    ("frequency", rename("frequency", Transform::Frequency)),
    ("variable", rename("variable_id", Transform::Identity)),
];

/// The closed set of translator variants, selected by name in configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorKind {
    Default,
    Cmip6,
    Cmip5,
    Barpa,
    Cordex,
    Era5,
    Ccam,
    Narclim,
}

impl TranslatorKind {
    fn rules(self) -> &'static [(&'static str, Rule)] {
        match self {
            TranslatorKind::Default => &[],
            TranslatorKind::Cmip6 => CMIP6_RULES,
            TranslatorKind::Cmip5 => CMIP5_RULES,
            TranslatorKind::Barpa => BARPA_RULES,
            TranslatorKind::Cordex => CORDEX_RULES,
            TranslatorKind::Era5 => ERA5_RULES,
            TranslatorKind::Ccam => CCAM_RULES,
            TranslatorKind::Narclim => NARCLIM_RULES,
        }
    }

    fn rule(self, column: &str) -> Option<Rule> {
        self.rules()
            .iter()
            .find(|(target, _)| *target == column)
            .map(|(_, rule)| *rule)
    }
}

impl fmt::Display for TranslatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TranslatorKind::Default => "DefaultTranslator",
            TranslatorKind::Cmip6 => "Cmip6Translator",
            TranslatorKind::Cmip5 => "Cmip5Translator",
            TranslatorKind::Barpa => "BarpaTranslator",
            TranslatorKind::Cordex => "CordexTranslator",
            TranslatorKind::Era5 => "Era5Translator",
            TranslatorKind::Ccam => "CcamTranslator",
            TranslatorKind::Narclim => "NarclimTranslator",
        };
        write!(f, "{name}")
    }
}

impl FromStr for TranslatorKind {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let key = trimmed.strip_suffix("Translator").unwrap_or(trimmed);
        match key.to_ascii_lowercase().as_str() {
            "default" => Ok(TranslatorKind::Default),
            "cmip6" => Ok(TranslatorKind::Cmip6),
            "cmip5" => Ok(TranslatorKind::Cmip5),
            "barpa" => Ok(TranslatorKind::Barpa),
            "cordex" => Ok(TranslatorKind::Cordex),
            "era5" => Ok(TranslatorKind::Era5),
            "ccam" => Ok(TranslatorKind::Ccam),
            "narclim" => Ok(TranslatorKind::Narclim),
            _ => Err(CatalogError::UnknownTranslator(value.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Translator {
    kind: TranslatorKind,
    columns: Vec<String>,
    groupby: Vec<String>,
}

impl Translator {
    pub fn new(kind: TranslatorKind, columns: Vec<String>, groupby: Vec<String>) -> Self {
        Self {
            kind,
            columns,
            groupby,
        }
    }

    pub fn kind(&self) -> TranslatorKind {
        self.kind
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Translate `source` into canonical rows, one per unique grouping tuple,
    /// in first-seen order. `schema` decides which columns hold lists.
    pub fn translate(
        &self,
        source: &TranslationSource,
        schema: &Schema,
    ) -> Result<Vec<Record>, CatalogError> {
        let iterable: Vec<bool> = self
            .columns
            .iter()
            .map(|column| schema.can_be_array(column))
            .collect();

        let mut order: Vec<Vec<String>> = Vec::new();
        let mut groups: HashMap<Vec<String>, Vec<Record>> = HashMap::new();
        for record in &source.records {
            let mut row = Record::new();
            for (column, is_iterable) in self.columns.iter().zip(&iterable) {
                let value = self.resolve(source, record, column);
                row.insert(column.clone(), normalize(value, *is_iterable));
            }
            let key: Vec<String> = self
                .groupby
                .iter()
                .map(|column| group_key(row.get(column)))
                .collect();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }

        let mut translated = Vec::with_capacity(order.len());
        for key in order {
            let Some(rows) = groups.remove(&key) else {
                continue;
            };
            translated.push(self.merge(rows, &iterable)?);
        }
        debug!(
            translator = %self.kind,
            input = source.records.len(),
            output = translated.len(),
            "translated datastore"
        );
        Ok(translated)
    }

    fn resolve(&self, source: &TranslationSource, record: &Record, column: &str) -> Value {
        self.kind
            .rule(column)
            .and_then(|rule| rule.apply(source, record))
            .or_else(|| base_lookup(source, record, column))
            .unwrap_or(Value::Null)
    }

    fn merge(&self, rows: Vec<Record>, iterable: &[bool]) -> Result<Record, CatalogError> {
        let mut merged = Record::new();
        for (column, is_iterable) in self.columns.iter().zip(iterable) {
            let values = rows
                .iter()
                .filter_map(|row| row.get(column))
                .filter(|value| !value.is_null());
            let combined = if self.groupby.contains(column) {
                values.cloned().next().unwrap_or(Value::Null)
            } else if *is_iterable {
                let mut items = Vec::new();
                for value in values {
                    for item in value_items(value) {
                        push_unique(&mut items, item);
                    }
                }
                if items.is_empty() {
                    Value::Null
                } else {
                    Value::Array(items)
                }
            } else {
                let mut distinct: Vec<Value> = Vec::new();
                for value in values {
                    push_unique(&mut distinct, value.clone());
                }
                match distinct.len() {
                    0 => Value::Null,
                    1 => distinct.remove(0),
                    _ => {
                        return Err(CatalogError::Translation(format!(
                            "column '{column}' holds several values within one group; \
                             only list-valued columns can be merged"
                        )));
                    }
                }
            };
            merged.insert(column.clone(), combined);
        }
        Ok(merged)
    }
}

fn normalize(value: Value, iterable: bool) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Array(items) if items.is_empty() => Value::Null,
        Value::Array(items) if iterable => Value::Array(items),
        other if iterable => Value::Array(vec![other]),
        other => other,
    }
}
