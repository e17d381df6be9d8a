use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

/// One metadata row: attribute name to value. Ordered so serialized output is stable.
pub type Record = BTreeMap<String, Value>;

pub const PATH_COLUMN: &str = "path";
pub const VARIABLE_COLUMN: &str = "variable";
pub const FILE_COUNT_COLUMN: &str = "file_count";
pub const NAME_COLUMN: &str = "name";
pub const UUID_COLUMN: &str = "experiment_uuid";
pub const REFERENCE_COLUMN: &str = "datastore";

const VERSION_PATTERN: &str = r"^v(2\d{3})-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])$";

/// Date-stamped catalog version, e.g. `v2025-01-01`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CatalogVersion(String);

impl CatalogVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn today() -> Self {
        Self(format!("v{}", Local::now().format("%Y-%m-%d")))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(format!("v{}", date.format("%Y-%m-%d")))
    }

    /// True when `name` is a well-formed version string; used to scan build directories.
    pub fn is_version_name(name: &str) -> bool {
        name.parse::<CatalogVersion>().is_ok()
    }
}

impl fmt::Display for CatalogVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CatalogVersion {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let normalized = if trimmed.starts_with('v') {
            trimmed.to_string()
        } else {
            format!("v{trimmed}")
        };
        let pattern =
            Regex::new(VERSION_PATTERN).map_err(|err| CatalogError::InvalidVersion(err.to_string()))?;
        if !pattern.is_match(&normalized) {
            return Err(CatalogError::InvalidVersion(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for CatalogVersion {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CatalogVersion> for String {
    fn from(value: CatalogVersion) -> Self {
        value.0
    }
}

/// Flatten a value into its members: arrays yield their elements, null yields nothing.
pub fn value_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Push `value` unless an equal value was already seen. Keeps first-seen order.
pub fn push_unique(target: &mut Vec<Value>, value: Value) {
    if !target.contains(&value) {
        target.push(value);
    }
}

/// Stable grouping key for a value. Missing values map to the `null` sentinel.
pub fn group_key(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
