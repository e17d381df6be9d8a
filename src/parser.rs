//! Asset parsers: turn one data file into a file-level metadata record.
//!
//! Reading the scientific file formats themselves is the job of an external
//! extraction tool. The parsers here consume what that tool leaves behind
//! (a JSON sidecar next to each file) and what the directory layout encodes.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use regex::Regex;
use serde_json::Value;

use crate::domain::{PATH_COLUMN, Record};

/// Contract for the external file-metadata extraction collaborator.
///
/// Implementations must be shareable across worker threads. A failure is
/// reported as a human-readable reason and never aborts the batch.
pub trait AssetParser: Send + Sync {
    fn parse(&self, path: &Utf8Path) -> Result<Record, String>;
}

impl<P: AssetParser + ?Sized> AssetParser for Box<P> {
    fn parse(&self, path: &Utf8Path) -> Result<Record, String> {
        (**self).parse(path)
    }
}

/// Reads `<file>.json` written by the extraction tool.
#[derive(Debug, Clone, Default)]
pub struct SidecarParser;

impl SidecarParser {
    pub fn new() -> Self {
        Self
    }

    pub fn sidecar_path(path: &Utf8Path) -> camino::Utf8PathBuf {
        let mut sidecar = path.as_str().to_string();
        sidecar.push_str(".json");
        camino::Utf8PathBuf::from(sidecar)
    }
}

impl AssetParser for SidecarParser {
    fn parse(&self, path: &Utf8Path) -> Result<Record, String> {
        let sidecar = Self::sidecar_path(path);
        let content = fs::read_to_string(sidecar.as_std_path())
            .map_err(|err| format!("reading {sidecar}: {err}"))?;
        let value: Value =
            serde_json::from_str(&content).map_err(|err| format!("parsing {sidecar}: {err}"))?;
        let Value::Object(map) = value else {
            return Err(format!("{sidecar} does not hold a JSON object"));
        };
        let mut record: Record = map.into_iter().collect();
        complete_record(&mut record, path);
        Ok(record)
    }
}

/// Wraps another parser and adds attributes captured from the file path.
///
/// Every named capture group of `pattern` becomes an attribute, passed through
/// `value_map` first. Path attributes win over the inner parser's values.
pub struct PathPatternParser<P> {
    pattern: Regex,
    value_map: BTreeMap<String, String>,
    strip_capture: Option<String>,
    inner: P,
}

impl<P: AssetParser> PathPatternParser<P> {
    pub fn new(pattern: Regex, value_map: BTreeMap<String, String>, inner: P) -> Self {
        Self {
            pattern,
            value_map,
            strip_capture: None,
            inner,
        }
    }

    /// Remove the raw text of capture `name` from the derived `file_id`, so
    /// files of different ensemble members share one id.
    pub fn strip_from_file_id(mut self, name: &str) -> Self {
        self.strip_capture = Some(name.to_string());
        self
    }
}

impl<P: AssetParser> AssetParser for PathPatternParser<P> {
    fn parse(&self, path: &Utf8Path) -> Result<Record, String> {
        let captures = self
            .pattern
            .captures(path.as_str())
            .ok_or_else(|| format!("path does not match {}", self.pattern.as_str()))?;
        let mut record = self.inner.parse(path)?;
        for name in self.pattern.capture_names().flatten() {
            if let Some(found) = captures.name(name) {
                let raw = found.as_str();
                let mapped = self.value_map.get(raw).map(String::as_str).unwrap_or(raw);
                record.insert(name.to_string(), Value::String(mapped.to_string()));
            }
        }
        complete_record(&mut record, path);
        if let Some(found) = self
            .strip_capture
            .as_deref()
            .and_then(|name| captures.name(name))
            .filter(|found| !found.as_str().is_empty())
        {
            if let Some(Value::String(file_id)) = record.get("file_id") {
                let stripped = file_id.replace(found.as_str(), "");
                let stripped = stripped.trim_matches('_').to_string();
                record.insert("file_id".to_string(), Value::String(stripped));
            }
        }
        Ok(record)
    }
}

/// Fill in `path`, `filename` and `file_id` when the parser did not provide them.
pub fn complete_record(record: &mut Record, path: &Utf8Path) {
    record.insert(PATH_COLUMN.to_string(), Value::String(path.to_string()));
    if let Some(name) = path.file_name() {
        record
            .entry("filename".to_string())
            .or_insert_with(|| Value::String(name.to_string()));
    }
    if !record.contains_key("file_id") {
        if let Some(stem) = path.file_stem() {
            record.insert(
                "file_id".to_string(),
                Value::String(redact_time_stamps(stem, 'X')),
            );
        }
    }
}

/// Redact the right-most time stamp in a file stem so every file of a series
/// maps to one id, e.g. `ocean_month_1979_01` becomes `ocean_month_XXXX_XX`.
/// Only the first matching pattern (most specific first) is redacted.
pub fn redact_time_stamps(stem: &str, fill: char) -> String {
    const PATTERNS: &[&str] = &[
        r"\d{4}[-_]\d{2}[-_]\d{2}",
        r"\d{4}[-_]\d{2}",
        r"\d{8}",
        r"\d{6}",
        r"\d{4}",
        r"\d{3}",
        r"\d{2}",
    ];

    let mut stripped = stem.to_string();
    for pattern in PATTERNS {
        let Ok(regex) = Regex::new(pattern) else {
            continue;
        };
        if let Some(found) = regex.find_iter(stem).last() {
            let replaced: String = found
                .as_str()
                .chars()
                .map(|ch| if ch.is_ascii_digit() { fill } else { ch })
                .collect();
            stripped = format!("{}{}{}", &stem[..found.start()], replaced, &stem[found.end()..]);
            break;
        }
    }

    let mut cleaned = stripped.replace(['-', '.'], "_");
    while cleaned.contains("__") {
        cleaned = cleaned.replace("__", "_");
    }
    cleaned.trim_matches('_').to_string()
}
