//! Flat tabular storage for datastores and the master catalog.
//!
//! One header row of column names, one CSV row per record. Cells hold plain
//! text when the text cannot be mistaken for JSON, and JSON otherwise, so
//! every value survives a write/read cycle unchanged. Empty cells are null.

use std::fs::File;
use std::io::{Read, Write};

use camino::Utf8Path;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;

use crate::domain::Record;
use crate::error::CatalogError;
use crate::store::write_bytes_atomic;

pub fn encode_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) if !text.is_empty() && serde_json::from_str::<Value>(text).is_err() => {
            text.clone()
        }
        other => other.to_string(),
    }
}

pub fn decode_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(cell).unwrap_or_else(|_| Value::String(cell.to_string()))
}

pub fn write_table<W: Write>(
    writer: W,
    columns: &[String],
    rows: &[Record],
) -> Result<(), CatalogError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(columns)
        .map_err(|err| CatalogError::Storage(err.to_string()))?;
    for row in rows {
        let cells = columns
            .iter()
            .map(|column| row.get(column).map(encode_cell).unwrap_or_default());
        csv_writer
            .write_record(cells)
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
    }
    csv_writer
        .flush()
        .map_err(|err| CatalogError::Storage(err.to_string()))
}

pub fn read_table<R: Read>(reader: R) -> Result<(Vec<String>, Vec<Record>), CatalogError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let columns: Vec<String> = csv_reader
        .headers()
        .map_err(|err| CatalogError::Storage(err.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for result in csv_reader.records() {
        let record = result.map_err(|err| CatalogError::Storage(err.to_string()))?;
        let row: Record = columns
            .iter()
            .zip(record.iter())
            .map(|(column, cell)| (column.clone(), decode_cell(cell)))
            .collect();
        rows.push(row);
    }
    Ok((columns, rows))
}

/// Write a table atomically; paths ending in `.gz` are gzip-compressed.
pub fn write_table_file(
    path: &Utf8Path,
    columns: &[String],
    rows: &[Record],
) -> Result<(), CatalogError> {
    let mut buffer = Vec::new();
    write_table(&mut buffer, columns, rows)?;
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&buffer)
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
        buffer = encoder
            .finish()
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
    }
    write_bytes_atomic(path, &buffer)
}

pub fn read_table_file(path: &Utf8Path) -> Result<(Vec<String>, Vec<Record>), CatalogError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| CatalogError::Storage(format!("open {path}: {err}")))?;
    if is_gzip(path) {
        read_table(GzDecoder::new(file))
    } else {
        read_table(file)
    }
}

fn is_gzip(path: &Utf8Path) -> bool {
    path.extension() == Some("gz")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_lookalike_strings_are_quoted() {
        assert_eq!(encode_cell(&json!("ocean")), "ocean");
        assert_eq!(encode_cell(&json!("1")), "\"1\"");
        assert_eq!(encode_cell(&json!("true")), "\"true\"");
        assert_eq!(encode_cell(&json!("")), "\"\"");
        assert_eq!(decode_cell("\"1\""), json!("1"));
        assert_eq!(decode_cell("1"), json!(1));
        assert_eq!(decode_cell(""), Value::Null);
    }

    #[test]
    fn lists_are_stored_as_json() {
        let value = json!(["ocean", "seaIce"]);
        assert_eq!(encode_cell(&value), "[\"ocean\",\"seaIce\"]");
        assert_eq!(decode_cell(&encode_cell(&value)), value);
    }

    #[test]
    fn gzip_tables_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("t.csv.gz")).unwrap();
        let columns = vec!["path".to_string(), "count".to_string()];
        let mut row = Record::new();
        row.insert("path".to_string(), json!(["/a.nc", "/b.nc"]));
        row.insert("count".to_string(), json!(2));
        write_table_file(&path, &columns, &[row.clone()]).unwrap();
        let (read_columns, rows) = read_table_file(&path).unwrap();
        assert_eq!(read_columns, columns);
        assert_eq!(rows, vec![row]);
    }
}
