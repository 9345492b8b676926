//! Decoding of the downloaded feed file into header + rows

use crate::data::row::FeedRow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Csv,
    Json,
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedFormat::Csv => f.write_str("csv"),
            FeedFormat::Json => f.write_str("json"),
        }
    }
}

/// A row as it is kept in the cache, before it is checked against the header.
///
/// Delimited rows stay positional so a column count mismatch can still be
/// reported when the batch containing the row is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRow {
    Fields(Vec<String>),
    Object(BTreeMap<String, String>),
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub header: Vec<String>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Downloaded file appears to be empty or invalid")]
    Empty,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported JSON shape: {0}")]
    Shape(String),
}

/// Per-row problem found while decoding, reported as a skip reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowDefect {
    ColumnCountMismatch { expected: usize, found: usize },
}

impl fmt::Display for RowDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowDefect::ColumnCountMismatch { .. } => f.write_str("column count mismatch"),
        }
    }
}

pub fn parse(bytes: &[u8], format: FeedFormat, delimiter: u8) -> Result<ParsedFeed, ParseError> {
    match format {
        FeedFormat::Csv => parse_delimited(bytes, delimiter),
        FeedFormat::Json => parse_objects(bytes),
    }
}

fn parse_delimited(bytes: &[u8], delimiter: u8) -> Result<ParsedFeed, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let mut header: Option<Vec<String>> = None;
    let mut rows = vec![];
    for record in csv_reader.byte_records() {
        let record = record?;
        // vendor files are not always valid UTF-8
        let fields: Vec<String> = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();
        if fields.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        match header {
            None => header = Some(fields.into_iter().map(|f| f.trim().to_owned()).collect()),
            Some(_) => rows.push(RawRow::Fields(fields)),
        }
    }

    match header {
        Some(header) if !rows.is_empty() => Ok(ParsedFeed { header, rows }),
        _ => Err(ParseError::Empty),
    }
}

fn parse_objects(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => {
            return Err(ParseError::Shape(format!(
                "expected an array of objects, got {}",
                json_type_name(&other)
            )))
        }
    };

    let mut header = vec![];
    let mut seen_columns = HashSet::new();
    let mut rows = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let object = match item {
            serde_json::Value::Object(object) => object,
            other => {
                return Err(ParseError::Shape(format!(
                    "element {} is {}, expected an object",
                    index,
                    json_type_name(&other)
                )))
            }
        };

        let mut row = BTreeMap::new();
        for (key, value) in object {
            let value = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            if seen_columns.insert(key.clone()) {
                header.push(key.clone());
            }
            row.insert(key, value);
        }
        rows.push(RawRow::Object(row));
    }

    if rows.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(ParsedFeed { header, rows })
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Map a cached row onto the header.
pub fn decode_row(header: &[String], raw: RawRow) -> Result<FeedRow, RowDefect> {
    match raw {
        RawRow::Fields(fields) => {
            if fields.len() != header.len() {
                return Err(RowDefect::ColumnCountMismatch {
                    expected: header.len(),
                    found: fields.len(),
                });
            }
            Ok(FeedRow::from_pairs(header.iter().zip(fields)))
        }
        RawRow::Object(object) => Ok(FeedRow::from_pairs(object)),
    }
}
