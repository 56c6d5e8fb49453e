//! Turns a model's free-text response into flat output columns.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::batch::types::{Cells, DerivedRow, cell_text};

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

const ROLE_KEYS: &[&str] = &["角色", "role"];
const CONTENT_KEYS: &[&str] = &["内容", "content", "text"];
const ARRAY_SPLIT_LIMIT: usize = 5;

/// Structured shape of a parsed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Scalar(Value),
    Record(Map<String, Value>),
    Array(Vec<Value>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub columns: Cells,
    pub structured: bool,
}

/// The inner content of the first fenced code block, or the whole response.
pub fn extract_candidate(response: &str) -> &str {
    FENCED_BLOCK
        .captures(response)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim())
        .filter(|inner| !inner.is_empty())
        .unwrap_or(response)
}

/// Parse a candidate payload. `None` when it is not a document or is empty.
pub fn classify(candidate: &str) -> Option<Payload> {
    let value: Value = serde_json::from_str(candidate.trim()).ok()?;
    match value {
        Value::Null => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(record) if record.is_empty() => None,
        Value::Array(items) => Some(Payload::Array(items)),
        Value::Object(record) => Some(Payload::Record(record)),
        scalar => Some(Payload::Scalar(scalar)),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn first_field<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| truthy(value))
}

fn dialogue_columns(items: &[Value], output_column: &str, columns: &mut Cells) {
    for (i, item) in items.iter().enumerate() {
        let Some(record) = item.as_object() else {
            continue;
        };
        let n = i + 1;
        if let Some(role) = first_field(record, ROLE_KEYS) {
            columns.insert(
                format!("{}_角色{}", output_column, n),
                Value::String(cell_text(role)),
            );
        }
        if let Some(content) = first_field(record, CONTENT_KEYS) {
            columns.insert(
                format!("{}_内容{}", output_column, n),
                Value::String(cell_text(content)),
            );
        }
    }
}

fn record_columns(record: &Map<String, Value>, output_column: &str, columns: &mut Cells) {
    for (key, value) in record {
        if key.is_empty() {
            continue;
        }
        let flat = match value {
            Value::Null => String::new(),
            Value::Array(items) => items.iter().map(cell_text).collect::<Vec<_>>().join(", "),
            Value::Object(_) => value.to_string(),
            other => cell_text(other),
        };
        columns.insert(format!("{}_{}", output_column, key), Value::String(flat));

        if let Value::Array(items) = value
            && items.len() <= ARRAY_SPLIT_LIMIT
        {
            for (i, item) in items.iter().enumerate() {
                columns.insert(
                    format!("{}_{}_{}", output_column, key, i + 1),
                    Value::String(cell_text(item)),
                );
            }
        }
    }
}

/// Normalize a response into output columns. The primary output column always
/// holds the raw response text; parse failures are not errors.
pub fn normalize(response: &str, output_column: &str) -> Normalized {
    let mut columns = Cells::new();
    columns.insert(output_column.to_string(), Value::String(response.to_string()));

    let structured = match classify(extract_candidate(response)) {
        None | Some(Payload::Scalar(_)) => false,
        Some(Payload::Array(items)) => {
            dialogue_columns(&items, output_column, &mut columns);
            true
        }
        Some(Payload::Record(record)) => {
            record_columns(&record, output_column, &mut columns);
            true
        }
    };

    Normalized {
        columns,
        structured,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ColumnRank {
    Original(usize),
    Primary,
    Dialogue(u64, u8),
    Derived(String),
}

fn dialogue_index(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.parse().ok()
}

fn rank(key: &str, headers: &[String], output_column: &str) -> ColumnRank {
    if let Some(pos) = headers.iter().position(|h| h == key) {
        return ColumnRank::Original(pos);
    }
    if key == output_column {
        return ColumnRank::Primary;
    }
    if let Some(n) = dialogue_index(key, &format!("{}_角色", output_column)) {
        return ColumnRank::Dialogue(n, 0);
    }
    if let Some(n) = dialogue_index(key, &format!("{}_内容", output_column)) {
        return ColumnRank::Dialogue(n, 1);
    }
    ColumnRank::Derived(key.to_string())
}

/// Column order for display: original headers, the primary output column,
/// role/content pairs by index, then any other derived columns alphabetically.
/// Internal `_`-prefixed keys are never shown.
pub fn display_columns<'a>(
    headers: &[String],
    output_column: &str,
    rows: impl IntoIterator<Item = &'a DerivedRow>,
) -> Vec<String> {
    let mut keys: Vec<String> = headers.to_vec();
    for row in rows {
        for key in row.columns.keys() {
            if !key.starts_with('_') && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    keys.sort_by_cached_key(|key| rank(key, headers, output_column));
    keys
}

/// Columns kept in a tabular export: original headers, the primary output
/// column and first-level record fields. Dialogue columns and per-element
/// array columns are left out.
pub fn export_columns<'a>(
    headers: &[String],
    output_column: &str,
    rows: impl IntoIterator<Item = &'a DerivedRow>,
) -> Vec<String> {
    let mut columns: Vec<String> = headers.to_vec();
    if !columns.iter().any(|c| c == output_column) {
        columns.push(output_column.to_string());
    }
    let derived_prefix = format!("{}_", output_column);
    let role_prefix = format!("{}_角色", output_column);
    let content_prefix = format!("{}_内容", output_column);

    for row in rows {
        for key in row.columns.keys() {
            let numbered = key
                .rsplit_once('_')
                .is_some_and(|(_, tail)| !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()));
            if !key.starts_with('_')
                && key.starts_with(&derived_prefix)
                && !key.starts_with(&role_prefix)
                && !key.starts_with(&content_prefix)
                && !numbered
                && !columns.contains(key)
            {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Project a derived row onto `columns`, filling gaps with empty strings.
pub fn project(row: &DerivedRow, columns: &[String]) -> Cells {
    columns
        .iter()
        .map(|column| {
            let value = row
                .columns
                .get(column)
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::String(String::new()));
            (column.clone(), value)
        })
        .collect()
}
