use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{PopulateError, RowError};
use crate::parse;

/// Where to find one spreadsheet export and how to name its columns.
#[derive(Debug, Clone, Default)]
pub struct CsvSource {
    pub path: PathBuf,
    /// Number of lines above the header row.
    pub head_row: usize,
    /// Header → field overrides. Headers not listed are snake-cased.
    pub field_renaming: HashMap<String, String>,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// One spreadsheet row. Blank cells and absent columns read the same.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    line: u64,
    fields: HashMap<String, String>,
}

/// Per-field cell values that mean "nothing here", e.g. `N/A` placeholders.
#[derive(Debug, Clone, Default)]
pub struct EmptyEquivalents {
    values: HashMap<String, Vec<String>>,
}

impl EmptyEquivalents {
    pub fn new(values: HashMap<String, Vec<String>>) -> Self {
        Self { values }
    }

    fn matches(&self, row: &Row) -> bool {
        self.values.iter().any(|(field, empties)| {
            row.get(field)
                .map(|value| empties.iter().any(|empty| empty == value))
                .unwrap_or(false)
        })
    }
}

impl Row {
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            line: 0,
            fields: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    /// Identifies the row in log messages.
    pub fn label(&self) -> String {
        ["readable_id", "id", "email", "name"]
            .iter()
            .find_map(|key| self.get(key))
            .map(str::to_string)
            .unwrap_or_else(|| format!("line {}", self.line))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, RowError> {
        self.get(key)
            .ok_or_else(|| RowError::MissingField(key.to_string()))
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn float(&self, key: &str) -> Result<Option<f64>, RowError> {
        self.convert(key, parse::parse_float)
    }

    pub fn require_float(&self, key: &str) -> Result<f64, RowError> {
        self.float(key)?
            .ok_or_else(|| RowError::MissingField(key.to_string()))
    }

    pub fn percentage(&self, key: &str) -> Result<Option<f64>, RowError> {
        self.convert(key, parse::parse_percentage)
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>, RowError> {
        self.convert(key, parse::parse_int)
    }

    pub fn require_int(&self, key: &str) -> Result<i64, RowError> {
        self.int(key)?
            .ok_or_else(|| RowError::MissingField(key.to_string()))
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse::parse_bool)
    }

    pub fn date(&self, key: &str) -> Result<Option<DateTime<Utc>>, RowError> {
        self.convert(key, parse::parse_date)
    }

    pub fn require_date(&self, key: &str) -> Result<DateTime<Utc>, RowError> {
        self.date(key)?
            .ok_or_else(|| RowError::MissingField(key.to_string()))
    }

    pub fn messy_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, RowError> {
        self.convert(key, parse::parse_loose_date)
    }

    pub fn uuid(&self, key: &str) -> Result<Option<Uuid>, RowError> {
        self.convert(key, |value| {
            Uuid::parse_str(value).map_err(|err| err.to_string())
        })
    }

    pub fn tag<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RowError> {
        self.convert(key, parse::from_tag)
    }

    pub fn require_tag<T: DeserializeOwned>(&self, key: &str) -> Result<T, RowError> {
        self.tag(key)?
            .ok_or_else(|| RowError::MissingField(key.to_string()))
    }

    fn convert<T>(
        &self,
        key: &str,
        f: impl FnOnce(&str) -> Result<T, String>,
    ) -> Result<Option<T>, RowError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => f(value)
                .map(Some)
                .map_err(|message| RowError::invalid(key, value, message)),
        }
    }

    /// True when the row should be skipped: every required field is blank, or
    /// some field holds an empty-equivalent value. A row missing only some of
    /// its required fields is skipped too, with a warning.
    pub fn is_empty(&self, required: &[&str], empty_equivalents: &EmptyEquivalents) -> bool {
        if required.iter().all(|key| !self.has(key)) || empty_equivalents.matches(self) {
            return true;
        }

        let missing = required
            .iter()
            .filter(|key| !self.has(key))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            tracing::warn!(
                row = %self.label(),
                line = self.line,
                ?missing,
                "skipping partially empty row"
            );
            return true;
        }

        false
    }
}

pub fn read_csv(source: &CsvSource) -> Result<Vec<Row>, PopulateError> {
    if !source.path.exists() {
        return Err(PopulateError::MissingCsv(source.path.clone()));
    }
    let content = fs::read_to_string(&source.path).map_err(|err| PopulateError::Csv {
        path: source.path.clone(),
        message: err.to_string(),
    })?;
    parse_csv(&content, source.head_row, &source.field_renaming).map_err(|message| {
        PopulateError::Csv {
            path: source.path.clone(),
            message,
        }
    })
}

/// Reads a CSV file, or returns no rows when the export does not exist.
pub fn read_optional_csv(source: &CsvSource) -> Result<Vec<Row>, PopulateError> {
    match read_csv(source) {
        Err(PopulateError::MissingCsv(path)) => {
            tracing::info!(path = %path.display(), "no CSV export, treating as empty");
            Ok(Vec::new())
        }
        other => other,
    }
}

pub fn parse_csv(
    content: &str,
    head_row: usize,
    field_renaming: &HashMap<String, String>,
) -> Result<Vec<Row>, String> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut body = content;
    for _ in 0..head_row {
        body = match body.split_once('\n') {
            Some((_, rest)) => rest,
            None => "",
        };
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| err.to_string())?
        .iter()
        .map(|header| rename_field(header, field_renaming))
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| err.to_string())?;
        let line = record
            .position()
            .map(|pos| pos.line() + head_row as u64)
            .unwrap_or_default();
        let fields = headers
            .iter()
            .zip(record.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();
        rows.push(Row { line, fields });
    }
    Ok(rows)
}

fn rename_field(header: &str, field_renaming: &HashMap<String, String>) -> String {
    field_renaming
        .get(header)
        .cloned()
        .unwrap_or_else(|| parse::snake_case(header))
}

pub fn csv_path(dir: &Path, filename: &str, file_renaming: &HashMap<String, String>) -> PathBuf {
    let name = file_renaming
        .get(filename)
        .map(String::as_str)
        .unwrap_or(filename);
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_snake_cased_or_renamed() {
        let renaming = HashMap::from([("Lab PI".to_string(), "pi_email".to_string())]);
        let rows = parse_csv(
            "\u{feff}Name,Lab PI,Delivery Dir\nSmith Lab,smith@yale.edu,smith\n",
            0,
            &renaming,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some("Smith Lab"));
        assert_eq!(rows[0].get("pi_email"), Some("smith@yale.edu"));
        assert_eq!(rows[0].get("delivery_dir"), Some("smith"));
    }

    #[test]
    fn head_rows_are_skipped() {
        let rows = parse_csv(
            "exported 2024-01-01\n\nid,name\n1,x\n",
            2,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some("1"));
    }

    #[test]
    fn blank_cells_read_as_none() {
        let row = Row::from_pairs([("name", "  "), ("id", "x")]);
        assert_eq!(row.get("name"), None);
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.require("name"), Err(RowError::MissingField("name".into())));
    }

    #[test]
    fn emptiness_rules() {
        let none = EmptyEquivalents::default();
        let blank = Row::from_pairs([("id", ""), ("name", "")]);
        assert!(blank.is_empty(&["id", "name"], &none));

        let partial = Row::from_pairs([("id", "x"), ("name", "")]);
        assert!(partial.is_empty(&["id", "name"], &none));

        let full = Row::from_pairs([("id", "x"), ("name", "y")]);
        assert!(!full.is_empty(&["id", "name"], &none));

        let placeholders = EmptyEquivalents::new(HashMap::from([(
            "name".to_string(),
            vec!["N/A".to_string()],
        )]));
        let placeholder = Row::from_pairs([("id", "x"), ("name", "N/A")]);
        assert!(placeholder.is_empty(&["id", "name"], &placeholders));
    }

    #[test]
    fn typed_accessors_report_field() {
        let row = Row::from_pairs([("volume", "abc")]);
        let err = row.float("volume").unwrap_err();
        assert!(matches!(err, RowError::InvalidValue { ref field, .. } if field == "volume"));
    }

    #[test]
    fn oversized_ints_are_invalid_values() {
        let row = Row::from_pairs([("n_amplification_cycles", "1e30")]);
        let err = row.int("n_amplification_cycles").unwrap_err();
        assert!(matches!(
            err,
            RowError::InvalidValue { ref field, ref value, .. }
                if field == "n_amplification_cycles" && value == "1e30"
        ));
    }
}
