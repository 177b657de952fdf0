//! Reading back the error artifacts a run left behind.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::domain::EntityKind;
use crate::error::PopulateError;

/// How labels are ordered in a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOrder {
    /// `25E12-SU3` style IDs: by year, experiment, then item number.
    ExperimentId,
    /// Plain IDs whose number starts at a fixed offset, e.g. `25L7` from 3.
    Numeric { from: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum LabelKey {
    Experiment(String, u64, u64),
    Numeric(u64),
    Unparsed,
}

fn digits(value: &str) -> Option<u64> {
    let digits = value.chars().filter(char::is_ascii_digit).collect::<String>();
    digits.parse().ok()
}

fn experiment_key(label: &str) -> Option<LabelKey> {
    let mut parts = label.split('-');
    let (experiment, item) = (parts.next()?, parts.next()?);
    let year = experiment.get(..2)?.to_string();
    let number = experiment
        .get(3..)?
        .chars()
        .filter(|ch| *ch != 'H' && *ch != 'E')
        .collect::<String>()
        .parse()
        .ok()?;
    let item = item
        .chars()
        .filter(|ch| !ch.is_ascii_alphabetic())
        .collect::<String>()
        .parse()
        .ok()?;
    Some(LabelKey::Experiment(year, number, item))
}

fn label_key(label: &str, order: LabelOrder) -> LabelKey {
    let key = match order {
        LabelOrder::ExperimentId => experiment_key(label),
        LabelOrder::Numeric { from } => label.get(from..).and_then(digits).map(LabelKey::Numeric),
    };
    key.unwrap_or(LabelKey::Unparsed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub label: String,
    pub path: Utf8PathBuf,
    pub error: Value,
}

/// The first artifact of every failed row of `kind` whose label matches
/// `pattern`, sorted by label. Labels the ordering cannot read go last.
pub fn find_errors(
    error_dir: &Utf8Path,
    kind: EntityKind,
    pattern: Option<&Regex>,
    order: LabelOrder,
) -> Result<Vec<ErrorEntry>, PopulateError> {
    let kind_dir = error_dir.join(kind.as_str());
    if !kind_dir.as_std_path().is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let read_dir = fs::read_dir(kind_dir.as_std_path())
        .map_err(|err| PopulateError::Filesystem(format!("{kind_dir}: {err}")))?;
    for entry in read_dir {
        let entry = entry.map_err(|err| PopulateError::Filesystem(err.to_string()))?;
        let Some(label) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if pattern.is_some_and(|pattern| !pattern.is_match(&label)) {
            continue;
        }
        let path = kind_dir.join(&label).join("0.json");
        if !path.as_std_path().is_file() {
            continue;
        }
        let content = fs::read(path.as_std_path())
            .map_err(|err| PopulateError::Filesystem(format!("{path}: {err}")))?;
        let error = serde_json::from_slice(&content)
            .map_err(|err| PopulateError::Filesystem(format!("{path}: {err}")))?;
        entries.push(ErrorEntry { label, path, error });
    }

    entries.sort_by_cached_key(|entry| (label_key(&entry.label, order), entry.label.clone()));
    Ok(entries)
}

pub fn compile_pattern(pattern: &str) -> Result<Regex, PopulateError> {
    Regex::new(pattern).map_err(|err| PopulateError::InvalidPattern(err.to_string()))
}
