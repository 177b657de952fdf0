use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Batch, SkipReason, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::parse::parse_loose_date;
use crate::resolve::{self, IdMap, ReadableRecord, SequencingRunRecord};
use crate::table::Row;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingSubmission {
    pub library_id: Uuid,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencingRunData {
    pub ilab_request_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSequencingRun {
    pub readable_id: String,
    pub begun_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub libraries: Vec<SequencingSubmission>,
    #[serde(default)]
    pub additional_data: SequencingRunData,
}

/// A run before it has been given a readable ID.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRun {
    pub begun_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub libraries: Vec<SequencingSubmission>,
    pub ilab_request_ids: Vec<String>,
}

impl PendingRun {
    pub fn period(&self) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
        (self.begun_at, self.finished_at)
    }

    pub fn with_readable_id(self, readable_id: String) -> NewSequencingRun {
        NewSequencingRun {
            readable_id,
            begun_at: self.begun_at,
            finished_at: self.finished_at,
            libraries: self.libraries,
            additional_data: SequencingRunData {
                ilab_request_ids: self.ilab_request_ids,
            },
        }
    }
}

/// A run date cell as it compares: the parsed date when it reads as one,
/// otherwise the cell itself.
fn run_date_key(row: &Row, key: &str) -> String {
    let raw = row.get(key).unwrap_or_default();
    parse_loose_date(raw).map_or_else(|_| raw.to_string(), |date| date.to_rfc3339())
}

/// Submission rows that went on the same run, keyed by their
/// `(sequenced_date, completed_date)` so that `3/4/2024` and `03/04/2024`
/// land together. Rows without an iLab project were never sequenced by the
/// core and are left out.
pub fn group_submissions(rows: &[Row]) -> BTreeMap<(String, String), Vec<&Row>> {
    let mut groups: BTreeMap<(String, String), Vec<&Row>> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.has("ilab_project_id")) {
        let key = (
            run_date_key(row, "sequenced_date"),
            run_date_key(row, "completed_date"),
        );
        groups.entry(key).or_default().push(row);
    }
    groups
}

/// Names a run by the dates of its first row, as they were typed.
fn run_label(rows: &[&Row]) -> String {
    let cell = |key| {
        rows.first()
            .and_then(|row| row.get(key))
            .unwrap_or_default()
    };
    format!("{}_{}", cell("sequenced_date"), cell("completed_date"))
}

/// Builds one run from its rows. Libraries that cannot be resolved are left
/// off the run with a warning; submissions without an arrival date are
/// dated at the start of the run.
pub fn parse_group(rows: &[&Row], libraries: &IdMap) -> Result<PendingRun, RowError> {
    let first = rows
        .first()
        .ok_or_else(|| RowError::Inconsistent("empty sequencing run".to_string()))?;
    let begun_at = first
        .messy_date("sequenced_date")?
        .ok_or_else(|| RowError::MissingField("sequenced_date".to_string()))?;
    let finished_at = first.messy_date("completed_date")?;

    let mut submissions = Vec::new();
    let mut ilab_request_ids = Vec::new();
    for row in rows {
        if let Some(ilab_id) = row.get("ilab_project_id") {
            ilab_request_ids.push(ilab_id.to_string());
        }
        let Some(library) = row.get("sc_id") else {
            continue;
        };
        let Some(library_id) = libraries.get(library) else {
            tracing::warn!(library, "sequenced library not found");
            continue;
        };
        submissions.push(SequencingSubmission {
            library_id,
            submitted_at: row.messy_date("date_arrived")?.unwrap_or(begun_at),
        });
    }

    Ok(PendingRun {
        begun_at,
        finished_at,
        libraries: submissions,
        ilab_request_ids,
    })
}

/// Readable IDs are integers; new runs count up from the highest one in use.
pub fn next_readable_id<'a>(existing: impl IntoIterator<Item = &'a str>) -> u64 {
    existing
        .into_iter()
        .filter_map(|id| id.trim().parse::<u64>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::SequencingRuns;
    let rows = stage.sources.read(CsvFile::SequencingSubmissions)?;

    let paths = [EntityKind::Libraries.endpoint(), kind.endpoint()];
    let [libraries, runs] = resolve::fetch_all(stage.client, paths)?;
    let libraries = resolve::by_readable_id(
        "library readable ID",
        &resolve::decode::<ReadableRecord>(paths[0], libraries)?,
    )?;
    let remote = resolve::decode::<SequencingRunRecord>(paths[1], runs)?;
    let cached = stage.cache.read_all::<NewSequencingRun>(kind)?;

    let remote_periods = remote
        .iter()
        .map(|run| (run.begun_at, run.finished_at))
        .collect::<HashSet<_>>();
    let cached_periods = cached
        .iter()
        .map(|run| (run.begun_at, run.finished_at))
        .collect::<HashSet<_>>();
    let mut next_id = next_readable_id(
        remote
            .iter()
            .map(|run| run.readable_id.as_str())
            .chain(cached.iter().map(|run| run.readable_id.as_str())),
    );

    let mut batch = Batch::new(kind);
    let mut batch_periods = HashSet::new();
    for group in group_submissions(&rows).into_values() {
        let label = run_label(&group);
        let run = match parse_group(&group, &libraries) {
            Ok(run) => run,
            Err(err) => {
                batch.reject(&label, err);
                continue;
            }
        };
        if remote_periods.contains(&run.period()) {
            batch.skip(&label, SkipReason::AlreadyExists);
            continue;
        }
        if cached_periods.contains(&run.period()) {
            batch.skip(&label, SkipReason::Cached);
            continue;
        }
        if !batch_periods.insert(run.period()) {
            batch.skip(&label, SkipReason::DuplicateInBatch);
            continue;
        }
        let run = run.with_readable_id(next_id.to_string());
        next_id += 1;
        batch.create(&run.readable_id.clone(), &run)?;
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sequenced: &str, completed: &str, ilab: &str, library: &str, arrived: &str) -> Row {
        Row::from_pairs([
            ("sequenced_date", sequenced),
            ("completed_date", completed),
            ("ilab_project_id", ilab),
            ("sc_id", library),
            ("date_arrived", arrived),
        ])
    }

    #[test]
    fn rows_group_by_run_dates() {
        let rows = vec![
            row("3/4/2024", "3/6/2024", "IL1", "25L1", "3/1/2024"),
            row("3/4/2024", "3/6/2024", "IL2", "25L2", ""),
            row("3/9/2024", "", "IL3", "25L3", ""),
            row("3/9/2024", "", "", "25L4", ""),
        ];
        let groups = group_submissions(&rows);
        let sizes = groups.values().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn differently_typed_dates_share_a_run() {
        let rows = vec![
            row("3/4/2024", "3/6/2024", "IL1", "25L1", ""),
            row("03/04/2024", "3/06/2024", "IL2", "25L2", ""),
            row("3/4/2024-3/5/2024", "3/6/2024", "IL3", "25L3", ""),
        ];
        let groups = group_submissions(&rows);
        assert_eq!(groups.len(), 1);
        let group = groups.into_values().next().unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(run_label(&group), "3/4/2024_3/6/2024");
    }

    #[test]
    fn unreadable_dates_still_group_by_cell() {
        let rows = vec![
            row("sometime", "", "IL1", "25L1", ""),
            row("sometime", "", "IL2", "25L2", ""),
        ];
        let groups = group_submissions(&rows);
        assert_eq!(groups[&("sometime".to_string(), String::new())].len(), 2);
        let group = &groups[&("sometime".to_string(), String::new())];
        assert!(parse_group(group, &IdMap::default()).is_err());
    }

    #[test]
    fn groups_become_runs() {
        let library = Uuid::new_v4();
        let libraries =
            IdMap::build("library readable ID", [("25L1".to_string(), library)]).unwrap();
        let rows = [
            row("3/4/2024-3/5/2024", "", "IL1", "25L1", "3/1/2024"),
            row("3/4/2024-3/5/2024", "", "IL2", "25L404", ""),
        ];
        let run = parse_group(&[&rows[0], &rows[1]], &libraries).unwrap();
        assert_eq!(run.begun_at, parse_loose_date("3/4/2024").unwrap());
        assert_eq!(run.finished_at, None);
        assert_eq!(run.ilab_request_ids, vec!["IL1", "IL2"]);
        assert_eq!(
            run.libraries,
            vec![SequencingSubmission {
                library_id: library,
                submitted_at: parse_loose_date("3/1/2024").unwrap(),
            }]
        );
    }

    #[test]
    fn missing_arrival_falls_back_to_the_run_start() {
        let library = Uuid::new_v4();
        let libraries =
            IdMap::build("library readable ID", [("25L1".to_string(), library)]).unwrap();
        let rows = [row("3/4/2024", "3/6/2024", "IL1", "25L1", "")];
        let run = parse_group(&[&rows[0]], &libraries).unwrap();
        assert_eq!(run.libraries[0].submitted_at, run.begun_at);
    }

    #[test]
    fn readable_ids_count_up_from_the_highest() {
        assert_eq!(next_readable_id([]), 1);
        assert_eq!(next_readable_id(["3", "12", "7", "legacy"]), 13);
    }
}
