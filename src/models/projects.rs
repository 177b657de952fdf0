use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, NamedRecord};
use crate::table::{EmptyEquivalents, Row};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Projects predate the spreadsheets, so every one spans the whole period
/// the core has been tracking samples.
fn project_period() -> Result<(DateTime<Utc>, DateTime<Utc>), RowError> {
    let started_at = Utc
        .with_ymd_and_hms(2014, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| RowError::Inconsistent("invalid project start".to_string()))?;
    let ended_at = Utc
        .with_ymd_and_hms(2026, 12, 31, 23, 59, 59)
        .single()
        .ok_or_else(|| RowError::Inconsistent("invalid project end".to_string()))?;
    Ok((started_at, ended_at))
}

pub fn parse_row(row: &Row, empty: &EmptyEquivalents) -> Result<Option<NewProject>, RowError> {
    if row.is_empty(&["name"], empty) {
        return Ok(None);
    }
    let (started_at, ended_at) = project_period()?;
    Ok(Some(NewProject {
        name: row.require("name")?.to_string(),
        started_at,
        ended_at,
    }))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Projects;
    let rows = stage.sources.read(CsvFile::Projects)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Projects);

    let known = Known::new(
        resolve::list::<NamedRecord, _>(stage.client, kind.endpoint())?
            .into_iter()
            .map(|project| project.name),
        stage
            .cache
            .read_all::<NewProject>(kind)?
            .into_iter()
            .map(|project| project.name),
    );

    let mut batch = Batch::new(kind);
    for row in &rows {
        match parse_row(row, &empty) {
            Ok(Some(project)) => batch.create_new(&project.name, &known, &project)?,
            Ok(None) => {}
            Err(err) => batch.reject(&row.label(), err),
        }
    }
    Ok(batch)
}
