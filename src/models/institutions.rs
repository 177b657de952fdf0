use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Batch, SkipReason, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, InstitutionRecord};
use crate::table::{EmptyEquivalents, Row};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstitution {
    pub id: Uuid,
    pub name: String,
}

pub fn parse_row(row: &Row, empty: &EmptyEquivalents) -> Result<Option<NewInstitution>, RowError> {
    if row.is_empty(&["id", "name"], empty) {
        return Ok(None);
    }
    let id = row
        .uuid("id")?
        .ok_or_else(|| RowError::MissingField("id".to_string()))?;
    Ok(Some(NewInstitution {
        id,
        name: row.require("name")?.to_string(),
    }))
}

/// Institutions carry their own IDs, so existing ones are matched by ID.
pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Institutions;
    let rows = stage.sources.read(CsvFile::Institutions)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Institutions);

    let existing = resolve::list::<InstitutionRecord, _>(stage.client, kind.endpoint())?
        .into_iter()
        .map(|institution| institution.id)
        .collect::<HashSet<_>>();
    let cached = stage
        .cache
        .read_all::<NewInstitution>(kind)?
        .into_iter()
        .map(|institution| institution.id)
        .collect::<HashSet<_>>();

    let mut batch = Batch::new(kind);
    for row in &rows {
        match parse_row(row, &empty) {
            Ok(None) => {}
            Ok(Some(institution)) => {
                let key = institution.id.to_string();
                if existing.contains(&institution.id) {
                    batch.skip(&key, SkipReason::AlreadyExists);
                } else if cached.contains(&institution.id) {
                    batch.skip(&key, SkipReason::Cached);
                } else {
                    batch.create(&key, &institution)?;
                }
            }
            Err(err) => batch.reject(&row.label(), err),
        }
    }
    Ok(batch)
}
