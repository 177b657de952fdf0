use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::specimens::{self, SpecimenMeasurement};
use super::{Batch, SkipReason, Stage};
use crate::api::{ApiRequest, TrackingClient};
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, IdMap, PersonRecord, SpecimenRecord};
use crate::table::Row;

/// Body of `PATCH /specimens/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecimenUpdate {
    pub id: Uuid,
    pub measurements: Vec<SpecimenMeasurement>,
}

/// Merges the measurement rows of one specimen into a single update,
/// leaving out every measurement the specimen already has. Two measurements
/// are the same when both the person and the data are equal.
pub fn parse_update(
    specimen: &SpecimenRecord,
    rows: &[&Row],
    people_by_email: &IdMap,
) -> Result<Option<SpecimenUpdate>, RowError> {
    let mut measurements: Vec<SpecimenMeasurement> = Vec::new();
    for row in rows {
        let parsed = specimens::parse_measurements(row, people_by_email, specimen.received_at)?;
        for measurement in parsed {
            if !specimen.measurements.contains(&measurement)
                && !measurements.contains(&measurement)
            {
                measurements.push(measurement);
            }
        }
    }
    if measurements.is_empty() {
        return Ok(None);
    }
    Ok(Some(SpecimenUpdate {
        id: specimen.id,
        measurements,
    }))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::SpecimenMeasurements;
    let rows = stage.sources.read(CsvFile::SpecimenMeasurements)?;
    let empty = stage
        .sources
        .empty_equivalents(CsvFile::SpecimenMeasurements);

    let paths = [EntityKind::People.endpoint(), kind.endpoint()];
    let [people, remote] = resolve::fetch_all(stage.client, paths)?;
    let people = resolve::people_by_email(&resolve::decode::<PersonRecord>(paths[0], people)?)?;
    let remote =
        resolve::specimens_by_readable_id(resolve::decode::<SpecimenRecord>(paths[1], remote)?)?;

    let grouped = specimens::group_measurement_rows(&rows, &empty);
    let mut readable_ids = grouped.keys().cloned().collect::<Vec<_>>();
    readable_ids.sort();

    let mut batch = Batch::new(kind);
    for readable_id in readable_ids {
        let group = &grouped[&readable_id];
        let Some(specimen) = remote.get(&readable_id) else {
            batch.reject(&readable_id, RowError::unresolved("specimen", &readable_id));
            continue;
        };
        match parse_update(specimen, group, &people) {
            Ok(Some(update)) => {
                let path = format!("{}/{}", kind.endpoint(), update.id);
                batch.push(&readable_id, |body| ApiRequest::patch(path, body), &update)?;
            }
            Ok(None) => batch.skip(&readable_id, SkipReason::AlreadyExists),
            Err(err) => batch.reject(&readable_id, err),
        }
    }
    Ok(batch)
}
