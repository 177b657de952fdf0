use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{self, SuspensionMeasurementData};
use super::suspensions::{self, NewSuspension, SuspensionRefs};
use super::{Batch, Known, SkipReason, Stage, group_rows};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::IdMap;
use crate::table::{EmptyEquivalents, Row};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionPoolMeasurement {
    pub measured_by: Uuid,
    pub data: SuspensionMeasurementData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSuspensionPool {
    pub readable_id: String,
    pub name: String,
    pub pooled_at: DateTime<Utc>,
    pub suspensions: Vec<NewSuspension>,
    pub preparer_ids: Vec<Uuid>,
    #[serde(default)]
    pub measurements: Vec<SuspensionPoolMeasurement>,
}

const REQUIRED: [&str; 3] = ["readable_id", "name", "date_pooled"];

/// Pool readable ID → the date of the chip run it was loaded on, read from
/// the GEMs loadings and the GEMs rows they point at. An unreadable chip run
/// date only leaves the pools loaded on that run undated.
pub fn chip_run_dates(loadings: &[Row], gems: &[Row]) -> HashMap<String, DateTime<Utc>> {
    let mut run_dates = HashMap::new();
    for row in gems {
        let Some(readable_id) = row.get("readable_id") else {
            continue;
        };
        match row.date("date_chip_run") {
            Ok(Some(date)) => {
                run_dates.insert(readable_id, date);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(gems = readable_id, %err, "unreadable chip run date");
            }
        }
    }

    let mut dates = HashMap::new();
    for loading in loadings {
        let (Some(pool), Some(gems_id)) = (
            loading.get("suspension_pool_readable_id"),
            loading.get("gems_readable_id"),
        ) else {
            continue;
        };
        if let Some(date) = run_dates.get(gems_id) {
            dates.entry(pool.to_string()).or_insert(*date);
        }
    }
    dates
}

/// Maps one pool row around its already-parsed children. Pre-storage values
/// are dated at pooling, the rest at the chip run.
pub fn parse_row(
    row: &Row,
    children: Vec<NewSuspension>,
    people_by_email: &IdMap,
    chip_run_at: Option<DateTime<Utc>>,
    empty: &EmptyEquivalents,
) -> Result<Option<NewSuspensionPool>, RowError> {
    if row.is_empty(&REQUIRED, empty) {
        return Ok(None);
    }
    let Some(first_child) = children.first() else {
        return Err(RowError::Inconsistent("pool has no suspensions".to_string()));
    };
    let material = first_child.biological_material;

    let pooled_at = row.require_date("date_pooled")?;
    let run_at = chip_run_at.unwrap_or(pooled_at);
    let preparer_ids =
        suspensions::preparers(row, "preparer_1_email", "preparer_2", people_by_email)?;

    let readings = [
        common::concentration(
            row,
            "pre-storage_cell/nucleus_concentration_(cell-nucleus/ml)",
            pooled_at,
            material,
            None,
            None,
        )?,
        common::concentration(
            row,
            "cell/nucleus_concentration_(cell-nucleus/ml)",
            run_at,
            material,
            None,
            None,
        )?,
        common::volume(row, "pre-storage_volume_(µl)", pooled_at)?,
        common::volume(row, "volume_(µl)", run_at)?,
        common::viability(row, "cell_viability_(%)", run_at, None)?,
        common::mean_diameter(
            row,
            "average_cell/nucleus_diameter_(µm)",
            run_at,
            material,
            None,
        )?,
    ];
    let measurements = readings
        .into_iter()
        .flatten()
        .map(|data| SuspensionPoolMeasurement {
            measured_by: preparer_ids[0],
            data,
        })
        .collect();

    Ok(Some(NewSuspensionPool {
        readable_id: row.require("readable_id")?.to_string(),
        name: row.require("name")?.to_string(),
        pooled_at,
        suspensions: children,
        preparer_ids,
        measurements,
    }))
}

/// Parses every pooled suspension, grouped by the pool it went into. A
/// child that fails to parse poisons its whole pool.
fn pooled_children(
    rows: &[Row],
    refs: &SuspensionRefs,
    empty: &EmptyEquivalents,
) -> HashMap<String, Result<Vec<NewSuspension>, RowError>> {
    let pooled = rows.iter().filter(|row| suspensions::row_is_pooled(row));
    group_rows(pooled, "pooled_into_id")
        .into_iter()
        .map(|(pool, rows)| {
            let children = rows
                .into_iter()
                .filter_map(|row| suspensions::parse_row(row, refs, empty).transpose())
                .collect::<Result<Vec<_>, _>>();
            (pool, children)
        })
        .collect()
}

/// Drops children whose readable ID was already claimed, by this pool or an
/// earlier one, and returns the dropped IDs.
fn drop_repeated_children(
    children: &mut Vec<NewSuspension>,
    claimed: &mut HashSet<String>,
) -> Vec<String> {
    let mut repeated = Vec::new();
    children.retain(|child| {
        if claimed.insert(child.readable_id.clone()) {
            true
        } else {
            repeated.push(child.readable_id.clone());
            false
        }
    });
    repeated
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::SuspensionPools;
    let rows = stage.sources.read(CsvFile::SuspensionPools)?;
    let suspension_rows = stage.sources.read(CsvFile::Suspensions)?;
    let gems = stage.sources.read_optional(CsvFile::Gems)?;
    let loadings = stage.sources.read_optional(CsvFile::GemsSuspensions)?;
    let empty = stage.sources.empty_equivalents(CsvFile::SuspensionPools);
    let suspension_empty = stage.sources.empty_equivalents(CsvFile::Suspensions);

    let (refs, existing) = suspensions::fetch_refs(stage.client, kind.endpoint())?;
    let known = Known::new(
        existing.into_iter().map(|pool| pool.readable_id),
        stage
            .cache
            .read_all::<NewSuspensionPool>(kind)?
            .into_iter()
            .map(|pool| pool.readable_id),
    );

    let run_dates = chip_run_dates(&loadings, &gems);
    let mut children = pooled_children(&suspension_rows, &refs, &suspension_empty);
    let mut claimed = HashSet::new();

    let mut batch = Batch::new(kind);
    for row in &rows {
        let label = row.label();
        let mut pool_children = match row.get("readable_id").and_then(|id| children.remove(id)) {
            Some(Ok(pool_children)) => pool_children,
            Some(Err(err)) => {
                batch.reject(&label, err);
                continue;
            }
            None => Vec::new(),
        };
        for readable_id in drop_repeated_children(&mut pool_children, &mut claimed) {
            batch.skip(&readable_id, SkipReason::DuplicateInBatch);
        }
        let chip_run_at = row.get("readable_id").and_then(|id| run_dates.get(id)).copied();
        match parse_row(row, pool_children, &refs.people_by_email, chip_run_at, &empty) {
            Ok(Some(pool)) => {
                let key = pool.readable_id.clone();
                batch.create_new(&key, &known, &pool)?;
            }
            Ok(None) => {}
            Err(err) => batch.reject(&label, err),
        }
    }
    Ok(batch)
}
