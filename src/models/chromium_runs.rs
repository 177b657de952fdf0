use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{self, Volume};
use super::{Batch, Known, Stage, group_rows};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, IdMap, PersonRecord, ReadableRecord};
use crate::table::{EmptyEquivalents, Row};

/// One suspension loaded into an on-chip-multiplexed GEMs well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionLoading {
    pub suspension_id: Uuid,
    pub suspension_volume_loaded: Volume,
    pub buffer_volume_loaded: Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plexy {
    Singleplex,
    PoolMultiplex,
    Ocm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plexy", rename_all = "snake_case")]
pub enum NewGems {
    Singleplex {
        readable_id: String,
        suspension_id: Uuid,
        suspension_volume_loaded: Volume,
        buffer_volume_loaded: Volume,
    },
    PoolMultiplex {
        readable_id: String,
        suspension_pool_id: Uuid,
        suspension_volume_loaded: Volume,
        buffer_volume_loaded: Volume,
    },
    Ocm {
        readable_id: String,
        loading: Vec<SuspensionLoading>,
    },
}

impl NewGems {
    pub fn plexy(&self) -> Plexy {
        match self {
            NewGems::Singleplex { .. } => Plexy::Singleplex,
            NewGems::PoolMultiplex { .. } => Plexy::PoolMultiplex,
            NewGems::Ocm { .. } => Plexy::Ocm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChromiumRun {
    pub plexy: Plexy,
    pub readable_id: String,
    pub run_at: DateTime<Utc>,
    pub run_by: Uuid,
    pub assay_id: Uuid,
    pub succeeded: bool,
    pub gems: Vec<NewGems>,
}

pub struct ChromiumRunRefs<'a> {
    pub people_by_email: IdMap,
    pub suspensions: IdMap,
    pub suspension_pools: IdMap,
    pub assays: &'a BTreeMap<String, Uuid>,
}

/// What one loading row put into the well.
enum Loaded<'r> {
    Suspension(&'r str),
    Pool(&'r str),
}

fn loaded(row: &Row) -> Result<Loaded<'_>, RowError> {
    match (row.get("suspension_readable_id"), row.get("suspension_pool_readable_id")) {
        (Some(_), Some(_)) => Err(RowError::Inconsistent(
            "a loading names both a suspension and a suspension pool".to_string(),
        )),
        (Some(suspension), None) => Ok(Loaded::Suspension(suspension)),
        (None, Some(pool)) => Ok(Loaded::Pool(pool)),
        (None, None) => Err(RowError::MissingField("suspension_readable_id".to_string())),
    }
}

/// Classifies the loadings of one GEMs well: a single suspension is
/// singleplex, a single pool is pool-multiplexed, and several suspensions
/// are on-chip multiplexed.
pub fn parse_gems(
    readable_id: &str,
    loadings: &[&Row],
    refs: &ChromiumRunRefs,
    run_at: DateTime<Utc>,
) -> Result<NewGems, RowError> {
    let readable_id = readable_id.to_string();
    let volumes = |row: &Row| -> Result<(Volume, Volume), RowError> {
        Ok((
            common::microliters(row, "suspension_volume_loaded_(µl)", run_at)?,
            common::microliters(row, "buffer_volume_loaded_(µl)", run_at)?,
        ))
    };

    let loaded = loadings.iter().map(|row| loaded(row)).collect::<Result<Vec<_>, _>>()?;
    match (loadings, loaded.as_slice()) {
        ([row], [Loaded::Suspension(suspension)]) => {
            let (suspension_volume_loaded, buffer_volume_loaded) = volumes(*row)?;
            Ok(NewGems::Singleplex {
                readable_id,
                suspension_id: refs.suspensions.resolve("suspension", suspension)?,
                suspension_volume_loaded,
                buffer_volume_loaded,
            })
        }
        ([row], [Loaded::Pool(pool)]) => {
            let (suspension_volume_loaded, buffer_volume_loaded) = volumes(*row)?;
            Ok(NewGems::PoolMultiplex {
                readable_id,
                suspension_pool_id: refs.suspension_pools.resolve("suspension pool", pool)?,
                suspension_volume_loaded,
                buffer_volume_loaded,
            })
        }
        ([], _) => Err(RowError::Inconsistent(format!("GEMs {readable_id} has no loadings"))),
        (rows, loaded) => {
            let mut loading = Vec::with_capacity(rows.len());
            for (row, loaded) in rows.iter().zip(loaded) {
                let Loaded::Suspension(suspension) = loaded else {
                    return Err(RowError::Inconsistent(format!(
                        "GEMs {readable_id} is loaded with a suspension pool and something else"
                    )));
                };
                let (suspension_volume_loaded, buffer_volume_loaded) = volumes(*row)?;
                loading.push(SuspensionLoading {
                    suspension_id: refs.suspensions.resolve("suspension", suspension)?,
                    suspension_volume_loaded,
                    buffer_volume_loaded,
                });
            }
            Ok(NewGems::Ocm { readable_id, loading })
        }
    }
}

fn loading_failed(loadings: &[&Row]) -> bool {
    loadings
        .iter()
        .any(|row| row.bool("clog/wetting_failure").unwrap_or(false))
}

/// Builds one run from its GEMs rows. GEMs without loadings are left out
/// with a warning; any other GEMs problem rejects the run.
pub fn parse_run(
    readable_id: &str,
    gems_rows: &[&Row],
    loadings: &HashMap<String, Vec<&Row>>,
    refs: &ChromiumRunRefs,
) -> Result<NewChromiumRun, RowError> {
    let first = gems_rows
        .first()
        .ok_or_else(|| RowError::Inconsistent(format!("chromium run {readable_id} has no GEMs")))?;
    let run_at = first.require_date("date_chip_run")?;
    let run_by = refs
        .people_by_email
        .resolve("person", first.require("chip_run_by")?)?;
    let assay = first.require("assay")?;
    let assay_id = *refs
        .assays
        .get(assay)
        .ok_or_else(|| RowError::unresolved("assay", assay))?;

    let mut succeeded = true;
    let mut gems = Vec::with_capacity(gems_rows.len());
    for row in gems_rows {
        let gems_id = row.require("readable_id")?;
        let Some(gems_loadings) = loadings.get(gems_id) else {
            tracing::warn!(
                chromium_run = readable_id,
                gems = gems_id,
                "GEMs has no complete loading"
            );
            continue;
        };
        succeeded &= !loading_failed(gems_loadings);
        gems.push(parse_gems(gems_id, gems_loadings, refs, run_at)?);
    }

    let Some(plexy) = gems.first().map(NewGems::plexy) else {
        return Err(RowError::Inconsistent(format!(
            "chromium run {readable_id} has no loaded GEMs"
        )));
    };
    if gems.iter().any(|g| g.plexy() != plexy) {
        return Err(RowError::Inconsistent(format!(
            "chromium run {readable_id} mixes GEMs types"
        )));
    }

    Ok(NewChromiumRun {
        plexy,
        readable_id: readable_id.to_string(),
        run_at,
        run_by,
        assay_id,
        succeeded,
        gems,
    })
}

/// Loadings by GEMs readable ID. Rows that record no volumes are ignored.
pub fn group_loadings<'a>(
    rows: &'a [Row],
    empty: &EmptyEquivalents,
) -> HashMap<String, Vec<&'a Row>> {
    const REQUIRED: [&str; 2] = ["suspension_volume_loaded_(µl)", "buffer_volume_loaded_(µl)"];
    let loaded = rows.iter().filter(|row| !row.is_empty(&REQUIRED, empty));
    group_rows(loaded, "gems_readable_id").into_iter().collect()
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::ChromiumRuns;
    let gems_rows = stage.sources.read(CsvFile::Gems)?;
    let loading_rows = stage.sources.read(CsvFile::GemsSuspensions)?;
    let gems_empty = stage.sources.empty_equivalents(CsvFile::Gems);
    let loading_empty = stage.sources.empty_equivalents(CsvFile::GemsSuspensions);

    let paths = [
        EntityKind::People.endpoint(),
        EntityKind::Suspensions.endpoint(),
        EntityKind::SuspensionPools.endpoint(),
        kind.endpoint(),
    ];
    let [people, suspensions, pools, runs] = resolve::fetch_all(stage.client, paths)?;
    let refs = ChromiumRunRefs {
        people_by_email: resolve::people_by_email(&resolve::decode::<PersonRecord>(
            paths[0], people,
        )?)?,
        suspensions: resolve::by_readable_id(
            "suspension readable ID",
            &resolve::decode::<ReadableRecord>(paths[1], suspensions)?,
        )?,
        suspension_pools: resolve::by_readable_id(
            "suspension pool readable ID",
            &resolve::decode::<ReadableRecord>(paths[2], pools)?,
        )?,
        assays: &stage.tables.assays,
    };
    let known = Known::new(
        resolve::decode::<ReadableRecord>(paths[3], runs)?
            .into_iter()
            .map(|run| run.readable_id),
        stage
            .cache
            .read_all::<NewChromiumRun>(kind)?
            .into_iter()
            .map(|run| run.readable_id),
    );

    let loadings = group_loadings(&loading_rows, &loading_empty);
    let gems_rows = gems_rows
        .iter()
        .filter(|row| !row.is_empty(&["chromium_run_readable_id", "assay"], &gems_empty));

    let mut batch = Batch::new(kind);
    for (readable_id, rows) in group_rows(gems_rows, "chromium_run_readable_id") {
        match parse_run(&readable_id, &rows, &loadings, &refs) {
            Ok(run) => batch.create_new(&readable_id, &known, &run)?,
            Err(err) => batch.reject(&readable_id, err),
        }
    }
    Ok(batch)
}
