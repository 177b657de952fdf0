use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::common::{self, NucleicAcidMeasurement};
use super::suspensions::preparers;
use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, IdMap, PersonRecord, ReadableRecord};
use crate::table::{EmptyEquivalents, Row};

/// 10x index kits are either single-index (`…NA`, `…GA`) or dual-index sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSetName {
    SingleIndexSetName(String),
    DualIndexSetName(String),
}

impl IndexSetName {
    pub fn classify(name: &str) -> Self {
        if name.contains("NA") || name.contains("GA") {
            IndexSetName::SingleIndexSetName(name.to_string())
        } else {
            IndexSetName::DualIndexSetName(name.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLibrary {
    pub readable_id: String,
    pub cdna_id: Uuid,
    pub number_of_sample_index_pcr_cycles: i64,
    pub volume_mcl: f64,
    pub target_reads_per_cell: i64,
    pub prepared_at: DateTime<Utc>,
    pub preparer_ids: Vec<Uuid>,
    #[serde(flatten)]
    pub index_set: IndexSetName,
    #[serde(default)]
    pub measurements: Vec<NucleicAcidMeasurement>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, Value>,
}

const REQUIRED: [&str; 6] = [
    "cdna_readable_id",
    "number_of_sample_index_pcr_cycles",
    "volume_µl",
    "target_reads_per_cell_(k)",
    "date_prepared",
    "preparer_1_email",
];

pub fn parse_row(
    row: &Row,
    cdna: &IdMap,
    people_by_email: &IdMap,
    empty: &EmptyEquivalents,
) -> Result<Option<NewLibrary>, RowError> {
    if row.is_empty(&REQUIRED, empty) {
        return Ok(None);
    }

    let preparer_ids = preparers(row, "preparer_1_email", "preparer_2_email", people_by_email)?;
    let prepared_at = row.require_date("date_prepared")?;
    let readings = [
        common::tapestation(
            row,
            "Agilent TapeStation",
            prepared_at,
            Some("tapestation_mean_library_size_(bp)"),
        )?,
        common::qubit(row, "qubit_concentration_(ng/µl)", "ThermoFisher Qubit", prepared_at)?,
    ];
    let measurements = readings
        .into_iter()
        .flatten()
        .map(|data| NucleicAcidMeasurement {
            measured_by: preparer_ids[0],
            data,
        })
        .collect();

    let mut additional_data = BTreeMap::new();
    additional_data.insert(
        "fails_quality_control".to_string(),
        row.bool("fails_quality_control").map_or(Value::Null, Value::Bool),
    );
    for key in ["failure_notes", "notes"] {
        if let Some(value) = row.get(key) {
            additional_data.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    let target_reads_per_cell = row.require_float("target_reads_per_cell_(k)")? * 1000.0;

    Ok(Some(NewLibrary {
        readable_id: row.require("readable_id")?.to_string(),
        cdna_id: cdna.resolve("cDNA", row.require("cdna_readable_id")?)?,
        number_of_sample_index_pcr_cycles: row.require_int("number_of_sample_index_pcr_cycles")?,
        volume_mcl: row.require_float("volume_µl")?,
        target_reads_per_cell: target_reads_per_cell.round() as i64,
        prepared_at,
        preparer_ids,
        index_set: IndexSetName::classify(row.require("full_index_set_name")?),
        measurements,
        additional_data,
    }))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Libraries;
    let rows = stage.sources.read(CsvFile::Libraries)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Libraries);

    let paths = [
        EntityKind::People.endpoint(),
        EntityKind::Cdna.endpoint(),
        kind.endpoint(),
    ];
    let [people, cdna, existing] = resolve::fetch_all(stage.client, paths)?;
    let people = resolve::people_by_email(&resolve::decode::<PersonRecord>(paths[0], people)?)?;
    let cdna = resolve::by_readable_id(
        "cDNA readable ID",
        &resolve::decode::<ReadableRecord>(paths[1], cdna)?,
    )?;
    let known = Known::new(
        resolve::decode::<ReadableRecord>(paths[2], existing)?
            .into_iter()
            .map(|library| library.readable_id),
        stage
            .cache
            .read_all::<NewLibrary>(kind)?
            .into_iter()
            .map(|library| library.readable_id),
    );

    let mut batch = Batch::new(kind);
    for row in &rows {
        match parse_row(row, &cdna, &people, &empty) {
            Ok(Some(library)) => {
                let key = library.readable_id.clone();
                batch.create_new(&key, &known, &library)?;
            }
            Ok(None) => {}
            Err(err) => batch.reject(&row.label(), err),
        }
    }
    Ok(batch)
}
