use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::common::{self, BiologicalMaterial, CellCountingMethod, SuspensionMeasurementData};
use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{
    self, IdMap, MultiplexingTagRecord, PersonRecord, ReadableRecord, SpecimenRecord,
};
use crate::table::{EmptyEquivalents, Row};

pub const MULTIPLEXING_TAGS_ENDPOINT: &str = "/multiplexing-tags";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionMeasurement {
    pub measured_by: Uuid,
    pub data: SuspensionMeasurementData,
    pub is_post_probe_hybridization: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSuspension {
    pub readable_id: String,
    pub parent_specimen_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexing_tag_id: Option<Uuid>,
    pub biological_material: BiologicalMaterial,
    pub preparer_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cell_recovery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lysis_duration_minutes: Option<f64>,
    #[serde(default)]
    pub measurements: Vec<SuspensionMeasurement>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, Value>,
}

pub struct SuspensionRefs {
    pub specimens: HashMap<String, SpecimenRecord>,
    pub people_by_email: IdMap,
    pub multiplexing_tags: IdMap,
}

#[derive(Clone, Copy)]
enum Quantity {
    Concentration,
    Volume,
    Viability,
    MeanDiameter,
}

/// One measurement column of the suspension export.
struct Column {
    key: &'static str,
    quantity: Quantity,
    by_customer: bool,
    post_hybridization: bool,
}

const fn column(
    key: &'static str,
    quantity: Quantity,
    by_customer: bool,
    post_hybridization: bool,
) -> Column {
    Column {
        key,
        quantity,
        by_customer,
        post_hybridization,
    }
}

const COLUMNS: [Column; 14] = [
    column(
        "customer_cell/nucleus_concentration_(cell-nucleus/ml)",
        Quantity::Concentration,
        true,
        false,
    ),
    column(
        "scbl_cell/nucleus_concentration_(cell-nucleus/ml)",
        Quantity::Concentration,
        false,
        false,
    ),
    column(
        "scbl_cell/nucleus_concentration_(post-adjustment)_(cell-nucleus/ml)",
        Quantity::Concentration,
        false,
        false,
    ),
    column(
        "post-hybridization_cell/nucleus_concentration_(cell-nucleus/ml)",
        Quantity::Concentration,
        false,
        true,
    ),
    column("customer_volume_(µl)", Quantity::Volume, true, false),
    column("scbl_volume_(µl)", Quantity::Volume, false, false),
    column("scbl_volume_(post-adjustment)_(µl)", Quantity::Volume, false, false),
    column("post-hybridization_volume_(µl)", Quantity::Volume, false, true),
    column("customer_cell_viability_(%)", Quantity::Viability, true, false),
    column("scbl_cell_viability_(%)", Quantity::Viability, false, false),
    column("scbl_cell_viability_(post-adjustment)_(%)", Quantity::Viability, false, false),
    column("scbl_average_cell/nucleus_diameter_(µm)", Quantity::MeanDiameter, false, false),
    column(
        "scbl_average_cell/nucleus_diameter_(post-adjustment)_(µm)",
        Quantity::MeanDiameter,
        false,
        false,
    ),
    column(
        "scbl_post-hybridization_average_cell/nucleus_diameter_(µm)",
        Quantity::MeanDiameter,
        false,
        true,
    ),
];

const REQUIRED: [&str; 3] = [
    "parent_specimen_readable_id",
    "biological_material",
    "preparer_1_email",
];

/// On-chip multiplexing (OCM) barcodes are named `OB…`. Suspensions tagged
/// with one are loaded side by side rather than pooled.
pub fn row_is_ocm(row: &Row) -> bool {
    row.get("multiplexing_tag_id")
        .map(|tag| tag.starts_with("OB"))
        .unwrap_or(false)
}

/// Whether the row describes a suspension that only exists inside a pool.
pub fn row_is_pooled(row: &Row) -> bool {
    row.has("pooled_into_id") && !row_is_ocm(row)
}

/// Resolves the first and, if given, second preparer.
pub fn preparers(
    row: &Row,
    first: &str,
    second: &str,
    people: &IdMap,
) -> Result<Vec<Uuid>, RowError> {
    let mut ids = vec![people.resolve("person", row.require(first)?)?];
    if let Some(email) = row.get(second) {
        ids.push(people.resolve("person", email)?);
    }
    Ok(ids)
}

fn measurements(
    row: &Row,
    material: BiologicalMaterial,
    measured_at: DateTime<Utc>,
    customer: Uuid,
    preparer: Uuid,
) -> Result<Vec<SuspensionMeasurement>, RowError> {
    let instrument = row.get("cell_counter");
    let counting_method = row.tag::<CellCountingMethod>("counting_method")?;

    let mut measurements = Vec::new();
    for column in &COLUMNS {
        let instrument = if column.by_customer { None } else { instrument };
        let data = match column.quantity {
            Quantity::Concentration => common::concentration(
                row,
                column.key,
                measured_at,
                material,
                instrument,
                if column.by_customer { None } else { counting_method },
            )?,
            Quantity::Volume => common::volume(row, column.key, measured_at)?,
            Quantity::Viability => common::viability(row, column.key, measured_at, instrument)?,
            Quantity::MeanDiameter => {
                common::mean_diameter(row, column.key, measured_at, material, instrument)?
            }
        };
        if let Some(data) = data {
            measurements.push(SuspensionMeasurement {
                measured_by: if column.by_customer { customer } else { preparer },
                data,
                is_post_probe_hybridization: column.post_hybridization,
            });
        }
    }
    Ok(measurements)
}

fn additional_data(row: &Row) -> BTreeMap<String, Value> {
    let mut data = BTreeMap::new();
    for key in ["experiment_id", "notes"] {
        if let Some(value) = row.get(key) {
            data.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    for key in ["fails_quality_control", "filtered_more_than_once"] {
        if let Some(value) = row.bool(key) {
            data.insert(key.to_string(), Value::Bool(value));
        }
    }
    data
}

/// Maps one suspension row. Measurements without a date are dated at the
/// parent specimen's receipt. Customer-reported values are attributed to
/// the specimen's submitter, everything else to the first preparer.
pub fn parse_row(
    row: &Row,
    refs: &SuspensionRefs,
    empty: &EmptyEquivalents,
) -> Result<Option<NewSuspension>, RowError> {
    if row.is_empty(&REQUIRED, empty) {
        return Ok(None);
    }

    let parent_readable_id = row.require("parent_specimen_readable_id")?;
    let parent = refs
        .specimens
        .get(parent_readable_id)
        .ok_or_else(|| RowError::unresolved("specimen", parent_readable_id))?;

    let material = row.require_tag::<BiologicalMaterial>("biological_material")?;
    let preparer_ids = preparers(row, "preparer_1_email", "preparer_2", &refs.people_by_email)?;
    let created_at = row.date("date_created")?;
    let measured_at = created_at.unwrap_or(parent.received_at);

    Ok(Some(NewSuspension {
        readable_id: row.require("readable_id")?.to_string(),
        parent_specimen_id: parent.id,
        created_at,
        multiplexing_tag_id: row
            .get("multiplexing_tag_id")
            .map(|tag| refs.multiplexing_tags.resolve("multiplexing tag", tag))
            .transpose()?,
        biological_material: material,
        target_cell_recovery: row.float("target_cell_recovery")?,
        lysis_duration_minutes: row.float("lysis_duration_minutes")?,
        measurements: measurements(
            row,
            material,
            measured_at,
            parent.submitted_by,
            preparer_ids[0],
        )?,
        additional_data: additional_data(row),
        preparer_ids,
    }))
}

/// Lists everything suspension rows resolve against, along with the records
/// already at `existing`.
pub fn fetch_refs<C: TrackingClient>(
    client: &C,
    existing: &str,
) -> Result<(SuspensionRefs, Vec<ReadableRecord>), PopulateError> {
    let paths = [
        EntityKind::People.endpoint(),
        EntityKind::Specimens.endpoint(),
        MULTIPLEXING_TAGS_ENDPOINT,
        existing,
    ];
    let [people, specimens, tags, records] = resolve::fetch_all(client, paths)?;
    let people = resolve::decode::<PersonRecord>(paths[0], people)?;
    let tags = resolve::decode::<MultiplexingTagRecord>(paths[2], tags)?;
    let refs = SuspensionRefs {
        people_by_email: resolve::people_by_email(&people)?,
        specimens: resolve::specimens_by_readable_id(resolve::decode(paths[1], specimens)?)?,
        multiplexing_tags: IdMap::build(
            "multiplexing tag ID",
            tags.into_iter().map(|tag| (tag.tag_id, tag.id)),
        )?,
    };
    Ok((refs, resolve::decode(paths[3], records)?))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Suspensions;
    let rows = stage.sources.read(CsvFile::Suspensions)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Suspensions);
    let (refs, existing) = fetch_refs(stage.client, kind.endpoint())?;

    let known = Known::new(
        existing.into_iter().map(|suspension| suspension.readable_id),
        stage
            .cache
            .read_all::<NewSuspension>(kind)?
            .into_iter()
            .map(|suspension| suspension.readable_id),
    );

    let mut batch = Batch::new(kind);
    for row in rows.iter().filter(|row| !row_is_pooled(row)) {
        match parse_row(row, &refs, &empty) {
            Ok(Some(suspension)) => {
                let key = suspension.readable_id.clone();
                batch.create_new(&key, &known, &suspension)?;
            }
            Ok(None) => {}
            Err(err) => batch.reject(&row.label(), err),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_date;

    struct Fixture {
        refs: SuspensionRefs,
        specimen: Uuid,
        submitter: Uuid,
        preparer: Uuid,
    }

    fn fixture() -> Fixture {
        let specimen = Uuid::new_v4();
        let submitter = Uuid::new_v4();
        let preparer = Uuid::new_v4();
        let record = SpecimenRecord {
            id: specimen,
            readable_id: "25SP1".to_string(),
            received_at: parse_date("2025-01-02").unwrap(),
            submitted_by: submitter,
            measurements: Vec::new(),
        };
        Fixture {
            refs: SuspensionRefs {
                specimens: HashMap::from([("25SP1".to_string(), record)]),
                people_by_email: IdMap::build(
                    "person email",
                    [("prep@yale.edu".to_string(), preparer)],
                )
                .unwrap(),
                multiplexing_tags: IdMap::build(
                    "multiplexing tag ID",
                    [("OB1".to_string(), Uuid::new_v4())],
                )
                .unwrap(),
            },
            specimen,
            submitter,
            preparer,
        }
    }

    fn row() -> Row {
        Row::from_pairs([
            ("readable_id", "25SU1"),
            ("parent_specimen_readable_id", "25SP1"),
            ("biological_material", "Cells"),
            ("preparer_1_email", "prep@yale.edu"),
            ("preparer_2", ""),
            ("date_created", ""),
            ("multiplexing_tag_id", ""),
            ("target_cell_recovery", "10,000"),
            ("cell_counter", "Countess 3"),
            ("counting_method", "Trypan Blue"),
            ("customer_cell/nucleus_concentration_(cell-nucleus/ml)", "1,000,000"),
            ("scbl_cell/nucleus_concentration_(cell-nucleus/ml)", "900000"),
            ("scbl_cell_viability_(%)", "91"),
            ("scbl_volume_(µl)", "40"),
            ("fails_quality_control", "FALSE"),
            ("experiment_id", "25E1"),
        ])
    }

    #[test]
    fn measurements_are_attributed() {
        let fixture = fixture();
        let suspension = parse_row(&row(), &fixture.refs, &EmptyEquivalents::default())
            .unwrap()
            .unwrap();
        assert_eq!(suspension.parent_specimen_id, fixture.specimen);
        assert_eq!(suspension.preparer_ids, vec![fixture.preparer]);
        assert_eq!(suspension.target_cell_recovery, Some(10_000.0));
        assert_eq!(suspension.measurements.len(), 4);

        let customer = &suspension.measurements[0];
        assert_eq!(customer.measured_by, fixture.submitter);
        assert!(matches!(
            customer.data,
            SuspensionMeasurementData::Concentration {
                instrument_name: None,
                counting_method: None,
                ..
            }
        ));

        let scbl = &suspension.measurements[1];
        assert_eq!(scbl.measured_by, fixture.preparer);
        assert!(matches!(
            &scbl.data,
            SuspensionMeasurementData::Concentration {
                instrument_name: Some(name),
                counting_method: Some(CellCountingMethod::TrypanBlue),
                measured_at,
                ..
            } if name == "Countess 3" && *measured_at == parse_date("2025-01-02").unwrap()
        ));

        assert!(suspension.measurements.iter().any(|m| matches!(
            m.data,
            SuspensionMeasurementData::Viability { value, .. } if (value - 0.91).abs() < 1e-9
        )));
        assert_eq!(suspension.additional_data["fails_quality_control"], Value::Bool(false));
        assert_eq!(suspension.additional_data["experiment_id"], Value::String("25E1".into()));
    }

    #[test]
    fn unknown_parent_is_an_error() {
        let fixture = fixture();
        let mut row = row();
        row.set("parent_specimen_readable_id", "25SP404");
        let err = parse_row(&row, &fixture.refs, &EmptyEquivalents::default()).unwrap_err();
        assert_eq!(err, RowError::unresolved("specimen", "25SP404"));
    }

    #[test]
    fn pooled_rows_belong_to_pools_unless_ocm() {
        let mut pooled = row();
        pooled.set("pooled_into_id", "25SUP1");
        assert!(row_is_pooled(&pooled));
        pooled.set("multiplexing_tag_id", "OB1");
        assert!(row_is_ocm(&pooled));
        assert!(!row_is_pooled(&pooled));
        assert!(!row_is_pooled(&row()));
    }
}
