//! Specimens as received by the core, plus the RIN / DV200 measurements
//! recorded against them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::parse;
use crate::resolve::{self, IdMap, NamedRecord, PersonRecord, ReadableRecord};
use crate::table::{EmptyEquivalents, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    AmbystomaMexicanum,
    CallithrixJacchus,
    CanisFamiliaris,
    DrosophilaMelanogaster,
    GasterosteusAculeatus,
    HomoSapiens,
    MusMusculus,
    RattusNorvegicus,
    SminthopsisCrassicaudata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedBlockEmbeddingMatrix {
    Paraffin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrozenBlockEmbeddingMatrix {
    CarboxymethylCellulose,
    #[serde(alias = "oct")]
    OptimalCuttingTemperatureCompound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockFixative {
    FormaldehydeDerivative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TissueFixative {
    DithiobisSuccinimidylpropionate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionFixative {
    DithiobisSuccinimidylpropionate,
    FormaldehydeDerivative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "quantity", rename_all = "snake_case")]
pub enum SpecimenMeasurementData {
    Rin {
        measured_at: DateTime<Utc>,
        instrument_name: String,
        value: f64,
    },
    Dv200 {
        measured_at: DateTime<Utc>,
        instrument_name: String,
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecimenMeasurement {
    pub measured_by: Uuid,
    pub data: SpecimenMeasurementData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecimenCommon {
    pub readable_id: String,
    pub name: String,
    pub lab_id: Uuid,
    pub submitted_by: Uuid,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
    pub species: Vec<Species>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_buffer: Option<String>,
    #[serde(default)]
    pub measurements: Vec<SpecimenMeasurement>,
}

/// A specimen, shaped by what it physically is and how it was preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NewSpecimen {
    FixedBlock {
        #[serde(flatten)]
        common: SpecimenCommon,
        embedded_in: FixedBlockEmbeddingMatrix,
        fixative: BlockFixative,
    },
    FrozenBlock {
        #[serde(flatten)]
        common: SpecimenCommon,
        embedded_in: FrozenBlockEmbeddingMatrix,
    },
    CryopreservedTissue {
        #[serde(flatten)]
        common: SpecimenCommon,
    },
    FixedTissue {
        #[serde(flatten)]
        common: SpecimenCommon,
        fixative: TissueFixative,
    },
    FrozenTissue {
        #[serde(flatten)]
        common: SpecimenCommon,
    },
    CryopreservedSuspension {
        #[serde(flatten)]
        common: SpecimenCommon,
    },
    FixedOrFreshSuspension {
        #[serde(flatten)]
        common: SpecimenCommon,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fixative: Option<SuspensionFixative>,
    },
    FrozenSuspension {
        #[serde(flatten)]
        common: SpecimenCommon,
    },
}

impl NewSpecimen {
    pub fn common(&self) -> &SpecimenCommon {
        match self {
            NewSpecimen::FixedBlock { common, .. }
            | NewSpecimen::FrozenBlock { common, .. }
            | NewSpecimen::CryopreservedTissue { common }
            | NewSpecimen::FixedTissue { common, .. }
            | NewSpecimen::FrozenTissue { common }
            | NewSpecimen::CryopreservedSuspension { common }
            | NewSpecimen::FixedOrFreshSuspension { common, .. }
            | NewSpecimen::FrozenSuspension { common } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut SpecimenCommon {
        match self {
            NewSpecimen::FixedBlock { common, .. }
            | NewSpecimen::FrozenBlock { common, .. }
            | NewSpecimen::CryopreservedTissue { common }
            | NewSpecimen::FixedTissue { common, .. }
            | NewSpecimen::FrozenTissue { common }
            | NewSpecimen::CryopreservedSuspension { common }
            | NewSpecimen::FixedOrFreshSuspension { common, .. }
            | NewSpecimen::FrozenSuspension { common } => common,
        }
    }
}

/// Reference data a specimen row resolves against.
pub struct SpecimenRefs {
    pub labs: IdMap,
    pub people_by_email: IdMap,
    pub people_by_name: IdMap,
}

const REQUIRED: [&str; 4] = ["date_received", "submitter_email", "lab_name", "species"];
const PDX: &str = "Homo sapiens + Mus musculus (PDX)";

fn parse_species(value: &str) -> Result<Vec<Species>, RowError> {
    if value.trim() == PDX {
        return Ok(vec![Species::HomoSapiens, Species::MusMusculus]);
    }
    parse::from_tag(value)
        .map(|species| vec![species])
        .map_err(|message| RowError::invalid("species", value, message))
}

fn is_dsp(preservation: &str) -> bool {
    matches!(preservation, "dsp-fixed" | "scale dsp-fixed")
}

pub fn parse_row(
    row: &Row,
    refs: &SpecimenRefs,
    empty: &EmptyEquivalents,
) -> Result<Option<NewSpecimen>, RowError> {
    let ty = row.get("type").unwrap_or_default().to_lowercase();
    let preservation = row
        .get("preservation_method")
        .unwrap_or_default()
        .to_lowercase();
    if ty.is_empty() && preservation.is_empty() {
        return Ok(None);
    }
    if row.is_empty(&REQUIRED, empty) {
        return Ok(None);
    }

    let notes = ["condition", "tissue", "storage_details", "notes"]
        .iter()
        .filter_map(|key| row.get(key))
        .collect::<Vec<_>>()
        .join("; ");
    let storage_buffer = row
        .get("storage_details")
        .filter(|details| details.to_lowercase().contains("cryostor"))
        .map(|_| "cryostor".to_string());

    let common = SpecimenCommon {
        readable_id: row.require("readable_id")?.to_string(),
        name: row.require("name")?.to_string(),
        lab_id: refs.labs.resolve("lab", row.require("lab_name")?)?,
        submitted_by: refs
            .people_by_email
            .resolve("person", row.require("submitter_email")?)?,
        received_at: row.require_date("date_received")?,
        returned_by: row
            .get("returned_by")
            .map(|name| refs.people_by_name.resolve("person with that unique name", name))
            .transpose()?,
        returned_at: row.date("date_returned")?,
        species: parse_species(row.require("species")?)?,
        notes: (!notes.is_empty()).then_some(notes),
        storage_buffer,
        measurements: Vec::new(),
    };

    let specimen = match (ty.as_str(), preservation.as_str()) {
        ("block", "formaldehyde-derivative fixed") => NewSpecimen::FixedBlock {
            common,
            embedded_in: row.require_tag("embedding_matrix")?,
            fixative: BlockFixative::FormaldehydeDerivative,
        },
        ("block", "frozen") => NewSpecimen::FrozenBlock {
            common,
            embedded_in: row.require_tag("embedding_matrix")?,
        },
        ("tissue", "cryopreserved") => NewSpecimen::CryopreservedTissue { common },
        ("tissue", p) if is_dsp(p) => NewSpecimen::FixedTissue {
            common,
            fixative: TissueFixative::DithiobisSuccinimidylpropionate,
        },
        ("tissue", "frozen") => NewSpecimen::FrozenTissue { common },
        ("cell suspension", "cryopreserved") => NewSpecimen::CryopreservedSuspension { common },
        ("cell suspension" | "nucleus suspension", "frozen") => {
            NewSpecimen::FrozenSuspension { common }
        }
        ("cell suspension" | "nucleus suspension", "fresh") => {
            NewSpecimen::FixedOrFreshSuspension {
                common,
                fixative: None,
            }
        }
        ("cell suspension" | "nucleus suspension", "formaldehyde-derivative fixed") => {
            NewSpecimen::FixedOrFreshSuspension {
                common,
                fixative: Some(SuspensionFixative::FormaldehydeDerivative),
            }
        }
        ("cell suspension" | "nucleus suspension", p) if is_dsp(p) => {
            NewSpecimen::FixedOrFreshSuspension {
                common,
                fixative: Some(SuspensionFixative::DithiobisSuccinimidylpropionate),
            }
        }
        _ => {
            return Err(RowError::Inconsistent(format!(
                "unexpected specimen details: {} {}",
                row.get("preservation_method").unwrap_or_default(),
                row.get("type").unwrap_or_default()
            )));
        }
    };
    Ok(Some(specimen))
}

/// DV200 is recorded either as a fraction or as a percentage.
fn dv200(row: &Row) -> Result<Option<f64>, RowError> {
    Ok(row
        .float("dv200")?
        .map(|value| if value > 1.0 { value / 100.0 } else { value }))
}

/// Reads the RIN and DV200 of one measurement row. Undated measurements are
/// dated at `fallback_measured_at`.
pub fn parse_measurements(
    row: &Row,
    people_by_email: &IdMap,
    fallback_measured_at: DateTime<Utc>,
) -> Result<Vec<SpecimenMeasurement>, RowError> {
    let measured_by = people_by_email.resolve("person", row.require("measured_by")?)?;
    let measured_at = row.date("date_measured")?.unwrap_or(fallback_measured_at);
    let instrument_name = row.get("instrument_name").unwrap_or("unknown").to_string();

    let mut measurements = Vec::new();
    if let Some(value) = row.float("rin")? {
        measurements.push(SpecimenMeasurement {
            measured_by,
            data: SpecimenMeasurementData::Rin {
                measured_at,
                instrument_name: instrument_name.clone(),
                value,
            },
        });
    }
    if let Some(value) = dv200(row)? {
        measurements.push(SpecimenMeasurement {
            measured_by,
            data: SpecimenMeasurementData::Dv200 {
                measured_at,
                instrument_name,
                value,
            },
        });
    }
    Ok(measurements)
}

/// Measurement rows by specimen readable ID, blank rows dropped.
pub fn group_measurement_rows<'a>(
    rows: &'a [Row],
    empty: &EmptyEquivalents,
) -> HashMap<String, Vec<&'a Row>> {
    let mut grouped: HashMap<String, Vec<&Row>> = HashMap::new();
    for row in rows {
        if row.is_empty(&["specimen_readable_id", "measured_by"], empty) {
            continue;
        }
        if let Some(readable_id) = row.get("specimen_readable_id") {
            grouped.entry(readable_id.to_string()).or_default().push(row);
        }
    }
    grouped
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Specimens;
    let rows = stage.sources.read(CsvFile::Specimens)?;
    let measurement_rows = stage.sources.read_optional(CsvFile::SpecimenMeasurements)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Specimens);
    let measurement_empty = stage
        .sources
        .empty_equivalents(CsvFile::SpecimenMeasurements);

    let paths = [
        EntityKind::Labs.endpoint(),
        EntityKind::People.endpoint(),
        kind.endpoint(),
    ];
    let [labs, people, specimens] = resolve::fetch_all(stage.client, paths)?;
    let labs = resolve::by_name("lab name", &resolve::decode::<NamedRecord>(paths[0], labs)?)?;
    let people = resolve::decode::<PersonRecord>(paths[1], people)?;
    let refs = SpecimenRefs {
        labs,
        people_by_email: resolve::people_by_email(&people)?,
        people_by_name: resolve::people_by_unambiguous_name(&people),
    };

    let known = Known::new(
        resolve::decode::<ReadableRecord>(paths[2], specimens)?
            .into_iter()
            .map(|specimen| specimen.readable_id),
        stage
            .cache
            .read_all::<NewSpecimen>(kind)?
            .into_iter()
            .map(|specimen| specimen.common().readable_id.clone()),
    );
    let measurements = group_measurement_rows(&measurement_rows, &measurement_empty);

    let mut batch = Batch::new(kind);
    for row in &rows {
        let mut specimen = match parse_row(row, &refs, &empty) {
            Ok(Some(specimen)) => specimen,
            Ok(None) => continue,
            Err(err) => {
                batch.reject(&row.label(), err);
                continue;
            }
        };
        let common = specimen.common_mut();
        for measurement_row in measurements.get(&common.readable_id).into_iter().flatten() {
            match parse_measurements(measurement_row, &refs.people_by_email, common.received_at) {
                Ok(parsed) => common.measurements.extend(parsed),
                Err(err) => tracing::warn!(
                    specimen = %common.readable_id,
                    line = measurement_row.line(),
                    error = %err,
                    "dropping specimen measurement"
                ),
            }
        }
        let key = common.readable_id.clone();
        batch.create_new(&key, &known, &specimen)?;
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Fixture {
        refs: SpecimenRefs,
        lab: Uuid,
        submitter: Uuid,
        returner: Uuid,
    }

    fn fixture() -> Fixture {
        let lab = Uuid::new_v4();
        let submitter = Uuid::new_v4();
        let returner = Uuid::new_v4();
        Fixture {
            refs: SpecimenRefs {
                labs: IdMap::build("lab name", [("Smith Lab".to_string(), lab)]).unwrap(),
                people_by_email: IdMap::build(
                    "person email",
                    [("pi@yale.edu".to_string(), submitter)],
                )
                .unwrap()
                .case_insensitive(),
                people_by_name: IdMap::build("person name", [("Kim Park".to_string(), returner)])
                    .unwrap(),
            },
            lab,
            submitter,
            returner,
        }
    }

    fn row(ty: &str, preservation: &str) -> Row {
        Row::from_pairs([
            ("readable_id", "25SP1819"),
            ("name", "tumor 1"),
            ("date_received", "2025-02-03"),
            ("submitter_email", "PI@yale.edu"),
            ("lab_name", "Smith Lab"),
            ("species", "Homo Sapiens"),
            ("condition", "healthy"),
            ("tissue", ""),
            ("storage_details", "CryoStor CS10"),
            ("notes", "rush"),
            ("type", ty),
            ("preservation_method", preservation),
            ("embedding_matrix", "Paraffin"),
            ("returned_by", ""),
            ("date_returned", ""),
        ])
    }

    #[test]
    fn fixed_block() {
        let fixture = fixture();
        let specimen = parse_row(
            &row("Block", "Formaldehyde-derivative fixed"),
            &fixture.refs,
            &EmptyEquivalents::default(),
        )
        .unwrap()
        .unwrap();
        let value = serde_json::to_value(&specimen).unwrap();
        assert_eq!(value["type"], "fixed_block");
        assert_eq!(value["embedded_in"], "paraffin");
        assert_eq!(value["fixative"], "formaldehyde_derivative");
        assert_eq!(value["lab_id"], json!(fixture.lab));
        assert_eq!(value["submitted_by"], json!(fixture.submitter));
        assert_eq!(value["received_at"], "2025-02-03T13:00:00Z");
        assert_eq!(value["species"], json!(["homo_sapiens"]));
        assert_eq!(value["notes"], "healthy; CryoStor CS10; rush");
        assert_eq!(value["storage_buffer"], "cryostor");
    }

    #[test]
    fn suspension_variants() {
        let fixture = fixture();
        let empty = EmptyEquivalents::default();
        let fresh = parse_row(&row("Nucleus Suspension", "Fresh"), &fixture.refs, &empty)
            .unwrap()
            .unwrap();
        assert!(matches!(fresh, NewSpecimen::FixedOrFreshSuspension { fixative: None, .. }));
        let dsp = parse_row(&row("Cell Suspension", "DSP-fixed"), &fixture.refs, &empty)
            .unwrap()
            .unwrap();
        assert!(matches!(
            dsp,
            NewSpecimen::FixedOrFreshSuspension {
                fixative: Some(SuspensionFixative::DithiobisSuccinimidylpropionate),
                ..
            }
        ));
        let frozen = parse_row(&row("Cell Suspension", "Frozen"), &fixture.refs, &empty)
            .unwrap()
            .unwrap();
        assert!(matches!(frozen, NewSpecimen::FrozenSuspension { .. }));
    }

    #[test]
    fn unexpected_combination_is_reported() {
        let fixture = fixture();
        let err = parse_row(&row("Block", "Fresh"), &fixture.refs, &EmptyEquivalents::default())
            .unwrap_err();
        assert_eq!(
            err,
            RowError::Inconsistent("unexpected specimen details: Fresh Block".to_string())
        );
    }

    #[test]
    fn pdx_species_and_return() {
        let fixture = fixture();
        let mut row = row("Tissue", "Frozen");
        row.set("species", PDX);
        row.set("returned_by", "Kim Park");
        row.set("date_returned", "2025-03-01");
        let specimen = parse_row(&row, &fixture.refs, &EmptyEquivalents::default())
            .unwrap()
            .unwrap();
        let common = specimen.common();
        assert_eq!(common.species, vec![Species::HomoSapiens, Species::MusMusculus]);
        assert_eq!(common.returned_by, Some(fixture.returner));
        assert!(common.returned_at.is_some());
    }

    #[test]
    fn unknown_lab_is_an_error() {
        let fixture = fixture();
        let mut row = row("Tissue", "Frozen");
        row.set("lab_name", "Nobody Lab");
        let err = parse_row(&row, &fixture.refs, &EmptyEquivalents::default()).unwrap_err();
        assert_eq!(err, RowError::unresolved("lab", "Nobody Lab"));
    }

    #[test]
    fn measurements_fall_back_to_received_date() {
        let fixture = fixture();
        let received = parse::parse_date("2025-02-03").unwrap();
        let row = Row::from_pairs([
            ("measured_by", "pi@yale.edu"),
            ("date_measured", ""),
            ("rin", "7.5"),
            ("dv200", "85%"),
        ]);
        let measurements =
            parse_measurements(&row, &fixture.refs.people_by_email, received).unwrap();
        assert_eq!(
            measurements,
            vec![
                SpecimenMeasurement {
                    measured_by: fixture.submitter,
                    data: SpecimenMeasurementData::Rin {
                        measured_at: received,
                        instrument_name: "unknown".to_string(),
                        value: 7.5,
                    },
                },
                SpecimenMeasurement {
                    measured_by: fixture.submitter,
                    data: SpecimenMeasurementData::Dv200 {
                        measured_at: received,
                        instrument_name: "unknown".to_string(),
                        value: 0.85,
                    },
                },
            ]
        );
    }

    #[test]
    fn cached_payload_decodes() {
        let fixture = fixture();
        let specimen = parse_row(
            &row("Tissue", "Cryopreserved"),
            &fixture.refs,
            &EmptyEquivalents::default(),
        )
        .unwrap()
        .unwrap();
        let decoded: NewSpecimen =
            serde_json::from_value(serde_json::to_value(&specimen).unwrap()).unwrap();
        assert_eq!(decoded, specimen);
    }
}
