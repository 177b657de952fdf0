use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::common::{self, NucleicAcidMeasurement};
use super::suspensions::preparers;
use super::{Batch, SkipReason, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, ChromiumRunRecord, IdMap, PersonRecord, ReadableRecord};
use crate::table::{EmptyEquivalents, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryType {
    AntibodyCapture,
    AntigenCapture,
    ChromatinAccessibility,
    CrisprGuideCapture,
    #[serde(alias = "gene_expression_flex")]
    GeneExpression,
    MultiplexingCapture,
    #[serde(alias = "vdj-t", alias = "vdj-b")]
    Vdj,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCdna {
    pub readable_id: String,
    pub library_type: LibraryType,
    pub gems_id: Uuid,
    pub prepared_at: DateTime<Utc>,
    pub preparer_ids: Vec<Uuid>,
    pub n_amplification_cycles: i64,
    pub volume_mcl: f64,
    #[serde(default)]
    pub measurements: Vec<NucleicAcidMeasurement>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, Value>,
}

/// cDNA made from the same GEMs are created together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewCdnaGroup {
    Single(NewCdna),
    OnChipMultiplexing(Vec<NewCdna>),
    Multiple(Vec<NewCdna>),
}

impl NewCdnaGroup {
    /// One cDNA is single; several of one library type came from an
    /// on-chip-multiplexed well; anything else is a mix of library types.
    pub fn from_members(mut members: Vec<NewCdna>) -> Option<Self> {
        match members.len() {
            0 => None,
            1 => members.pop().map(NewCdnaGroup::Single),
            _ => {
                let types = members.iter().map(|c| c.library_type).collect::<HashSet<_>>();
                if types.len() == 1 {
                    Some(NewCdnaGroup::OnChipMultiplexing(members))
                } else {
                    Some(NewCdnaGroup::Multiple(members))
                }
            }
        }
    }

    pub fn members(&self) -> &[NewCdna] {
        match self {
            NewCdnaGroup::Single(cdna) => std::slice::from_ref(cdna),
            NewCdnaGroup::OnChipMultiplexing(members) | NewCdnaGroup::Multiple(members) => {
                members
            }
        }
    }
}

/// cDNA waiting to be grouped by the GEMs they were made from, in the order
/// the GEMs first appear.
#[derive(Debug, Default)]
pub struct CdnaGroups {
    seen: HashSet<String>,
    groups: Vec<(Uuid, String, Vec<NewCdna>)>,
}

impl CdnaGroups {
    /// Returns false, keeping nothing, when the readable ID was already added.
    pub fn insert(&mut self, gems_label: &str, cdna: NewCdna) -> bool {
        if !self.seen.insert(cdna.readable_id.clone()) {
            return false;
        }
        match self.groups.iter_mut().find(|(gems_id, ..)| *gems_id == cdna.gems_id) {
            Some((_, _, members)) => members.push(cdna),
            None => self.groups.push((cdna.gems_id, gems_label.to_string(), vec![cdna])),
        }
        true
    }

    /// Each group labelled with its GEMs readable ID.
    pub fn into_groups(self) -> impl Iterator<Item = (String, NewCdnaGroup)> {
        self.groups.into_iter().filter_map(|(_, label, members)| {
            NewCdnaGroup::from_members(members).map(|group| (label, group))
        })
    }
}

const REQUIRED: [&str; 6] = [
    "library_type",
    "date_prepared",
    "preparer_email",
    "gems_readable_id",
    "volume_(µl)",
    "n_amplification_cycles",
];

pub fn parse_row(
    row: &Row,
    gems: &IdMap,
    people_by_email: &IdMap,
    empty: &EmptyEquivalents,
) -> Result<Option<NewCdna>, RowError> {
    if row.is_empty(&REQUIRED, empty) {
        return Ok(None);
    }

    let preparer_ids = preparers(row, "preparer_email", "preparer_2", people_by_email)?;
    let prepared_at = row.require_date("date_prepared")?;
    let measurements = common::tapestation(row, "TapeStation", prepared_at, None)?
        .map(|data| NucleicAcidMeasurement {
            measured_by: preparer_ids[0],
            data,
        })
        .into_iter()
        .collect();

    let mut additional_data = BTreeMap::new();
    for key in ["experiment_id", "failure_notes", "storage_location", "notes"] {
        if let Some(value) = row.get(key) {
            additional_data.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    for key in ["is_preamplification_product", "fails_quality_control"] {
        additional_data.insert(key.to_string(), row.bool(key).map_or(Value::Null, Value::Bool));
    }

    Ok(Some(NewCdna {
        readable_id: row.require("readable_id")?.to_string(),
        library_type: row.require_tag("library_type")?,
        gems_id: gems.resolve("GEMs", row.require("gems_readable_id")?)?,
        prepared_at,
        preparer_ids,
        n_amplification_cycles: row.require_int("n_amplification_cycles")?,
        volume_mcl: row.require_float("volume_(µl)")?,
        measurements,
        additional_data,
    }))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Cdna;
    let rows = stage.sources.read(CsvFile::Cdna)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Cdna);

    let paths = [
        EntityKind::People.endpoint(),
        EntityKind::ChromiumRuns.endpoint(),
        kind.endpoint(),
    ];
    let [people, runs, existing] = resolve::fetch_all(stage.client, paths)?;
    let people =
        resolve::people_by_email(&resolve::decode::<PersonRecord>(paths[0], people)?)?;
    let gems = resolve::decode::<ChromiumRunRecord>(paths[1], runs)?
        .into_iter()
        .flat_map(|run| run.gems)
        .collect::<Vec<_>>();
    let gems = resolve::by_readable_id("GEMs readable ID", &gems)?;
    let remote = resolve::decode::<ReadableRecord>(paths[2], existing)?
        .into_iter()
        .map(|cdna| cdna.readable_id)
        .collect::<HashSet<_>>();
    let cached = stage
        .cache
        .read_all::<NewCdnaGroup>(kind)?
        .iter()
        .flat_map(|group| group.members().iter().map(|cdna| cdna.readable_id.clone()))
        .collect::<HashSet<_>>();

    let mut batch = Batch::new(kind);
    let mut groups = CdnaGroups::default();
    for row in &rows {
        let cdna = match parse_row(row, &gems, &people, &empty) {
            Ok(Some(cdna)) => cdna,
            Ok(None) => continue,
            Err(err) => {
                batch.reject(&row.label(), err);
                continue;
            }
        };
        let readable_id = cdna.readable_id.clone();
        if remote.contains(&readable_id) {
            batch.skip(&readable_id, SkipReason::AlreadyExists);
            continue;
        }
        if cached.contains(&readable_id) {
            batch.skip(&readable_id, SkipReason::Cached);
            continue;
        }
        let gems_label = row.get("gems_readable_id").unwrap_or_default();
        if !groups.insert(gems_label, cdna) {
            batch.skip(&readable_id, SkipReason::DuplicateInBatch);
        }
    }

    for (label, group) in groups.into_groups() {
        batch.create(&label, &group)?;
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::parse::from_tag;

    fn refs() -> (IdMap, IdMap) {
        (
            IdMap::build("GEMs readable ID", [("25G1".to_string(), Uuid::new_v4())])
                .unwrap(),
            IdMap::build("person email", [("prep@yale.edu".to_string(), Uuid::new_v4())])
                .unwrap(),
        )
    }

    fn row(readable_id: &str, library_type: &str) -> Row {
        Row::from_pairs([
            ("readable_id", readable_id),
            ("library_type", library_type),
            ("date_prepared", "2025-04-01"),
            ("preparer_email", "prep@yale.edu"),
            ("gems_readable_id", "25G1"),
            ("volume_(µl)", "35"),
            ("n_amplification_cycles", "11.0"),
            ("fails_quality_control", "FALSE"),
        ])
    }

    #[test]
    fn library_type_aliases() {
        assert_eq!(
            from_tag::<LibraryType>("Gene Expression Flex").unwrap(),
            LibraryType::GeneExpression
        );
        assert_eq!(from_tag::<LibraryType>("VDJ-T").unwrap(), LibraryType::Vdj);
        assert_eq!(from_tag::<LibraryType>("vdj-b").unwrap(), LibraryType::Vdj);
    }

    #[test]
    fn rows_map_to_cdna() {
        let (gems, people) = refs();
        let empty = EmptyEquivalents::default();
        let cdna = parse_row(&row("25C1", "Gene Expression"), &gems, &people, &empty)
            .unwrap()
            .unwrap();
        assert_eq!(cdna.n_amplification_cycles, 11);
        assert_eq!(cdna.gems_id, gems.get("25G1").unwrap());
        assert!(cdna.measurements.is_empty());
        assert_eq!(cdna.additional_data["fails_quality_control"], json!(false));
        assert_eq!(cdna.additional_data["is_preamplification_product"], json!(null));
    }

    #[test]
    fn unknown_gems_is_unresolved() {
        let (_, people) = refs();
        let empty = EmptyEquivalents::default();
        let err = parse_row(&row("25C1", "Gene Expression"), &IdMap::default(), &people, &empty)
            .unwrap_err();
        assert_eq!(err, RowError::unresolved("GEMs", "25G1"));
    }

    #[test]
    fn groups_by_library_types() {
        let (gems, people) = refs();
        let parse = |id: &str, library_type: &str| {
            parse_row(&row(id, library_type), &gems, &people, &EmptyEquivalents::default())
                .unwrap()
                .unwrap()
        };

        assert!(matches!(
            NewCdnaGroup::from_members(vec![parse("25C1", "Gene Expression")]),
            Some(NewCdnaGroup::Single(_))
        ));
        assert!(matches!(
            NewCdnaGroup::from_members(vec![
                parse("25C1", "Gene Expression"),
                parse("25C2", "Gene Expression"),
            ]),
            Some(NewCdnaGroup::OnChipMultiplexing(members)) if members.len() == 2
        ));
        let mixed = NewCdnaGroup::from_members(vec![
            parse("25C1", "Gene Expression"),
            parse("25C2", "VDJ-T"),
        ])
        .unwrap();
        assert!(matches!(mixed, NewCdnaGroup::Multiple(_)));
        assert_eq!(mixed.members().len(), 2);
        assert_eq!(NewCdnaGroup::from_members(Vec::new()), None);

        let single = NewCdnaGroup::from_members(vec![parse("25C1", "Gene Expression")]);
        let body = serde_json::to_value(single).unwrap();
        assert_eq!(body["single"]["readable_id"], json!("25C1"));
    }

    #[test]
    fn repeated_readable_ids_are_grouped_once() {
        let (gems, people) = refs();
        let empty = EmptyEquivalents::default();
        let parse = |id: &str, library_type: &str| {
            parse_row(&row(id, library_type), &gems, &people, &empty)
                .unwrap()
                .unwrap()
        };

        let mut groups = CdnaGroups::default();
        assert!(groups.insert("25G1", parse("25C1", "Gene Expression")));
        assert!(!groups.insert("25G1", parse("25C1", "VDJ-T")));
        assert!(groups.insert("25G1", parse("25C2", "Gene Expression")));

        let groups = groups.into_groups().collect::<Vec<_>>();
        assert_eq!(groups.len(), 1);
        let (label, group) = &groups[0];
        assert_eq!(label, "25G1");
        assert_matches!(group, NewCdnaGroup::OnChipMultiplexing(members) if members.len() == 2);
    }
}
