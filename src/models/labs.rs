use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, IdMap, NamedRecord, PersonRecord};
use crate::table::{EmptyEquivalents, Row};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLab {
    pub name: String,
    pub pi_id: Uuid,
    pub delivery_dir: String,
}

const REQUIRED: [&str; 3] = ["name", "pi_email", "delivery_dir"];

pub fn parse_row(
    row: &Row,
    people_by_email: &IdMap,
    empty: &EmptyEquivalents,
) -> Result<Option<NewLab>, RowError> {
    if row.is_empty(&REQUIRED, empty) {
        return Ok(None);
    }
    Ok(Some(NewLab {
        name: row.require("name")?.to_string(),
        pi_id: people_by_email.resolve("person", row.require("pi_email")?)?,
        delivery_dir: row.require("delivery_dir")?.to_string(),
    }))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::Labs;
    let rows = stage.sources.read(CsvFile::Labs)?;
    let empty = stage.sources.empty_equivalents(CsvFile::Labs);

    let paths = [EntityKind::People.endpoint(), kind.endpoint()];
    let [people, labs] = resolve::fetch_all(stage.client, paths)?;
    let people = resolve::people_by_email(&resolve::decode::<PersonRecord>(paths[0], people)?)?;
    let labs = resolve::decode::<NamedRecord>(paths[1], labs)?;

    let known = Known::new(
        labs.into_iter().map(|lab| lab.name),
        stage
            .cache
            .read_all::<NewLab>(kind)?
            .into_iter()
            .map(|lab| lab.name),
    )
    .case_insensitive();

    let mut batch = Batch::new(kind);
    for row in &rows {
        match parse_row(row, &people, &empty) {
            Ok(Some(lab)) => batch.create_new(&lab.name, &known, &lab)?,
            Ok(None) => {}
            Err(err) => batch.reject(&row.label(), err),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pi_is_resolved_by_email() {
        let pi = Uuid::new_v4();
        let people = IdMap::build("person email", [("Pi@Yale.edu".to_string(), pi)])
            .unwrap()
            .case_insensitive();
        let row = Row::from_pairs([
            ("name", "Smith Lab"),
            ("pi_email", "pi@yale.edu"),
            ("delivery_dir", "smith"),
        ]);
        let lab = parse_row(&row, &people, &EmptyEquivalents::default())
            .unwrap()
            .unwrap();
        assert_eq!(lab.pi_id, pi);
        assert_eq!(lab.delivery_dir, "smith");
    }

    #[test]
    fn unknown_pi_is_an_error() {
        let row = Row::from_pairs([
            ("name", "Smith Lab"),
            ("pi_email", "nobody@yale.edu"),
            ("delivery_dir", "smith"),
        ]);
        let err = parse_row(&row, &IdMap::default(), &EmptyEquivalents::default()).unwrap_err();
        assert!(matches!(err, RowError::UnresolvedReference { .. }));
    }

    #[test]
    fn partially_empty_rows_are_skipped() {
        let row = Row::from_pairs([("name", "Smith Lab"), ("pi_email", ""), ("delivery_dir", "")]);
        assert_eq!(
            parse_row(&row, &IdMap::default(), &EmptyEquivalents::default()).unwrap(),
            None
        );
    }
}
