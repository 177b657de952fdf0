use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::config::CsvFile;
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, IdMap, InstitutionRecord, PersonRecord};
use crate::table::Row;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPerson {
    pub name: String,
    pub email: String,
    pub institution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms_user_id: Option<Uuid>,
}

/// The part of an address after the last `@`.
pub fn email_domain(email: &str) -> &str {
    email.rsplit('@').next().unwrap_or(email)
}

/// Maps a people row. Rows without an email are not people records yet and
/// yield nothing.
pub fn parse_row(row: &Row, domains: &IdMap) -> Result<Option<NewPerson>, RowError> {
    if row.has("email_domain") {
        return Err(RowError::Inconsistent(
            "`email_domain` is derived from `email` and must not be a column".to_string(),
        ));
    }
    let Some(email) = row.get("email") else {
        return Ok(None);
    };
    let domain = email_domain(email);
    Ok(Some(NewPerson {
        name: row.require("name")?.to_string(),
        email: email.to_string(),
        institution_id: domains.resolve("institution for email domain", domain)?,
        ms_user_id: row.uuid("ms_user_id")?,
    }))
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::People;
    let rows = stage.sources.read(CsvFile::People)?;

    let paths = [EntityKind::Institutions.endpoint(), kind.endpoint()];
    let [institutions, people] = resolve::fetch_all(stage.client, paths)?;
    let institutions = resolve::decode::<InstitutionRecord>(paths[0], institutions)?;
    let people = resolve::decode::<PersonRecord>(paths[1], people)?;

    let domains =
        resolve::institutions_by_domain(&institutions, &stage.tables.institution_domains)?;
    let known = Known::new(
        people.into_iter().filter_map(|person| person.email),
        stage
            .cache
            .read_all::<NewPerson>(kind)?
            .into_iter()
            .map(|person| person.email),
    )
    .case_insensitive();

    let mut batch = Batch::new(kind);
    for row in &rows {
        match parse_row(row, &domains) {
            Ok(None) => {}
            Ok(Some(person)) => {
                let key = person.email.to_lowercase();
                batch.create_new(&key, &known, &person)?;
            }
            Err(err) => batch.reject(&row.label(), err),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn yale() -> (Uuid, IdMap) {
        let id = Uuid::new_v4();
        let institutions = vec![InstitutionRecord {
            id,
            name: "Yale University".to_string(),
        }];
        let table = BTreeMap::from([("Yale University".to_string(), "yale.edu".to_string())]);
        (id, resolve::institutions_by_domain(&institutions, &table).unwrap())
    }

    #[test]
    fn institution_follows_email_domain() {
        let (yale_id, domains) = yale();
        let row = Row::from_pairs([
            ("name", "A Person"),
            ("email", "a@yale.edu"),
            ("ms_user_id", ""),
        ]);
        let person = parse_row(&row, &domains).unwrap().unwrap();
        assert_eq!(person.institution_id, yale_id);
        assert_eq!(person.ms_user_id, None);
    }

    #[test]
    fn unknown_domain_is_unresolved() {
        let (_, domains) = yale();
        let row = Row::from_pairs([("name", "B Person"), ("email", "b@elsewhere.org")]);
        let err = parse_row(&row, &domains).unwrap_err();
        assert!(matches!(
            err,
            RowError::UnresolvedReference { ref key, .. } if key == "elsewhere.org"
        ));
    }

    #[test]
    fn email_domain_column_is_rejected() {
        let (_, domains) = yale();
        let row = Row::from_pairs([
            ("name", "A Person"),
            ("email", "a@yale.edu"),
            ("email_domain", "yale.edu"),
        ]);
        assert!(matches!(parse_row(&row, &domains), Err(RowError::Inconsistent(_))));
    }

    #[test]
    fn rows_without_email_are_skipped() {
        let (_, domains) = yale();
        let row = Row::from_pairs([("name", "No Email"), ("email", "")]);
        assert_eq!(parse_row(&row, &domains).unwrap(), None);
    }
}
