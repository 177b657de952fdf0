use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::api::TrackingClient;
use crate::error::{PopulateError, RowError};
use crate::models::specimens::SpecimenMeasurement;

/// Natural key → server ID, built once per stage from a remote listing.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    map: HashMap<String, Uuid>,
    case_insensitive: bool,
}

impl IdMap {
    /// Fails when two records share a key.
    pub fn build(
        property: &str,
        pairs: impl IntoIterator<Item = (String, Uuid)>,
    ) -> Result<Self, PopulateError> {
        let mut map = HashMap::new();
        for (key, id) in pairs {
            if map.insert(key.clone(), id).is_some() {
                return Err(PopulateError::DuplicateKey {
                    property: property.to_string(),
                    value: key,
                });
            }
        }
        Ok(Self {
            map,
            case_insensitive: false,
        })
    }

    /// Also answers lookups whose case differs from the stored key.
    pub fn case_insensitive(mut self) -> Self {
        let lowered = self
            .map
            .iter()
            .map(|(key, id)| (key.to_lowercase(), *id))
            .collect::<Vec<_>>();
        for (key, id) in lowered {
            self.map.entry(key).or_insert(id);
        }
        self.case_insensitive = true;
        self
    }

    pub fn get(&self, key: &str) -> Option<Uuid> {
        let key = key.trim();
        self.map.get(key).copied().or_else(|| {
            self.case_insensitive
                .then(|| self.map.get(&key.to_lowercase()).copied())
                .flatten()
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn resolve(&self, what: &'static str, key: &str) -> Result<Uuid, RowError> {
        self.get(key).ok_or_else(|| RowError::unresolved(what, key))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstitutionRecord {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Any record with a human-chosen unique name (labs, projects).
#[derive(Debug, Clone, Deserialize)]
pub struct NamedRecord {
    pub id: Uuid,
    pub name: String,
}

/// Any record identified by a readable ID (suspensions, pools, cDNA, libraries).
#[derive(Debug, Clone, Deserialize)]
pub struct ReadableRecord {
    pub id: Uuid,
    pub readable_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpecimenRecord {
    pub id: Uuid,
    pub readable_id: String,
    pub received_at: DateTime<Utc>,
    #[serde(deserialize_with = "id_or_record")]
    pub submitted_by: Uuid,
    #[serde(default)]
    pub measurements: Vec<SpecimenMeasurement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiplexingTagRecord {
    pub id: Uuid,
    pub tag_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumRunRecord {
    pub id: Uuid,
    pub readable_id: String,
    #[serde(default)]
    pub gems: Vec<ReadableRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequencingRunRecord {
    pub id: Uuid,
    pub readable_id: String,
    pub begun_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRecord {
    pub id: Uuid,
    pub data_path: String,
}

/// Accepts a bare UUID or an embedded record carrying one.
fn id_or_record<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Reference {
        Id(Uuid),
        Record {
            #[serde(alias = "id_")]
            id: Uuid,
        },
    }
    Ok(match Reference::deserialize(deserializer)? {
        Reference::Id(id) | Reference::Record { id } => id,
    })
}

/// Lists several collections at once and waits for all of them.
pub fn fetch_all<C: TrackingClient, const N: usize>(
    client: &C,
    paths: [&str; N],
) -> Result<[Vec<Value>; N], PopulateError> {
    let listings = paths
        .par_iter()
        .map(|path| client.list(path))
        .collect::<Result<Vec<_>, _>>()?;
    listings
        .try_into()
        .map_err(|_| PopulateError::ApiDecode("incomplete reference listing".to_string()))
}

/// Lists one collection as typed records.
pub fn list<T: DeserializeOwned, C: TrackingClient>(
    client: &C,
    path: &str,
) -> Result<Vec<T>, PopulateError> {
    decode(path, client.list(path)?)
}

/// Decodes a listing. Records nested as `{info: {id_, summary: {...}}}` or
/// `{summary: {...}}` are flattened first, so every record type reads its
/// fields from the top level.
pub fn decode<T: DeserializeOwned>(
    path: &str,
    values: Vec<Value>,
) -> Result<Vec<T>, PopulateError> {
    values
        .into_iter()
        .map(|value| {
            serde_json::from_value(flatten_record(value))
                .map_err(|err| PopulateError::ApiDecode(format!("{path}: {err}")))
        })
        .collect()
}

fn flatten_record(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    for key in ["info", "summary"] {
        if let Some(Value::Object(inner)) = map.remove(key) {
            let Value::Object(inner) = flatten_record(Value::Object(inner)) else {
                continue;
            };
            for (field, value) in inner {
                let field = if field == "id_" { "id".to_string() } else { field };
                map.entry(field).or_insert(value);
            }
        }
    }
    if let Some(id) = map.remove("id_") {
        map.entry("id").or_insert(id);
    }
    Value::Object(map)
}

/// Specimens keyed by readable ID, keeping the whole record for its
/// submitter, receipt date and measurements.
pub fn specimens_by_readable_id(
    specimens: Vec<SpecimenRecord>,
) -> Result<HashMap<String, SpecimenRecord>, PopulateError> {
    let mut map = HashMap::new();
    for specimen in specimens {
        if let Some(previous) = map.insert(specimen.readable_id.clone(), specimen) {
            return Err(PopulateError::DuplicateKey {
                property: "specimen readable ID".to_string(),
                value: previous.readable_id,
            });
        }
    }
    Ok(map)
}

pub fn people_by_email(people: &[PersonRecord]) -> Result<IdMap, PopulateError> {
    IdMap::build(
        "person email",
        people
            .iter()
            .filter_map(|person| person.email.as_ref().map(|email| (email.clone(), person.id))),
    )
    .map(IdMap::case_insensitive)
}

/// Names are not unique across the whole directory; only names carried by
/// exactly one person resolve.
pub fn people_by_unambiguous_name(people: &[PersonRecord]) -> IdMap {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for person in people {
        *counts.entry(person.name.as_str()).or_default() += 1;
    }
    let unique = people
        .iter()
        .filter(|person| counts.get(person.name.as_str()) == Some(&1))
        .map(|person| (person.name.clone(), person.id));
    IdMap::build("person name", unique).unwrap_or_default()
}

pub fn by_name(property: &str, records: &[NamedRecord]) -> Result<IdMap, PopulateError> {
    IdMap::build(
        property,
        records.iter().map(|record| (record.name.clone(), record.id)),
    )
    .map(IdMap::case_insensitive)
}

pub fn by_readable_id(property: &str, records: &[ReadableRecord]) -> Result<IdMap, PopulateError> {
    IdMap::build(
        property,
        records
            .iter()
            .map(|record| (record.readable_id.clone(), record.id)),
    )
}

/// Email domain → institution, through the configured name → domain table.
/// Institutions missing from the table cannot be reached by email.
pub fn institutions_by_domain(
    institutions: &[InstitutionRecord],
    domains: &BTreeMap<String, String>,
) -> Result<IdMap, PopulateError> {
    let pairs = institutions
        .iter()
        .filter_map(|institution| match domains.get(&institution.name) {
            Some(domain) => Some((domain.to_lowercase(), institution.id)),
            None => {
                tracing::debug!(institution = %institution.name, "no email domain configured");
                None
            }
        });
    IdMap::build("institution email domain", pairs).map(IdMap::case_insensitive)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn person(name: &str, email: &str) -> PersonRecord {
        PersonRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: Some(email.to_string()),
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let id = Uuid::new_v4();
        let err = IdMap::build("lab name", [("a".to_string(), id), ("a".to_string(), id)])
            .unwrap_err();
        assert_matches!(err, PopulateError::DuplicateKey { .. });
    }

    #[test]
    fn email_lookup_ignores_case() {
        let people = vec![person("Ada", "Ada.Lovelace@Yale.edu")];
        let map = people_by_email(&people).unwrap();
        assert_eq!(map.get("ada.lovelace@yale.edu"), Some(people[0].id));
        assert_eq!(map.get("Ada.Lovelace@Yale.edu"), Some(people[0].id));
    }

    #[test]
    fn ambiguous_names_do_not_resolve() {
        let people = vec![
            person("Sam Lee", "sam1@yale.edu"),
            person("Sam Lee", "sam2@yale.edu"),
            person("Kim Park", "kim@yale.edu"),
        ];
        let map = people_by_unambiguous_name(&people);
        assert!(!map.contains("Sam Lee"));
        assert_eq!(map.get("Kim Park"), Some(people[2].id));
    }

    #[test]
    fn nested_listings_are_flattened() {
        let id = Uuid::new_v4();
        let values = vec![serde_json::json!({
            "info": {"id_": id, "summary": {"readable_id": "SP1"}},
            "measurements": []
        })];
        let records: Vec<ReadableRecord> = decode("/specimens", values).unwrap();
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].readable_id, "SP1");
    }

    #[test]
    fn domains_follow_table() {
        let yale = InstitutionRecord {
            id: Uuid::new_v4(),
            name: "Yale University".to_string(),
        };
        let other = InstitutionRecord {
            id: Uuid::new_v4(),
            name: "Somewhere Else".to_string(),
        };
        let table = BTreeMap::from([("Yale University".to_string(), "yale.edu".to_string())]);
        let map = institutions_by_domain(&[yale.clone(), other], &table).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("yale.edu"), Some(yale.id));
    }

    struct PathEcho;

    impl TrackingClient for PathEcho {
        fn list(&self, path: &str) -> Result<Vec<Value>, PopulateError> {
            match path {
                "/broken" => Err(PopulateError::ApiHttp("connection reset".to_string())),
                path => Ok(vec![Value::from(path)]),
            }
        }

        fn send(&self, _request: &crate::api::ApiRequest) -> Result<Value, crate::api::ApiFailure> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn listings_come_back_in_request_order() {
        let [labs, people, projects] = fetch_all(&PathEcho, ["/labs", "/people", "/projects"])
            .unwrap();
        assert_eq!(labs, vec![Value::from("/labs")]);
        assert_eq!(people, vec![Value::from("/people")]);
        assert_eq!(projects, vec![Value::from("/projects")]);
    }

    #[test]
    fn one_failed_listing_fails_the_lookup() {
        let err = fetch_all(&PathEcho, ["/labs", "/broken"]).unwrap_err();
        assert_matches!(err, PopulateError::ApiHttp(_));
    }
}
