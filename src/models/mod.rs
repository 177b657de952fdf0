//! Row → request mapping, one module per record type.
//!
//! Every module exposes a `build` function that reads its spreadsheet(s),
//! fetches the reference data it needs, and returns the requests that are
//! neither cached nor already present in scamplers.

pub mod cdna;
pub mod chromium_datasets;
pub mod chromium_runs;
pub mod common;
pub mod institutions;
pub mod labs;
pub mod libraries;
pub mod people;
pub mod projects;
pub mod sequencing_runs;
pub mod specimen_measurements;
pub mod specimens;
pub mod suspension_pools;
pub mod suspensions;

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::api::{ApiRequest, TrackingClient};
use crate::cache::Cache;
use crate::config::{LookupTables, Sources};
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::submit::Submission;
use crate::table::Row;

/// Groups rows by the value of `field`, keeping first-seen order. Rows with
/// a blank key are left out.
pub fn group_rows<'a>(
    rows: impl IntoIterator<Item = &'a Row>,
    field: &str,
) -> Vec<(String, Vec<&'a Row>)> {
    let mut groups: Vec<(String, Vec<&Row>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let Some(key) = row.get(field) else {
            continue;
        };
        match index.get(key) {
            Some(&position) => groups[position].1.push(row),
            None => {
                index.insert(key.to_string(), groups.len());
                groups.push((key.to_string(), vec![row]));
            }
        }
    }
    groups
}

/// Everything a stage may read: the API, the local cache and the inputs.
pub struct Stage<'a, C: TrackingClient> {
    pub client: &'a C,
    pub cache: &'a Cache,
    pub sources: &'a Sources,
    pub tables: &'a LookupTables,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyExists,
    Cached,
    DuplicateInBatch,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub label: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Natural keys already taken care of, remotely or by an earlier run.
#[derive(Debug, Default)]
pub struct Known {
    remote: HashSet<String>,
    cached: HashSet<String>,
    case_insensitive: bool,
}

impl Known {
    pub fn new(
        remote: impl IntoIterator<Item = String>,
        cached: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            remote: remote.into_iter().collect(),
            cached: cached.into_iter().collect(),
            case_insensitive: false,
        }
    }

    pub fn case_insensitive(self) -> Self {
        Self {
            remote: self.remote.iter().map(|key| key.to_lowercase()).collect(),
            cached: self.cached.iter().map(|key| key.to_lowercase()).collect(),
            case_insensitive: true,
        }
    }

    pub fn check(&self, key: &str) -> Option<SkipReason> {
        let key = if self.case_insensitive {
            key.to_lowercase()
        } else {
            key.to_string()
        };
        if self.remote.contains(&key) {
            Some(SkipReason::AlreadyExists)
        } else if self.cached.contains(&key) {
            Some(SkipReason::Cached)
        } else {
            None
        }
    }
}

/// The requests of one stage plus every row that was deliberately left out.
#[derive(Debug)]
pub struct Batch {
    kind: EntityKind,
    pub submissions: Vec<Submission>,
    pub skipped: Vec<Skipped>,
    seen: HashSet<String>,
}

impl Batch {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            submissions: Vec::new(),
            skipped: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Queues a request unless another one with the same natural key already
    /// is.
    pub fn push<T: Serialize>(
        &mut self,
        key: &str,
        request: impl FnOnce(serde_json::Value) -> ApiRequest,
        payload: &T,
    ) -> Result<(), PopulateError> {
        if !self.seen.insert(key.to_string()) {
            self.skip(key, SkipReason::DuplicateInBatch);
            return Ok(());
        }
        let body = serde_json::to_value(payload)
            .map_err(|err| PopulateError::ApiDecode(err.to_string()))?;
        self.submissions.push(Submission {
            kind: self.kind,
            label: key.to_string(),
            request: request(body),
        });
        Ok(())
    }

    /// Queues a POST to the stage's collection endpoint.
    pub fn create<T: Serialize>(&mut self, key: &str, payload: &T) -> Result<(), PopulateError> {
        let endpoint = self.kind.endpoint();
        self.push(key, |body| ApiRequest::post(endpoint, body), payload)
    }

    /// Queues a creation unless `known` already accounts for the key.
    pub fn create_new<T: Serialize>(
        &mut self,
        key: &str,
        known: &Known,
        payload: &T,
    ) -> Result<(), PopulateError> {
        match known.check(key) {
            Some(reason) => {
                self.skip(key, reason);
                Ok(())
            }
            None => self.create(key, payload),
        }
    }

    pub fn skip(&mut self, label: &str, reason: SkipReason) {
        match &reason {
            SkipReason::AlreadyExists | SkipReason::Cached => {
                tracing::debug!(kind = %self.kind, %label, ?reason, "skipping row");
            }
            SkipReason::DuplicateInBatch => {
                tracing::warn!(kind = %self.kind, %label, "duplicate natural key in batch");
            }
            SkipReason::Invalid(message) => {
                tracing::warn!(kind = %self.kind, %label, %message, "skipping invalid row");
            }
        }
        self.skipped.push(Skipped {
            label: label.to_string(),
            reason,
        });
    }

    pub fn reject(&mut self, label: &str, error: RowError) {
        self.skip(label, SkipReason::Invalid(error.to_string()));
    }
}
