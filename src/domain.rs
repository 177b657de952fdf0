use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PopulateError;

/// The record types migrated into scamplers, declared in dependency order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Institutions,
    People,
    Labs,
    Projects,
    Specimens,
    SpecimenMeasurements,
    Suspensions,
    SuspensionPools,
    ChromiumRuns,
    Cdna,
    Libraries,
    SequencingRuns,
    ChromiumDatasets,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Institutions,
        EntityKind::People,
        EntityKind::Labs,
        EntityKind::Projects,
        EntityKind::Specimens,
        EntityKind::SpecimenMeasurements,
        EntityKind::Suspensions,
        EntityKind::SuspensionPools,
        EntityKind::ChromiumRuns,
        EntityKind::Cdna,
        EntityKind::Libraries,
        EntityKind::SequencingRuns,
        EntityKind::ChromiumDatasets,
    ];

    /// Name used for cache and error-artifact subdirectories.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Institutions => "institutions",
            EntityKind::People => "people",
            EntityKind::Labs => "labs",
            EntityKind::Projects => "projects",
            EntityKind::Specimens => "specimens",
            EntityKind::SpecimenMeasurements => "specimen_measurements",
            EntityKind::Suspensions => "suspensions",
            EntityKind::SuspensionPools => "suspension_pools",
            EntityKind::ChromiumRuns => "chromium_runs",
            EntityKind::Cdna => "cdna",
            EntityKind::Libraries => "libraries",
            EntityKind::SequencingRuns => "sequencing_runs",
            EntityKind::ChromiumDatasets => "chromium_datasets",
        }
    }

    /// Collection endpoint relative to the API base URL.
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Institutions => "/institutions",
            EntityKind::People => "/people",
            EntityKind::Labs => "/labs",
            EntityKind::Projects => "/projects",
            EntityKind::Specimens | EntityKind::SpecimenMeasurements => "/specimens",
            EntityKind::Suspensions => "/suspensions",
            EntityKind::SuspensionPools => "/suspension-pools",
            EntityKind::ChromiumRuns => "/chromium-runs",
            EntityKind::Cdna => "/cdna",
            EntityKind::Libraries => "/libraries",
            EntityKind::SequencingRuns => "/sequencing-runs",
            EntityKind::ChromiumDatasets => "/chromium-datasets",
        }
    }

    /// Whether successful submissions of this kind are remembered in the local cache.
    pub fn is_cached(&self) -> bool {
        !matches!(self, EntityKind::SpecimenMeasurements)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = PopulateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| PopulateError::InvalidKind(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn kinds_are_in_dependency_order() {
        let mut sorted = EntityKind::ALL;
        sorted.sort();
        assert_eq!(sorted, EntityKind::ALL);
        assert!(EntityKind::Institutions < EntityKind::People);
        assert!(EntityKind::Libraries < EntityKind::SequencingRuns);
    }

    #[test]
    fn parse_kind_accepts_kebab_and_snake() {
        let kind: EntityKind = "suspension-pools".parse().unwrap();
        assert_eq!(kind, EntityKind::SuspensionPools);
        let kind: EntityKind = "Chromium_Runs".parse().unwrap();
        assert_eq!(kind, EntityKind::ChromiumRuns);
    }

    #[test]
    fn parse_kind_invalid() {
        let err = "gems".parse::<EntityKind>().unwrap_err();
        assert_matches!(err, PopulateError::InvalidKind(_));
    }
}
