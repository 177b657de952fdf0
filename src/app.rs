use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::api::TrackingClient;
use crate::cache::Cache;
use crate::config::{LookupTables, Sources};
use crate::datasets::{self, CopyOutcome, DatasetDir};
use crate::domain::EntityKind;
use crate::error::PopulateError;
use crate::models::{
    Batch, Skipped, Stage, cdna, chromium_datasets, chromium_runs, institutions, labs,
    libraries, people, projects, sequencing_runs, specimen_measurements, specimens,
    suspension_pools, suspensions,
};
use crate::submit::{Outcome, SubmissionResult, SubmitOptions, submit_batch};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: Option<EntityKind>,
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.kind {
            Some(kind) => tracing::info!(%kind, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    SkippedByConfig,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRow {
    pub label: String,
    pub status: Option<u16>,
    pub message: String,
    pub artifact: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub kind: EntityKind,
    pub status: StageStatus,
    pub built: usize,
    pub skipped: Vec<Skipped>,
    pub succeeded: usize,
    pub dry_run: usize,
    pub failed: Vec<FailedRow>,
}

impl StageReport {
    fn empty(kind: EntityKind, status: StageStatus) -> Self {
        Self {
            kind,
            status,
            built: 0,
            skipped: Vec::new(),
            succeeded: 0,
            dry_run: 0,
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|stage| matches!(stage.status, StageStatus::Failed { .. }))
    }

    pub fn failed_rows(&self) -> usize {
        self.stages.iter().map(|stage| stage.failed.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_stages().next().is_none() && self.failed_rows() == 0
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub skip: BTreeSet<EntityKind>,
    pub submit: SubmitOptions,
}

pub struct App<C: TrackingClient> {
    client: C,
    cache: Cache,
    sources: Sources,
    tables: LookupTables,
}

impl<C: TrackingClient> App<C> {
    pub fn new(client: C, cache: Cache, sources: Sources, tables: LookupTables) -> Self {
        Self {
            client,
            cache,
            sources,
            tables,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Runs every stage in dependency order. A stage that cannot be built
    /// is reported and the remaining stages still run.
    pub fn run(&self, options: &RunOptions, sink: &dyn ProgressSink) -> RunReport {
        let mut report = RunReport::default();
        for kind in EntityKind::ALL {
            if options.skip.contains(&kind) {
                sink.event(ProgressEvent {
                    kind: Some(kind),
                    message: "skipped by configuration".to_string(),
                });
                report
                    .stages
                    .push(StageReport::empty(kind, StageStatus::SkippedByConfig));
                continue;
            }
            report.stages.push(self.run_stage(kind, &options.submit, sink));
        }
        report
    }

    pub fn run_stage(
        &self,
        kind: EntityKind,
        options: &SubmitOptions,
        sink: &dyn ProgressSink,
    ) -> StageReport {
        sink.event(ProgressEvent {
            kind: Some(kind),
            message: "building requests".to_string(),
        });
        let batch = match self.build(kind) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(%kind, error = %err, "stage failed");
                return StageReport::empty(
                    kind,
                    StageStatus::Failed {
                        error: err.to_string(),
                    },
                );
            }
        };

        let Batch {
            submissions,
            skipped,
            ..
        } = batch;
        let built = submissions.len();
        sink.event(ProgressEvent {
            kind: Some(kind),
            message: format!("submitting {built} requests ({} rows skipped)", skipped.len()),
        });
        let results = submit_batch(&self.client, submissions, options);
        self.remember(kind, &results);

        let mut report = StageReport::empty(kind, StageStatus::Completed);
        report.built = built;
        report.skipped = skipped;
        for result in results {
            match result.outcome {
                Outcome::Created { .. } => report.succeeded += 1,
                Outcome::DryRun => report.dry_run += 1,
                Outcome::Failed { failure, artifact } => report.failed.push(FailedRow {
                    label: result.label,
                    status: failure.status,
                    message: failure.to_string(),
                    artifact,
                }),
            }
        }
        sink.event(ProgressEvent {
            kind: Some(kind),
            message: format!(
                "{} created, {} failed",
                report.succeeded,
                report.failed.len()
            ),
        });
        report
    }

    fn build(&self, kind: EntityKind) -> Result<Batch, PopulateError> {
        let stage = Stage {
            client: &self.client,
            cache: &self.cache,
            sources: &self.sources,
            tables: &self.tables,
        };
        match kind {
            EntityKind::Institutions => institutions::build(&stage),
            EntityKind::People => people::build(&stage),
            EntityKind::Labs => labs::build(&stage),
            EntityKind::Projects => projects::build(&stage),
            EntityKind::Specimens => specimens::build(&stage),
            EntityKind::SpecimenMeasurements => specimen_measurements::build(&stage),
            EntityKind::Suspensions => suspensions::build(&stage),
            EntityKind::SuspensionPools => suspension_pools::build(&stage),
            EntityKind::ChromiumRuns => chromium_runs::build(&stage),
            EntityKind::Cdna => cdna::build(&stage),
            EntityKind::Libraries => libraries::build(&stage),
            EntityKind::SequencingRuns => sequencing_runs::build(&stage),
            EntityKind::ChromiumDatasets => chromium_datasets::build(&stage),
        }
    }

    /// Caches the request body of every creation under its server ID.
    fn remember(&self, kind: EntityKind, results: &[SubmissionResult]) {
        if !kind.is_cached() {
            return;
        }
        for result in results {
            let Outcome::Created { id, .. } = &result.outcome else {
                continue;
            };
            let Some(id) = id else {
                tracing::warn!(%kind, label = %result.label, "response carries no ID, not cached");
                continue;
            };
            if let Err(err) = self.cache.write(kind, id, &result.request.body) {
                tracing::error!(
                    %kind,
                    label = %result.label,
                    error = %err,
                    "failed to cache creation"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CopyResult {
    Copied { source: Utf8PathBuf, destination: Utf8PathBuf },
    AlreadyCopied { source: Utf8PathBuf, destination: Utf8PathBuf },
    Failed { source: Utf8PathBuf, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CopyReport {
    pub datasets: Vec<CopyResult>,
}

impl CopyReport {
    pub fn failures(&self) -> usize {
        self.datasets
            .iter()
            .filter(|result| matches!(result, CopyResult::Failed { .. }))
            .count()
    }
}

/// Copies the slim outputs of every dataset. One broken dataset does not
/// stop the others.
pub fn copy_datasets(
    destination: &Utf8Path,
    sources: &[Utf8PathBuf],
    sink: &dyn ProgressSink,
) -> CopyReport {
    let mut report = CopyReport::default();
    for source in sources {
        let result = DatasetDir::open(source)
            .and_then(|dataset| datasets::copy_dataset(&dataset, destination));
        let result = match result {
            Ok(CopyOutcome::Copied(destination)) => CopyResult::Copied {
                source: source.clone(),
                destination,
            },
            Ok(CopyOutcome::AlreadyCopied(destination)) => CopyResult::AlreadyCopied {
                source: source.clone(),
                destination,
            },
            Err(err) => {
                tracing::error!(%source, error = %err, "failed to copy dataset");
                CopyResult::Failed {
                    source: source.clone(),
                    error: err.to_string(),
                }
            }
        };
        sink.event(ProgressEvent {
            kind: Some(EntityKind::ChromiumDatasets),
            message: format!("{source}: {}", copy_label(&result)),
        });
        report.datasets.push(result);
    }
    report
}

fn copy_label(result: &CopyResult) -> &'static str {
    match result {
        CopyResult::Copied { .. } => "copied",
        CopyResult::AlreadyCopied { .. } => "already copied",
        CopyResult::Failed { .. } => "failed",
    }
}
