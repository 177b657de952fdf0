use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;

use crate::api::{ApiFailure, ApiRequest, TrackingClient, response_id};
use crate::cache::write_new_file;
use crate::domain::EntityKind;
use crate::error::PopulateError;

/// One request ready to be sent, labelled with the natural key of the row it
/// came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub kind: EntityKind,
    pub label: String,
    pub request: ApiRequest,
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub dry_run: bool,
    pub print_requests: bool,
    pub save_requests: Option<Utf8PathBuf>,
    pub print_responses: bool,
    pub save_responses: Option<Utf8PathBuf>,
    pub error_dir: Utf8PathBuf,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Created {
        id: Option<String>,
        response: Value,
    },
    DryRun,
    Failed {
        failure: ApiFailure,
        artifact: Option<Utf8PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResult {
    pub label: String,
    pub request: ApiRequest,
    pub outcome: Outcome,
}

impl SubmissionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Outcome::Created { .. })
    }
}

#[derive(Debug, Serialize)]
struct ErrorArtifact<'a> {
    request: &'a ApiRequest,
    status: Option<u16>,
    headers: &'a std::collections::BTreeMap<String, String>,
    response: &'a Value,
}

/// A directory of numbered JSON files, `<root>/<kind>/<label>/<n>.json`.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: Utf8PathBuf,
}

impl ArtifactDir {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn label_dir(&self, kind: EntityKind, label: &str) -> Utf8PathBuf {
        self.root.join(kind.as_str()).join(sanitize_label(label))
    }

    /// Writes under the first unused counter.
    pub fn write<T: Serialize>(
        &self,
        kind: EntityKind,
        label: &str,
        data: &T,
    ) -> Result<Utf8PathBuf, PopulateError> {
        let dir = self.label_dir(kind, label);
        let content = serde_json::to_vec_pretty(data)
            .map_err(|err| PopulateError::Filesystem(err.to_string()))?;
        let mut counter = 0usize;
        loop {
            let path = dir.join(format!("{counter}.json"));
            if path.as_std_path().exists() {
                counter += 1;
                continue;
            }
            match write_new_file(&path, &content) {
                Ok(()) => return Ok(path),
                Err(PopulateError::CacheEntryExists(_)) => counter += 1,
                Err(err) => return Err(err),
            }
        }
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned = label
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect::<String>();
    match cleaned.as_str() {
        "" | "." | ".." => "unlabelled".to_string(),
        _ => cleaned,
    }
}

/// Sends every submission concurrently and waits for all of them. One
/// failure never stops the others; results keep the input order.
pub fn submit_batch<C: TrackingClient>(
    client: &C,
    submissions: Vec<Submission>,
    options: &SubmitOptions,
) -> Vec<SubmissionResult> {
    if submissions.is_empty() {
        return Vec::new();
    }
    let workers = options.max_concurrency.clamp(1, submissions.len());
    let send_all = || {
        submissions
            .par_iter()
            .map(|submission| submit_one(client, submission, options))
            .collect::<Vec<_>>()
    };
    match ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(send_all),
        Err(err) => {
            tracing::warn!(error = %err, workers, "falling back to the global thread pool");
            send_all()
        }
    }
}

fn submit_one<C: TrackingClient>(
    client: &C,
    submission: &Submission,
    options: &SubmitOptions,
) -> SubmissionResult {
    let Submission {
        kind,
        label,
        request,
    } = submission;

    if options.print_requests {
        print_json(&format!("{kind} {label} request"), request);
    }
    if let Some(dir) = &options.save_requests {
        save_json(dir, *kind, label, request);
    }

    if options.dry_run {
        tracing::debug!(%kind, %label, method = %request.method, path = %request.path, "dry run");
        return SubmissionResult {
            label: label.clone(),
            request: request.clone(),
            outcome: Outcome::DryRun,
        };
    }

    let outcome = match client.send(request) {
        Ok(response) => {
            tracing::debug!(%kind, %label, "created");
            if options.print_responses {
                print_json(&format!("{kind} {label} response"), &response);
            }
            if let Some(dir) = &options.save_responses {
                save_json(dir, *kind, label, &response);
            }
            Outcome::Created {
                id: response_id(&response),
                response,
            }
        }
        Err(failure) => {
            tracing::error!(%kind, %label, %failure, "submission failed");
            let artifact = ErrorArtifact {
                request,
                status: failure.status,
                headers: &failure.headers,
                response: &failure.response,
            };
            let artifact = match ArtifactDir::new(options.error_dir.clone()).write(
                *kind,
                label,
                &artifact,
            ) {
                Ok(path) => Some(path),
                Err(err) => {
                    tracing::error!(%kind, %label, error = %err, "failed to record error artifact");
                    None
                }
            };
            Outcome::Failed { failure, artifact }
        }
    };

    SubmissionResult {
        label: label.clone(),
        request: request.clone(),
        outcome,
    }
}

fn print_json<T: Serialize>(title: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => eprintln!("# {title}\n{json}"),
        Err(err) => tracing::warn!(error = %err, "failed to render {title}"),
    }
}

fn save_json<T: Serialize>(dir: &Utf8Path, kind: EntityKind, label: &str, value: &T) {
    if let Err(err) = fs::create_dir_all(dir.as_std_path())
        .map_err(|err| PopulateError::Filesystem(err.to_string()))
        .and_then(|_| ArtifactDir::new(dir.to_owned()).write(kind, label, value))
    {
        tracing::warn!(%kind, %label, error = %err, "failed to save JSON");
    }
}
