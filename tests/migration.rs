mod common;

use std::collections::BTreeSet;

use serde_json::{Value, json};

use populate_scamplers::app::{App, LogSink, RunOptions, StageStatus};
use populate_scamplers::cache::Cache;
use populate_scamplers::config::{LookupTables, Sources};
use populate_scamplers::domain::EntityKind;
use populate_scamplers::models::SkipReason;

use common::{MockTracking, Workspace};

const YALE_ID: &str = "0d4f3c1e-6f7a-4b7e-9d4a-2f1c3b5a6e70";

fn app(workspace: &Workspace, client: MockTracking) -> App<MockTracking> {
    App::new(
        client,
        Cache::new(workspace.cache_dir()),
        Sources::new(workspace.csv_dir()),
        LookupTables::default(),
    )
}

fn only(workspace: &Workspace, kinds: &[EntityKind]) -> RunOptions {
    RunOptions {
        skip: EntityKind::ALL
            .into_iter()
            .filter(|kind| !kinds.contains(kind))
            .collect::<BTreeSet<_>>(),
        submit: workspace.submit_options(),
    }
}

#[test]
fn new_institution_is_created_as_written() {
    let workspace = Workspace::new();
    workspace.write_csv("institutions.csv", &format!("ID,Name\n{YALE_ID},Yale University\n"));

    let app = app(&workspace, MockTracking::default());
    let report = app.run_stage(EntityKind::Institutions, &workspace.submit_options(), &LogSink);

    assert_eq!(report.status, StageStatus::Completed);
    assert_eq!(report.succeeded, 1);
    let cached = Cache::new(workspace.cache_dir())
        .read_all::<Value>(EntityKind::Institutions)
        .unwrap();
    assert_eq!(cached, vec![json!({"id": YALE_ID, "name": "Yale University"})]);
}

#[test]
fn existing_institution_is_not_resubmitted() {
    let workspace = Workspace::new();
    workspace.write_csv("institutions.csv", &format!("ID,Name\n{YALE_ID},Yale University\n"));

    let client = MockTracking::default().with_listing(
        "/institutions",
        vec![json!({"id": YALE_ID, "name": "Yale University"})],
    );
    let app = app(&workspace, client);
    let report = app.run_stage(EntityKind::Institutions, &workspace.submit_options(), &LogSink);

    assert_eq!(report.built, 0);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, SkipReason::AlreadyExists);
}

#[test]
fn people_are_placed_by_email_domain() {
    let workspace = Workspace::new();
    workspace.write_csv(
        "people.csv",
        "Name,Email\nA Person,a@yale.edu\nB Person,b@elsewhere.org\n",
    );
    let client = MockTracking::default().with_listing(
        "/institutions",
        vec![json!({"id": YALE_ID, "name": "Yale University"})],
    );

    let app = app(&workspace, client);
    let report = app.run_stage(EntityKind::People, &workspace.submit_options(), &LogSink);

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped.len(), 1);
    assert!(matches!(report.skipped[0].reason, SkipReason::Invalid(_)));

    let cached = Cache::new(workspace.cache_dir())
        .read_all::<Value>(EntityKind::People)
        .unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0]["email"], json!("a@yale.edu"));
    assert_eq!(cached[0]["institution_id"], json!(YALE_ID));
}

#[test]
fn existing_people_are_reported_by_their_key() {
    let workspace = Workspace::new();
    workspace.write_csv(
        "people.csv",
        "Name,Email\nA Person,A.Person@Yale.edu\nB Person,b@yale.edu\n",
    );
    let client = MockTracking::default()
        .with_listing(
            "/institutions",
            vec![json!({"id": YALE_ID, "name": "Yale University"})],
        )
        .with_listing(
            "/people",
            vec![json!({
                "id": "5e0b7a9c-3d2f-4c1a-8b6e-9f4d2a1c7e35",
                "name": "A Person",
                "email": "a.person@yale.edu"
            })],
        );

    let app = app(&workspace, client);
    let report = app.run_stage(EntityKind::People, &workspace.submit_options(), &LogSink);

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].label, "a.person@yale.edu");
    assert_eq!(report.skipped[0].reason, SkipReason::AlreadyExists);
    assert_eq!(report.failed.len(), 0);
}

#[test]
fn pool_stage_lists_pools_not_suspensions() {
    let workspace = Workspace::new();
    workspace.write_csv("suspension_pools.csv", "Readable ID,Name,Date Pooled\n");
    workspace.write_csv(
        "suspensions.csv",
        "Readable ID,Parent Specimen Readable ID,Pooled Into ID\n",
    );

    let app = app(&workspace, MockTracking::default());
    let report = app.run_stage(
        EntityKind::SuspensionPools,
        &workspace.submit_options(),
        &LogSink,
    );

    assert_eq!(report.status, StageStatus::Completed);
    let listed = app.client().listed_paths();
    assert_eq!(listed.iter().filter(|path| *path == "/suspension-pools").count(), 1);
    assert!(!listed.iter().any(|path| path == "/suspensions"));
}

#[test]
fn second_run_submits_nothing() {
    let workspace = Workspace::new();
    workspace.write_csv("institutions.csv", &format!("ID,Name\n{YALE_ID},Yale University\n"));
    workspace.write_csv("people.csv", "Name,Email\nA Person,a@yale.edu\n");
    workspace.write_csv("projects.csv", "Name\nAtlas\nAtlas\n");
    let kinds = [EntityKind::Institutions, EntityKind::People, EntityKind::Projects];

    // The listings never show what the first run created, so only the
    // cache keeps people and projects from being sent again.
    let listing = || {
        MockTracking::default().with_listing(
            "/institutions",
            vec![json!({"id": YALE_ID, "name": "Yale University"})],
        )
    };

    let first = app(&workspace, listing());
    let report = first.run(&only(&workspace, &kinds), &LogSink);
    let created = report
        .stages
        .iter()
        .map(|stage| stage.succeeded)
        .sum::<usize>();
    assert_eq!(created, 2);
    assert!(report.is_clean());

    let second = app(&workspace, listing());
    let report = second.run(&only(&workspace, &kinds), &LogSink);
    assert!(report.stages.iter().all(|stage| stage.built == 0));
    let reasons = report
        .stages
        .iter()
        .flat_map(|stage| stage.skipped.iter().map(|skipped| skipped.reason.clone()))
        .collect::<Vec<_>>();
    assert!(reasons.contains(&SkipReason::Cached));
}

#[test]
fn skipped_kinds_are_reported() {
    let workspace = Workspace::new();
    let app = app(&workspace, MockTracking::default());
    let report = app.run(&only(&workspace, &[]), &LogSink);
    assert!(
        report
            .stages
            .iter()
            .all(|stage| stage.status == StageStatus::SkippedByConfig)
    );
    assert!(report.is_clean());
}

#[test]
fn missing_exports_fail_only_their_stage() {
    let workspace = Workspace::new();
    workspace.write_csv("projects.csv", "Name\nAtlas\n");
    let app = app(&workspace, MockTracking::default());
    let report = app.run(
        &only(&workspace, &[EntityKind::Labs, EntityKind::Projects]),
        &LogSink,
    );

    let labs = report
        .stages
        .iter()
        .find(|stage| stage.kind == EntityKind::Labs)
        .unwrap();
    assert!(matches!(labs.status, StageStatus::Failed { .. }));
    let projects = report
        .stages
        .iter()
        .find(|stage| stage.kind == EntityKind::Projects)
        .unwrap();
    assert_eq!(projects.succeeded, 1);
}
