use std::collections::BTreeSet;
use std::path::PathBuf;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use populate_scamplers::config::{ConfigLoader, DEFAULT_MAX_CONCURRENCY, Overrides};
use populate_scamplers::domain::EntityKind;
use populate_scamplers::error::PopulateError;

const SETTINGS: &str = r#"
api_base_url = "https://scamplers.example.org/api"
api_key = "from-file"
cache_dir = "/tmp/scamplers-cache"
skip = ["chromium_datasets"]

[file_renaming]
"people.csv" = "People Export.csv"

[csv_field_renamings.labs]
"Lab PI" = "pi_email"

[institution_domains]
"Yale University" = "yale.edu"
"#;

fn overrides() -> Overrides {
    Overrides {
        csv_dir: PathBuf::from("exports"),
        ..Overrides::default()
    }
}

#[test]
fn settings_file_fills_in_missing_flags() {
    let settings = ConfigLoader::parse(SETTINGS).unwrap();
    let resolved = ConfigLoader::resolve(settings, overrides()).unwrap();

    assert_eq!(resolved.api_base_url, "https://scamplers.example.org/api");
    assert_eq!(resolved.api_key, "from-file");
    assert_eq!(resolved.cache_dir, Utf8PathBuf::from("/tmp/scamplers-cache"));
    assert_eq!(resolved.error_dir, Utf8PathBuf::from(".errors"));
    assert_eq!(resolved.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    assert_eq!(resolved.skip, BTreeSet::from([EntityKind::ChromiumDatasets]));
    assert_eq!(resolved.tables.institution_domains.len(), 1);
    assert!(!resolved.tables.assays.is_empty());
}

#[test]
fn flags_override_the_settings_file() {
    let settings = ConfigLoader::parse(SETTINGS).unwrap();
    let resolved = ConfigLoader::resolve(
        settings,
        Overrides {
            api_key: Some("from-env".to_string()),
            skip: vec![EntityKind::SequencingRuns],
            max_concurrency: Some(0),
            ..overrides()
        },
    )
    .unwrap();

    assert_eq!(resolved.api_key, "from-env");
    assert_eq!(resolved.max_concurrency, 1);
    assert_eq!(
        resolved.skip,
        BTreeSet::from([EntityKind::SequencingRuns, EntityKind::ChromiumDatasets])
    );
}

#[test]
fn api_key_is_required() {
    let settings = ConfigLoader::parse("api_base_url = \"https://x\"\n").unwrap();
    assert_matches!(
        ConfigLoader::resolve(settings, overrides()),
        Err(PopulateError::MissingSetting("api_key"))
    );
}

#[test]
fn explicit_settings_path_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("missing.toml")).unwrap();
    assert_matches!(
        ConfigLoader::load(Some(&path)),
        Err(PopulateError::MissingConfig(_))
    );
}

#[test]
fn unknown_kinds_in_skip_are_rejected() {
    assert_matches!(
        ConfigLoader::parse("skip = [\"samples\"]\n"),
        Err(PopulateError::ConfigParse(_))
    );
}
