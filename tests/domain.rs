use std::str::FromStr;

use assert_matches::assert_matches;

use populate_scamplers::domain::EntityKind;
use populate_scamplers::error::PopulateError;

#[test]
fn kinds_parse_from_their_names() {
    for kind in EntityKind::ALL {
        assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), kind);
    }
    assert_matches!(
        EntityKind::from_str("samples"),
        Err(PopulateError::InvalidKind(_))
    );
}

#[test]
fn measurements_are_never_cached() {
    let uncached = EntityKind::ALL
        .into_iter()
        .filter(|kind| !kind.is_cached())
        .collect::<Vec<_>>();
    assert_eq!(uncached, vec![EntityKind::SpecimenMeasurements]);
}
