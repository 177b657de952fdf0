use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Batch, Known, Stage};
use crate::api::TrackingClient;
use crate::datasets::{DatasetDir, Pipeline};
use crate::domain::EntityKind;
use crate::error::{PopulateError, RowError};
use crate::resolve::{self, DatasetRecord, IdMap, ReadableRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChromiumDataset {
    pub name: String,
    pub data_path: String,
    pub pipeline: Pipeline,
    pub library_ids: Vec<Uuid>,
    pub metrics: Vec<Value>,
    pub web_summaries: Vec<String>,
}

fn read(path: &Utf8Path) -> Result<String, RowError> {
    fs::read_to_string(path.as_std_path())
        .map_err(|err| RowError::invalid("path", path.as_str(), err.to_string()))
}

/// CSV metrics become one object per row keyed by header; JSON metrics are
/// passed through.
pub fn parse_metrics(path: &Utf8Path, content: &str) -> Result<Value, RowError> {
    if path.extension() == Some("json") {
        return serde_json::from_str(content)
            .map_err(|err| RowError::invalid("metrics", path.as_str(), err.to_string()));
    }
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| RowError::invalid("metrics", path.as_str(), err.to_string()))?
        .clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|err| RowError::invalid("metrics", path.as_str(), err.to_string()))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.to_string(), Value::String(value.to_string())))
            .collect::<serde_json::Map<_, _>>();
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

pub fn parse_dir(dataset: &DatasetDir, libraries: &IdMap) -> Result<NewChromiumDataset, RowError> {
    let readable_ids = dataset.library_readable_ids();
    if readable_ids.is_empty() {
        return Err(RowError::Inconsistent(format!(
            "dataset {} does not name any library",
            dataset.name()
        )));
    }
    let library_ids = readable_ids
        .iter()
        .map(|readable_id| libraries.resolve("library", readable_id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut metrics = Vec::new();
    let mut web_summaries = Vec::new();
    for files in dataset.output_files().map_err(|err| RowError::Inconsistent(err.to_string()))? {
        metrics.push(parse_metrics(&files.metrics, &read(&files.metrics)?)?);
        web_summaries.push(read(&files.web_summary)?);
    }

    Ok(NewChromiumDataset {
        name: dataset.name().to_string(),
        data_path: dataset.root().to_string(),
        pipeline: dataset.pipeline(),
        library_ids,
        metrics,
        web_summaries,
    })
}

pub fn build<C: TrackingClient>(stage: &Stage<C>) -> Result<Batch, PopulateError> {
    let kind = EntityKind::ChromiumDatasets;
    let mut batch = Batch::new(kind);
    if stage.sources.dataset_dirs.is_empty() {
        tracing::info!("no dataset directories given");
        return Ok(batch);
    }

    let paths = [EntityKind::Libraries.endpoint(), kind.endpoint()];
    let [libraries, existing] = resolve::fetch_all(stage.client, paths)?;
    let libraries = resolve::by_readable_id(
        "library readable ID",
        &resolve::decode::<ReadableRecord>(paths[0], libraries)?,
    )?;
    let known = Known::new(
        resolve::decode::<DatasetRecord>(paths[1], existing)?
            .into_iter()
            .map(|dataset| dataset.data_path),
        stage
            .cache
            .read_all::<NewChromiumDataset>(kind)?
            .into_iter()
            .map(|dataset| dataset.data_path),
    );

    for dir in &stage.sources.dataset_dirs {
        let data_path = dir.to_string();
        if let Some(reason) = known.check(&data_path) {
            batch.skip(&data_path, reason);
            continue;
        }
        let dataset = match DatasetDir::open(dir) {
            Ok(dataset) => dataset,
            Err(err) => {
                batch.reject(&data_path, RowError::Inconsistent(err.to_string()));
                continue;
            }
        };
        match parse_dir(&dataset, &libraries) {
            Ok(payload) => batch.create(&data_path, &payload)?,
            Err(err) => batch.reject(&data_path, err),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;

    fn write(path: &Utf8Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn csv_metrics_become_objects() {
        let metrics = parse_metrics(
            Utf8Path::new("metrics_summary.csv"),
            "Estimated Number of Cells,Mean Reads per Cell\n\"1,234\",\"50,000\"\n",
        )
        .unwrap();
        assert_eq!(
            metrics,
            json!([{"Estimated Number of Cells": "1,234", "Mean Reads per Cell": "50,000"}])
        );
        assert_eq!(
            parse_metrics(Utf8Path::new("summary.json"), "{\"cells\": 3}").unwrap(),
            json!({"cells": 3})
        );
    }

    #[test]
    fn datasets_resolve_their_libraries() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("25L1-25L2-GEX")).unwrap();
        write(&root.join("cellranger/_files/_cmdline"), "cellranger count");
        write(&root.join("cellranger/metrics_summary.csv"), "Cells\n10\n");
        write(&root.join("cellranger/web_summary.html"), "<html/>");

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let libraries = IdMap::build(
            "library readable ID",
            [("25L1".to_string(), first), ("25L2".to_string(), second)],
        )
        .unwrap();
        let dataset = parse_dir(&DatasetDir::open(&root).unwrap(), &libraries).unwrap();
        assert_eq!(dataset.name, "25L1-25L2-GEX");
        assert_eq!(dataset.pipeline, Pipeline::Cellranger);
        assert_eq!(dataset.library_ids, vec![first, second]);
        assert_eq!(dataset.metrics, vec![json!([{"Cells": "10"}])]);
        assert_eq!(dataset.web_summaries, vec!["<html/>".to_string()]);

        let missing = IdMap::build("library readable ID", [("25L1".to_string(), first)]).unwrap();
        assert_eq!(
            parse_dir(&DatasetDir::open(&root).unwrap(), &missing).unwrap_err(),
            RowError::unresolved("library", "25L2")
        );
    }
}
