//! Cell Ranger output directories as delivered to labs.
//!
//! A dataset directory is named after the libraries it was computed from
//! (`25L1-25L2-…-<suffix>`) and holds one `cellranger*` directory whose
//! name is the pipeline that produced it.

use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::PopulateError;

pub const PER_SAMPLE_OUTS: &str = "per_sample_outs";
pub const WEB_SUMMARY: &str = "web_summary.html";
pub const PIPELINE_METADATA: &str = "pipeline-metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pipeline {
    Cellranger,
    CellrangerArc,
    CellrangerAtac,
    CellrangerMulti,
    CellrangerMultiHto,
    CellrangerMultiOcm,
    CellrangerMultiVdj,
    CellrangerVdj,
}

impl Pipeline {
    pub const ALL: [Pipeline; 8] = [
        Pipeline::Cellranger,
        Pipeline::CellrangerArc,
        Pipeline::CellrangerAtac,
        Pipeline::CellrangerMulti,
        Pipeline::CellrangerMultiHto,
        Pipeline::CellrangerMultiOcm,
        Pipeline::CellrangerMultiVdj,
        Pipeline::CellrangerVdj,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Pipeline::Cellranger => "cellranger",
            Pipeline::CellrangerArc => "cellranger-arc",
            Pipeline::CellrangerAtac => "cellranger-atac",
            Pipeline::CellrangerMulti => "cellranger-multi",
            Pipeline::CellrangerMultiHto => "cellranger-multi-hto",
            Pipeline::CellrangerMultiOcm => "cellranger-multi-ocm",
            Pipeline::CellrangerMultiVdj => "cellranger-multi-vdj",
            Pipeline::CellrangerVdj => "cellranger-vdj",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Pipeline::ALL.into_iter().find(|pipeline| pipeline.dir_name() == name)
    }

    pub fn metrics_filename(&self) -> &'static str {
        match self {
            Pipeline::CellrangerArc => "summary.csv",
            Pipeline::CellrangerAtac => "summary.json",
            _ => "metrics_summary.csv",
        }
    }
}

/// The metrics and web summary of one sample, or of the whole run when the
/// pipeline does not split its outputs per sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    pub sample: Option<String>,
    pub metrics: Utf8PathBuf,
    pub web_summary: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDir {
    root: Utf8PathBuf,
    cellranger_dir: Utf8PathBuf,
    pipeline: Pipeline,
}

fn invalid(path: &Utf8Path, message: impl Into<String>) -> PopulateError {
    PopulateError::InvalidDataset {
        path: path.as_std_path().to_path_buf(),
        message: message.into(),
    }
}

fn fs_error(path: &Utf8Path, err: std::io::Error) -> PopulateError {
    PopulateError::Filesystem(format!("{path}: {err}"))
}

fn sorted_subdirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PopulateError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir.as_std_path()).map_err(|err| fs_error(dir, err))? {
        let entry = entry.map_err(|err| fs_error(dir, err))?;
        if !entry.path().is_dir() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
            PopulateError::Filesystem(format!("non UTF-8 path {}", path.display()))
        })?;
        dirs.push(path);
    }
    dirs.sort();
    Ok(dirs)
}

impl DatasetDir {
    /// Locates the `cellranger*` directory inside `root`.
    pub fn open(root: &Utf8Path) -> Result<Self, PopulateError> {
        if !root.as_std_path().is_dir() {
            return Err(invalid(root, "not a directory"));
        }
        let cellranger_dir = sorted_subdirs(root)?
            .into_iter()
            .find(|dir| dir.file_name().is_some_and(|name| name.contains("cellranger")))
            .ok_or_else(|| invalid(root, "no cellranger output directory"))?;
        let dir_name = cellranger_dir.file_name().unwrap_or_default();
        let pipeline = Pipeline::from_dir_name(dir_name)
            .ok_or_else(|| invalid(root, format!("unknown pipeline {dir_name}")))?;
        Ok(Self {
            root: root.to_path_buf(),
            cellranger_dir,
            pipeline,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn name(&self) -> &str {
        self.root.file_name().unwrap_or(self.root.as_str())
    }

    /// Every dash-separated part of the directory name but the last.
    pub fn library_readable_ids(&self) -> Vec<String> {
        let parts = self.name().split('-').collect::<Vec<_>>();
        parts[..parts.len().saturating_sub(1)]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.to_string())
            .collect()
    }

    pub fn cmdline_file(&self) -> Utf8PathBuf {
        self.cellranger_dir.join("_files").join("_cmdline")
    }

    pub fn pipeline_metadata_file(&self) -> Utf8PathBuf {
        self.root.join(PIPELINE_METADATA)
    }

    fn per_sample_outs(&self) -> Utf8PathBuf {
        self.cellranger_dir.join(PER_SAMPLE_OUTS)
    }

    pub fn output_files(&self) -> Result<Vec<OutputFiles>, PopulateError> {
        let metrics = self.pipeline.metrics_filename();
        let per_sample_outs = self.per_sample_outs();
        if !per_sample_outs.as_std_path().is_dir() {
            return Ok(vec![OutputFiles {
                sample: None,
                metrics: self.cellranger_dir.join(metrics),
                web_summary: self.cellranger_dir.join(WEB_SUMMARY),
            }]);
        }
        Ok(sorted_subdirs(&per_sample_outs)?
            .into_iter()
            .map(|sample_dir| OutputFiles {
                sample: sample_dir.file_name().map(str::to_string),
                metrics: sample_dir.join(metrics),
                web_summary: sample_dir.join(WEB_SUMMARY),
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied(Utf8PathBuf),
    AlreadyCopied(Utf8PathBuf),
}

fn copy_file(source: &Utf8Path, dest: &Path) -> Result<(), PopulateError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| PopulateError::Filesystem(err.to_string()))?;
    }
    fs::copy(source.as_std_path(), dest).map_err(|err| fs_error(source, err))?;
    Ok(())
}

/// Copies the command line, pipeline metadata, metrics and web summaries of
/// a dataset to `<destination>/<dataset>/<cellranger dir>/`. The copy is
/// staged next to its final place and renamed in, so an interrupted copy
/// leaves nothing behind and an existing copy is never touched.
pub fn copy_dataset(
    dataset: &DatasetDir,
    destination: &Utf8Path,
) -> Result<CopyOutcome, PopulateError> {
    let dataset_dest = destination.join(dataset.name());
    let dest = dataset_dest.join(dataset.pipeline.dir_name());
    if dest.as_std_path().exists() {
        tracing::debug!(dataset = dataset.name(), %dest, "dataset already copied");
        return Ok(CopyOutcome::AlreadyCopied(dest));
    }

    fs::create_dir_all(dataset_dest.as_std_path()).map_err(|err| fs_error(&dataset_dest, err))?;
    let staging = tempfile::Builder::new()
        .prefix(".populate-scamplers-copy")
        .tempdir_in(dataset_dest.as_std_path())
        .map_err(|err| fs_error(&dataset_dest, err))?;
    let staged = staging.path();

    copy_file(&dataset.cmdline_file(), &staged.join("_files").join("_cmdline"))?;
    copy_file(&dataset.pipeline_metadata_file(), &staged.join(PIPELINE_METADATA))?;
    for files in dataset.output_files()? {
        let dir = match &files.sample {
            Some(sample) => staged.join(PER_SAMPLE_OUTS).join(sample),
            None => staged.to_path_buf(),
        };
        for source in [&files.metrics, &files.web_summary] {
            let file_name = source.file_name().unwrap_or_default();
            copy_file(source, &dir.join(file_name))?;
        }
    }

    let staged = staging.keep();
    fs::rename(&staged, dest.as_std_path()).map_err(|err| {
        let _ = fs::remove_dir_all(&staged);
        fs_error(&dest, err)
    })?;
    tracing::info!(dataset = dataset.name(), %dest, "copied dataset");
    Ok(CopyOutcome::Copied(dest))
}
