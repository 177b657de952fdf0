use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CopyReport, CopyResult, ProgressEvent, ProgressSink, RunReport, StageStatus};
use crate::error_report::ErrorEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_copy(report: &CopyReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_errors(entries: &[ErrorEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Plain summaries for a terminal.
pub struct TextOutput;

impl TextOutput {
    pub fn print_run(report: &RunReport) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for stage in &report.stages {
            match &stage.status {
                StageStatus::SkippedByConfig => {
                    writeln!(stdout, "{:<22} skipped", stage.kind.as_str())?;
                }
                StageStatus::Failed { error } => {
                    writeln!(stdout, "{:<22} FAILED: {error}", stage.kind.as_str())?;
                }
                StageStatus::Completed => {
                    writeln!(
                        stdout,
                        "{:<22} {} sent, {} created, {} dry run, {} failed, {} rows skipped",
                        stage.kind.as_str(),
                        stage.built,
                        stage.succeeded,
                        stage.dry_run,
                        stage.failed.len(),
                        stage.skipped.len(),
                    )?;
                    for failed in &stage.failed {
                        let status = failed
                            .status
                            .map(|status| status.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        match &failed.artifact {
                            Some(artifact) => writeln!(
                                stdout,
                                "  {} [{status}] see {artifact}",
                                failed.label
                            )?,
                            None => writeln!(
                                stdout,
                                "  {} [{status}] {}",
                                failed.label, failed.message
                            )?,
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn print_copy(report: &CopyReport) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for result in &report.datasets {
            match result {
                CopyResult::Copied {
                    source,
                    destination,
                } => writeln!(stdout, "copied {source} -> {destination}")?,
                CopyResult::AlreadyCopied {
                    source,
                    destination,
                } => writeln!(stdout, "exists {source} -> {destination}")?,
                CopyResult::Failed { source, error } => {
                    writeln!(stdout, "failed {source}: {error}")?
                }
            }
        }
        Ok(())
    }

    pub fn print_errors(entries: &[ErrorEntry]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for entry in entries {
            let error = serde_json::to_string_pretty(&entry.error).map_err(io::Error::other)?;
            writeln!(stdout, "{} ({})", entry.label, entry.path)?;
            writeln!(stdout, "{error}")?;
        }
        Ok(())
    }
}

/// Progress lines on stderr, so stdout stays a clean summary.
pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        match event.kind {
            Some(kind) => eprintln!("[{kind}] {}", event.message),
            None => eprintln!("{}", event.message),
        }
    }
}
