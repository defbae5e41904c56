//! Workflow factory and the four-stage run: cleanup → execute → post_process → stop.
//!
//! One [`Workflow`] is built per notebook found in the notebook directory. A
//! run walks the fixed stage chain strictly in order and fails fast: the first
//! stage error aborts the run and is returned to the caller (the scheduler or
//! the `run` command), which decides what to log.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use crate::config::Settings;
use crate::contract::{ApiError, FileStore, NotebookRunner, SpreadsheetApi};
use crate::execute::{notebook_parameters, ExecuteError};
use crate::load_config::{Manifest, PostDirective};
use crate::post_process::{PostProcessError, PostProcessor, PostReport};
use crate::scheduler::Interval;

pub const NOTEBOOK_EXTENSION: &str = "ipynb";

/// Nodes of the stage chain, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Start,
    Cleanup,
    Execute,
    PostProcess,
    Stop,
}

impl Stage {
    pub fn id(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Cleanup => "cleanup",
            Stage::Execute => "execute",
            Stage::PostProcess => "post_process",
            Stage::Stop => "stop",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// The only chain a workflow ever has.
pub const STAGE_CHAIN: [Stage; 5] = [
    Stage::Start,
    Stage::Cleanup,
    Stage::Execute,
    Stage::PostProcess,
    Stage::Stop,
];

#[derive(Debug, Clone)]
pub struct Workflow {
    /// The notebook basename.
    pub id: String,
    pub notebook: PathBuf,
    pub interval: Interval,
    pub timeout: Duration,
    pub posts: Vec<PostDirective>,
}

impl Workflow {
    pub fn stages(&self) -> &'static [Stage] {
        &STAGE_CHAIN
    }

    /// Upstream → downstream pairs of the chain.
    pub fn edges(&self) -> Vec<(Stage, Stage)> {
        STAGE_CHAIN.windows(2).map(|w| (w[0], w[1])).collect()
    }
}

/// `.ipynb` files in `dir` as `(basename, path)`, sorted by basename.
/// Hidden files, other files and directories are skipped.
pub fn discover_notebooks(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list notebook directory {}", dir.display()))?;

    let mut notebooks = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let is_notebook = path.extension().is_some_and(|ext| ext == NOTEBOOK_EXTENSION);
        if file_name.starts_with('.') || !path.is_file() || !is_notebook {
            debug!(path = %path.display(), "Skipping non-notebook entry");
            continue;
        }
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        notebooks.push((stem, path));
    }
    notebooks.sort();
    Ok(notebooks)
}

/// Builds one workflow per notebook in the notebook directory.
///
/// A missing notebook directory, or a notebook the manifest does not
/// describe, is a fatal configuration error.
pub fn build_workflows(settings: &Settings, manifest: &Manifest) -> Result<Vec<Workflow>> {
    settings.validate()?;
    let notebooks = discover_notebooks(&settings.notebooks_dir)?;

    let mut workflows = Vec::with_capacity(notebooks.len());
    for (basename, notebook) in notebooks {
        let entry = manifest.get(&basename).ok_or_else(|| {
            error!(notebook = %basename, "Notebook has no manifest entry");
            anyhow::anyhow!(
                "Notebook '{}' has no entry in {}",
                basename,
                settings.manifest_path.display()
            )
        })?;
        info!(workflow = %basename, interval = %entry.interval, posts = entry.posts.len(), "Registered workflow");
        workflows.push(Workflow {
            id: basename,
            notebook,
            interval: entry.interval.clone(),
            timeout: settings.run_timeout(),
            posts: entry.posts.clone(),
        });
    }

    for name in manifest.notebooks.keys() {
        if !workflows.iter().any(|w| &w.id == name) {
            debug!(notebook = %name, "Manifest entry has no notebook file");
        }
    }
    Ok(workflows)
}

/// External services a run talks to. Built once at startup and shared by
/// reference with every run.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn NotebookRunner>,
    pub sheets: Arc<dyn SpreadsheetApi>,
    pub drive: Arc<dyn FileStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("cleanup of {} failed: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    ExecutionTime(#[from] ExecuteError),

    #[error("notebook execution failed: {0}")]
    Execute(#[source] ApiError),

    #[error(transparent)]
    PostProcess(#[from] PostProcessError),

    #[error("run exceeded its {0:?} budget")]
    TimedOut(Duration),
}

impl WorkflowError {
    /// Stage that was running when the error happened.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            WorkflowError::Cleanup { .. } => Some(Stage::Cleanup),
            WorkflowError::ExecutionTime(_) | WorkflowError::Execute(_) => Some(Stage::Execute),
            WorkflowError::PostProcess(_) => Some(Stage::PostProcess),
            WorkflowError::TimedOut(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub execution_time: String,
    /// Stages reached, in order.
    pub stages: Vec<Stage>,
    pub removed_files: usize,
    pub posts: Vec<PostReport>,
}

/// Removes everything in `output_dir`, creating it when missing. Entries that
/// vanish concurrently are skipped, so running it twice is harmless.
pub fn cleanup(output_dir: &Path) -> Result<usize, WorkflowError> {
    let io_err = |source| WorkflowError::Cleanup {
        path: output_dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(output_dir).map_err(io_err)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(output_dir).map_err(io_err)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_err(e)),
        };
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed generated file");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_err(e)),
        }
    }
    Ok(removed)
}

/// Current time in the format scheduled runs use.
pub fn now_execution_time() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Runs the full stage chain within the workflow's time budget.
pub async fn run_workflow(
    services: &Services,
    output_dir: &Path,
    workflow: &Workflow,
    execution_time: &str,
) -> Result<RunReport, WorkflowError> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("run", workflow = %workflow.id, %run_id, execution_time);
    match tokio::time::timeout(
        workflow.timeout,
        run_stages(services, output_dir, workflow, execution_time, run_id).instrument(span),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            error!(workflow = %workflow.id, %run_id, timeout = ?workflow.timeout, "[RUN][ERROR] Run timed out");
            Err(WorkflowError::TimedOut(workflow.timeout))
        }
    }
}

async fn run_stages(
    services: &Services,
    output_dir: &Path,
    workflow: &Workflow,
    execution_time: &str,
    run_id: Uuid,
) -> Result<RunReport, WorkflowError> {
    let mut report = RunReport {
        run_id,
        workflow_id: workflow.id.clone(),
        execution_time: execution_time.to_string(),
        stages: Vec::new(),
        removed_files: 0,
        posts: Vec::new(),
    };

    for stage in workflow.stages() {
        info!(stage = %stage, "[RUN] Entering stage");
        match stage {
            Stage::Start | Stage::Stop => {}
            Stage::Cleanup => {
                let dir = output_dir.to_path_buf();
                report.removed_files = tokio::task::spawn_blocking(move || cleanup(&dir))
                    .await
                    .map_err(|e| WorkflowError::Cleanup {
                        path: output_dir.to_path_buf(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e),
                    })??;
                info!(removed = report.removed_files, "[RUN] Output directory cleared");
            }
            Stage::Execute => {
                let params = notebook_parameters(output_dir, execution_time)?;
                services
                    .runner
                    .execute(&workflow.notebook, &params)
                    .await
                    .map_err(|e| {
                        error!(error = %e, "[RUN][ERROR] Execute stage failed");
                        WorkflowError::Execute(e)
                    })?;
            }
            Stage::PostProcess => {
                let processor =
                    PostProcessor::new(output_dir, services.sheets.as_ref(), services.drive.as_ref());
                report.posts = processor.run_all(&workflow.posts).await?;
            }
        }
        report.stages.push(*stage);
    }

    info!(stages = report.stages.len(), "[RUN] Run complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_form_a_single_chain() {
        let wf = Workflow {
            id: "nb".into(),
            notebook: PathBuf::from("nb.ipynb"),
            interval: Interval::Once,
            timeout: Duration::from_secs(60),
            posts: vec![],
        };
        assert_eq!(
            wf.edges(),
            vec![
                (Stage::Start, Stage::Cleanup),
                (Stage::Cleanup, Stage::Execute),
                (Stage::Execute, Stage::PostProcess),
                (Stage::PostProcess, Stage::Stop),
            ]
        );
    }

    #[test]
    fn cleanup_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        assert_eq!(cleanup(&out).unwrap(), 0);
        assert!(out.is_dir());
    }
}
