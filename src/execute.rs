//! Notebook execution: timestamp handling and the papermill-backed runner.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::RunnerSettings;
use crate::contract::{ApiError, NotebookParameters, NotebookRunner};

/// Production timestamps carry microseconds.
const FRACTIONAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";
const WHOLE_SECOND_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("unparsable execution time '{0}'")]
    InvalidExecutionTime(String),

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("notebook {} failed with {status}: {stderr}", notebook.display())]
    Failed {
        notebook: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Parses a run timestamp, first with fractional seconds, then without, then
/// as RFC 3339 (which accepts a `Z` offset).
pub fn parse_execution_time(raw: &str) -> Result<DateTime<FixedOffset>, ExecuteError> {
    DateTime::parse_from_str(raw, FRACTIONAL_FORMAT)
        .or_else(|_| DateTime::parse_from_str(raw, WHOLE_SECOND_FORMAT))
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map_err(|_| ExecuteError::InvalidExecutionTime(raw.to_string()))
}

/// `YYYY-MM-DD` of the given run timestamp, in its own offset.
pub fn execution_date(raw: &str) -> Result<String, ExecuteError> {
    Ok(parse_execution_time(raw)?.format("%Y-%m-%d").to_string())
}

/// Builds the parameters injected into a run.
pub fn notebook_parameters(
    output_dir: &Path,
    execution_time: &str,
) -> Result<NotebookParameters, ExecuteError> {
    Ok(NotebookParameters {
        output_dir: output_dir.to_path_buf(),
        execution_date: execution_date(execution_time)?,
        execution_time: execution_time.to_string(),
    })
}

/// Runs notebooks through the `papermill` CLI. The executed notebook is
/// written to the null device.
#[derive(Debug, Clone)]
pub struct PapermillRunner {
    program: String,
    kernel: Option<String>,
}

impl PapermillRunner {
    pub fn new(settings: &RunnerSettings) -> Self {
        Self {
            program: settings.program.clone(),
            kernel: settings.kernel.clone(),
        }
    }

    /// Full argument list for one run, program excluded.
    pub fn args(&self, notebook: &Path, params: &NotebookParameters) -> Vec<String> {
        let mut args = vec![
            notebook.display().to_string(),
            null_device().to_string(),
            "-p".into(),
            "output_dir".into(),
            output_dir_param(&params.output_dir),
            "-p".into(),
            "execution_date".into(),
            params.execution_date.clone(),
            "-p".into(),
            "execution_time".into(),
            params.execution_time.clone(),
            "--log-output".into(),
            "--report-mode".into(),
        ];
        if let Some(kernel) = &self.kernel {
            args.push("--kernel".into());
            args.push(kernel.clone());
        }
        args
    }
}

#[async_trait]
impl NotebookRunner for PapermillRunner {
    async fn execute(&self, notebook: &Path, params: &NotebookParameters) -> Result<(), ApiError> {
        let args = self.args(notebook, params);
        debug!(program = %self.program, ?args, "Launching notebook runner");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                error!(error = ?e, program = %self.program, "Failed to launch notebook runner");
                ExecuteError::Spawn {
                    program: self.program.clone(),
                    source: e,
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            debug!(notebook = %notebook.display(), "{line}");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(
                notebook = %notebook.display(),
                status = %output.status,
                "Notebook execution failed"
            );
            return Err(Box::new(ExecuteError::Failed {
                notebook: notebook.to_path_buf(),
                status: output.status,
                stderr,
            }));
        }

        info!(
            notebook = %notebook.display(),
            execution_time = %params.execution_time,
            "Notebook executed"
        );
        Ok(())
    }
}

/// Notebooks concatenate file names onto `output_dir`, so it keeps a trailing separator.
fn output_dir_param(dir: &Path) -> String {
    let mut s = dir.display().to_string();
    if !s.ends_with(std::path::MAIN_SEPARATOR) {
        s.push(std::path::MAIN_SEPARATOR);
    }
    s
}

fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_from_fractional_timestamp() {
        assert_eq!(
            execution_date("2024-03-05T10:15:30.123456+00:00").unwrap(),
            "2024-03-05"
        );
    }

    #[test]
    fn date_from_whole_second_timestamp() {
        assert_eq!(execution_date("2024-03-05T10:15:30+00:00").unwrap(), "2024-03-05");
    }

    #[test]
    fn date_keeps_the_timestamp_offset() {
        assert_eq!(execution_date("2024-03-05T23:30:00-05:00").unwrap(), "2024-03-05");
    }

    #[test]
    fn date_from_zulu_timestamp() {
        assert_eq!(execution_date("2024-03-05T10:15:30Z").unwrap(), "2024-03-05");
        assert_eq!(execution_date("2024-03-05T10:15:30.5Z").unwrap(), "2024-03-05");
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        assert!(matches!(
            parse_execution_time("yesterday"),
            Err(ExecuteError::InvalidExecutionTime(_))
        ));
    }

    #[test]
    fn papermill_args_inject_parameters() {
        let runner = PapermillRunner::new(&RunnerSettings {
            program: "papermill".into(),
            kernel: Some("python3".into()),
        });
        let params = NotebookParameters {
            output_dir: PathBuf::from("/data/output"),
            execution_date: "2024-03-05".into(),
            execution_time: "2024-03-05T10:15:30+00:00".into(),
        };
        let args = runner.args(Path::new("/data/notebooks/daily.ipynb"), &params);
        assert_eq!(args[0], "/data/notebooks/daily.ipynb");
        assert!(args.windows(3).any(|w| w == ["-p", "output_dir", "/data/output/"]));
        assert!(args.windows(3).any(|w| w == ["-p", "execution_date", "2024-03-05"]));
        assert!(args.ends_with(&["--kernel".to_string(), "python3".to_string()]));
    }
}
