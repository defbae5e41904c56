//! Process settings: where notebooks, outputs, the manifest and credentials
//! live, and how notebooks are executed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Environment variable overriding the OAuth client-secrets path.
pub const CLIENT_SECRETS_ENV: &str = "G_OAUTH_JSON_FILE";

/// Token cache file name inside the credentials directory.
pub const TOKEN_FILE: &str = "g_oauth_clt.json";

/// Manifest file name inside `<root>/config`.
pub const MANIFEST_FILE: &str = "notebooks.json";

const DEFAULT_RUN_TIMEOUT_MINUTES: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub notebooks_dir: PathBuf,
    /// Shared scratch space, cleared at the start of every run.
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub credentials_dir: PathBuf,
    #[serde(default)]
    pub client_secrets_path: Option<PathBuf>,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_minutes: u64,
    /// Fall back to the browser consent flow when no usable token exists.
    #[serde(default = "default_true")]
    pub interactive_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_runner_program")]
    pub program: String,
    #[serde(default)]
    pub kernel: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            program: default_runner_program(),
            kernel: None,
        }
    }
}

fn default_runner_program() -> String {
    "papermill".to_string()
}

fn default_run_timeout() -> u64 {
    DEFAULT_RUN_TIMEOUT_MINUTES
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Conventional layout under a deployment root:
    /// `notebooks/`, `output/`, `config/notebooks.json`, `credentials/`.
    pub fn from_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            notebooks_dir: root.join("notebooks"),
            output_dir: root.join("output"),
            manifest_path: root.join("config").join(MANIFEST_FILE),
            credentials_dir: root.join("credentials"),
            client_secrets_path: None,
            runner: RunnerSettings::default(),
            run_timeout_minutes: DEFAULT_RUN_TIMEOUT_MINUTES,
            interactive_auth: true,
        }
    }

    /// Reads a YAML settings file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        info!(settings_path = ?path_ref, "Loading settings from file");

        let content = fs::read_to_string(path_ref).map_err(|e| {
            error!(error = ?e, settings_path = ?path_ref, "Failed to read settings file");
            anyhow::anyhow!("Failed to read settings file {:?}: {}", path_ref, e)
        })?;

        let settings: Settings = serde_yaml::from_str(&content).map_err(|e| {
            error!(error = ?e, settings_path = ?path_ref, "Failed to parse settings YAML");
            anyhow::anyhow!("Failed to parse settings YAML: {e}")
        })?;

        Ok(settings)
    }

    /// Applies environment overrides. Only the client-secrets path is
    /// configurable this way.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(CLIENT_SECRETS_ENV) {
            debug!(path = %path, "Client secrets path taken from environment");
            self.client_secrets_path = Some(PathBuf::from(path));
        }
        self
    }

    pub fn token_path(&self) -> PathBuf {
        self.credentials_dir.join(TOKEN_FILE)
    }

    pub fn run_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.run_timeout_minutes * 60)
    }

    /// Fails when the notebook directory is missing; every other path is
    /// checked lazily by whoever uses it.
    pub fn validate(&self) -> Result<()> {
        if !self.notebooks_dir.is_dir() {
            error!(path = %self.notebooks_dir.display(), "Notebook directory does not exist");
            anyhow::bail!(
                "Notebook directory {} does not exist",
                self.notebooks_dir.display()
            );
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            notebooks_dir = %self.notebooks_dir.display(),
            output_dir = %self.output_dir.display(),
            manifest = %self.manifest_path.display(),
            "Loaded settings"
        );
        debug!(settings = ?self, "Settings loaded (full debug)");
    }
}

/// Settings from `--config`, or else the conventional layout under `--root`
/// (default: the current directory).
pub fn resolve_settings(config: Option<&Path>, root: Option<&Path>) -> Result<Settings> {
    let settings = match config {
        Some(path) => Settings::load(path)?,
        None => {
            let root = match root {
                Some(r) => r.to_path_buf(),
                None => std::env::current_dir().context("Cannot determine current directory")?,
            };
            Settings::from_root(root)
        }
    };
    let settings = settings.with_env_overrides();
    settings.trace_loaded();
    Ok(settings)
}
