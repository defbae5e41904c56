/// `load_config` module: loads the notebook manifest (`notebooks.json`) and turns it into typed,
/// validated entries.
///
/// This is the only place where the manifest JSON is parsed. Loosely typed directive objects are
/// mapped to the closed [`PostDirective`] enum here, so a misconfigured notebook fails at process
/// start instead of in the middle of a scheduled run.
///
/// # Errors
/// Read and parse failures are `anyhow` errors; semantic problems carry a [`ConfigError`] that
/// callers can downcast to.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{error, info};

use crate::scheduler::Interval;

pub const PROCESS_OVERWRITE: &str = "upload_gdrive_overwrite";
pub const PROCESS_COMPRESSED_FILE: &str = "upload_gdrive_compressed_file";
pub const PROCESS_COMPRESSED_FILES: &str = "upload_gdrive_compressed_files";
pub const PROCESS_GSHEET_CSV: &str = "upload_gsheet_csv";

/// The parsed manifest: notebook basename → entry.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub notebooks: BTreeMap<String, NotebookEntry>,
}

impl Manifest {
    pub fn get(&self, basename: &str) -> Option<&NotebookEntry> {
        self.notebooks.get(basename)
    }
}

#[derive(Debug, Clone)]
pub struct NotebookEntry {
    pub interval: Interval,
    /// Run in order by the post_process stage.
    pub posts: Vec<PostDirective>,
}

/// One configured post-processing action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostDirective {
    /// Delete-then-upload every glob match.
    UploadGdriveOverwrite(OverwriteUpload),
    /// Gzip every glob match and overwrite-upload the `.gz`.
    UploadGdriveCompressedFile(CompressedUpload),
    /// Tar+gzip all glob matches into one archive and overwrite-upload it.
    UploadGdriveCompressedFiles(CompressedUpload),
    /// Push every matched CSV into a spreadsheet range.
    UploadGsheetCsv(SheetUpload),
}

impl PostDirective {
    /// The `process` discriminator as written in the manifest.
    pub fn kind(&self) -> &'static str {
        match self {
            PostDirective::UploadGdriveOverwrite(_) => PROCESS_OVERWRITE,
            PostDirective::UploadGdriveCompressedFile(_) => PROCESS_COMPRESSED_FILE,
            PostDirective::UploadGdriveCompressedFiles(_) => PROCESS_COMPRESSED_FILES,
            PostDirective::UploadGsheetCsv(_) => PROCESS_GSHEET_CSV,
        }
    }

    /// Glob pattern, relative to the output directory.
    pub fn glob(&self) -> &str {
        match self {
            PostDirective::UploadGdriveOverwrite(d) => &d.glob,
            PostDirective::UploadGdriveCompressedFile(d) => &d.glob,
            PostDirective::UploadGdriveCompressedFiles(d) => &d.glob,
            PostDirective::UploadGsheetCsv(d) => &d.glob,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverwriteUpload {
    pub glob: String,
    pub file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub parent_dir_id: Option<String>,
    /// Ship this file instead of the glob match.
    #[serde(default)]
    pub path_to_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedUpload {
    pub glob: String,
    pub file_name: String,
    #[serde(default)]
    pub parent_dir_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetUpload {
    pub glob: String,
    pub sheet_id: String,
    pub sheet_range: String,
}

/// Semantic manifest errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("notebook '{notebook}': unsupported post processing '{process}'")]
    UnknownProcess { notebook: String, process: String },

    #[error("notebook '{notebook}': post #{index} has no 'process' field")]
    MissingProcess { notebook: String, index: usize },

    #[error("notebook '{notebook}': invalid '{process}' directive #{index}: {reason}")]
    InvalidDirective {
        notebook: String,
        process: String,
        index: usize,
        reason: String,
    },

    #[error("notebook '{notebook}': invalid interval '{interval}': {reason}")]
    InvalidInterval {
        notebook: String,
        interval: String,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    posts: Vec<serde_json::Value>,
}

/// Reads and validates the manifest. Any failure is fatal for the process.
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    let path_ref = path.as_ref();
    info!(manifest_path = ?path_ref, "Loading manifest from file");

    let content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, manifest_path = ?path_ref, "Failed to read manifest file");
            return Err(anyhow::anyhow!(
                "Failed to read manifest file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    parse_manifest(&content)
}

/// Parses manifest JSON text.
pub fn parse_manifest(content: &str) -> Result<Manifest> {
    let raw: BTreeMap<String, RawEntry> = match serde_json::from_str(content) {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = ?e, "Failed to parse manifest JSON");
            return Err(anyhow::anyhow!("Failed to parse manifest JSON: {e}"));
        }
    };

    let mut notebooks = BTreeMap::new();
    for (name, entry) in raw {
        let interval = match entry.interval.as_deref() {
            None => Interval::Once,
            Some(expr) => Interval::parse(expr).map_err(|reason| ConfigError::InvalidInterval {
                notebook: name.clone(),
                interval: expr.to_string(),
                reason,
            })?,
        };

        let posts = entry
            .posts
            .into_iter()
            .enumerate()
            .map(|(index, value)| parse_directive(&name, index, value))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        info!(notebook = %name, %interval, posts = posts.len(), "Parsed manifest entry");
        notebooks.insert(name, NotebookEntry { interval, posts });
    }

    info!(notebooks = notebooks.len(), "Manifest loaded");
    Ok(Manifest { notebooks })
}

fn parse_directive(
    notebook: &str,
    index: usize,
    value: serde_json::Value,
) -> Result<PostDirective, ConfigError> {
    let process = match value.get("process").and_then(|p| p.as_str()) {
        Some(p) => p.to_string(),
        None => {
            error!(notebook, index, "Post directive without process field");
            return Err(ConfigError::MissingProcess {
                notebook: notebook.to_string(),
                index,
            });
        }
    };

    let invalid = |e: serde_json::Error| ConfigError::InvalidDirective {
        notebook: notebook.to_string(),
        process: process.clone(),
        index,
        reason: e.to_string(),
    };

    let directive = match process.as_str() {
        PROCESS_OVERWRITE => {
            PostDirective::UploadGdriveOverwrite(serde_json::from_value(value).map_err(invalid)?)
        }
        PROCESS_COMPRESSED_FILE => PostDirective::UploadGdriveCompressedFile(
            serde_json::from_value(value).map_err(invalid)?,
        ),
        PROCESS_COMPRESSED_FILES => PostDirective::UploadGdriveCompressedFiles(
            serde_json::from_value(value).map_err(invalid)?,
        ),
        PROCESS_GSHEET_CSV => {
            PostDirective::UploadGsheetCsv(serde_json::from_value(value).map_err(invalid)?)
        }
        other => {
            error!(notebook, process = %other, "Unsupported post processing in manifest");
            return Err(ConfigError::UnknownProcess {
                notebook: notebook.to_string(),
                process: other.to_string(),
            });
        }
    };
    Ok(directive)
}
