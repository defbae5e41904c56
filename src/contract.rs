#![allow(unused)]

//! # contract: the seams between workflow runs and the outside world
//!
//! A workflow run touches three external systems: the notebook runner, the
//! spreadsheet service and the file store. Each one is a trait here so the
//! orchestration in [`crate::workflow`] and [`crate::post_process`] can be
//! driven by real clients in production and by `mockall` mocks in tests.
//!
//! ## Interface
//! - [`SpreadsheetApi`]: overwrite a cell range with literal rows.
//! - [`FileStore`]: search, delete and upload files.
//! - [`NotebookRunner`]: execute one notebook with injected parameters.
//!
//! All methods are async and return boxed errors, mirroring the loosely typed
//! surface of the wrapped REST APIs. API failures are never retried here.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the mocks are exported under the
//!   `test-export-mocks` feature so integration tests can use them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use mockall::{automock, predicate::*};

/// Error type shared by all contract traits.
pub type ApiError = Box<dyn std::error::Error + Send + Sync>;

/// A file as reported by the file store search.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub modified_time: Option<String>,
}

/// Everything needed to upload one local file.
#[derive(Debug, Clone)]
pub struct NewUpload<'a> {
    /// File on local disk to send.
    pub local_path: &'a Path,
    /// Name the file gets in the store.
    pub name: &'a str,
    pub mime_type: &'a str,
    /// Folder to place the file in; the store root when absent.
    pub parent_id: Option<&'a str>,
}

/// The created file as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct UploadedFile {
    pub id: String,
}

/// Summary returned by a range update.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeUpdate {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default)]
    pub updated_range: String,
    #[serde(default)]
    pub updated_rows: u64,
    #[serde(default)]
    pub updated_cells: u64,
}

/// Spreadsheet capability used by `upload_gsheet_csv`.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SpreadsheetApi: Send + Sync {
    /// Overwrite `range` of spreadsheet `sheet_id` with `rows` (row-major).
    async fn update_range(
        &self,
        sheet_id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<RangeUpdate, ApiError>;
}

/// File store capability used by the Drive directives.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Substring search on the file name, filtered by MIME type. At most 100 results.
    async fn find_files(&self, keyword: &str, mime_type: &str) -> Result<Vec<RemoteFile>, ApiError>;

    /// Delete a single file by id.
    async fn delete_file_by_id(&self, file_id: &str) -> Result<(), ApiError>;

    /// Upload a local file, returning the id of the created file.
    async fn upload_file<'a>(&self, req: NewUpload<'a>) -> Result<UploadedFile, ApiError>;
}

/// Delete every remote file whose name is exactly `name` and whose MIME type
/// matches. Search results that merely contain `name` are left alone.
pub async fn delete_file<S>(store: &S, name: &str, mime_type: &str) -> Result<usize, ApiError>
where
    S: FileStore + ?Sized,
{
    let candidates = store.find_files(name, mime_type).await?;
    let mut deleted = 0;
    for file in candidates.iter().filter(|f| f.name == name) {
        tracing::info!(file_id = %file.id, name = %file.name, "Deleting remote file");
        store.delete_file_by_id(&file.id).await?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Parameters injected into a notebook run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookParameters {
    pub output_dir: PathBuf,
    /// `YYYY-MM-DD` projection of `execution_time`.
    pub execution_date: String,
    /// The scheduled run timestamp, passed through as given.
    pub execution_time: String,
}

/// Executes a notebook. Its rendered output is discarded; only files written
/// to `output_dir` matter.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait NotebookRunner: Send + Sync {
    async fn execute(&self, notebook: &Path, params: &NotebookParameters) -> Result<(), ApiError>;
}
