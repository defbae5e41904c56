//! Post-processing dispatcher: ships the files a notebook left in the output
//! directory to Drive or Sheets, one [`PostDirective`] at a time.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::contract::{self, ApiError, FileStore, NewUpload, SpreadsheetApi};
use crate::load_config::{CompressedUpload, OverwriteUpload, PostDirective, SheetUpload};

pub const GZIP_MIME: &str = "application/gzip";

#[derive(Debug, thiserror::Error)]
pub enum PostProcessError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read csv {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{process} failed: {source}")]
    Api {
        process: &'static str,
        #[source]
        source: ApiError,
    },
}

/// What one directive did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostReport {
    pub process: &'static str,
    /// Local files that matched the glob.
    pub matched: Vec<PathBuf>,
    /// Ids of files created in the file store.
    pub uploaded_ids: Vec<String>,
    /// Spreadsheet ranges that were overwritten.
    pub updated_ranges: Vec<String>,
}

pub struct PostProcessor<'a> {
    output_dir: &'a Path,
    sheets: &'a dyn SpreadsheetApi,
    drive: &'a dyn FileStore,
}

impl<'a> PostProcessor<'a> {
    pub fn new(output_dir: &'a Path, sheets: &'a dyn SpreadsheetApi, drive: &'a dyn FileStore) -> Self {
        Self {
            output_dir,
            sheets,
            drive,
        }
    }

    /// Runs every directive in order; the first failure aborts the rest.
    pub async fn run_all(&self, posts: &[PostDirective]) -> Result<Vec<PostReport>, PostProcessError> {
        let mut reports = Vec::with_capacity(posts.len());
        for post in posts {
            reports.push(self.run(post).await?);
        }
        Ok(reports)
    }

    pub async fn run(&self, post: &PostDirective) -> Result<PostReport, PostProcessError> {
        info!(process = post.kind(), glob = post.glob(), "[POST] Running directive");
        let result = match post {
            PostDirective::UploadGdriveOverwrite(d) => self.upload_gdrive_overwrite(d).await,
            PostDirective::UploadGdriveCompressedFile(d) => self.upload_gdrive_compressed_file(d).await,
            PostDirective::UploadGdriveCompressedFiles(d) => self.upload_gdrive_compressed_files(d).await,
            PostDirective::UploadGsheetCsv(d) => self.upload_gsheet_csv(d).await,
        };
        match &result {
            Ok(report) => info!(
                process = report.process,
                matched = report.matched.len(),
                uploads = report.uploaded_ids.len(),
                ranges = report.updated_ranges.len(),
                "[POST] Directive completed"
            ),
            Err(e) => error!(process = post.kind(), error = %e, "[POST][ERROR] Directive failed"),
        }
        result
    }

    async fn upload_gdrive_overwrite(&self, d: &OverwriteUpload) -> Result<PostReport, PostProcessError> {
        let process = crate::load_config::PROCESS_OVERWRITE;
        let matched = matching_files(self.output_dir, &d.glob)?;
        let mut report = PostReport {
            process,
            ..Default::default()
        };
        for file in &matched {
            let source = match &d.path_to_file {
                Some(explicit) => self.output_dir.join(explicit),
                None => file.clone(),
            };
            info!(file = %file.display(), source = %source.display(), "[POST] Processing match");
            let uploaded = overwrite_upload(
                self.drive,
                &source,
                &d.file_name,
                &d.mime_type,
                d.parent_dir_id.as_deref(),
            )
            .await
            .map_err(|source| PostProcessError::Api { process, source })?;
            report.uploaded_ids.push(uploaded);
        }
        report.matched = matched;
        Ok(report)
    }

    async fn upload_gdrive_compressed_file(
        &self,
        d: &CompressedUpload,
    ) -> Result<PostReport, PostProcessError> {
        let process = crate::load_config::PROCESS_COMPRESSED_FILE;
        let matched = matching_files(self.output_dir, &d.glob)?;
        let mut report = PostReport {
            process,
            ..Default::default()
        };
        for file in &matched {
            let gz = gzip_file(file).map_err(|source| PostProcessError::Io {
                path: file.clone(),
                source,
            })?;
            let uploaded = overwrite_upload(
                self.drive,
                &gz,
                &d.file_name,
                GZIP_MIME,
                d.parent_dir_id.as_deref(),
            )
            .await
            .map_err(|source| PostProcessError::Api { process, source })?;
            report.uploaded_ids.push(uploaded);
        }
        report.matched = matched;
        Ok(report)
    }

    /// One archive, one upload, however many files matched.
    async fn upload_gdrive_compressed_files(
        &self,
        d: &CompressedUpload,
    ) -> Result<PostReport, PostProcessError> {
        let process = crate::load_config::PROCESS_COMPRESSED_FILES;
        let matched = matching_files(self.output_dir, &d.glob)?;

        let scratch = tempfile::tempdir().map_err(|source| PostProcessError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        let archive = scratch.path().join(archive_file_name(&d.file_name));
        tar_gz_files(&matched, &archive).map_err(|source| PostProcessError::Io {
            path: archive.clone(),
            source,
        })?;
        debug!(archive = %archive.display(), files = matched.len(), "[POST] Built archive");

        let uploaded = overwrite_upload(
            self.drive,
            &archive,
            &d.file_name,
            GZIP_MIME,
            d.parent_dir_id.as_deref(),
        )
        .await
        .map_err(|source| PostProcessError::Api { process, source })?;

        Ok(PostReport {
            process,
            matched,
            uploaded_ids: vec![uploaded],
            updated_ranges: Vec::new(),
        })
    }

    async fn upload_gsheet_csv(&self, d: &SheetUpload) -> Result<PostReport, PostProcessError> {
        let process = crate::load_config::PROCESS_GSHEET_CSV;
        let matched = matching_files(self.output_dir, &d.glob)?;
        let mut report = PostReport {
            process,
            ..Default::default()
        };
        for file in &matched {
            let rows = read_csv_grid(file)?;
            info!(file = %file.display(), rows = rows.len(), sheet_id = %d.sheet_id, range = %d.sheet_range, "[POST] Updating sheet range");
            let updated = self
                .sheets
                .update_range(&d.sheet_id, &d.sheet_range, rows)
                .await
                .map_err(|source| PostProcessError::Api { process, source })?;
            info!(file = %file.display(), updated_range = %updated.updated_range, "Upload csv successful");
            report.updated_ranges.push(d.sheet_range.clone());
        }
        report.matched = matched;
        Ok(report)
    }
}

/// Delete any remote file with the same name and MIME type, then upload.
/// Returns the id of the new file.
pub async fn overwrite_upload(
    drive: &dyn FileStore,
    local_path: &Path,
    name: &str,
    mime_type: &str,
    parent_id: Option<&str>,
) -> Result<String, ApiError> {
    contract::delete_file(drive, name, mime_type).await?;
    let uploaded = drive
        .upload_file(NewUpload {
            local_path,
            name,
            mime_type,
            parent_id,
        })
        .await?;
    info!(name, file_id = %uploaded.id, "Upload file successful");
    Ok(uploaded.id)
}

/// Existing regular files under `dir` matching `pattern`, sorted.
pub fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, PostProcessError> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()).trim_end_matches('/'),
        pattern
    );
    let paths = glob::glob(&full).map_err(|source| PostProcessError::Glob {
        pattern: full.clone(),
        source,
    })?;
    let mut files: Vec<PathBuf> = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable glob entry");
                None
            }
        })
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Compresses `path` to `<path>.gz` next to it.
pub fn gzip_file(path: &Path) -> io::Result<PathBuf> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);

    let mut input = File::open(path)?;
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(gz_path)
}

/// Writes a tar+gzip archive holding `files`, each stored under its base name.
pub fn tar_gz_files(files: &[PathBuf], archive: &Path) -> io::Result<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        builder.append_path_with_name(file, name)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Reads a CSV file into a row-major grid. No header row, ragged rows allowed.
pub fn read_csv_grid(path: &Path) -> Result<Vec<Vec<String>>, PostProcessError> {
    let csv_err = |source| PostProcessError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Remote names may contain separators; the local scratch copy must not.
fn archive_file_name(remote_name: &str) -> String {
    let cleaned = remote_name.replace(['/', '\\'], "_");
    if cleaned.is_empty() {
        "archive.tar.gz".to_string()
    } else {
        cleaned
    }
}
