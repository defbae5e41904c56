use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ensure_success, network_error, Authenticator, GoogleApiError};
use crate::contract::{ApiError, FileStore, NewUpload, RemoteFile, UploadedFile};

const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, createdTime, modifiedTime)";
const PAGE_SIZE: &str = "100";

pub struct DriveClient {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
    base_url: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

#[derive(Serialize)]
struct FileMetadata<'a> {
    name: &'a str,
    parents: Vec<&'a str>,
}

/// Escapes a literal for use inside a single-quoted Drive query string.
pub fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// `(name contains 'k') and (mimeType = 'm')`
pub fn search_query(keyword: &str, mime_type: &str) -> String {
    format!(
        "(name contains '{}') and (mimeType = '{}')",
        escape_query_literal(keyword),
        escape_query_literal(mime_type)
    )
}

impl DriveClient {
    pub fn new(http: reqwest::Client, auth: Arc<Authenticator>, base_url: String) -> Self {
        Self {
            http,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn token(&self) -> Result<String, GoogleApiError> {
        Ok(self.auth.access_token().await?)
    }
}

#[async_trait]
impl FileStore for DriveClient {
    async fn find_files(&self, keyword: &str, mime_type: &str) -> Result<Vec<RemoteFile>, ApiError> {
        tracing::info!(keyword, mime_type, "Finding gdrive file");
        let token = self.token().await?;
        let url = format!("{}/drive/v3/files", self.base_url);
        let query = search_query(keyword, mime_type);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("q", query.as_str()),
                ("spaces", "drive"),
                ("pageSize", PAGE_SIZE),
                ("fields", LIST_FIELDS),
            ])
            .bearer_auth(token)
            .send()
            .await
            .map_err(network_error(&url))?;
        let response = ensure_success(&url, response).await?;
        let list: FileList = response.json().await.map_err(network_error(&url))?;
        tracing::debug!(keyword, found = list.files.len(), "Gdrive search complete");
        Ok(list.files)
    }

    async fn delete_file_by_id(&self, file_id: &str) -> Result<(), ApiError> {
        let token = self.token().await?;
        let url = format!("{}/drive/v3/files/{}", self.base_url, urlencoding::encode(file_id));

        let response = self
            .http
            .delete(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(network_error(&url))?;
        ensure_success(&url, response).await?;
        tracing::info!(file_id, "Deleted gdrive file");
        Ok(())
    }

    /// Resumable upload: open a session with the metadata, then send the
    /// whole file body to the session URL in one request.
    async fn upload_file<'a>(&self, req: NewUpload<'a>) -> Result<UploadedFile, ApiError> {
        tracing::info!(name = req.name, path = %req.local_path.display(), "Uploading gdrive file");
        let content = tokio::fs::read(req.local_path)
            .await
            .map_err(|source| GoogleApiError::Io {
                path: req.local_path.to_path_buf(),
                source,
            })?;
        let token = self.token().await?;
        let url = format!("{}/upload/drive/v3/files", self.base_url);

        let metadata = FileMetadata {
            name: req.name,
            parents: req.parent_id.into_iter().collect(),
        };
        let response = self
            .http
            .post(&url)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", req.mime_type)
            .header("X-Upload-Content-Length", content.len().to_string())
            .json(&metadata)
            .send()
            .await
            .map_err(network_error(&url))?;
        let response = ensure_success(&url, response).await?;

        let session = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| GoogleApiError::MissingUploadSession(req.name.to_string()))?;

        let response = self
            .http
            .put(&session)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, req.mime_type)
            .body(content)
            .send()
            .await
            .map_err(network_error(&session))?;
        let response = ensure_success(&session, response).await?;
        let created: UploadedFile = response.json().await.map_err(network_error(&session))?;
        tracing::info!(name = req.name, file_id = %created.id, "Gdrive upload complete");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_escapes_quotes() {
        assert_eq!(
            search_query("bob's.csv", "text/csv"),
            "(name contains 'bob\\'s.csv') and (mimeType = 'text/csv')"
        );
    }
}
