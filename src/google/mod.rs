//! Google Sheets and Google Drive clients behind the [`crate::contract`] traits.
//!
//! Both clients share one [`Authenticator`] and one `reqwest::Client`. They
//! are built once at startup by [`GoogleApi::from_settings`]; no request is
//! made, and no token is resolved, until the first API call.

pub mod auth;
pub mod drive;
pub mod error;
pub mod sheets;

use std::sync::Arc;

pub use auth::{Authenticator, ClientSecrets, StoredToken, SCOPES};
pub use drive::DriveClient;
pub use error::{AuthError, GoogleApiError};
pub use sheets::SheetsClient;

use crate::config::Settings;

pub const SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";
pub const DRIVE_BASE_URL: &str = "https://www.googleapis.com";

/// API roots; overridden in tests to point at a local server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub sheets: String,
    pub drive: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            sheets: SHEETS_BASE_URL.to_string(),
            drive: DRIVE_BASE_URL.to_string(),
        }
    }
}

pub struct GoogleApi {
    pub sheets: Arc<SheetsClient>,
    pub drive: Arc<DriveClient>,
}

impl GoogleApi {
    pub fn new(auth: Arc<Authenticator>, endpoints: Endpoints) -> Self {
        let http = reqwest::Client::new();
        Self {
            sheets: Arc::new(SheetsClient::new(http.clone(), auth.clone(), endpoints.sheets)),
            drive: Arc::new(DriveClient::new(http, auth, endpoints.drive)),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let auth = Authenticator::new(
            settings.token_path(),
            settings.client_secrets_path.clone(),
            settings.interactive_auth,
        );
        Self::new(Arc::new(auth), Endpoints::default())
    }
}

/// Turns a non-success response into [`GoogleApiError::Status`].
pub(crate) async fn ensure_success(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GoogleApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    tracing::error!(url, %status, body = %body, "Google API returned error");
    Err(GoogleApiError::Status {
        url: url.to_string(),
        status,
        body,
    })
}

pub(crate) fn network_error(url: &str) -> impl FnOnce(reqwest::Error) -> GoogleApiError + '_ {
    move |source| GoogleApiError::Network {
        url: url.to_string(),
        source,
    }
}
