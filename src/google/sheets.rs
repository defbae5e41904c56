use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use super::{ensure_success, network_error, Authenticator, GoogleApiError};
use crate::contract::{ApiError, RangeUpdate, SpreadsheetApi};

pub struct SheetsClient {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange<'a> {
    range: &'a str,
    major_dimension: &'static str,
    values: Vec<Vec<String>>,
}

impl SheetsClient {
    pub fn new(http: reqwest::Client, auth: Arc<Authenticator>, base_url: String) -> Self {
        Self {
            http,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn values_url(&self, sheet_id: &str, range: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.base_url,
            urlencoding::encode(sheet_id),
            urlencoding::encode(range)
        )
    }
}

#[async_trait]
impl SpreadsheetApi for SheetsClient {
    async fn update_range(
        &self,
        sheet_id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<RangeUpdate, ApiError> {
        tracing::info!(sheet_id, range, rows = rows.len(), "Updating gsheet values");
        let token = self.auth.access_token().await.map_err(GoogleApiError::from)?;
        let url = self.values_url(sheet_id, range);

        let response = self
            .http
            .put(&url)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .bearer_auth(token)
            .json(&ValueRange {
                range,
                major_dimension: "ROWS",
                values: rows,
            })
            .send()
            .await
            .map_err(network_error(&url))?;
        let response = ensure_success(&url, response).await?;
        let update: RangeUpdate = response.json().await.map_err(network_error(&url))?;
        tracing::info!(
            sheet_id,
            updated_range = %update.updated_range,
            updated_cells = update.updated_cells,
            "Gsheet range updated"
        );
        Ok(update)
    }
}
