use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::SinkRow;
use crate::services::crypto::{AssertionSigner, ServiceAccountKey, SHEETS_SCOPE};

const SHEETS_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const JWT_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
// Refresh a little before Google's expiry.
const TOKEN_SLACK_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink credentials: {0}")]
    Credentials(String),
    #[error("sink rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("sink request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sink error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("sink destination: {0}")]
    Destination(String),
}

/// Append-only tabular destination. Rows of one call keep their order.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    async fn append(&self, rows: &[SinkRow]) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct AppendBody {
    #[serde(rename = "majorDimension")]
    major_dimension: &'static str,
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

/// Writes rows to one sheet through the Sheets `values:append` API.
pub struct GoogleSheetsWriter {
    client: reqwest::Client,
    signer: AssertionSigner,
    spreadsheet_id: String,
    range: String,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleSheetsWriter {
    pub fn from_credentials_file(path: &Path, spreadsheet_id: String, range: String) -> Result<Self, SinkError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SinkError::Credentials(format!("{}: {}", path.display(), e)))?;
        let key: ServiceAccountKey =
            serde_json::from_str(&raw).map_err(|e| SinkError::Credentials(e.to_string()))?;
        let signer = AssertionSigner::new(&key).map_err(|e| SinkError::Credentials(e.to_string()))?;
        Ok(GoogleSheetsWriter {
            client: reqwest::Client::new(),
            signer,
            spreadsheet_id,
            range,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - TOKEN_SLACK_SECS > now {
                return Ok(token.value.clone());
            }
        }

        let assertion = self
            .signer
            .assertion(SHEETS_SCOPE, now)
            .map_err(|e| SinkError::Credentials(e.to_string()))?;
        let response = self
            .client
            .post(self.signer.token_uri())
            .form(&[("grant_type", JWT_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Auth { status, body });
        }

        let token: TokenResponse = response.json().await?;
        debug!(expires_in = token.expires_in, "refreshed sheets access token");
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: now + token.expires_in,
        });
        Ok(value)
    }
}

#[async_trait]
impl SinkWriter for GoogleSheetsWriter {
    async fn append(&self, rows: &[SinkRow]) -> Result<(), SinkError> {
        let token = self.access_token().await?;
        let url = append_url(&self.spreadsheet_id, &self.range)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&append_body(rows))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            // Drop the token so the next call signs a fresh one.
            *self.token.lock().await = None;
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Auth {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// `{base}/{id}/values/{range}:append` with the id and range percent-encoded
/// as path segments, so ranges like `Q1 #2!A:H` stay in the path.
fn append_url(spreadsheet_id: &str, range: &str) -> Result<reqwest::Url, SinkError> {
    let mut url = reqwest::Url::parse(SHEETS_BASE).map_err(|e| SinkError::Destination(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| SinkError::Destination(SHEETS_BASE.to_string()))?
        .push(spreadsheet_id)
        .push("values")
        .push(&format!("{}:append", range));
    Ok(url)
}

fn append_body(rows: &[SinkRow]) -> AppendBody {
    AppendBody {
        major_dimension: "ROWS",
        values: rows.iter().map(SinkRow::cells).collect(),
    }
}
