//! OAuth token handling for the Google APIs.
//!
//! Tokens are cached as JSON on disk. [`Authenticator::access_token`] loads
//! the cache on first use, refreshes an expired token when a refresh token is
//! stored, and otherwise falls back to the interactive consent flow (unless
//! that is disabled), persisting whatever it obtains.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::AuthError;

pub const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/drive",
];

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// The OAuth client of an "installed application".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    /// Reads a client secrets file as downloaded from the Google console.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SecretsFile = serde_json::from_str(&content).map_err(|source| AuthError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        file.installed.or(file.web).ok_or_else(|| {
            AuthError::InvalidSecrets(format!(
                "{} has neither an 'installed' nor a 'web' client",
                path.display()
            ))
        })
    }
}

/// A token as persisted in the cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now + Duration::seconds(EXPIRY_SKEW_SECS) >= expiry,
            None => false,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && !self.is_expired(now)
    }

    /// `Ok(None)` when no cache file exists. An unreadable file is treated as
    /// absent so a corrupt cache leads to re-authorization.
    pub fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match serde_json::from_str(&content) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Ignoring unreadable token cache");
                Ok(None)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let io_err = |source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| AuthError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)?;
        info!(path = %path.display(), "Token saved");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

async fn post_token_form(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, AuthError> {
    let response = http.post(token_uri).form(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(AuthError::TokenEndpoint { status, body });
    }
    Ok(response.json().await?)
}

/// Exchanges the stored refresh token for a fresh access token. The refresh
/// token is kept when the endpoint does not rotate it.
pub async fn refresh_token(http: &reqwest::Client, token: &StoredToken) -> Result<StoredToken, AuthError> {
    let refresh = token
        .refresh_token
        .as_deref()
        .ok_or_else(|| AuthError::Callback("token has no refresh token".to_string()))?;
    let response = post_token_form(
        http,
        &token.token_uri,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
        ],
    )
    .await?;

    Ok(StoredToken {
        access_token: response.access_token,
        refresh_token: response.refresh_token.or_else(|| token.refresh_token.clone()),
        expiry: response.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
        token_uri: token.token_uri.clone(),
        client_id: token.client_id.clone(),
        client_secret: token.client_secret.clone(),
        scopes: match response.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => token.scopes.clone(),
        },
    })
}

/// Consent URL for the installed-application flow.
pub fn authorization_url(secrets: &ClientSecrets, redirect_uri: &str, scopes: &[&str], state: &str) -> String {
    let scope = scopes.join(" ");
    let params = [
        ("response_type", "code"),
        ("client_id", secrets.client_id.as_str()),
        ("redirect_uri", redirect_uri),
        ("scope", scope.as_str()),
        ("state", state),
        ("access_type", "offline"),
        ("prompt", "consent"),
    ];
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", secrets.auth_uri, query)
}

/// Interactive consent: listens on a loopback port, prints the consent URL,
/// waits for the browser redirect and exchanges the code. Blocks until the
/// user completes the flow.
pub async fn run_interactive_flow(
    http: &reqwest::Client,
    secrets: &ClientSecrets,
    scopes: &[&str],
) -> Result<StoredToken, AuthError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| AuthError::Callback(format!("cannot bind loopback listener: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| AuthError::Callback(e.to_string()))?
        .port();
    let redirect_uri = format!("http://127.0.0.1:{port}/");
    let state = Uuid::new_v4().simple().to_string();

    let url = authorization_url(secrets, &redirect_uri, scopes, &state);
    println!("Please visit this URL to authorize this application: {url}");
    info!(port, "Waiting for OAuth redirect");

    let code = receive_authorization_code(&listener, &state).await?;
    debug!("Authorization code received, exchanging");

    let response = post_token_form(
        http,
        &secrets.token_uri,
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
        ],
    )
    .await?;

    Ok(StoredToken {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        expiry: response.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
        token_uri: secrets.token_uri.clone(),
        client_id: secrets.client_id.clone(),
        client_secret: secrets.client_secret.clone(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
    })
}

async fn receive_authorization_code(listener: &TcpListener, expected_state: &str) -> Result<String, AuthError> {
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| AuthError::Callback(e.to_string()))?;
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| AuthError::Callback(e.to_string()))?;

    let result = parse_callback(&request_line, expected_state);
    let body = match &result {
        Ok(_) => "The authentication flow has completed. You may close this window.",
        Err(_) => "The authentication flow failed. Check the terminal for details.",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "Could not answer the OAuth redirect");
    }
    let _ = stream.shutdown().await;
    result
}

/// Extracts `code` from a redirect request line such as
/// `GET /?state=..&code=.. HTTP/1.1`.
pub fn parse_callback(request_line: &str, expected_state: &str) -> Result<String, AuthError> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AuthError::Callback(format!("malformed request line '{}'", request_line.trim())))?;
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or("");

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            "error" => error = Some(value),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(AuthError::Callback(format!("consent denied: {error}")));
    }
    if state.as_deref() != Some(expected_state) {
        return Err(AuthError::Callback("state mismatch".to_string()));
    }
    code.ok_or_else(|| AuthError::Callback("redirect carried no code".to_string()))
}

/// Shared by the Sheets and Drive clients; resolves a valid access token on
/// demand.
#[derive(Debug)]
pub struct Authenticator {
    token_path: PathBuf,
    secrets_path: Option<PathBuf>,
    interactive: bool,
    http: reqwest::Client,
    cached: Mutex<Option<StoredToken>>,
}

impl Authenticator {
    pub fn new(token_path: PathBuf, secrets_path: Option<PathBuf>, interactive: bool) -> Self {
        Self {
            token_path,
            secrets_path,
            interactive,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// A currently valid access token, renewing and persisting it if needed.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = StoredToken::load(&self.token_path)?;
        }
        if let Some(token) = cached.as_ref() {
            if token.is_valid(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let renewed = match cached.take() {
            Some(token) if token.refresh_token.is_some() => {
                warn!("Google OAuth token expired... refreshing.");
                refresh_token(&self.http, &token).await?
            }
            _ => {
                warn!(path = %self.token_path.display(), "Google OAuth token not found");
                if !self.interactive {
                    return Err(AuthError::AuthorizationRequired {
                        token_path: self.token_path.clone(),
                    });
                }
                let secrets_path = self.secrets_path.as_deref().ok_or_else(|| {
                    AuthError::InvalidSecrets("no client secrets path configured".to_string())
                })?;
                let secrets = ClientSecrets::load(secrets_path)?;
                run_interactive_flow(&self.http, &secrets, &SCOPES).await?
            }
        };

        renewed.save(&self.token_path)?;
        let access = renewed.access_token.clone();
        *cached = Some(renewed);
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expiry: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            access_token: "ya29.token".into(),
            refresh_token: Some("1//refresh".into()),
            expiry,
            token_uri: "https://oauth2.googleapis.com/token".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            scopes: vec![],
        }
    }

    #[test]
    fn expiry_uses_skew() {
        let now = Utc::now();
        assert!(token(Some(now + Duration::seconds(30))).is_expired(now));
        assert!(!token(Some(now + Duration::seconds(600))).is_expired(now));
        assert!(!token(None).is_expired(now));
    }

    #[test]
    fn callback_extracts_code() {
        let code = parse_callback("GET /?state=abc&code=4%2F0Ab HTTP/1.1\r\n", "abc").unwrap();
        assert_eq!(code, "4/0Ab");
    }

    #[test]
    fn callback_rejects_state_mismatch() {
        assert!(parse_callback("GET /?state=zzz&code=c HTTP/1.1", "abc").is_err());
    }

    #[test]
    fn callback_reports_denied_consent() {
        let err = parse_callback("GET /?error=access_denied&state=abc HTTP/1.1", "abc").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[test]
    fn authorization_url_encodes_scopes() {
        let secrets = ClientSecrets {
            client_id: "cid".into(),
            client_secret: "cs".into(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
        };
        let url = authorization_url(&secrets, "http://127.0.0.1:8080/", &SCOPES, "st");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fspreadsheets%20https"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A8080%2F"));
    }
}
