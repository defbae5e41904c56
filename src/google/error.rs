use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid client secrets: {0}")]
    InvalidSecrets(String),

    #[error("token endpoint unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("no usable OAuth token at {}; run `gauth <client_secrets.json>` first", token_path.display())]
    AuthorizationRequired { token_path: PathBuf },

    #[error("authorization callback failed: {0}")]
    Callback(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("resumable upload for '{0}' returned no session location")]
    MissingUploadSession(String),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
