use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("token exchange failed: {0}")]
    AuthExchange(String),

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed stream frame: {0}")]
    StreamParse(String),

    #[error("stream transport error: {0}")]
    StreamTransport(String),

    #[error("device flow {error} ({status})")]
    DeviceFlow {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("kv store error: {0}")]
    Kv(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns a user-friendly suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::AuthExchange(_) => {
                Some("The GitHub token may be revoked; run 'acpc login' for a new one")
            }
            Error::Auth(AuthError::MissingCredential) => {
                Some("Set LONG_TERM_TOKEN or run 'acpc login' to store a token")
            }
            Error::Auth(AuthError::InvalidCredentialFormat) => {
                Some("Use a GitHub OAuth token starting with 'ghu_' or 'gho_'")
            }
            Error::Kv(_) => Some("Check the [kv] section of config.toml"),
            Error::DeviceFlow { error, .. } if error == "expired_token" => {
                Some("The device code expired, run 'acpc login' again")
            }
            Error::Timeout(_) => Some("Check your internet connection or try again"),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing Authorization bearer token.")]
    MissingBearer,

    #[error("Invalid credentials.")]
    InvalidCredentials,

    #[error("Unknown user.")]
    UnknownUser,

    #[error("Invalid username.")]
    InvalidUsername,

    #[error("Invalid password.")]
    InvalidPassword,

    #[error("No GitHub token configured.")]
    MissingCredential,

    #[error("GitHub token must start with 'ghu' or 'gho'.")]
    InvalidCredentialFormat,
}

pub type Result<T> = std::result::Result<T, Error>;
