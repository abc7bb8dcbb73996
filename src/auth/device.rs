//! GitHub OAuth device authorization flow.
//!
//! Used both by the `/github/*` endpoints and by `acpc login` in the terminal.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::HttpClient;
use crate::error::{Error, Result};

pub const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
pub const GITHUB_APP_SCOPES: &str = "read:user";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Extra seconds GitHub asks for on `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    access_token: Option<String>,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    scope: String,
    error: Option<String>,
    error_description: Option<String>,
}

/// HTTP status the gateway answers with for a device-flow `error` code.
pub fn status_for_error(error: &str) -> u16 {
    match error {
        "authorization_pending" => 202,
        "slow_down" => 429,
        "access_denied" => 403,
        "expired_token" => 410,
        _ => 400,
    }
}

pub async fn request_device_code(http: &HttpClient, github_base: &str) -> Result<DeviceCode> {
    let url = format!("{}/login/device/code", github_base.trim_end_matches('/'));
    let body = json!({
        "client_id": GITHUB_CLIENT_ID,
        "scope": GITHUB_APP_SCOPES,
    });

    let response = http
        .post_json(&url, &[], &serde_json::to_vec(&body)?)
        .await
        .map_err(|e| Error::Http(format!("Failed to get device code: {}", e)))?;

    serde_json::from_slice(&response)
        .map_err(|e| Error::Http(format!("Invalid device code response: {}", e)))
}

/// One poll of the access-token endpoint.
///
/// Pending, slow-down, denied and expired answers come back as
/// [`Error::DeviceFlow`] carrying the mapped HTTP status.
pub async fn poll_access_token(
    http: &HttpClient,
    github_base: &str,
    device_code: &str,
) -> Result<AccessToken> {
    let url = format!(
        "{}/login/oauth/access_token",
        github_base.trim_end_matches('/')
    );
    let body = json!({
        "client_id": GITHUB_CLIENT_ID,
        "device_code": device_code,
        "grant_type": DEVICE_GRANT_TYPE,
    });

    let response = http
        .post_json(&url, &[], &serde_json::to_vec(&body)?)
        .await
        .map_err(|e| Error::Http(format!("Failed to exchange device code: {}", e)))?;

    interpret_poll(&response)
}

fn interpret_poll(body: &[u8]) -> Result<AccessToken> {
    let parsed: PollResponse = serde_json::from_slice(body)
        .map_err(|e| Error::Http(format!("Invalid device token response: {}", e)))?;

    match (parsed.access_token, parsed.error) {
        (Some(access_token), _) if !access_token.is_empty() => Ok(AccessToken {
            access_token,
            token_type: parsed.token_type,
            scope: parsed.scope,
        }),
        (Some(_), None) => Err(Error::Http("Empty access_token".to_string())),
        (_, error) => {
            let error = error.unwrap_or_else(|| "unknown_error".to_string());
            Err(Error::DeviceFlow {
                status: status_for_error(&error),
                error,
                description: parsed.error_description,
            })
        }
    }
}

/// Poll until GitHub hands out a token, the code expires or the user declines.
///
/// `on_wait` is called before each sleep with the current interval.
pub async fn wait_for_access_token(
    http: &HttpClient,
    github_base: &str,
    code: &DeviceCode,
    mut on_wait: impl FnMut(Duration),
) -> Result<AccessToken> {
    let mut interval = code.interval.max(1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in.max(1));

    loop {
        let wait = Duration::from_secs(interval);
        on_wait(wait);
        tokio::time::sleep(wait).await;

        match poll_access_token(http, github_base, &code.device_code).await {
            Ok(token) => return Ok(token),
            Err(Error::DeviceFlow { error, .. }) if error == "authorization_pending" => {
                debug!("Device authorization pending");
            }
            Err(Error::DeviceFlow { error, .. }) if error == "slow_down" => {
                interval += SLOW_DOWN_STEP_SECS;
                debug!(interval, "Device flow asked to slow down");
            }
            Err(e) => return Err(e),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::DeviceFlow {
                status: status_for_error("expired_token"),
                error: "expired_token".to_string(),
                description: Some("The device code has expired.".to_string()),
            });
        }
    }
}
