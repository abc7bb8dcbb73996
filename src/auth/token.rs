use async_trait::async_trait;
use hyper::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::HttpClient;
use crate::error::{Error, Result};
use crate::upstream::request::{COPILOT_VERSION, USER_AGENT, X_GITHUB_API_VERSION};

/// A short-lived token is only served while more than this many seconds remain.
pub const EXPIRY_SKEW_SECS: u64 = 60;

/// Upstream bearer token with the expiry parsed out of its `exp=` segment.
///
/// Serialised in the KV store as `{"tempToken": ..., "expiry": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortLivedToken {
    #[serde(rename = "tempToken")]
    pub token: String,
    pub expiry: u64,
}

impl ShortLivedToken {
    pub fn from_token(token: String) -> Self {
        let expiry = extract_expiry(&token);
        Self { token, expiry }
    }

    /// True while `expiry - now > 60`.
    pub fn is_servable(&self, now: u64) -> bool {
        self.expiry > now.saturating_add(EXPIRY_SKEW_SECS)
    }

    /// KV lifetime: `max(60, expiry - now - 60)`.
    pub fn kv_ttl(&self, now: u64) -> u64 {
        self.expiry
            .saturating_sub(now)
            .saturating_sub(EXPIRY_SKEW_SECS)
            .max(60)
    }
}

/// Parse `exp=<unix seconds>` out of a `;`-separated `key=value` token.
/// Returns 0 (already expired) when no usable segment exists.
pub fn extract_expiry(token: &str) -> u64 {
    token
        .split(';')
        .find_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            if key.trim() == "exp" {
                value.trim().parse::<u64>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Exchanges a long-lived GitHub credential for a short-lived upstream token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, long_term: &str) -> Result<String>;
}

/// `GET {github_api}/copilot_internal/v2/token`.
pub struct GithubExchanger {
    http: Arc<HttpClient>,
    github_api_base: String,
    vscode_version: String,
}

impl GithubExchanger {
    pub fn new(http: Arc<HttpClient>, github_api_base: &str, vscode_version: &str) -> Self {
        Self {
            http,
            github_api_base: github_api_base.trim_end_matches('/').to_string(),
            vscode_version: vscode_version.to_string(),
        }
    }
}

#[async_trait]
impl TokenExchanger for GithubExchanger {
    async fn exchange(&self, long_term: &str) -> Result<String> {
        let url = format!("{}/copilot_internal/v2/token", self.github_api_base);
        let authorization = format!("token {}", long_term);
        let editor_version = format!("vscode/{}", self.vscode_version);
        let headers = github_headers(&authorization, &editor_version);

        let body = self
            .http
            .get(&url, &headers)
            .await
            .map_err(Error::AuthExchange)?;

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::AuthExchange(format!("invalid token response: {}", e)))?;

        parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::AuthExchange("\"token\" field not found".to_string()))
    }
}

/// Headers GitHub expects on `copilot_internal` calls made with the long-lived credential.
pub fn github_headers<'a>(
    authorization: &'a str,
    editor_version: &'a str,
) -> [(&'a str, &'a str); 8] {
    [
        ("Authorization", authorization),
        ("Accept", "application/json"),
        ("Content-Type", "application/json"),
        ("Editor-Version", editor_version),
        ("Editor-Plugin-Version", COPILOT_VERSION),
        ("User-Agent", USER_AGENT),
        ("X-GitHub-Api-Version", X_GITHUB_API_VERSION),
        ("X-Vscode-User-Agent-Library-Version", "electron-fetch"),
    ]
}

/// Quota snapshot for the account behind a long-lived credential.
pub async fn fetch_usage(
    http: &HttpClient,
    github_api_base: &str,
    vscode_version: &str,
    long_term: &str,
) -> Result<serde_json::Value> {
    let url = format!(
        "{}/copilot_internal/user",
        github_api_base.trim_end_matches('/')
    );
    let authorization = format!("token {}", long_term);
    let editor_version = format!("vscode/{}", vscode_version);
    let headers = github_headers(&authorization, &editor_version);

    let response = http
        .send(Method::GET, &url, &headers, None)
        .await
        .map_err(Error::Http)?;
    if !response.is_success() {
        return Err(Error::Upstream {
            status: response.status,
            body: response.text(),
        });
    }

    let raw: serde_json::Value = serde_json::from_slice(&response.body)?;
    let snapshots = raw.get("quota_snapshots");
    let pick = |name: &str| {
        snapshots
            .and_then(|s| s.get(name))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    };

    Ok(serde_json::json!({
        "copilot_plan": raw.get("copilot_plan").cloned().unwrap_or_default(),
        "quota_reset_date": raw.get("quota_reset_date").cloned().unwrap_or_default(),
        "quota_snapshots": {
            "chat": pick("chat"),
            "completions": pick("completions"),
            "premium_interactions": pick("premium_interactions"),
        }
    }))
}
