use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::LazyLock;

pub const COPILOT_VERSION: &str = "copilot-chat/0.26.7";
pub const USER_AGENT: &str = "GitHubCopilotChat/0.26.7";
pub const X_GITHUB_API_VERSION: &str = "2025-04-01";
pub const INTEGRATION_ID: &str = "vscode-chat";

/// Stable for the life of the process, like an editor install.
static MACHINE_ID: LazyLock<String> = LazyLock::new(|| {
    let mut seed = [0u8; 32];
    getrandom::fill(&mut seed).expect("Failed to generate random bytes");
    let digest = Sha256::digest(seed);
    let mut hex = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", b);
    }
    hex
});

static SESSION_ID: LazyLock<String> = LazyLock::new(|| uuid::Uuid::new_v4().to_string());

pub fn machine_id() -> &'static str {
    &MACHINE_ID
}

/// Headers for every call to the chat, responses, embeddings and models endpoints.
pub fn build_headers(
    upstream_token: &str,
    vscode_version: &str,
    streaming: bool,
) -> Vec<(Cow<'static, str>, Cow<'static, str>)> {
    let mut headers = Vec::with_capacity(14);
    headers.push((
        Cow::Borrowed("Authorization"),
        Cow::Owned(format!("Bearer {}", upstream_token)),
    ));
    headers.push((
        Cow::Borrowed("Content-Type"),
        Cow::Borrowed("application/json"),
    ));
    headers.push((
        Cow::Borrowed("copilot-integration-id"),
        Cow::Borrowed(INTEGRATION_ID),
    ));
    headers.push((
        Cow::Borrowed("editor-version"),
        Cow::Owned(format!("vscode/{}", vscode_version)),
    ));
    headers.push((
        Cow::Borrowed("editor-plugin-version"),
        Cow::Borrowed(COPILOT_VERSION),
    ));
    headers.push((Cow::Borrowed("user-agent"), Cow::Borrowed(USER_AGENT)));
    headers.push((
        Cow::Borrowed("openai-intent"),
        Cow::Borrowed("conversation-panel"),
    ));
    headers.push((
        Cow::Borrowed("x-github-api-version"),
        Cow::Borrowed(X_GITHUB_API_VERSION),
    ));
    headers.push((
        Cow::Borrowed("x-request-id"),
        Cow::Owned(uuid::Uuid::new_v4().to_string()),
    ));
    headers.push((
        Cow::Borrowed("x-vscode-user-agent-library-version"),
        Cow::Borrowed("electron-fetch"),
    ));
    headers.push((
        Cow::Borrowed("vscode-machineid"),
        Cow::Owned(MACHINE_ID.clone()),
    ));
    headers.push((
        Cow::Borrowed("vscode-sessionid"),
        Cow::Owned(SESSION_ID.clone()),
    ));
    headers.push((
        Cow::Borrowed("copilot-vision-request"),
        Cow::Borrowed("true"),
    ));

    if streaming {
        headers.push((Cow::Borrowed("accept"), Cow::Borrowed("text/event-stream")));
    } else {
        headers.push((Cow::Borrowed("accept"), Cow::Borrowed("application/json")));
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(headers: &'a [(Cow<'static, str>, Cow<'static, str>)], name: &str) -> &'a str {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_ref())
            .unwrap_or_default()
    }

    #[test]
    fn test_build_headers_streaming() {
        let headers = build_headers("tid=1;exp=2", "1.98.0", true);
        assert_eq!(header(&headers, "Authorization"), "Bearer tid=1;exp=2");
        assert_eq!(header(&headers, "accept"), "text/event-stream");
        assert_eq!(header(&headers, "editor-version"), "vscode/1.98.0");
        assert_eq!(header(&headers, "copilot-integration-id"), "vscode-chat");
        assert_eq!(header(&headers, "openai-intent"), "conversation-panel");
    }

    #[test]
    fn test_machine_id_stable() {
        let a = build_headers("t", "1", false);
        let b = build_headers("t", "1", false);
        assert_eq!(header(&a, "accept"), "application/json");
        assert_eq!(header(&a, "vscode-machineid"), header(&b, "vscode-machineid"));
        assert_eq!(header(&a, "vscode-sessionid"), header(&b, "vscode-sessionid"));
        assert_ne!(header(&a, "x-request-id"), header(&b, "x-request-id"));
        assert_eq!(machine_id().len(), 64);
        assert!(machine_id().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
