use async_trait::async_trait;
use hyper::Method;
use hyper::body::Bytes;
use serde::Deserialize;
use std::sync::Arc;

use super::{KvPage, KvStore};
use crate::auth::HttpClient;
use crate::error::{Error, Result};

/// Cloudflare accepts nothing shorter.
const MIN_EXPIRATION_TTL: u64 = 60;

/// Workers KV namespace accessed through the Cloudflare REST API.
pub struct CloudflareKv {
    http: Arc<HttpClient>,
    namespace_url: String,
    authorization: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

impl CloudflareKv {
    pub fn new(
        http: Arc<HttpClient>,
        api_base: &str,
        account_id: &str,
        namespace_id: &str,
        api_token: &str,
    ) -> Self {
        let namespace_url = format!(
            "{}/client/v4/accounts/{}/storage/kv/namespaces/{}",
            api_base.trim_end_matches('/'),
            account_id,
            namespace_id
        );
        Self {
            http,
            namespace_url,
            authorization: format!("Bearer {}", api_token),
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.namespace_url, urlencoding::encode(key))
    }

    fn list_url(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/keys?prefix={}&limit={}",
            self.namespace_url,
            urlencoding::encode(prefix),
            limit.clamp(10, 1000)
        );
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            url.push_str("&cursor=");
            url.push_str(&urlencoding::encode(cursor));
        }
        url
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
    ) -> Result<crate::auth::HttpResponse> {
        let headers = [
            ("Authorization", self.authorization.as_str()),
            ("Content-Type", "text/plain"),
        ];
        self.http
            .send(method, url, &headers, body)
            .await
            .map_err(|e| Error::Kv(format!("cloudflare request failed: {}", e)))
    }
}

fn kv_failure(op: &str, status: u16, body: &str) -> Error {
    Error::Kv(format!("cloudflare {} returned {}: {}", op, status, body))
}

fn parse_list(body: &[u8]) -> Result<KvPage> {
    let parsed: ListResponse = serde_json::from_slice(body)
        .map_err(|e| Error::Kv(format!("invalid cloudflare key listing: {}", e)))?;
    let cursor = parsed
        .result_info
        .and_then(|info| info.cursor)
        .filter(|c| !c.is_empty());
    Ok(KvPage {
        keys: parsed.result.into_iter().map(|k| k.name).collect(),
        list_complete: cursor.is_none(),
        cursor,
    })
}

#[async_trait]
impl KvStore for CloudflareKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self.call(Method::GET, &self.value_url(key), None).await?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => Ok(Some(response.text())),
            status => Err(kv_failure("get", status, &response.text())),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut url = self.value_url(key);
        if let Some(ttl) = ttl_secs {
            url.push_str(&format!(
                "?expiration_ttl={}",
                ttl.max(MIN_EXPIRATION_TTL)
            ));
        }
        let response = self
            .call(Method::PUT, &url, Some(Bytes::copy_from_slice(value.as_bytes())))
            .await?;
        if !response.is_success() {
            return Err(kv_failure("put", response.status, &response.text()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.call(Method::DELETE, &self.value_url(key), None).await?;
        if !response.is_success() && response.status != 404 {
            return Err(kv_failure("delete", response.status, &response.text()));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<KvPage> {
        let url = self.list_url(prefix, limit, cursor);
        let response = self.call(Method::GET, &url, None).await?;
        if !response.is_success() {
            return Err(kv_failure("list", response.status, &response.text()));
        }
        parse_list(&response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CloudflareKv {
        CloudflareKv::new(
            Arc::new(HttpClient::new()),
            "https://api.cloudflare.com/",
            "acct",
            "ns",
            "secret",
        )
    }

    #[test]
    fn test_value_url_encodes_key() {
        assert_eq!(
            store().value_url("cred:alice:a/b"),
            "https://api.cloudflare.com/client/v4/accounts/acct/storage/kv/namespaces/ns/values/cred%3Aalice%3Aa%2Fb"
        );
    }

    #[test]
    fn test_list_url() {
        let kv = store();
        assert_eq!(
            kv.list_url("user:", 1000, None),
            "https://api.cloudflare.com/client/v4/accounts/acct/storage/kv/namespaces/ns/keys?prefix=user%3A&limit=1000"
        );
        assert!(kv.list_url("user:", 5000, Some("abc")).ends_with("&limit=1000&cursor=abc"));
    }

    #[test]
    fn test_parse_list_pages() {
        let body = br#"{"success":true,"result":[{"name":"user:a"},{"name":"user:b"}],"result_info":{"count":2,"cursor":"next"}}"#;
        let page = parse_list(body).unwrap();
        assert_eq!(page.keys, vec!["user:a", "user:b"]);
        assert_eq!(page.cursor.as_deref(), Some("next"));
        assert!(!page.list_complete);

        let last = parse_list(br#"{"result":[],"result_info":{"cursor":""}}"#).unwrap();
        assert!(last.list_complete);
        assert!(last.cursor.is_none());
    }

    #[test]
    fn test_bearer_header() {
        assert_eq!(store().authorization, "Bearer secret");
    }
}
