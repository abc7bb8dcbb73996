//! Durable key-value storage for credentials, cached tokens and the model list.

pub mod cloudflare;
pub mod file;
pub mod memory;

pub use cloudflare::CloudflareKv;
pub use file::FileKv;
pub use memory::MemoryKv;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::auth::HttpClient;
use crate::config::KvConfig;
use crate::error::{Error, Result};

const LIST_PAGE_LIMIT: usize = 1000;
const LIST_MAX_PAGES: usize = 50;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
    pub list_complete: bool,
}

/// Generic durable map with optional per-key TTL and prefix enumeration.
///
/// Writes are upserts. No multi-key atomicity is provided.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `ttl_secs` of `None` keeps the value until deleted.
    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<KvPage>;
}

/// Collect every key under `prefix`, following cursors for at most 50 pages.
pub async fn list_all(kv: &dyn KvStore, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..LIST_MAX_PAGES {
        let page = kv.list(prefix, LIST_PAGE_LIMIT, cursor.as_deref()).await?;
        keys.extend(page.keys);
        if page.list_complete || page.cursor.is_none() {
            break;
        }
        cursor = page.cursor;
    }

    Ok(keys)
}

/// Read and decode a JSON value; undecodable values read as absent.
pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = kv.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Ignoring undecodable KV value");
            Ok(None)
        }
    }
}

pub async fn put_json<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    kv.put(key, &raw, ttl_secs).await
}

/// Build the configured backend.
pub fn from_config(config: &KvConfig, http: Arc<HttpClient>) -> Result<Arc<dyn KvStore>> {
    match config.backend.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryKv::new())),
        "file" => Ok(Arc::new(FileKv::new(config.file_path()))),
        "cloudflare" => {
            if config.cf_account_id.is_empty()
                || config.cf_namespace_id.is_empty()
                || config.cf_api_token.is_empty()
            {
                return Err(Error::Kv(
                    "cloudflare backend needs cf_account_id, cf_namespace_id and cf_api_token"
                        .to_string(),
                ));
            }
            Ok(Arc::new(CloudflareKv::new(
                http,
                &config.cf_api_base,
                &config.cf_account_id,
                &config.cf_namespace_id,
                &config.cf_api_token,
            )))
        }
        other => Err(Error::Kv(format!("unknown kv backend '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_all_follows_cursor() {
        let kv = MemoryKv::new();
        for i in 0..2500 {
            kv.put(&format!("user:{:05}", i), "x", None).await.unwrap();
        }
        kv.put("other", "x", None).await.unwrap();

        let keys = list_all(&kv, "user:").await.unwrap();
        assert_eq!(keys.len(), 2500);
        assert_eq!(keys[0], "user:00000");
        assert_eq!(keys[2499], "user:02499");
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let kv = MemoryKv::new();
        put_json(&kv, "k", &serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        let value: Option<serde_json::Value> = get_json(&kv, "k").await.unwrap();
        assert_eq!(value.unwrap()["a"], 1);

        kv.put("bad", "not json", None).await.unwrap();
        let bad: Option<serde_json::Value> = get_json(&kv, "bad").await.unwrap();
        assert!(bad.is_none());
    }

    #[test]
    fn test_from_config_rejects_incomplete_cloudflare() {
        let config = KvConfig {
            backend: "cloudflare".to_string(),
            ..KvConfig::default()
        };
        let result = from_config(&config, Arc::new(HttpClient::new()));
        assert!(matches!(result, Err(Error::Kv(_))));
    }
}
