use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kv::{KvStore, get_json, put_json};
use crate::upstream::CopilotClient;

/// Models served without premium quota.
pub const FREE_MODELS: &[&str] = &[
    "gpt-5-mini",
    "gpt-4o-2024-11-20",
    "grok-code-fast-1",
    "oswe-vscode-prime",
];

/// KV key of the shared model list.
pub const MODELS_CACHE_KEY: &str = "modelsCache";

/// One entry of the upstream model list; unknown fields are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(default)]
    pub free: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Flag models on `allow_list` as free and list them first, in allow-list order.
///
/// The sort is stable, so the other models keep their upstream order, and
/// annotating an annotated list changes nothing.
pub fn annotate(models: &[ModelDescriptor], allow_list: &[&str]) -> Vec<ModelDescriptor> {
    let rank = |id: &str| {
        allow_list
            .iter()
            .position(|allowed| *allowed == id)
            .unwrap_or(usize::MAX)
    };
    let mut annotated: Vec<ModelDescriptor> = models
        .iter()
        .map(|m| ModelDescriptor {
            free: rank(&m.id) != usize::MAX,
            ..m.clone()
        })
        .collect();
    annotated.sort_by_key(|m| rank(&m.id));
    annotated
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedModels {
    data: Vec<ModelDescriptor>,
    #[serde(rename = "fetchedAt")]
    fetched_at: String,
}

/// Entries of an upstream `{data: [...]}` body; entries without an id are skipped.
pub fn parse_model_list(body: &[u8]) -> Result<Vec<ModelDescriptor>> {
    let value: Value = serde_json::from_slice(body)?;
    let entries = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Http("model list has no `data` array".to_string()))?;
    Ok(entries
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect())
}

/// Annotated model list, served from KV when fresh and fetched otherwise.
pub async fn list_models(
    kv: &dyn KvStore,
    copilot: &CopilotClient,
    base: &str,
    upstream_token: &str,
    ttl_secs: u64,
) -> Result<Vec<ModelDescriptor>> {
    if let Some(cached) = get_json::<CachedModels>(kv, MODELS_CACHE_KEY).await? {
        debug!(fetched_at = %cached.fetched_at, count = cached.data.len(), "Model list cache hit");
        return Ok(annotate(&cached.data, FREE_MODELS));
    }

    let body = copilot.models(base, upstream_token).await?;
    let models = parse_model_list(&body)?;

    let entry = CachedModels {
        data: models,
        fetched_at: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(e) = put_json(kv, MODELS_CACHE_KEY, &entry, Some(ttl_secs)).await {
        warn!(error = %e, "Failed to cache model list");
    }
    Ok(annotate(&entry.data, FREE_MODELS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn model(id: &str) -> ModelDescriptor {
        serde_json::from_value(json!({"id": id})).unwrap()
    }

    fn ids(models: &[ModelDescriptor]) -> Vec<(&str, bool)> {
        models.iter().map(|m| (m.id.as_str(), m.free)).collect()
    }

    #[test]
    fn test_free_models_first() {
        let out = annotate(&[model("b"), model("a")], &["a"]);
        assert_eq!(ids(&out), vec![("a", true), ("b", false)]);
    }

    #[test]
    fn test_stable_within_groups() {
        let input: Vec<_> = ["p1", "f1", "p2", "f2", "p3"].into_iter().map(model).collect();
        let out = annotate(&input, &["f1", "f2"]);
        assert_eq!(
            ids(&out),
            vec![
                ("f1", true),
                ("f2", true),
                ("p1", false),
                ("p2", false),
                ("p3", false)
            ]
        );
    }

    #[test]
    fn test_free_models_follow_allow_list_order() {
        let input: Vec<_> = ["x", "grok-code-fast-1", "gpt-5-mini"].into_iter().map(model).collect();
        let out = annotate(&input, FREE_MODELS);
        assert_eq!(
            ids(&out),
            vec![("gpt-5-mini", true), ("grok-code-fast-1", true), ("x", false)]
        );
    }

    #[test]
    fn test_idempotent_and_input_untouched() {
        let input = vec![model("gpt-4.1"), model("gpt-5-mini")];
        let once = annotate(&input, FREE_MODELS);
        let twice = annotate(&once, FREE_MODELS);
        assert_eq!(once, twice);
        assert_eq!(input[0].id, "gpt-4.1");
        assert!(!input[1].free);
    }

    #[test]
    fn test_stale_free_flag_is_recomputed() {
        let mut stale = model("x");
        stale.free = true;
        let out = annotate(&[stale], &[]);
        assert!(!out[0].free);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let body = json!({"data": [
            {"id": "gpt-4o", "vendor": "Azure OpenAI", "model_picker_enabled": true, "capabilities": {"family": "gpt-4o"}},
            {"name": "no id"}
        ]});
        let models = parse_model_list(body.to_string().as_bytes()).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].vendor.as_deref(), Some("Azure OpenAI"));

        let out = serde_json::to_value(&models[0]).unwrap();
        assert_eq!(out["model_picker_enabled"], true);
        assert_eq!(out["capabilities"]["family"], "gpt-4o");
        assert_eq!(out["free"], false);
        assert!(out.get("name").is_none());
    }

    #[test]
    fn test_parse_requires_data() {
        assert!(parse_model_list(b"{}").is_err());
        assert!(parse_model_list(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_cached_list_is_annotated() {
        let kv = MemoryKv::new();
        let entry = CachedModels {
            data: vec![model("claude-x"), model("grok-code-fast-1")],
            fetched_at: "2025-01-01T00:00:00Z".to_string(),
        };
        put_json(&kv, MODELS_CACHE_KEY, &entry, None).await.unwrap();

        let copilot = CopilotClient::new(&crate::config::UpstreamConfig::default());
        let out = list_models(&kv, &copilot, "http://127.0.0.1:9", "tok", 60)
            .await
            .unwrap();
        assert_eq!(ids(&out), vec![("grok-code-fast-1", true), ("claude-x", false)]);
    }
}
