use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::token::{ShortLivedToken, TokenExchanger, now_secs};
use crate::error::{AuthError, Error, Result};
use crate::kv::{self, KvStore};

/// KV key holding the process-wide fallback credential.
pub const FALLBACK_CREDENTIAL_KEY: &str = "longTermToken";

type SharedExchange = Shared<BoxFuture<'static, std::result::Result<ShortLivedToken, String>>>;

/// In-process token map plus the table of exchanges currently in flight.
///
/// Both maps are keyed by the long-lived credential. Locks are never held
/// across an await.
#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, ShortLivedToken>>,
    in_flight: Mutex<HashMap<String, SharedExchange>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, credential: &str, now: u64) -> Option<ShortLivedToken> {
        self.tokens
            .lock()
            .get(credential)
            .filter(|t| t.is_servable(now))
            .cloned()
    }

    fn insert(&self, credential: &str, token: ShortLivedToken) {
        self.tokens.lock().insert(credential.to_string(), token);
    }

    fn remove(&self, credential: &str) {
        self.tokens.lock().remove(credential);
    }

    /// Join the exchange in flight for `credential`, or register `start()` as it.
    fn join_or_start(
        &self,
        credential: &str,
        start: impl FnOnce() -> SharedExchange,
    ) -> (SharedExchange, bool) {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(credential) {
            return (existing.clone(), false);
        }
        let flight = start();
        in_flight.insert(credential.to_string(), flight.clone());
        (flight, true)
    }

    fn finish(&self, credential: &str, flight: &SharedExchange) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(credential)
            .is_some_and(|current| current.ptr_eq(flight))
        {
            in_flight.remove(credential);
        }
    }
}

/// Resolves long-lived credentials to servable short-lived upstream tokens.
///
/// Lookup order: in-process cache, KV store, then one de-duplicated exchange.
pub struct TokenManager {
    cache: TokenCache,
    kv: Arc<dyn KvStore>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl TokenManager {
    pub fn new(kv: Arc<dyn KvStore>, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            cache: TokenCache::new(),
            kv,
            exchanger,
        }
    }

    pub async fn resolve_upstream_token(&self, credential: &str) -> Result<ShortLivedToken> {
        let now = now_secs();
        if let Some(token) = self.cache.get(credential, now) {
            return Ok(token);
        }

        let key = kv_token_key(credential);
        match kv::get_json::<ShortLivedToken>(self.kv.as_ref(), &key).await {
            Ok(Some(token)) if token.is_servable(now) => {
                debug!(expiry = token.expiry, "Promoted upstream token from KV");
                self.cache.insert(credential, token.clone());
                return Ok(token);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "KV token lookup failed, exchanging"),
        }

        self.exchange_deduplicated(credential).await
    }

    async fn exchange_deduplicated(&self, credential: &str) -> Result<ShortLivedToken> {
        let (flight, leader) = self.cache.join_or_start(credential, || {
            exchange_and_persist(
                self.exchanger.clone(),
                self.kv.clone(),
                credential.to_string(),
            )
            .boxed()
            .shared()
        });
        if !leader {
            debug!("Joining in-flight token exchange");
        }

        let result = flight.clone().await;

        if let Ok(token) = &result
            && token.is_servable(now_secs())
        {
            self.cache.insert(credential, token.clone());
        }
        self.cache.finish(credential, &flight);

        result.map_err(Error::AuthExchange)
    }

    /// Forget any cached token for `credential`, in process and in KV.
    pub async fn invalidate(&self, credential: &str) -> Result<()> {
        self.cache.remove(credential);
        self.kv.delete(&kv_token_key(credential)).await
    }

    /// Process-wide credential for the un-prefixed routes: config first, then KV.
    pub async fn fallback_credential(&self, configured: Option<&str>) -> Result<String> {
        let credential = match configured.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => c.to_string(),
            None => self
                .kv
                .get(FALLBACK_CREDENTIAL_KEY)
                .await?
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .ok_or(Error::Auth(AuthError::MissingCredential))?,
        };
        validate_credential(&credential)?;
        Ok(credential)
    }

    pub async fn store_fallback_credential(&self, credential: &str) -> Result<()> {
        validate_credential(credential)?;
        self.kv.put(FALLBACK_CREDENTIAL_KEY, credential, None).await
    }
}

async fn exchange_and_persist(
    exchanger: Arc<dyn TokenExchanger>,
    kv: Arc<dyn KvStore>,
    credential: String,
) -> std::result::Result<ShortLivedToken, String> {
    info!("Exchanging GitHub credential for upstream token");
    let raw = exchanger
        .exchange(&credential)
        .await
        .map_err(|e| match e {
            Error::AuthExchange(msg) => msg,
            other => other.to_string(),
        })?;

    let token = ShortLivedToken::from_token(raw);
    let now = now_secs();
    if token.is_servable(now) {
        let ttl = token.kv_ttl(now);
        if let Err(e) = kv::put_json(kv.as_ref(), &kv_token_key(&credential), &token, Some(ttl)).await
        {
            warn!(error = %e, "Failed to persist upstream token");
        }
    } else {
        warn!(
            expiry = token.expiry,
            "Upstream token has no usable expiry, not caching"
        );
    }

    Ok(token)
}

/// Long-lived credentials must be GitHub user or OAuth tokens.
pub fn validate_credential(credential: &str) -> Result<()> {
    if credential.starts_with("ghu") || credential.starts_with("gho") {
        Ok(())
    } else {
        Err(Error::Auth(AuthError::InvalidCredentialFormat))
    }
}

/// `token:<sha256 hex>` so credentials never appear in key listings.
pub fn kv_token_key(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    let mut key = String::with_capacity(6 + 64);
    key.push_str("token:");
    for b in digest {
        use std::fmt::Write;
        let _ = write!(key, "{:02x}", b);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingExchanger {
        calls: AtomicUsize,
        lifetime: u64,
        fail: bool,
    }

    impl CountingExchanger {
        fn new(lifetime: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime: 0,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchanger for CountingExchanger {
        async fn exchange(&self, _long_term: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(Error::AuthExchange("HTTP 401".to_string()));
            }
            Ok(format!(
                "tid=t{};exp={};sku=free",
                n,
                now_secs() + self.lifetime
            ))
        }
    }

    fn manager(exchanger: Arc<CountingExchanger>) -> (Arc<TokenManager>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let m = TokenManager::new(kv.clone(), exchanger);
        (Arc::new(m), kv)
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_exchange() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, _) = manager(exchanger.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.resolve_upstream_token("ghu_same").await.unwrap()
            }));
        }

        let mut tokens = Vec::new();
        for h in handles {
            tokens.push(h.await.unwrap());
        }

        assert_eq!(exchanger.calls(), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
        assert!(tokens[0].token.starts_with("tid=t1;"));
    }

    #[tokio::test]
    async fn test_two_requests_same_credential_identical_token() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, _) = manager(exchanger.clone());

        let (a, b) = tokio::join!(
            manager.resolve_upstream_token("ghu_shared"),
            manager.resolve_upstream_token("ghu_shared")
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_credentials_exchange_separately() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, _) = manager(exchanger.clone());

        let (a, b) = tokio::join!(
            manager.resolve_upstream_token("ghu_one"),
            manager.resolve_upstream_token("ghu_two")
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_token_reused() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, kv) = manager(exchanger.clone());

        let first = manager.resolve_upstream_token("ghu_x").await.unwrap();
        let second = manager.resolve_upstream_token("ghu_x").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exchanger.calls(), 1);

        let stored: ShortLivedToken = kv::get_json(kv.as_ref(), &kv_token_key("ghu_x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn test_near_expiry_token_triggers_exchange() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, kv) = manager(exchanger.clone());

        let now = now_secs();
        for exp in [now + 60, now + 10, now] {
            let stale = ShortLivedToken {
                token: format!("tid=old;exp={}", exp),
                expiry: exp,
            };
            kv::put_json(kv.as_ref(), &kv_token_key("ghu_stale"), &stale, None)
                .await
                .unwrap();
            manager.cache.insert("ghu_stale", stale);

            let before = exchanger.calls();
            let fresh = manager.resolve_upstream_token("ghu_stale").await.unwrap();
            assert_eq!(exchanger.calls(), before + 1);
            assert!(fresh.expiry > now + 60);

            manager.cache.remove("ghu_stale");
            kv.delete(&kv_token_key("ghu_stale")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_kv_token_promoted_without_exchange() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, kv) = manager(exchanger.clone());

        let exp = now_secs() + 900;
        let persisted = ShortLivedToken {
            token: format!("tid=kv;exp={}", exp),
            expiry: exp,
        };
        kv::put_json(kv.as_ref(), &kv_token_key("ghu_kv"), &persisted, Some(840))
            .await
            .unwrap();

        let got = manager.resolve_upstream_token("ghu_kv").await.unwrap();
        assert_eq!(got, persisted);
        assert_eq!(exchanger.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_without_expiry_is_never_cached() {
        struct NoExpiry;

        #[async_trait]
        impl TokenExchanger for NoExpiry {
            async fn exchange(&self, _long_term: &str) -> Result<String> {
                Ok("tid=abc;sku=free".to_string())
            }
        }

        let kv = Arc::new(MemoryKv::new());
        let manager = TokenManager::new(kv.clone(), Arc::new(NoExpiry));

        let token = manager.resolve_upstream_token("ghu_n").await.unwrap();
        assert_eq!(token.expiry, 0);
        assert!(manager.cache.get("ghu_n", 0).is_none());
        assert!(kv.get(&kv_token_key("ghu_n")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_shared_and_not_cached() {
        let exchanger = CountingExchanger::failing();
        let (manager, _) = manager(exchanger.clone());

        let (a, b) = tokio::join!(
            manager.resolve_upstream_token("ghu_bad"),
            manager.resolve_upstream_token("ghu_bad")
        );
        assert!(matches!(a, Err(Error::AuthExchange(ref m)) if m == "HTTP 401"));
        assert!(matches!(b, Err(Error::AuthExchange(ref m)) if m == "HTTP 401"));
        assert_eq!(exchanger.calls(), 1);

        let again = manager.resolve_upstream_token("ghu_bad").await;
        assert!(again.is_err());
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_exchange() {
        let exchanger = CountingExchanger::new(1800);
        let (manager, _) = manager(exchanger.clone());

        manager.resolve_upstream_token("ghu_inv").await.unwrap();
        manager.invalidate("ghu_inv").await.unwrap();
        manager.resolve_upstream_token("ghu_inv").await.unwrap();
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_credential_sources() {
        let (manager, _) = manager(CountingExchanger::new(1800));

        assert!(matches!(
            manager.fallback_credential(None).await,
            Err(Error::Auth(AuthError::MissingCredential))
        ));
        assert!(matches!(
            manager.fallback_credential(Some("ghp_classic")).await,
            Err(Error::Auth(AuthError::InvalidCredentialFormat))
        ));
        assert_eq!(
            manager.fallback_credential(Some(" gho_cfg ")).await.unwrap(),
            "gho_cfg"
        );

        manager.store_fallback_credential("ghu_stored").await.unwrap();
        assert_eq!(manager.fallback_credential(None).await.unwrap(), "ghu_stored");
    }

    #[test]
    fn test_kv_token_key_hides_credential() {
        let key = kv_token_key("ghu_secret");
        assert!(key.starts_with("token:"));
        assert_eq!(key.len(), 6 + 64);
        assert!(!key.contains("ghu_secret"));
        assert_eq!(key, kv_token_key("ghu_secret"));
    }
}
