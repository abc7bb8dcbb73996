use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

use super::manager::{TokenManager, validate_credential};
use crate::error::{AuthError, Result};
use crate::kv::{self, KvStore};

const USER_PREFIX: &str = "user:";
const CRED_PREFIX: &str = "cred:";
const PASSWORD_PREFIX: &str = "acpc-";
const PASSWORD_SUFFIX_LEN: usize = 10;
const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid username regex"));

static PASSWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^acpc-[A-Za-z0-9]{10}$").expect("valid password regex"));

/// What a registration stores: who, the gateway password, and the GitHub credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub username: String,
    pub password: String,
    pub long_term_token: String,
    pub created_at: String,
}

pub fn is_valid_username(username: &str) -> bool {
    USERNAME_RE.is_match(username)
}

pub fn is_valid_password(password: &str) -> bool {
    PASSWORD_RE.is_match(password)
}

/// `acpc-` followed by ten random alphanumerics.
pub fn generate_password() -> String {
    let mut password = String::with_capacity(PASSWORD_PREFIX.len() + PASSWORD_SUFFIX_LEN);
    password.push_str(PASSWORD_PREFIX);

    // Rejection sampling keeps the alphabet uniform.
    let limit = (256 / ALPHANUMERIC.len() * ALPHANUMERIC.len()) as u8;
    while password.len() < PASSWORD_PREFIX.len() + PASSWORD_SUFFIX_LEN {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes).expect("Failed to generate random bytes");
        for b in bytes {
            if b < limit && password.len() < PASSWORD_PREFIX.len() + PASSWORD_SUFFIX_LEN {
                password.push(ALPHANUMERIC[b as usize % ALPHANUMERIC.len()] as char);
            }
        }
    }
    password
}

fn registration_id() -> String {
    let mut bytes = [0u8; 12];
    getrandom::fill(&mut bytes).expect("Failed to generate random bytes");
    URL_SAFE_NO_PAD.encode(bytes)
}

fn index_key(username: &str) -> String {
    format!("{}{}", USER_PREFIX, username)
}

/// Username → credential registry backed by the KV store.
///
/// `user:<name>` points at the current `cred:<name>:<id>` entry so that a
/// re-registration never exposes a half-written record.
pub struct UserRegistry {
    kv: Arc<dyn KvStore>,
    tokens: Arc<TokenManager>,
}

impl UserRegistry {
    pub fn new(kv: Arc<dyn KvStore>, tokens: Arc<TokenManager>) -> Self {
        Self { kv, tokens }
    }

    /// Create or replace the registration for `username`.
    ///
    /// A missing password is generated. Returns the stored record.
    pub async fn register(
        &self,
        username: &str,
        password: Option<&str>,
        long_term_token: &str,
    ) -> Result<CredentialRecord> {
        let username = username.trim().to_lowercase();
        if !is_valid_username(&username) {
            return Err(AuthError::InvalidUsername.into());
        }
        let password = match password.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) if is_valid_password(p) => p.to_string(),
            Some(_) => return Err(AuthError::InvalidPassword.into()),
            None => generate_password(),
        };
        let long_term_token = long_term_token.trim();
        validate_credential(long_term_token)?;

        let record = CredentialRecord {
            username: username.clone(),
            password,
            long_term_token: long_term_token.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let index = index_key(&username);
        let previous_key = self.kv.get(&index).await?;
        let previous = match &previous_key {
            Some(key) => kv::get_json::<CredentialRecord>(self.kv.as_ref(), key).await?,
            None => None,
        };

        let cred_key = format!("{}{}:{}", CRED_PREFIX, username, registration_id());
        kv::put_json(self.kv.as_ref(), &cred_key, &record, None).await?;
        self.kv.put(&index, &cred_key, None).await?;

        if let Some(old_key) = previous_key.filter(|k| k != &cred_key) {
            if let Err(e) = self.kv.delete(&old_key).await {
                warn!(username = %username, error = %e, "Failed to delete replaced credential");
            }
        }
        if let Some(old) = previous
            && let Err(e) = self.tokens.invalidate(&old.long_term_token).await
        {
            warn!(username = %username, error = %e, "Failed to invalidate replaced token");
        }

        info!(username = %username, "Registered user");
        Ok(record)
    }

    /// Current record for `username`, if registered.
    pub async fn lookup(&self, username: &str) -> Result<Option<CredentialRecord>> {
        if !is_valid_username(username) {
            return Err(AuthError::InvalidUsername.into());
        }
        let Some(cred_key) = self.kv.get(&index_key(username)).await? else {
            return Ok(None);
        };
        kv::get_json(self.kv.as_ref(), &cred_key).await
    }

    /// Resolve `username` and check `password` against the stored record.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<CredentialRecord> {
        let record = self
            .lookup(username)
            .await?
            .ok_or(AuthError::UnknownUser)?;
        if password.is_empty() {
            return Err(AuthError::MissingBearer.into());
        }
        if record.password != password {
            return Err(AuthError::InvalidCredentials.into());
        }
        Ok(record)
    }

    /// Remove a registration after an exact password match.
    pub async fn delete(&self, username: &str, password: &str) -> Result<()> {
        let record = self.authenticate(username, password).await?;
        let index = index_key(username);
        let cred_key = self.kv.get(&index).await?;

        // Index first: an orphaned credential is unreachable, a dangling index is not.
        self.kv.delete(&index).await?;
        if let Some(key) = cred_key {
            self.kv.delete(&key).await?;
        }
        if let Err(e) = self.tokens.invalidate(&record.long_term_token).await {
            warn!(username = %username, error = %e, "Failed to invalidate deleted token");
        }

        info!(username = %username, "Deleted user");
        Ok(())
    }

    /// Registered usernames, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = kv::list_all(self.kv.as_ref(), USER_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(USER_PREFIX).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::TokenExchanger;
    use crate::error::Error;
    use crate::kv::MemoryKv;
    use async_trait::async_trait;

    struct NeverExchange;

    #[async_trait]
    impl TokenExchanger for NeverExchange {
        async fn exchange(&self, _long_term: &str) -> Result<String> {
            Err(Error::AuthExchange("not in tests".to_string()))
        }
    }

    fn registry() -> (UserRegistry, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let tokens = Arc::new(TokenManager::new(kv.clone(), Arc::new(NeverExchange)));
        (UserRegistry::new(kv.clone(), tokens), kv)
    }

    #[test]
    fn test_username_rules() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("team-7-bot"));
        assert!(!is_valid_username("Alice"));
        assert!(!is_valid_username("-alice"));
        assert!(!is_valid_username("alice-"));
        assert!(!is_valid_username("al--ice"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("a_b"));
    }

    #[test]
    fn test_generated_password_shape() {
        for _ in 0..20 {
            let p = generate_password();
            assert!(is_valid_password(&p), "bad password {}", p);
        }
        assert!(!is_valid_password("acpc-short"));
        assert!(!is_valid_password("acpc-abcdefghij!"));
        assert!(!is_valid_password("xxxx-abcdefghij"));
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let (registry, _) = registry();
        let record = registry
            .register("alice", Some("acpc-AbCdEf1234"), "ghu_alice")
            .await
            .unwrap();
        assert_eq!(record.password, "acpc-AbCdEf1234");

        let found = registry.authenticate("alice", "acpc-AbCdEf1234").await.unwrap();
        assert_eq!(found.long_term_token, "ghu_alice");

        assert!(matches!(
            registry.authenticate("alice", "acpc-wrongwrong").await,
            Err(Error::Auth(AuthError::InvalidCredentials))
        ));
        assert!(matches!(
            registry.authenticate("bob", "acpc-AbCdEf1234").await,
            Err(Error::Auth(AuthError::UnknownUser))
        ));
        assert!(matches!(
            registry.authenticate("Bad_Name", "x").await,
            Err(Error::Auth(AuthError::InvalidUsername))
        ));
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.register("alice", None, "ghp_classic").await,
            Err(Error::Auth(AuthError::InvalidCredentialFormat))
        ));
        assert!(matches!(
            registry.register("alice", Some("hunter2"), "ghu_x").await,
            Err(Error::Auth(AuthError::InvalidPassword))
        ));
        let generated = registry.register("alice", None, "gho_x").await.unwrap();
        assert!(is_valid_password(&generated.password));
    }

    #[tokio::test]
    async fn test_reregistration_rotates_credential_key() {
        let (registry, kv) = registry();
        registry
            .register("alice", Some("acpc-AAAAAAAAAA"), "ghu_old")
            .await
            .unwrap();
        let first_key = kv.get("user:alice").await.unwrap().unwrap();

        registry
            .register("alice", Some("acpc-BBBBBBBBBB"), "ghu_new")
            .await
            .unwrap();
        let second_key = kv.get("user:alice").await.unwrap().unwrap();

        assert_ne!(first_key, second_key);
        assert!(second_key.starts_with("cred:alice:"));
        assert!(kv.get(&first_key).await.unwrap().is_none());

        let creds = kv::list_all(kv.as_ref(), "cred:alice:").await.unwrap();
        assert_eq!(creds, vec![second_key]);

        assert!(registry.authenticate("alice", "acpc-AAAAAAAAAA").await.is_err());
        let record = registry.authenticate("alice", "acpc-BBBBBBBBBB").await.unwrap();
        assert_eq!(record.long_term_token, "ghu_new");
    }

    #[tokio::test]
    async fn test_delete_requires_password() {
        let (registry, kv) = registry();
        registry
            .register("alice", Some("acpc-AAAAAAAAAA"), "ghu_a")
            .await
            .unwrap();

        assert!(registry.delete("alice", "acpc-ZZZZZZZZZZ").await.is_err());
        assert!(kv.get("user:alice").await.unwrap().is_some());

        registry.delete("alice", "acpc-AAAAAAAAAA").await.unwrap();
        assert!(kv.get("user:alice").await.unwrap().is_none());
        assert!(kv::list_all(kv.as_ref(), "cred:").await.unwrap().is_empty());
        assert!(matches!(
            registry.authenticate("alice", "acpc-AAAAAAAAAA").await,
            Err(Error::Auth(AuthError::UnknownUser))
        ));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let (registry, _) = registry();
        for name in ["zed", "alice", "mid-user"] {
            registry.register(name, None, "ghu_x").await.unwrap();
        }
        assert_eq!(registry.list().await.unwrap(), vec!["alice", "mid-user", "zed"]);
    }
}
