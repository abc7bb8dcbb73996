use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
        valid_values: Vec<String>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                path,
                field,
                value,
                valid_values,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}\n  Valid values: {}",
                    value,
                    field,
                    path.display(),
                    valid_values.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

pub const ACCOUNT_TYPES: &[&str] = &["individual", "business", "enterprise"];
const KV_BACKENDS: &[&str] = &["memory", "file", "cloudflare"];

/// acpc configuration loaded from `~/.config/acpc/config.toml`.
///
/// All fields have defaults; CLI flags and environment variables override them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Time allowed until upstream response headers arrive (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Log translated upstream payloads
    #[serde(default)]
    pub log_requests: bool,
}

/// Upstream provider endpoints and client identity.
///
/// Example in `config.toml`:
/// ```toml
/// [upstream]
/// account_type = "business"
/// timeout_secs = 120
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// "individual", "business" or "enterprise"
    #[serde(default = "default_account_type")]
    pub account_type: String,
    /// Explicit chat API base; empty derives it from `account_type`
    #[serde(default)]
    pub api_base: String,
    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,
    #[serde(default = "default_github_base")]
    pub github_base: String,
    #[serde(default = "default_vscode_version")]
    pub vscode_version: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_models_cache_ttl")]
    pub models_cache_ttl_secs: u64,
}

fn default_account_type() -> String {
    "individual".to_string()
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_github_base() -> String {
    "https://github.com".to_string()
}

fn default_vscode_version() -> String {
    "1.98.0-insider".to_string()
}

fn default_api_timeout() -> u64 {
    120
}

fn default_models_cache_ttl() -> u64 {
    3600
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            account_type: default_account_type(),
            api_base: String::new(),
            github_api_base: default_github_api_base(),
            github_base: default_github_base(),
            vscode_version: default_vscode_version(),
            timeout_secs: default_api_timeout(),
            models_cache_ttl_secs: default_models_cache_ttl(),
        }
    }
}

impl UpstreamConfig {
    /// Chat API base URL for an account type, honouring an explicit `api_base`.
    pub fn api_base_for(&self, account_type: &str) -> String {
        if !self.api_base.is_empty() {
            return self.api_base.trim_end_matches('/').to_string();
        }
        match account_type {
            "individual" => "https://api.githubcopilot.com".to_string(),
            other => format!("https://api.{}.githubcopilot.com", other),
        }
    }
}

/// Key-value store backing credentials and cached tokens.
///
/// Example in `config.toml`:
/// ```toml
/// [kv]
/// backend = "cloudflare"
/// cf_account_id = "..."
/// cf_namespace_id = "..."
/// cf_api_token = "..."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// "memory", "file" or "cloudflare"
    #[serde(default = "default_kv_backend")]
    pub backend: String,
    /// File backend location; empty means `<config dir>/kv.json`
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_cf_api_base")]
    pub cf_api_base: String,
    #[serde(default)]
    pub cf_account_id: String,
    #[serde(default)]
    pub cf_namespace_id: String,
    #[serde(default)]
    pub cf_api_token: String,
}

fn default_kv_backend() -> String {
    "file".to_string()
}

fn default_cf_api_base() -> String {
    "https://api.cloudflare.com".to_string()
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: default_kv_backend(),
            path: String::new(),
            cf_api_base: default_cf_api_base(),
            cf_account_id: String::new(),
            cf_namespace_id: String::new(),
            cf_api_token: String::new(),
        }
    }
}

impl KvConfig {
    pub fn file_path(&self) -> PathBuf {
        if self.path.is_empty() {
            Config::dir().join("kv.json")
        } else {
            PathBuf::from(&self.path)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Fallback GitHub token for the un-prefixed `/v1/*` routes
    #[serde(default)]
    pub long_term_token: Option<String>,
}

fn default_port() -> u16 {
    8787
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    pub fn dir() -> PathBuf {
        paths::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("acpc")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                source: e,
            })?;
            Self::parse(&content, path)
        } else {
            Ok(Self::default())
        }
    }

    fn parse(content: &str, path: PathBuf) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.clone(),
            source: e,
        })?;

        let account_type = config.upstream.account_type.to_lowercase();
        if !ACCOUNT_TYPES.contains(&account_type.as_str()) {
            return Err(ConfigError::InvalidValue {
                path,
                field: "upstream.account_type".to_string(),
                value: config.upstream.account_type,
                valid_values: ACCOUNT_TYPES.iter().map(|s| s.to_string()).collect(),
            });
        }

        let backend = config.kv.backend.to_lowercase();
        if !KV_BACKENDS.contains(&backend.as_str()) {
            return Err(ConfigError::InvalidValue {
                path,
                field: "kv.backend".to_string(),
                value: config.kv.backend,
                valid_values: KV_BACKENDS.iter().map(|s| s.to_string()).collect(),
            });
        }

        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn host(&self) -> &str {
        &self.server.host
    }

    pub fn with_overrides(mut self, port: Option<u16>, host: Option<String>, debug: bool) -> Self {
        if let Ok(p) = std::env::var("PORT")
            && let Ok(p) = p.parse::<u16>()
        {
            self.server.port = p;
        }
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if debug {
            self.logging.debug = true;
        }
        if let Ok(token) = std::env::var("LONG_TERM_TOKEN")
            && !token.trim().is_empty()
        {
            self.auth.long_term_token = Some(token.trim().to_string());
        }
        self.apply_cloudflare_env(|name| std::env::var(name).ok());
        self
    }

    /// Apply `CF_*` variables; a complete account/namespace/token triple selects the
    /// Cloudflare backend.
    fn apply_cloudflare_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(base) = var("CF_API_BASE_URL") {
            self.kv.cf_api_base = base;
        }
        if let Some(account) = var("CF_ACCOUNT_ID") {
            self.kv.cf_account_id = account;
        }
        if let Some(ns) = var("CF_KV_NAMESPACE_ID") {
            self.kv.cf_namespace_id = ns;
        }
        if let Some(token) = var("CF_API_TOKEN") {
            self.kv.cf_api_token = token;
        }
        if !self.kv.cf_account_id.is_empty()
            && !self.kv.cf_namespace_id.is_empty()
            && !self.kv.cf_api_token.is_empty()
        {
            self.kv.backend = "cloudflare".to_string();
        }
    }
}

pub mod paths {
    use std::path::PathBuf;

    /// `~/.config` on macOS and Linux (XDG aware), `%APPDATA%` on Windows.
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        }
        #[cfg(target_os = "windows")]
        {
            dirs::config_dir()
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows")))]
        {
            dirs::home_dir().map(|h| h.join(".config"))
        }
    }
}
