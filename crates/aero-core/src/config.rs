use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Gateway-wide constants
pub const DEFAULT_PORT: u16 = 18300;
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Response header carrying the server conversation id.
pub const CONVERSATION_HEADER: &str = "X-AG-Conversation-Id";
/// Signatures shorter than this are never valid.
pub const MIN_SIGNATURE_LEN: usize = 10;
/// Hard cap shared by thinking budget + minimum output headroom.
pub const THINKING_HARD_CAP: u32 = 32_000;
/// Output tokens that must remain free after the thinking budget.
pub const MIN_OUTPUT_TOKENS: u32 = 1_024;
/// Floor for max_tokens on thinking-enabled requests.
pub const MIN_MAX_TOKENS: u32 = 16_384;

/// Top-level config (aero.toml + AERO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AeroConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    /// Disable a credential permanently after an auth failure.
    #[serde(default = "bool_true")]
    pub auto_ban: bool,
    /// Lenient request parsing for clients that send non-standard fields.
    #[serde(default)]
    pub compatibility_mode: bool,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl Default for AeroConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            conversation: ConversationConfig::default(),
            outbound: OutboundConfig::default(),
            auto_ban: true,
            compatibility_mode: false,
            backends: Vec::new(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on every API request.
    pub api_password: Option<String>,
    /// Accepted for interface compatibility; the control panel ships separately.
    pub panel_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_password: None,
            panel_password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Rotate to the next credential after this many calls on one credential.
    #[serde(default = "default_calls_per_rotation")]
    pub calls_per_rotation: u32,
    #[serde(default = "default_retry_429_max_attempts")]
    pub retry_429_max_attempts: u32,
    #[serde(default = "default_retry_429_base_delay_ms")]
    pub retry_429_base_delay_ms: u64,
    /// Extra full-request retries when a response ends without a finish reason.
    #[serde(default = "default_anti_truncation")]
    pub anti_truncation_max_attempts: u32,
    /// Cooldown applied on quota exhaustion when upstream sends no retry-after.
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    /// Credentials with any monitored model below this quota fraction are skipped.
    #[serde(default = "default_quota_floor")]
    pub quota_floor: f64,
    /// Optional end-to-end deadline bounding the whole chain-retry loop.
    #[serde(default)]
    pub request_deadline_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            calls_per_rotation: default_calls_per_rotation(),
            retry_429_max_attempts: default_retry_429_max_attempts(),
            retry_429_base_delay_ms: default_retry_429_base_delay_ms(),
            anti_truncation_max_attempts: default_anti_truncation(),
            default_cooldown_secs: default_cooldown_secs(),
            quota_floor: default_quota_floor(),
            request_deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// Write-through signature mirror in the storage dir (opt-in).
    #[serde(default)]
    pub mirror: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            mirror: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding credential JSON files and the sqlite databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Conversations idle longer than this are expired.
    #[serde(default = "default_conversation_ttl")]
    pub idle_ttl_secs: u64,
    /// Persist conversation states to sqlite.
    #[serde(default)]
    pub persist: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_conversation_ttl(),
            persist: false,
        }
    }
}

/// Outbound HTTP routing. All upstream calls go through `proxy` when set;
/// `oauth_proxy` and `googleapis_proxy` override it for the token endpoints
/// and the Gemini API host respectively.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutboundConfig {
    pub proxy: Option<String>,
    pub oauth_proxy: Option<String>,
    pub googleapis_proxy: Option<String>,
}

/// Wire dialect an upstream backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAi => "openai",
            ApiFormat::Anthropic => "anthropic",
            ApiFormat::Gemini => "gemini",
        }
    }
}

/// A single upstream backend entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Short identifier used in routes and the /{key}/v1/... prefix.
    pub key: String,
    /// Human-readable name for diagnostics. Defaults to `key`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// One or more base URLs, rotated round-robin on connect failure.
    pub base_urls: Vec<String>,
    pub api_format: ApiFormat,
    /// Lower numbers are tried first when no explicit route matches.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Static API keys. Credential files in the storage dir add to the pool.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Models this backend accepts. Empty means wildcard.
    #[serde(default)]
    pub models: Vec<String>,
}

impl BackendConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.key)
    }

    /// Whether this backend accepts the given model. Empty list = wildcard;
    /// a trailing `*` in an entry matches by prefix.
    pub fn accepts_model(&self, model: &str) -> bool {
        if self.models.is_empty() {
            return true;
        }
        self.models.iter().any(|m| match m.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => m == model,
        })
    }
}

/// One step of an explicit routing chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStep {
    pub backend: String,
    /// Rewrites the model name for this backend when set.
    #[serde(default)]
    pub model: Option<String>,
}

/// Maps a model pattern to an ordered backend chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Exact model name, or a prefix ending in `*`.
    pub model_pattern: String,
    pub chain: Vec<RouteStep>,
}

impl RouteRule {
    pub fn matches(&self, model: &str) -> bool {
        match self.model_pattern.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => self.model_pattern == model,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_calls_per_rotation() -> u32 {
    100
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_429_max_attempts() -> u32 {
    3
}
fn default_retry_429_base_delay_ms() -> u64 {
    500
}
fn default_anti_truncation() -> u32 {
    2
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_quota_floor() -> f64 {
    0.1
}
fn default_cache_entries() -> usize {
    10_000
}
fn default_conversation_ttl() -> u64 {
    3_600
}
fn default_priority() -> i32 {
    100
}
fn default_timeout() -> u64 {
    60
}
fn default_stream_timeout() -> u64 {
    300
}
fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.aero", home)
}

impl AeroConfig {
    /// Load config from a TOML file with AERO_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. AERO_CONFIG env var
    ///   3. ~/.aero/aero.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("AERO_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: AeroConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("AERO_").split("__"))
            .extract()
            .map_err(|e| crate::error::AeroError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the router cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        for b in &self.backends {
            if b.base_urls.is_empty() {
                return Err(crate::error::AeroError::Config(format!(
                    "backend '{}' has no base_urls",
                    b.key
                )));
            }
        }
        for r in &self.routes {
            for step in &r.chain {
                if !self.backends.iter().any(|b| b.key == step.backend) {
                    return Err(crate::error::AeroError::Config(format!(
                        "route '{}' references unknown backend '{}'",
                        r.model_pattern, step.backend
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn backend(&self, key: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.key == key)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.aero/aero.toml", home)
}
