use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PORT: u16 = 8989;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Timeout for token refresh HTTP calls. Streaming chat calls have no fixed
/// timeout; they are bounded by the client disconnecting.
pub const REFRESH_TIMEOUT_SECS: u64 = 30;

/// Minimum remaining token validity required before opening a long stream.
pub const STREAMING_MIN_VALIDITY_SECS: i64 = 600;

/// IDE product string the upstream expects in the User-Agent.
pub const UPSTREAM_IDE_VERSION: &str = "KiroIDE-0.7.45";

/// Environment variables recognised on top of `kirogate.toml`.
const ENV_KEYS: &[&str] = &[
    "PROXY_API_KEY",
    "REFRESH_TOKEN",
    "PROFILE_ARN",
    "KIRO_REGION",
    "KIRO_BASE_URL",
    "KIRO_CREDS_FILE",
    "KIRO_DB_FILE",
    "RATE_LIMIT_RPM",
    "TOKEN_REFRESH_THRESHOLD",
    "BACKGROUND_REFRESH_INTERVAL",
    "TOOL_DESCRIPTION_MAX_LENGTH",
    "FAKE_REASONING_ENABLED",
    "FAKE_REASONING_MAX_TOKENS",
    "TRUNCATION_RECOVERY",
];

/// Top-level config (kirogate.toml + bare env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bearer token clients must present on every data endpoint.
    pub proxy_api_key: String,
    /// Upstream refresh token(s). Comma-separated values select the
    /// multi-token pool.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
    #[serde(default = "default_region")]
    pub kiro_region: String,
    /// Overrides the region-derived upstream host, for deployments that
    /// front the upstream with their own proxy. No trailing slash.
    #[serde(default)]
    pub kiro_base_url: Option<String>,
    /// Optional JSON credentials file (Kiro Desktop / Enterprise IDE).
    #[serde(default)]
    pub kiro_creds_file: Option<String>,
    /// Optional kiro-cli SQLite database with an `auth_kv` table.
    #[serde(default)]
    pub kiro_db_file: Option<String>,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Requests per minute surfaced to the deployment's limiter.
    /// 0 disables. Enforcement lives outside the gateway.
    #[serde(default)]
    pub rate_limit_rpm: u32,
    /// Seconds of remaining validity below which a token counts as expiring.
    #[serde(default = "default_refresh_threshold")]
    pub token_refresh_threshold: i64,
    /// Seconds between background refresh sweeps.
    #[serde(default = "default_background_interval")]
    pub background_refresh_interval: u64,
    /// Tool descriptions longer than this many bytes move to the system
    /// prompt. 0 disables the rewrite.
    #[serde(default = "default_tool_description_max")]
    pub tool_description_max_length: usize,
    #[serde(default)]
    pub fake_reasoning_enabled: bool,
    #[serde(default = "default_fake_reasoning_max_tokens")]
    pub fake_reasoning_max_tokens: u32,
    #[serde(default = "bool_true")]
    pub truncation_recovery: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_api_key: String::new(),
            refresh_token: None,
            profile_arn: None,
            kiro_region: default_region(),
            kiro_base_url: None,
            kiro_creds_file: None,
            kiro_db_file: None,
            bind: default_bind(),
            port: default_port(),
            rate_limit_rpm: 0,
            token_refresh_threshold: default_refresh_threshold(),
            background_refresh_interval: default_background_interval(),
            tool_description_max_length: default_tool_description_max(),
            fake_reasoning_enabled: false,
            fake_reasoning_max_tokens: default_fake_reasoning_max_tokens(),
            truncation_recovery: true,
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file with bare env var overrides.
    ///
    /// Checks in order: explicit path argument, `./kirogate.toml`.
    /// Env vars always win over file values.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("kirogate.toml");

        let config: GatewayConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;

        Ok(config)
    }

    /// Refresh tokens split out of the comma-separated env value.
    pub fn refresh_tokens(&self) -> Vec<String> {
        self.refresh_token
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Kiro Desktop Auth refresh endpoint for a region.
pub fn kiro_refresh_url(region: &str) -> String {
    format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
}

/// AWS SSO OIDC token endpoint for a (possibly SSO-specific) region.
pub fn oidc_token_url(sso_region: &str) -> String {
    format!("https://oidc.{sso_region}.amazonaws.com/token")
}

/// Upstream API host for a region.
pub fn kiro_api_host(region: &str) -> String {
    format!("https://codewhisperer.{region}.amazonaws.com")
}

/// Upstream chat endpoint for a region.
pub fn kiro_chat_url(region: &str) -> String {
    format!("{}/generateAssistantResponse", kiro_api_host(region))
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_refresh_threshold() -> i64 {
    300
}
fn default_background_interval() -> u64 {
    1800
}
fn default_tool_description_max() -> usize {
    10_240
}
fn default_fake_reasoning_max_tokens() -> u32 {
    8_192
}
fn bool_true() -> bool {
    true
}
