//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable holding the hosted project URL.
pub const ENV_URL: &str = "SUPABASE_URL";
/// Environment variable holding the public anon key.
pub const ENV_ANON_KEY: &str = "SUPABASE_ANON_KEY";
/// Environment variable holding a signed-in user's access token.
pub const ENV_ACCESS_TOKEN: &str = "CATALOG_ACCESS_TOKEN";

/// Main configuration for the catalog daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Hosted store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Realtime change notifications
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    #[serde(default)]
    pub url: Option<String>,

    /// Public anon key sent as `apikey`
    #[serde(default)]
    pub anon_key: Option<String>,

    /// Access token of a signed-in user; the anon key is used when absent
    #[serde(default)]
    pub access_token: Option<String>,

    /// Database schema holding the catalog tables
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Per-request timeout in seconds (0 disables the timeout)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            access_token: None,
            schema: default_schema(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Subscribe to change notifications; when off, collections load once
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket endpoint; derived from the store URL when absent
    #[serde(default)]
    pub url: Option<String>,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Longest reconnect delay in milliseconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Give up after this many failed reconnects (unlimited when absent)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            heartbeat_secs: default_heartbeat(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            max_reconnect_attempts: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_heartbeat() -> u64 {
    30
}

fn default_reconnect_initial() -> u64 {
    1_000
}

fn default_reconnect_max() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_file
            );
            let config = Config::default();

            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_URL) {
            self.store.url = Some(url);
        }
        if let Some(key) = get(ENV_ANON_KEY) {
            self.store.anon_key = Some(key);
        }
        if let Some(token) = get(ENV_ACCESS_TOKEN) {
            self.store.access_token = Some(token);
        }
    }
}

impl StoreConfig {
    /// True when both a URL and an anon key are present.
    pub fn is_configured(&self) -> bool {
        self.base_url().is_some() && self.key().is_some()
    }

    /// Project URL without a trailing slash.
    pub fn base_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
    }

    pub fn key(&self) -> Option<&str> {
        self.anon_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Token used for `Authorization: Bearer`.
    pub fn bearer(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.key())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// WebSocket endpoint of the realtime service.
    pub fn realtime_url(&self) -> Option<String> {
        let base = self.base_url()?;
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Some(format!("{ws}/realtime/v1/websocket"))
    }
}

impl Config {
    /// Realtime endpoint: the explicit one, else derived from the store URL.
    pub fn realtime_url(&self) -> Option<String> {
        self.realtime
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.store.realtime_url())
    }
}

impl RealtimeConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
