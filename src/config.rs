use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

/// `http(s)://host/api` -> `ws(s)://host/ws`
pub fn derive_ws_url(api_base_url: &str) -> String {
    let s = api_base_url.trim().trim_end_matches('/');
    let (scheme, rest) = match s.split_once("://") {
        Some(("https", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", s),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{scheme}://{host}/ws")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Backend
    pub api_base_url: String,
    pub push_ws_url: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub http_timeout_secs: u64,

    // Refresh / retry
    pub accounts_refresh_secs: u64,
    pub subscription_refresh_secs: u64,
    pub fetch_max_retries: u32,
    pub fetch_retry_base_ms: u64,
    pub push_reconnect_max_secs: u64,

    // Storage
    pub sqlite_path: String,
    pub snapshot_interval_secs: u64,
    pub snapshot_retention_hours: u64,

    // Dashboard
    pub dashboard_enabled: bool,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    pub dashboard_enable_admin: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let api_base_url = get_env_string("API_BASE_URL", "http://127.0.0.1:5000/api")
            .trim_end_matches('/')
            .to_string();
        let push_ws_url = get_env("PUSH_WS_URL").unwrap_or_else(|| derive_ws_url(&api_base_url));

        let dashboard_port = get_env_u64("DASHBOARD_PORT", 8010)?;
        let dashboard_port = u16::try_from(dashboard_port)
            .map_err(|_| anyhow!("DASHBOARD_PORT out of range (got {dashboard_port})"))?;

        let fetch_max_retries = get_env_u64("FETCH_MAX_RETRIES", 3)?;
        let fetch_max_retries = u32::try_from(fetch_max_retries)
            .map_err(|_| anyhow!("FETCH_MAX_RETRIES out of range (got {fetch_max_retries})"))?;

        let s = Self {
            api_base_url,
            push_ws_url,
            api_token: get_env("API_TOKEN"),
            http_timeout_secs: get_env_u64("HTTP_TIMEOUT_SECS", 15)?,
            accounts_refresh_secs: get_env_u64("ACCOUNTS_REFRESH_SECS", 30)?,
            subscription_refresh_secs: get_env_u64("SUBSCRIPTION_REFRESH_SECS", 300)?,
            fetch_max_retries,
            fetch_retry_base_ms: get_env_u64("FETCH_RETRY_BASE_MS", 500)?,
            push_reconnect_max_secs: get_env_u64("PUSH_RECONNECT_MAX_SECS", 30)?,
            sqlite_path: get_env_string("SQLITE_PATH", "./data/copydesk.sqlite"),
            snapshot_interval_secs: get_env_u64("SNAPSHOT_INTERVAL_SECS", 10)?,
            snapshot_retention_hours: get_env_u64("SNAPSHOT_RETENTION_HOURS", 72)?,
            dashboard_enabled: get_env_bool("DASHBOARD_ENABLED", true),
            dashboard_host: get_env_string("DASHBOARD_HOST", "127.0.0.1"),
            dashboard_port,
            dashboard_enable_admin: get_env_bool("DASHBOARD_ENABLE_ADMIN", false),
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(anyhow!(
                "API_BASE_URL must start with http:// or https:// (got {})",
                self.api_base_url
            ));
        }
        if !(self.push_ws_url.starts_with("ws://") || self.push_ws_url.starts_with("wss://")) {
            return Err(anyhow!(
                "PUSH_WS_URL must start with ws:// or wss:// (got {})",
                self.push_ws_url
            ));
        }
        if self.http_timeout_secs < 1 {
            return Err(anyhow!("HTTP_TIMEOUT_SECS must be >= 1 (got {})", self.http_timeout_secs));
        }
        if self.accounts_refresh_secs < 1 {
            return Err(anyhow!(
                "ACCOUNTS_REFRESH_SECS must be >= 1 (got {})",
                self.accounts_refresh_secs
            ));
        }
        if self.subscription_refresh_secs < 1 {
            return Err(anyhow!(
                "SUBSCRIPTION_REFRESH_SECS must be >= 1 (got {})",
                self.subscription_refresh_secs
            ));
        }
        if self.fetch_max_retries > 10 {
            return Err(anyhow!(
                "FETCH_MAX_RETRIES must be <= 10 (got {})",
                self.fetch_max_retries
            ));
        }
        if self.push_reconnect_max_secs < 1 {
            return Err(anyhow!(
                "PUSH_RECONNECT_MAX_SECS must be >= 1 (got {})",
                self.push_reconnect_max_secs
            ));
        }
        if self.snapshot_interval_secs < 1 {
            return Err(anyhow!(
                "SNAPSHOT_INTERVAL_SECS must be >= 1 (got {})",
                self.snapshot_interval_secs
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".to_string(),
            push_ws_url: "ws://127.0.0.1:5000/ws".to_string(),
            api_token: None,
            http_timeout_secs: 5,
            accounts_refresh_secs: 30,
            subscription_refresh_secs: 300,
            fetch_max_retries: 2,
            fetch_retry_base_ms: 1,
            push_reconnect_max_secs: 1,
            sqlite_path: ":memory:".to_string(),
            snapshot_interval_secs: 10,
            snapshot_retention_hours: 72,
            dashboard_enabled: false,
            dashboard_host: "127.0.0.1".to_string(),
            dashboard_port: 8010,
            dashboard_enable_admin: true,
        }
    }
}
