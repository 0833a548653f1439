use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::{
    websocket_url, ApiClientOptions, ClientError, ClientResult, RetryPolicy, TransportOptions,
};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "chat_cli.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base_url: String,
    /// Derived from `api_base_url` when unset.
    pub realtime_url: Option<String>,
    pub credentials_database_url: String,
    pub request_timeout_secs: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000/api".into(),
            realtime_url: None,
            credentials_database_url: "sqlite://./data/chat_cli.db".into(),
            request_timeout_secs: 30,
            handshake_timeout_ms: 10_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 8,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    realtime_url: Option<String>,
    credentials_database_url: Option<String>,
    request_timeout_secs: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
}

impl Settings {
    pub fn api_options(&self) -> ApiClientOptions {
        ApiClientOptions {
            base_url: self.api_base_url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.reconnect_max_attempts,
        )
    }

    pub fn transport_options(&self) -> ClientResult<TransportOptions> {
        let url = match &self.realtime_url {
            Some(raw) => Url::parse(raw)
                .map_err(|err| ClientError::Decode(format!("invalid realtime url '{raw}': {err}")))?,
            None => websocket_url(&self.api_base_url)?,
        };
        Ok(TransportOptions {
            url,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            retry: self.retry_policy(),
        })
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file.realtime_url {
            self.realtime_url = Some(v);
        }
        if let Some(v) = file.credentials_database_url {
            self.credentials_database_url = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file.handshake_timeout_ms {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = file.reconnect_base_delay_ms {
            self.reconnect_base_delay_ms = v;
        }
        if let Some(v) = file.reconnect_max_delay_ms {
            self.reconnect_max_delay_ms = v;
        }
        if let Some(v) = file.reconnect_max_attempts {
            self.reconnect_max_attempts = v;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = var("APP__API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = var("APP__REALTIME_URL") {
            self.realtime_url = Some(v);
        }
        if let Some(v) = var("APP__CREDENTIALS_DATABASE_URL") {
            self.credentials_database_url = v;
        }

        let numeric = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(v) = numeric("APP__REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = numeric("APP__HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = numeric("APP__RECONNECT_BASE_DELAY_MS") {
            self.reconnect_base_delay_ms = v;
        }
        if let Some(v) = numeric("APP__RECONNECT_MAX_DELAY_MS") {
            self.reconnect_max_delay_ms = v;
        }
        if let Some(v) = var("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.reconnect_max_attempts = v;
        }
    }
}

/// Defaults, then the optional config file, then `APP__*` environment overrides.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    match fs::read_to_string(path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
            settings.apply_file(file);
        }
        Err(err) if config_path.is_some() => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()));
        }
        Err(_) => {}
    }

    settings.apply_env(|name| std::env::var(name).ok());
    Ok(settings)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().credentials_database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.replace('\\', "/");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
