use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::backoff::ReconnectPolicy;
use crate::store::{DuplicatePolicy, DEFAULT_WINDOW_CAPACITY};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub farm_id: Option<String>,
    pub device_id: Option<String>,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub window_capacity: usize,
    pub history_limit: usize,
    pub history_refresh_secs: u64,
    pub dedup_samples: bool,
    pub online_threshold_secs: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: "http://localhost:8000/api/v1".to_string(),
            ws_url: "ws://localhost:8000".to_string(),
            farm_id: None,
            device_id: None,
            auth_token: None,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            history_limit: DEFAULT_WINDOW_CAPACITY,
            history_refresh_secs: 60,
            dedup_samples: false,
            online_threshold_secs: 120,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let api_url = env::var("API_URL").unwrap_or(defaults.api_url);
        let ws_url = env::var("WS_URL").unwrap_or(defaults.ws_url);
        let farm_id = env::var("FARM_ID").ok();
        let device_id = env::var("DEVICE_ID").ok();
        let auth_token = env::var("AUTH_TOKEN").ok();

        let window_capacity = get_env_var_u64("WINDOW_CAPACITY", defaults.window_capacity as u64) as usize;
        let history_limit = get_env_var_u64("HISTORY_LIMIT", defaults.history_limit as u64) as usize;
        let history_refresh_secs = get_env_var_u64("HISTORY_REFRESH_SECS", defaults.history_refresh_secs);
        let dedup_samples = get_env_var_bool("DEDUP_SAMPLES", defaults.dedup_samples);
        let online_threshold_secs = get_env_var_u64("ONLINE_THRESHOLD_SECS", defaults.online_threshold_secs);

        let reconnect = ReconnectPolicy {
            enabled: get_env_var_bool("RECONNECT_ENABLED", defaults.reconnect.enabled),
            base_ms: get_env_var_u64("RECONNECT_BASE_MS", defaults.reconnect.base_ms),
            max_ms: get_env_var_u64("RECONNECT_MAX_MS", defaults.reconnect.max_ms),
            max_attempts: get_env_var_u64("RECONNECT_MAX_ATTEMPTS", defaults.reconnect.max_attempts as u64) as u32,
        };

        let config = Config {
            api_url,
            ws_url,
            farm_id,
            device_id,
            auth_token,
            window_capacity,
            history_limit,
            history_refresh_secs,
            dedup_samples,
            online_threshold_secs,
            reconnect,
        };
        config.validate()?;
        Ok(config)
    }

    /// The config file when there is one, the environment otherwise. A file
    /// that exists but does not parse or validate is an error.
    pub fn load() -> Result<Self> {
        Self::load_or_env(&Self::get_config_file_path())
    }

    fn load_or_env(path: &Path) -> Result<Self> {
        match Self::load_from_path(path) {
            Ok(mut config) => {
                // The token is never stored in the file.
                if config.auth_token.is_none() {
                    config.auth_token = env::var("AUTH_TOKEN").ok();
                }
                Ok(config)
            }
            Err(e) if is_not_found(&e) => {
                tracing::debug!(path = %path.display(), "No config file, reading environment");
                Self::from_env()
            }
            Err(e) => Err(e.context(format!("invalid config file {}", path.display()))),
        }
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("dashboard_config.json")
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        if self.dedup_samples {
            DuplicatePolicy::DropSameTimestamp
        } else {
            DuplicatePolicy::KeepAll
        }
    }

    fn validate(&self) -> Result<()> {
        if self.window_capacity == 0 {
            bail!("window_capacity must be at least 1");
        }
        if self.reconnect.base_ms > self.reconnect.max_ms {
            bail!(
                "reconnect base delay ({} ms) exceeds max delay ({} ms)",
                self.reconnect.base_ms,
                self.reconnect.max_ms
            );
        }
        for url in [&self.api_url, &self.ws_url] {
            url::Url::parse(url)?;
        }
        Ok(())
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn get_env_var_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|val| match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}
