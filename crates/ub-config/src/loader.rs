//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;
use ub_common::Redacted;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "unifi-bouncer.toml",
    "config.toml",
    "./config/unifi-bouncer.toml",
    "/etc/unifi-bouncer/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("UNIFI_BOUNCER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // LAPI
        if let Ok(val) = env::var("UNIFI_BOUNCER_LAPI_URL") {
            config.lapi.url = val;
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_LAPI_KEY") {
            config.lapi.api_key = Redacted::new(val);
        }

        // Controller
        if let Ok(val) = env::var("UNIFI_BOUNCER_UNIFI_URL") {
            config.unifi.url = val;
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_UNIFI_USER") {
            config.unifi.username = val;
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_UNIFI_PASS") {
            config.unifi.password = Redacted::new(val);
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_UNIFI_API_KEY") {
            config.unifi.api_key = Redacted::new(val);
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_UNIFI_SITES") {
            config.unifi.sites = val.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_UNIFI_SKIP_TLS_VERIFY") {
            config.unifi.insecure_skip_verify = val.parse().unwrap_or(false);
        }

        // Engine
        if let Ok(val) = env::var("UNIFI_BOUNCER_DRY_RUN") {
            config.dry_run = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.pool.workers = workers;
            }
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_IPV6") {
            config.firewall.enable_ipv6 = val.parse().unwrap_or(true);
        }

        // Store and listener
        if let Ok(val) = env::var("UNIFI_BOUNCER_STORE_PATH") {
            config.store.path = val;
        }
        if let Ok(val) = env::var("UNIFI_BOUNCER_LISTEN_ADDR") {
            config.http.listen_addr = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
