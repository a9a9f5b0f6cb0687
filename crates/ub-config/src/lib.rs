//! Bouncer configuration.
//!
//! TOML-based configuration with environment variable override support.
//! Every tunable that shapes the projection engine lives here; components
//! receive their section by value at construction, never through globals.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use ub_common::Redacted;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub lapi: LapiConfig,
    pub unifi: UnifiConfig,
    pub firewall: FirewallConfig,
    pub filter: FilterConfig,
    pub pool: PoolConfig,
    pub rate_gate: RateGateConfig,
    pub reconcile: ReconcileConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,

    /// Log intended controller writes without performing them.
    pub dry_run: bool,
    /// Fallback TTL for bans whose decision carries no duration; zero means
    /// such bans never expire.
    #[serde(with = "humantime_serde")]
    pub ban_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lapi: LapiConfig::default(),
            unifi: UnifiConfig::default(),
            firewall: FirewallConfig::default(),
            filter: FilterConfig::default(),
            pool: PoolConfig::default(),
            rate_gate: RateGateConfig::default(),
            reconcile: ReconcileConfig::default(),
            store: StoreConfig::default(),
            http: HttpConfig::default(),
            dry_run: false,
            ban_ttl: Duration::ZERO,
            janitor_interval: Duration::from_secs(300),
        }
    }
}

/// CrowdSec LAPI connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LapiConfig {
    pub url: String,
    pub api_key: Redacted,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Interval for usage-metrics reporting back to the LAPI; zero disables.
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
    pub insecure_skip_verify: bool,
}

impl Default for LapiConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            api_key: Redacted::default(),
            poll_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(1800),
            insecure_skip_verify: false,
        }
    }
}

/// UniFi controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiConfig {
    pub url: String,
    pub username: String,
    pub password: Redacted,
    /// Controller API key; when set, used instead of username/password.
    pub api_key: Redacted,
    /// Sites the bouncer manages. Every ban fans out to each unless the job
    /// carries an explicit site.
    pub sites: Vec<String>,
    /// UniFi OS console (UDM and friends) vs. classic software controller.
    pub is_unifi_os: bool,
    pub insecure_skip_verify: bool,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Thundering-herd gap: re-logins within this window of the previous
    /// successful one are suppressed.
    #[serde(with = "humantime_serde")]
    pub min_reauth_interval: Duration,
}

impl Default for UnifiConfig {
    fn default() -> Self {
        Self {
            url: "https://192.168.1.1".to_string(),
            username: String::new(),
            password: Redacted::default(),
            api_key: Redacted::default(),
            sites: vec!["default".to_string()],
            is_unifi_os: true,
            insecure_skip_verify: false,
            timeout: Duration::from_secs(30),
            min_reauth_interval: Duration::from_secs(10),
        }
    }
}

/// Projection mode for firewall state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallMode {
    /// Probe the controller per site; zone policies if supported, else legacy.
    Auto,
    /// Legacy WAN_IN / WANv6_IN drop rules.
    Legacy,
    /// Zone-based firewall policies.
    Zone,
}

/// Action taken by legacy block rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockAction {
    Drop,
    Reject,
}

impl BlockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockAction::Drop => "drop",
            BlockAction::Reject => "reject",
        }
    }
}

/// One `src->dst` ordered zone tuple naming a policy slot in zone mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZonePair {
    pub src: String,
    pub dst: String,
}

impl ZonePair {
    /// Parse the `src->dst` config syntax.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (src, dst) = raw.split_once("->").ok_or_else(|| {
            ConfigError::Validation(format!(
                "zone pair '{raw}' must use the 'src->dst' form"
            ))
        })?;
        let (src, dst) = (src.trim(), dst.trim());
        if src.is_empty() || dst.is_empty() {
            return Err(ConfigError::Validation(format!(
                "zone pair '{raw}' has an empty side"
            )));
        }
        Ok(Self {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }
}

/// Firewall projection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub mode: FirewallMode,
    pub enable_ipv6: bool,
    /// Maximum members per firewall group (controller-imposed ceiling).
    pub group_capacity: usize,
    /// Optional per-family capacity overrides.
    pub group_capacity_v4: Option<usize>,
    pub group_capacity_v6: Option<usize>,
    /// Coalescing window between an Apply call and the batch flush.
    #[serde(with = "humantime_serde")]
    pub batch_window: Duration,
    /// Pause between consecutive shard writes within one flush or prune.
    #[serde(with = "humantime_serde")]
    pub api_shard_delay: Duration,
    /// Global cap on concurrent group writes across all sites and families;
    /// zero means unbounded.
    pub flush_concurrency: usize,
    /// Name templates; placeholders: {family} {index} {site} {src} {dst}.
    pub group_name_template: String,
    pub rule_name_template: String,
    pub policy_name_template: String,

    // Legacy mode
    pub rule_index_start_v4: u32,
    pub rule_index_start_v6: u32,
    pub ruleset_v4: String,
    pub ruleset_v6: String,
    pub block_action: BlockAction,
    pub log_drops: bool,

    // Zone mode
    /// `src->dst` pairs, one policy slot per pair per shard.
    pub zone_pairs: Vec<String>,
    /// Keep managed policies ordered ahead of unmanaged ones.
    pub zone_policy_reorder: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            mode: FirewallMode::Auto,
            enable_ipv6: true,
            group_capacity: 10_000,
            group_capacity_v4: None,
            group_capacity_v6: None,
            batch_window: Duration::from_secs(5),
            api_shard_delay: Duration::from_millis(500),
            flush_concurrency: 0,
            group_name_template: "crowdsec-{family}-{index}".to_string(),
            rule_name_template: "crowdsec-block-{family}-{index}".to_string(),
            policy_name_template: "crowdsec-{src}-{dst}-{family}-{index}".to_string(),
            rule_index_start_v4: 22_000,
            rule_index_start_v6: 27_000,
            ruleset_v4: "WAN_IN".to_string(),
            ruleset_v6: "WANv6_IN".to_string(),
            block_action: BlockAction::Drop,
            log_drops: false,
            zone_pairs: vec!["External->Internal".to_string()],
            zone_policy_reorder: false,
        }
    }
}

impl FirewallConfig {
    pub fn capacity_for(&self, ipv6: bool) -> usize {
        let over = if ipv6 {
            self.group_capacity_v6
        } else {
            self.group_capacity_v4
        };
        over.unwrap_or(self.group_capacity)
    }

    pub fn parsed_zone_pairs(&self) -> Result<Vec<ZonePair>, ConfigError> {
        self.zone_pairs.iter().map(|p| ZonePair::parse(p)).collect()
    }
}

/// Decision filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Admitted remediation types, compared case-insensitively.
    pub allowed_actions: Vec<String>,
    pub allowed_scopes: Vec<String>,
    /// Empty list admits every origin, including absent ones.
    pub allowed_origins: Vec<String>,
    /// Substrings; a match anywhere in the scenario rejects the decision.
    pub scenario_excludes: Vec<String>,
    /// CIDRs (or bare addresses) that are never banned.
    pub whitelist: Vec<String>,
    /// Bans shorter than this are ignored; zero disables the check.
    #[serde(with = "humantime_serde")]
    pub min_ban_duration: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allowed_actions: vec!["ban".to_string(), "delete".to_string()],
            allowed_scopes: vec!["ip".to_string(), "range".to_string()],
            allowed_origins: Vec::new(),
            scenario_excludes: Vec::new(),
            whitelist: Vec::new(),
            min_ban_duration: Duration::ZERO,
        }
    }
}

impl FilterConfig {
    /// Parse the whitelist into networks; bare addresses become host routes.
    pub fn whitelist_nets(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.whitelist
            .iter()
            .map(|raw| parse_net_or_host(raw))
            .collect()
    }
}

/// Parse CIDR text, treating a bare address as /32 or /128.
pub fn parse_net_or_host(raw: &str) -> Result<IpNet, ConfigError> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ConfigError::Validation(format!("'{raw}' is not an IP or CIDR")))
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_depth: usize,
    /// Additional attempts after the first; zero means exactly one attempt.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 512,
            max_retries: 4,
            retry_base: Duration::from_secs(2),
        }
    }
}

/// Rolling-window rate gate settings for controller group updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateGateConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Calls admitted per window; zero or negative disables the gate.
    pub max_calls: i64,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_calls: 0,
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub on_start: bool,
    /// Periodic full reconcile; zero disables.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            on_start: true,
            interval: Duration::from_secs(3600),
        }
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./data/unifi-bouncer.db".to_string(),
        }
    }
}

/// Local health/metrics listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl AppConfig {
    /// Load and parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 || self.pool.workers > 64 {
            return Err(ConfigError::Validation(format!(
                "pool.workers must be between 1 and 64, got {}",
                self.pool.workers
            )));
        }
        if self.pool.queue_depth == 0 {
            return Err(ConfigError::Validation(
                "pool.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.firewall.group_capacity == 0
            || self.firewall.group_capacity_v4 == Some(0)
            || self.firewall.group_capacity_v6 == Some(0)
        {
            return Err(ConfigError::Validation(
                "firewall.group_capacity must be at least 1".to_string(),
            ));
        }
        if self.unifi.sites.is_empty() {
            return Err(ConfigError::Validation(
                "unifi.sites must name at least one site".to_string(),
            ));
        }
        self.firewall.parsed_zone_pairs()?;
        self.filter.whitelist_nets()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_worker_range() {
        let mut config = AppConfig::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());
        config.pool.workers = 65;
        assert!(config.validate().is_err());
        config.pool.workers = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zone_pair_parsing() {
        let pair = ZonePair::parse("External -> Internal").unwrap();
        assert_eq!(pair.src, "External");
        assert_eq!(pair.dst, "Internal");
        assert!(ZonePair::parse("External").is_err());
        assert!(ZonePair::parse("->Internal").is_err());
    }

    #[test]
    fn whitelist_bare_address_becomes_host_net() {
        let mut filter = FilterConfig::default();
        filter.whitelist = vec!["203.0.113.7".to_string(), "10.0.0.0/8".to_string()];
        let nets = filter.whitelist_nets().unwrap();
        assert_eq!(nets[0].prefix_len(), 32);
        assert_eq!(nets[1].prefix_len(), 8);
    }

    #[test]
    fn toml_round_trip_with_durations() {
        let raw = r#"
            dry_run = true
            ban_ttl = "4h"

            [pool]
            workers = 8
            retry_base = "1s"

            [firewall]
            mode = "legacy"
            batch_window = "10s"

            [filter]
            min_ban_duration = "30s"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.ban_ttl, Duration::from_secs(4 * 3600));
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.firewall.mode, FirewallMode::Legacy);
        assert_eq!(config.filter.min_ban_duration, Duration::from_secs(30));
        config.validate().unwrap();
    }
}
