use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod duration;
pub mod logging;
pub mod redact;

pub use duration::parse_go_duration;
pub use redact::Redacted;

// ============================================================================
// Decision Types
// ============================================================================

/// A raw blocklist decision as emitted by the CrowdSec LAPI decision stream.
///
/// Field names follow the LAPI wire format. Optional fields arrive as `null`
/// for some origins and must never panic downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Remediation type: "ban" applies a block, "delete" lifts one.
    #[serde(rename = "type")]
    pub action: String,
    /// Decision scope: "ip" or "range".
    #[serde(default)]
    pub scope: Option<String>,
    /// IP address or CIDR text, as sent by the LAPI.
    pub value: String,
    /// Scenario that produced the decision (e.g. "crowdsecurity/ssh-bf").
    #[serde(default)]
    pub scenario: Option<String>,
    /// Decision origin (e.g. "CAPI", "crowdsec", "cscli").
    #[serde(default)]
    pub origin: Option<String>,
    /// Remaining duration as a Go duration string (e.g. "3h59m42s").
    #[serde(default)]
    pub duration: Option<String>,
}

/// Normalized remediation action after filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanAction {
    Ban,
    Delete,
}

impl BanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanAction::Ban => "ban",
            BanAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for BanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running a decision through the filter pipeline.
///
/// `value` is the canonical IP/CIDR text after sanitization and is the key
/// used everywhere downstream (store, shards, group members).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterVerdict {
    pub action: BanAction,
    pub value: String,
    pub ipv6: bool,
    /// Parsed ban duration, when the decision carried a parseable one.
    pub duration: Option<std::time::Duration>,
}

/// The filter stage that rejected a decision, used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterStage {
    Action,
    Scenario,
    Origin,
    Scope,
    Parse,
    Private,
    Whitelist,
    MinDuration,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Action => "action",
            FilterStage::Scenario => "scenario",
            FilterStage::Origin => "origin",
            FilterStage::Scope => "scope",
            FilterStage::Parse => "parse",
            FilterStage::Private => "private",
            FilterStage::Whitelist => "whitelist",
            FilterStage::MinDuration => "min_duration",
        }
    }
}

// ============================================================================
// Persisted Record Types
// ============================================================================

/// A persisted ban, keyed by canonical IP/CIDR text in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub recorded_at: DateTime<Utc>,
    /// Expiry instant; `None` means the ban never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub ipv6: bool,
}

impl BanEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Local mirror of one controller firewall group, keyed by generated name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub unifi_id: String,
    pub site: String,
    /// Sorted member list as last acknowledged by the controller.
    pub members: Vec<String>,
    pub ipv6: bool,
}

/// Which provisioning mode owns a persisted rule/policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Legacy,
    Zone,
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyMode::Legacy => f.write_str("legacy"),
            PolicyMode::Zone => f.write_str("zone"),
        }
    }
}

/// Local mirror of one controller rule or zone policy, keyed by generated name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub unifi_id: String,
    pub site: String,
    pub mode: PolicyMode,
}

/// Address family of a shard sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Family::V6)
    }

    pub fn from_ipv6(ipv6: bool) -> Self {
        if ipv6 {
            Family::V6
        } else {
            Family::V4
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
