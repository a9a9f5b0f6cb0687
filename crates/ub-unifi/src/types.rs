//! Controller wire types.
//!
//! Legacy endpoints speak the classic `{"meta": ..., "data": [...]}` envelope
//! with snake_case fields; the v2 zone endpoints use bare camelCase JSON.

use serde::{Deserialize, Serialize};

/// Address-group flavour, one per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    #[serde(rename = "address-group")]
    AddressGroup,
    #[serde(rename = "ipv6-address-group")]
    Ipv6AddressGroup,
}

impl GroupType {
    pub fn for_ipv6(ipv6: bool) -> Self {
        if ipv6 {
            GroupType::Ipv6AddressGroup
        } else {
            GroupType::AddressGroup
        }
    }
}

/// One controller firewall address group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallGroup {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "group_type")]
    pub group_type: GroupType,
    #[serde(rename = "group_members", default)]
    pub members: Vec<String>,
}

impl FirewallGroup {
    pub fn new(name: impl Into<String>, ipv6: bool, members: Vec<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            group_type: GroupType::for_ipv6(ipv6),
            members,
        }
    }
}

/// One legacy firewall rule (WAN_IN / WANv6_IN rulesets).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub ruleset: String,
    pub rule_index: u32,
    /// "drop" or "reject".
    pub action: String,
    pub enabled: bool,
    #[serde(default)]
    pub src_firewallgroup_ids: Vec<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub logging: bool,
}

fn default_protocol() -> String {
    "all".to_string()
}

/// Zone policy match side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEndpoint {
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_group_id: Vec<String>,
}

impl PolicyEndpoint {
    pub fn any(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            matching_target: None,
            ip_group_id: Vec::new(),
        }
    }

    pub fn ip_group(zone_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            matching_target: Some("IP".to_string()),
            ip_group_id: vec![group_id.into()],
        }
    }
}

/// One zone-based firewall policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZonePolicy {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Always "BLOCK" for managed policies.
    pub action: String,
    /// "IPV4", "IPV6" or "BOTH".
    pub ip_version: String,
    pub source: PolicyEndpoint,
    pub destination: PolicyEndpoint,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub predefined: bool,
}

/// One firewall zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

/// Classic API response envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub meta: EnvelopeMeta,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default)]
    pub rc: String,
    #[serde(default)]
    pub msg: Option<String>,
}

impl EnvelopeMeta {
    pub fn is_error(&self) -> bool {
        self.rc == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_serializes_without_id_when_unset() {
        let group = FirewallGroup::new("crowdsec-v4-0", false, vec!["1.1.1.1".into()]);
        let json = serde_json::to_value(&group).unwrap();
        assert!(json.get("_id").is_none());
        assert_eq!(json["group_type"], "address-group");
        assert_eq!(json["group_members"][0], "1.1.1.1");
    }

    #[test]
    fn envelope_with_error_meta() {
        let raw = r#"{"meta":{"rc":"error","msg":"api.err.Duplicate"},"data":[]}"#;
        let env: Envelope<FirewallGroup> = serde_json::from_str(raw).unwrap();
        assert!(env.meta.is_error());
        assert_eq!(env.meta.msg.as_deref(), Some("api.err.Duplicate"));
    }

    #[test]
    fn zone_policy_camel_case() {
        let policy = ZonePolicy {
            id: None,
            name: "crowdsec-ext-int-v4-0".to_string(),
            action: "BLOCK".to_string(),
            ip_version: "IPV4".to_string(),
            source: PolicyEndpoint::ip_group("z1", "g1"),
            destination: PolicyEndpoint::any("z2"),
            enabled: true,
            index: None,
            predefined: false,
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["ipVersion"], "IPV4");
        assert_eq!(json["source"]["matchingTarget"], "IP");
        assert_eq!(json["source"]["ipGroupId"][0], "g1");
    }
}
