//! Decision filter pipeline.
//!
//! An ordered eight-stage gate, pure over (decision, config). The first
//! failing stage short-circuits; each rejection increments a per-stage
//! counter. Nil scenario/origin/duration behave as empty and never panic.

use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::trace;
use ub_common::{parse_go_duration, BanAction, Decision, FilterStage, FilterVerdict};
use ub_config::{ConfigError, FilterConfig};

/// Result of one filter evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Accepted(FilterVerdict),
    Rejected(FilterStage),
}

impl FilterOutcome {
    pub fn verdict(self) -> Option<FilterVerdict> {
        match self {
            FilterOutcome::Accepted(verdict) => Some(verdict),
            FilterOutcome::Rejected(_) => None,
        }
    }
}

/// Parsed target of a decision: a single address or a network.
#[derive(Debug, Clone, Copy)]
enum Target {
    Addr(IpAddr),
    Net(IpNet),
}

impl Target {
    fn canonical(&self) -> String {
        match self {
            Target::Addr(addr) => addr.to_string(),
            Target::Net(net) => net.to_string(),
        }
    }

    fn is_ipv6(&self) -> bool {
        match self {
            Target::Addr(addr) => addr.is_ipv6(),
            Target::Net(net) => matches!(net, IpNet::V6(_)),
        }
    }

    fn representative_addr(&self) -> IpAddr {
        match self {
            Target::Addr(addr) => *addr,
            Target::Net(net) => net.network(),
        }
    }

    fn contained_in(&self, net: &IpNet) -> bool {
        match self {
            Target::Addr(addr) => net.contains(addr),
            Target::Net(target) => net.contains(target),
        }
    }
}

pub struct DecisionFilter {
    allowed_actions: Vec<String>,
    allowed_scopes: Vec<String>,
    allowed_origins: Vec<String>,
    scenario_excludes: Vec<String>,
    whitelist: Vec<IpNet>,
    min_ban_duration: Duration,
}

impl DecisionFilter {
    pub fn new(cfg: &FilterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            allowed_actions: lowercase_all(&cfg.allowed_actions),
            allowed_scopes: lowercase_all(&cfg.allowed_scopes),
            allowed_origins: cfg.allowed_origins.clone(),
            scenario_excludes: cfg.scenario_excludes.clone(),
            whitelist: cfg.whitelist_nets()?,
            min_ban_duration: cfg.min_ban_duration,
        })
    }

    /// Run the gate. Deterministic: depends only on the decision and this
    /// filter's configuration.
    pub fn evaluate(&self, decision: &Decision) -> FilterOutcome {
        match self.evaluate_inner(decision) {
            Ok(verdict) => FilterOutcome::Accepted(verdict),
            Err(stage) => {
                metrics::counter!("filter_rejected_total", "stage" => stage.as_str())
                    .increment(1);
                trace!(
                    value = %decision.value,
                    stage = stage.as_str(),
                    "Decision rejected"
                );
                FilterOutcome::Rejected(stage)
            }
        }
    }

    fn evaluate_inner(&self, decision: &Decision) -> Result<FilterVerdict, FilterStage> {
        // 1. Action
        let action_lower = decision.action.to_lowercase();
        if !self.allowed_actions.contains(&action_lower) {
            return Err(FilterStage::Action);
        }
        let action = match action_lower.as_str() {
            "ban" => BanAction::Ban,
            "delete" => BanAction::Delete,
            _ => return Err(FilterStage::Action),
        };

        // 2. Scenario excludes
        let scenario = decision.scenario.as_deref().unwrap_or("");
        if self
            .scenario_excludes
            .iter()
            .any(|needle| scenario.contains(needle.as_str()))
        {
            return Err(FilterStage::Scenario);
        }

        // 3. Origin allow-list; empty list admits everything.
        if !self.allowed_origins.is_empty() {
            let origin = decision.origin.as_deref().unwrap_or("");
            if !self.allowed_origins.iter().any(|o| o == origin) {
                return Err(FilterStage::Origin);
            }
        }

        // 4. Scope
        let scope = decision
            .scope
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !self.allowed_scopes.contains(&scope) || !matches!(scope.as_str(), "ip" | "range")
        {
            return Err(FilterStage::Scope);
        }

        // 5. Parse and sanitize
        let target = parse_target(&decision.value).ok_or(FilterStage::Parse)?;

        // 6. Private / non-routable
        if is_private(&target.representative_addr()) {
            return Err(FilterStage::Private);
        }

        // 7. Whitelist
        if self.whitelist.iter().any(|net| target.contained_in(net)) {
            return Err(FilterStage::Whitelist);
        }

        // 8. Minimum ban duration; deletes bypass, unparseable never rejects.
        let duration = decision
            .duration
            .as_deref()
            .and_then(parse_go_duration);
        if action == BanAction::Ban && !self.min_ban_duration.is_zero() {
            if let Some(d) = duration {
                if d < self.min_ban_duration {
                    return Err(FilterStage::MinDuration);
                }
            }
        }

        Ok(FilterVerdict {
            action,
            value: target.canonical(),
            ipv6: target.is_ipv6(),
            duration,
        })
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

/// Parse an IP or CIDR, normalizing IPv4-mapped IPv6 to plain IPv4.
fn parse_target(value: &str) -> Option<Target> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<IpAddr>() {
        return Some(Target::Addr(unmap(addr)));
    }
    if let Ok(net) = value.parse::<IpNet>() {
        // Canonicalize host bits away: 1.2.3.4/24 -> 1.2.3.0/24.
        return Some(Target::Net(net.trunc()));
    }
    None
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Non-routable source ranges the bouncer refuses to manage.
///
/// RFC1918, loopback, link-local, ULA and CGNAT. Multicast and the
/// TEST-NET documentation ranges are deliberately not in this set.
fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                // 100.64.0.0/10 (CGNAT)
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                // fc00::/7 (ULA)
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 (link-local)
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> DecisionFilter {
        DecisionFilter::new(&FilterConfig::default()).unwrap()
    }

    fn ban(value: &str) -> Decision {
        Decision {
            action: "ban".to_string(),
            scope: Some("ip".to_string()),
            value: value.to_string(),
            scenario: Some("crowdsecurity/ssh-bf".to_string()),
            origin: Some("crowdsec".to_string()),
            duration: Some("4h".to_string()),
        }
    }

    #[test]
    fn accepts_plain_ban() {
        let outcome = filter().evaluate(&ban("203.0.113.10"));
        let verdict = outcome.verdict().unwrap();
        assert_eq!(verdict.action, BanAction::Ban);
        assert_eq!(verdict.value, "203.0.113.10");
        assert!(!verdict.ipv6);
        assert_eq!(verdict.duration, Some(Duration::from_secs(4 * 3600)));
    }

    #[test]
    fn rejects_unknown_action() {
        let mut decision = ban("203.0.113.10");
        decision.action = "captcha".to_string();
        assert_eq!(
            filter().evaluate(&decision),
            FilterOutcome::Rejected(FilterStage::Action)
        );
    }

    #[test]
    fn action_is_case_insensitive() {
        let mut decision = ban("203.0.113.10");
        decision.action = "BAN".to_string();
        assert!(matches!(
            filter().evaluate(&decision),
            FilterOutcome::Accepted(_)
        ));
    }

    #[test]
    fn scenario_exclude_matches_substring() {
        let cfg = FilterConfig {
            scenario_excludes: vec!["ssh".to_string()],
            ..FilterConfig::default()
        };
        let filter = DecisionFilter::new(&cfg).unwrap();
        assert_eq!(
            filter.evaluate(&ban("203.0.113.10")),
            FilterOutcome::Rejected(FilterStage::Scenario)
        );
    }

    #[test]
    fn origin_allow_list() {
        let cfg = FilterConfig {
            allowed_origins: vec!["CAPI".to_string()],
            ..FilterConfig::default()
        };
        let filter = DecisionFilter::new(&cfg).unwrap();

        // Wrong origin rejected.
        assert_eq!(
            filter.evaluate(&ban("203.0.113.10")),
            FilterOutcome::Rejected(FilterStage::Origin)
        );

        // Absent origin rejected when a list is configured.
        let mut decision = ban("203.0.113.10");
        decision.origin = None;
        assert_eq!(
            filter.evaluate(&decision),
            FilterOutcome::Rejected(FilterStage::Origin)
        );

        // Empty allow-list admits absent origins.
        let open = DecisionFilter::new(&FilterConfig::default()).unwrap();
        let mut decision = ban("203.0.113.10");
        decision.origin = None;
        assert!(matches!(
            open.evaluate(&decision),
            FilterOutcome::Accepted(_)
        ));
    }

    #[test]
    fn rejects_unknown_scope() {
        let mut decision = ban("203.0.113.10");
        decision.scope = Some("country".to_string());
        assert_eq!(
            filter().evaluate(&decision),
            FilterOutcome::Rejected(FilterStage::Scope)
        );

        decision.scope = None;
        assert_eq!(
            filter().evaluate(&decision),
            FilterOutcome::Rejected(FilterStage::Scope)
        );
    }

    #[test]
    fn rejects_garbage_value() {
        assert_eq!(
            filter().evaluate(&ban("not-an-ip")),
            FilterOutcome::Rejected(FilterStage::Parse)
        );
    }

    #[test]
    fn normalizes_ipv4_mapped() {
        let verdict = filter()
            .evaluate(&ban("::ffff:203.0.113.10"))
            .verdict()
            .unwrap();
        assert_eq!(verdict.value, "203.0.113.10");
        assert!(!verdict.ipv6);
    }

    #[test]
    fn range_scope_truncates_host_bits() {
        let mut decision = ban("198.51.100.77/24");
        decision.scope = Some("range".to_string());
        let verdict = filter().evaluate(&decision).verdict().unwrap();
        assert_eq!(verdict.value, "198.51.100.0/24");
    }

    #[test]
    fn rejects_private_ranges() {
        for value in [
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "100.64.0.1",
            "100.127.255.254",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:192.168.1.1",
        ] {
            let mut decision = ban(value);
            decision.scope = Some("ip".to_string());
            assert_eq!(
                filter().evaluate(&decision),
                FilterOutcome::Rejected(FilterStage::Private),
                "{value} should be private"
            );
        }
    }

    #[test]
    fn test_net_and_multicast_are_not_private() {
        for value in ["192.0.2.1", "224.0.0.1"] {
            assert!(
                matches!(filter().evaluate(&ban(value)), FilterOutcome::Accepted(_)),
                "{value} should pass the private stage"
            );
        }
    }

    #[test]
    fn whitelist_contains_address_and_range() {
        let cfg = FilterConfig {
            whitelist: vec!["203.0.113.0/24".to_string(), "2001:db8::5".to_string()],
            ..FilterConfig::default()
        };
        let filter = DecisionFilter::new(&cfg).unwrap();

        assert_eq!(
            filter.evaluate(&ban("203.0.113.99")),
            FilterOutcome::Rejected(FilterStage::Whitelist)
        );
        assert_eq!(
            filter.evaluate(&ban("2001:db8::5")),
            FilterOutcome::Rejected(FilterStage::Whitelist)
        );

        // A range inside a whitelisted net is also covered.
        let mut decision = ban("203.0.113.0/25");
        decision.scope = Some("range".to_string());
        assert_eq!(
            filter.evaluate(&decision),
            FilterOutcome::Rejected(FilterStage::Whitelist)
        );

        assert!(matches!(
            filter.evaluate(&ban("198.51.100.9")),
            FilterOutcome::Accepted(_)
        ));
    }

    #[test]
    fn min_duration_gate() {
        let cfg = FilterConfig {
            min_ban_duration: Duration::from_secs(3600),
            ..FilterConfig::default()
        };
        let filter = DecisionFilter::new(&cfg).unwrap();

        let mut short = ban("203.0.113.10");
        short.duration = Some("5m".to_string());
        assert_eq!(
            filter.evaluate(&short),
            FilterOutcome::Rejected(FilterStage::MinDuration)
        );

        // Deletes bypass the check.
        let mut delete = short.clone();
        delete.action = "delete".to_string();
        assert!(matches!(
            filter.evaluate(&delete),
            FilterOutcome::Accepted(_)
        ));

        // Unparseable and missing durations pass through.
        let mut odd = ban("203.0.113.10");
        odd.duration = Some("soon".to_string());
        assert!(matches!(filter.evaluate(&odd), FilterOutcome::Accepted(_)));
        odd.duration = None;
        assert!(matches!(filter.evaluate(&odd), FilterOutcome::Accepted(_)));
    }

    #[test]
    fn evaluation_is_stable_under_repetition() {
        let filter = filter();
        let decision = ban("203.0.113.10");
        let first = filter.evaluate(&decision);
        for _ in 0..5 {
            assert_eq!(filter.evaluate(&decision), first);
        }
    }
}
