//! Scriptable in-memory controller for engine and handler tests.
//!
//! Records every call by method name, hands out generated ids, and can be
//! scripted to fail upcoming calls with specific typed errors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::error::{Result, UnifiError};
use crate::types::{FirewallGroup, FirewallRule, Zone, ZonePolicy};
use crate::ControllerApi;

#[derive(Default)]
struct SiteState {
    groups: Vec<FirewallGroup>,
    rules: Vec<FirewallRule>,
    policies: Vec<ZonePolicy>,
    zones: Vec<Zone>,
    features: HashMap<String, bool>,
}

#[derive(Default)]
struct MockState {
    sites: HashMap<String, SiteState>,
    calls: Vec<String>,
    scripted_failures: HashMap<String, VecDeque<UnifiError>>,
    reorder_requests: Vec<Vec<String>>,
}

/// In-memory [`ControllerApi`] double.
#[derive(Default)]
pub struct MockController {
    state: Mutex<MockState>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call to `method`.
    pub fn fail_next(&self, method: &str, error: UnifiError) {
        self.state
            .lock()
            .scripted_failures
            .entry(method.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_feature(&self, site: &str, feature: &str, supported: bool) {
        self.state
            .lock()
            .sites
            .entry(site.to_string())
            .or_default()
            .features
            .insert(feature.to_string(), supported);
    }

    pub fn set_zones(&self, site: &str, zones: Vec<Zone>) {
        self.state
            .lock()
            .sites
            .entry(site.to_string())
            .or_default()
            .zones = zones;
    }

    /// Number of recorded calls to `method`, across sites.
    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    pub fn groups(&self, site: &str) -> Vec<FirewallGroup> {
        self.state
            .lock()
            .sites
            .get(site)
            .map(|s| s.groups.clone())
            .unwrap_or_default()
    }

    pub fn rules(&self, site: &str) -> Vec<FirewallRule> {
        self.state
            .lock()
            .sites
            .get(site)
            .map(|s| s.rules.clone())
            .unwrap_or_default()
    }

    pub fn policies(&self, site: &str) -> Vec<ZonePolicy> {
        self.state
            .lock()
            .sites
            .get(site)
            .map(|s| s.policies.clone())
            .unwrap_or_default()
    }

    pub fn reorder_requests(&self) -> Vec<Vec<String>> {
        self.state.lock().reorder_requests.clone()
    }

    /// Record the call and pop any scripted failure for it.
    fn enter(&self, method: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(method.to_string());
        if let Some(queue) = state.scripted_failures.get_mut(method) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[async_trait]
impl ControllerApi for MockController {
    async fn list_firewall_groups(&self, site: &str) -> Result<Vec<FirewallGroup>> {
        self.enter("list_firewall_groups")?;
        Ok(self.groups(site))
    }

    async fn create_firewall_group(
        &self,
        site: &str,
        group: &FirewallGroup,
    ) -> Result<FirewallGroup> {
        self.enter("create_firewall_group")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        if site_state.groups.iter().any(|g| g.name == group.name) {
            return Err(UnifiError::Conflict(format!(
                "group '{}' already exists",
                group.name
            )));
        }
        let mut created = group.clone();
        created.id = Some(Self::new_id());
        site_state.groups.push(created.clone());
        Ok(created)
    }

    async fn update_firewall_group(&self, site: &str, group: &FirewallGroup) -> Result<()> {
        self.enter("update_firewall_group")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let existing = site_state
            .groups
            .iter_mut()
            .find(|g| g.id == group.id)
            .ok_or(UnifiError::NotFound)?;
        *existing = group.clone();
        Ok(())
    }

    async fn delete_firewall_group(&self, site: &str, id: &str) -> Result<()> {
        self.enter("delete_firewall_group")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let before = site_state.groups.len();
        site_state.groups.retain(|g| g.id.as_deref() != Some(id));
        if site_state.groups.len() == before {
            return Err(UnifiError::NotFound);
        }
        Ok(())
    }

    async fn list_firewall_rules(&self, site: &str) -> Result<Vec<FirewallRule>> {
        self.enter("list_firewall_rules")?;
        Ok(self.rules(site))
    }

    async fn create_firewall_rule(
        &self,
        site: &str,
        rule: &FirewallRule,
    ) -> Result<FirewallRule> {
        self.enter("create_firewall_rule")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let mut created = rule.clone();
        created.id = Some(Self::new_id());
        site_state.rules.push(created.clone());
        Ok(created)
    }

    async fn update_firewall_rule(&self, site: &str, rule: &FirewallRule) -> Result<()> {
        self.enter("update_firewall_rule")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let existing = site_state
            .rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or(UnifiError::NotFound)?;
        *existing = rule.clone();
        Ok(())
    }

    async fn delete_firewall_rule(&self, site: &str, id: &str) -> Result<()> {
        self.enter("delete_firewall_rule")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let before = site_state.rules.len();
        site_state.rules.retain(|r| r.id.as_deref() != Some(id));
        if site_state.rules.len() == before {
            return Err(UnifiError::NotFound);
        }
        Ok(())
    }

    async fn list_zone_policies(&self, site: &str) -> Result<Vec<ZonePolicy>> {
        self.enter("list_zone_policies")?;
        Ok(self.policies(site))
    }

    async fn create_zone_policy(&self, site: &str, policy: &ZonePolicy) -> Result<ZonePolicy> {
        self.enter("create_zone_policy")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let mut created = policy.clone();
        created.id = Some(Self::new_id());
        site_state.policies.push(created.clone());
        Ok(created)
    }

    async fn update_zone_policy(&self, site: &str, policy: &ZonePolicy) -> Result<()> {
        self.enter("update_zone_policy")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let existing = site_state
            .policies
            .iter_mut()
            .find(|p| p.id == policy.id)
            .ok_or(UnifiError::NotFound)?;
        *existing = policy.clone();
        Ok(())
    }

    async fn delete_zone_policy(&self, site: &str, id: &str) -> Result<()> {
        self.enter("delete_zone_policy")?;
        let mut state = self.state.lock();
        let site_state = state.sites.entry(site.to_string()).or_default();
        let before = site_state.policies.len();
        site_state.policies.retain(|p| p.id.as_deref() != Some(id));
        if site_state.policies.len() == before {
            return Err(UnifiError::NotFound);
        }
        Ok(())
    }

    async fn reorder_zone_policies(&self, _site: &str, ordered_ids: &[String]) -> Result<()> {
        self.enter("reorder_zone_policies")?;
        self.state
            .lock()
            .reorder_requests
            .push(ordered_ids.to_vec());
        Ok(())
    }

    async fn list_zones(&self, site: &str) -> Result<Vec<Zone>> {
        self.enter("list_zones")?;
        Ok(self
            .state
            .lock()
            .sites
            .get(site)
            .map(|s| s.zones.clone())
            .unwrap_or_default())
    }

    async fn has_feature(&self, site: &str, feature: &str) -> Result<bool> {
        self.enter("has_feature")?;
        Ok(self
            .state
            .lock()
            .sites
            .get(site)
            .and_then(|s| s.features.get(feature).copied())
            .unwrap_or(false))
    }

    async fn ping(&self) -> Result<()> {
        self.enter("ping")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_id_and_conflicts_on_duplicate_name() {
        let mock = MockController::new();
        let group = FirewallGroup::new("crowdsec-v4-0", false, vec![]);

        let created = mock.create_firewall_group("default", &group).await.unwrap();
        assert!(created.id.is_some());

        let err = mock
            .create_firewall_group("default", &group)
            .await
            .unwrap_err();
        assert!(matches!(err, UnifiError::Conflict(_)));
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let mock = MockController::new();
        mock.fail_next("ping", UnifiError::Unauthorized);

        assert!(matches!(mock.ping().await, Err(UnifiError::Unauthorized)));
        assert!(mock.ping().await.is_ok());
        assert_eq!(mock.call_count("ping"), 2);
    }
}
