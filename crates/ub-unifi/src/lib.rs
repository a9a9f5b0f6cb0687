//! UniFi Network controller client.
//!
//! This crate provides:
//! - ControllerApi: the capability set the projection engine consumes
//! - UnifiClient: reqwest-based implementation with cookie/CSRF session
//!   handling, deduplicated re-authentication and typed error mapping
//! - MockController: scriptable in-memory double for engine tests

use async_trait::async_trait;

pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::UnifiClient;
pub use error::{Result, UnifiError};
pub use mock::MockController;
pub use types::{FirewallGroup, FirewallRule, GroupType, PolicyEndpoint, Zone, ZonePolicy};

/// Feature name probed to detect zone-based firewall support.
pub const FEATURE_ZONE_FIREWALL: &str = "ZONE_BASED_FIREWALL";

/// Capability set over the controller's firewall surface.
///
/// Site-scoped CRUD per entity; implementations surface the typed errors in
/// [`UnifiError`] so callers can dispatch on them.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn list_firewall_groups(&self, site: &str) -> Result<Vec<FirewallGroup>>;
    async fn create_firewall_group(
        &self,
        site: &str,
        group: &FirewallGroup,
    ) -> Result<FirewallGroup>;
    async fn update_firewall_group(&self, site: &str, group: &FirewallGroup) -> Result<()>;
    async fn delete_firewall_group(&self, site: &str, id: &str) -> Result<()>;

    async fn list_firewall_rules(&self, site: &str) -> Result<Vec<FirewallRule>>;
    async fn create_firewall_rule(
        &self,
        site: &str,
        rule: &FirewallRule,
    ) -> Result<FirewallRule>;
    async fn update_firewall_rule(&self, site: &str, rule: &FirewallRule) -> Result<()>;
    async fn delete_firewall_rule(&self, site: &str, id: &str) -> Result<()>;

    async fn list_zone_policies(&self, site: &str) -> Result<Vec<ZonePolicy>>;
    async fn create_zone_policy(&self, site: &str, policy: &ZonePolicy) -> Result<ZonePolicy>;
    async fn update_zone_policy(&self, site: &str, policy: &ZonePolicy) -> Result<()>;
    async fn delete_zone_policy(&self, site: &str, id: &str) -> Result<()>;
    /// Reorder policies so the given ids come first, in the given order.
    async fn reorder_zone_policies(&self, site: &str, ordered_ids: &[String]) -> Result<()>;

    async fn list_zones(&self, site: &str) -> Result<Vec<Zone>>;

    /// Probe for a controller feature. Probe failures surface as errors;
    /// callers that only need a yes/no treat errors as `false`.
    async fn has_feature(&self, site: &str, feature: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}
