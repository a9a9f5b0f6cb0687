//! Legacy-mode provisioning: one WAN drop rule per shard.
//!
//! Rules live in the WAN_IN (v4) or WANv6_IN (v6) ruleset at
//! `start_index + shard_index`, referencing the shard's group id as the
//! source. Rule names are the managed namespace; the persisted
//! PolicyRecord carries the controller id so existing rules are skipped
//! without touching them.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ub_common::{Family, PolicyMode, PolicyRecord};
use ub_config::{BlockAction, FirewallConfig};
use ub_store::BanStore;
use ub_unifi::{ControllerApi, FirewallRule, UnifiError};

use crate::error::{EngineError, Result};
use crate::names::{render, NameParts};
use crate::provision::ShardRef;

const RULE_PROTOCOL: &str = "all";

pub struct LegacyProvisioner {
    site: String,
    family: Family,
    start_index: u32,
    ruleset: String,
    action: BlockAction,
    log_drops: bool,
    rule_name_template: String,
    api_delay: Duration,
    dry_run: bool,
    controller: Arc<dyn ControllerApi>,
    store: Arc<dyn BanStore>,
}

impl LegacyProvisioner {
    pub fn new(
        site: String,
        family: Family,
        cfg: &FirewallConfig,
        dry_run: bool,
        controller: Arc<dyn ControllerApi>,
        store: Arc<dyn BanStore>,
    ) -> Self {
        let (start_index, ruleset) = match family {
            Family::V4 => (cfg.rule_index_start_v4, cfg.ruleset_v4.clone()),
            Family::V6 => (cfg.rule_index_start_v6, cfg.ruleset_v6.clone()),
        };
        Self {
            site,
            family,
            start_index,
            ruleset,
            action: cfg.block_action,
            log_drops: cfg.log_drops,
            rule_name_template: cfg.rule_name_template.clone(),
            api_delay: cfg.api_shard_delay,
            dry_run,
            controller,
            store,
        }
    }

    fn rule_name(&self, shard_idx: usize) -> String {
        render(
            &self.rule_name_template,
            NameParts::new(self.family, shard_idx, &self.site),
        )
    }

    fn build_rule(&self, shard_idx: usize, group_id: &str) -> FirewallRule {
        FirewallRule {
            id: None,
            name: self.rule_name(shard_idx),
            ruleset: self.ruleset.clone(),
            rule_index: self.start_index + shard_idx as u32,
            action: self.action.as_str().to_string(),
            enabled: true,
            src_firewallgroup_ids: vec![group_id.to_string()],
            protocol: RULE_PROTOCOL.to_string(),
            logging: self.log_drops,
        }
    }

    /// Ensure one drop rule exists per shard. Lists the controller's rules
    /// once and skips shards whose persisted rule id is still present.
    pub async fn ensure_rules(
        &self,
        shards: &[ShardRef],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if shards.is_empty() {
            return Ok(());
        }
        if self.dry_run {
            info!(
                site = %self.site,
                family = %self.family,
                shards = shards.len(),
                "dry-run: would ensure block rules"
            );
            return Ok(());
        }

        let live = self.controller.list_firewall_rules(&self.site).await?;
        let live_ids: std::collections::HashSet<&str> = live
            .iter()
            .filter_map(|r| r.id.as_deref())
            .collect();

        let mut created_any = false;
        for (shard_idx, group_id) in shards {
            let name = self.rule_name(*shard_idx);
            if let Some(record) = self.store.get_policy(&name).await? {
                if live_ids.contains(record.unifi_id.as_str()) {
                    continue;
                }
                debug!(rule = %name, "Controller forgot rule, recreating");
            }

            if created_any && !self.api_delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(self.api_delay) => {}
                }
            }

            self.create_rule(*shard_idx, group_id).await?;
            created_any = true;
        }
        Ok(())
    }

    /// Per-shard variant used when a shard is created mid-operation.
    pub async fn ensure_rule_for_shard(&self, shard_idx: usize, group_id: &str) -> Result<()> {
        if self.dry_run {
            info!(
                site = %self.site,
                rule = %self.rule_name(shard_idx),
                "dry-run: would create block rule"
            );
            return Ok(());
        }
        let name = self.rule_name(shard_idx);
        if self.store.get_policy(&name).await?.is_some() {
            return Ok(());
        }
        self.create_rule(shard_idx, group_id).await
    }

    async fn create_rule(&self, shard_idx: usize, group_id: &str) -> Result<()> {
        let rule = self.build_rule(shard_idx, group_id);
        let created = self.controller.create_firewall_rule(&self.site, &rule).await?;
        let unifi_id = created.id.ok_or(EngineError::Controller(UnifiError::Api {
            status: 200,
            message: "created rule has no id".to_string(),
        }))?;

        let record = PolicyRecord {
            unifi_id,
            site: self.site.clone(),
            mode: PolicyMode::Legacy,
        };
        if let Err(error) = self.store.set_policy(&rule.name, &record).await {
            warn!(rule = %rule.name, %error, "Failed to mirror rule record");
        }
        info!(
            site = %self.site,
            rule = %rule.name,
            index = rule.rule_index,
            "Created block rule"
        );
        Ok(())
    }

    /// Pruning variant: delete the shard's rule and forget its record.
    /// A rule already gone from the controller is benign.
    pub async fn delete_rule_for_shard(&self, shard_idx: usize) -> Result<()> {
        let name = self.rule_name(shard_idx);
        if self.dry_run {
            info!(site = %self.site, rule = %name, "dry-run: would delete block rule");
            return Ok(());
        }

        let Some(record) = self.store.get_policy(&name).await? else {
            return Ok(());
        };

        match self
            .controller
            .delete_firewall_rule(&self.site, &record.unifi_id)
            .await
        {
            Ok(()) | Err(UnifiError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_policy(&name).await?;
        debug!(site = %self.site, rule = %name, "Deleted block rule");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ub_store::SqliteStore;
    use ub_unifi::MockController;

    async fn provisioner() -> (LegacyProvisioner, Arc<MockController>, Arc<SqliteStore>) {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let provisioner = LegacyProvisioner::new(
            "default".to_string(),
            Family::V4,
            &FirewallConfig {
                api_shard_delay: Duration::ZERO,
                ..FirewallConfig::default()
            },
            false,
            controller.clone(),
            store.clone(),
        );
        (provisioner, controller, store)
    }

    #[tokio::test]
    async fn creates_rule_per_shard_with_offset_indices() {
        let (provisioner, controller, _) = provisioner().await;
        let shards = vec![(0, "g0".to_string()), (1, "g1".to_string())];

        provisioner
            .ensure_rules(&shards, &CancellationToken::new())
            .await
            .unwrap();

        let rules = controller.rules("default");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_index, 22_000);
        assert_eq!(rules[1].rule_index, 22_001);
        assert_eq!(rules[0].ruleset, "WAN_IN");
        assert_eq!(rules[0].src_firewallgroup_ids, vec!["g0"]);
        assert_eq!(rules[0].action, "drop");
    }

    #[tokio::test]
    async fn skips_shards_whose_rule_survives() {
        let (provisioner, controller, _) = provisioner().await;
        let shards = vec![(0, "g0".to_string())];
        let token = CancellationToken::new();

        provisioner.ensure_rules(&shards, &token).await.unwrap();
        provisioner.ensure_rules(&shards, &token).await.unwrap();

        assert_eq!(controller.call_count("create_firewall_rule"), 1);
    }

    #[tokio::test]
    async fn recreates_forgotten_rule() {
        let (provisioner, controller, store) = provisioner().await;
        let shards = vec![(0, "g0".to_string())];
        let token = CancellationToken::new();

        provisioner.ensure_rules(&shards, &token).await.unwrap();

        // Simulate the controller forgetting the rule behind our back.
        let id = store
            .get_policy("crowdsec-block-v4-0")
            .await
            .unwrap()
            .unwrap()
            .unifi_id;
        controller.delete_firewall_rule("default", &id).await.unwrap();

        provisioner.ensure_rules(&shards, &token).await.unwrap();
        assert_eq!(controller.rules("default").len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_rule_is_benign() {
        let (provisioner, controller, _) = provisioner().await;
        let token = CancellationToken::new();

        provisioner
            .ensure_rules(&[(0, "g0".to_string())], &token)
            .await
            .unwrap();

        // Delete twice: the second pass sees no record and is a no-op.
        provisioner.delete_rule_for_shard(0).await.unwrap();
        provisioner.delete_rule_for_shard(0).await.unwrap();
        assert!(controller.rules("default").is_empty());
    }
}
