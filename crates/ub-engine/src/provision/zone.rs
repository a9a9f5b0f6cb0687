//! Zone-mode provisioning: one block policy per (shard, zone pair).
//!
//! Policies match source = the shard's address group within the source
//! zone, destination = ANY in the destination zone. With reordering
//! enabled, managed policies are kept ahead of everything unmanaged so a
//! broad allow rule cannot shadow the blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ub_common::{Family, PolicyMode, PolicyRecord};
use ub_config::{FirewallConfig, ZonePair};
use ub_store::BanStore;
use ub_unifi::{ControllerApi, PolicyEndpoint, UnifiError, ZonePolicy};

use crate::error::{EngineError, Result};
use crate::names::{render, NameParts};
use crate::provision::ShardRef;

pub struct ZoneProvisioner {
    site: String,
    family: Family,
    pairs: Vec<ZonePair>,
    /// Zone name -> controller zone id, resolved once per bootstrap.
    zone_ids: HashMap<String, String>,
    policy_name_template: String,
    reorder: bool,
    api_delay: Duration,
    dry_run: bool,
    controller: Arc<dyn ControllerApi>,
    store: Arc<dyn BanStore>,
}

impl ZoneProvisioner {
    pub fn new(
        site: String,
        family: Family,
        cfg: &FirewallConfig,
        zone_ids: HashMap<String, String>,
        dry_run: bool,
        controller: Arc<dyn ControllerApi>,
        store: Arc<dyn BanStore>,
    ) -> Result<Self> {
        let pairs = cfg
            .parsed_zone_pairs()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self {
            site,
            family,
            pairs,
            zone_ids,
            policy_name_template: cfg.policy_name_template.clone(),
            reorder: cfg.zone_policy_reorder,
            api_delay: cfg.api_shard_delay,
            dry_run,
            controller,
            store,
        })
    }

    fn policy_name(&self, shard_idx: usize, pair: &ZonePair) -> String {
        render(
            &self.policy_name_template,
            NameParts::new(self.family, shard_idx, &self.site)
                .with_zones(&pair.src, &pair.dst),
        )
    }

    fn ip_version(&self) -> &'static str {
        match self.family {
            Family::V4 => "IPV4",
            Family::V6 => "IPV6",
        }
    }

    fn zone_id(&self, name: &str) -> Result<&str> {
        self.zone_ids
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| EngineError::UnknownZone(name.to_string()))
    }

    fn build_policy(&self, shard_idx: usize, pair: &ZonePair, group_id: &str) -> Result<ZonePolicy> {
        Ok(ZonePolicy {
            id: None,
            name: self.policy_name(shard_idx, pair),
            action: "BLOCK".to_string(),
            ip_version: self.ip_version().to_string(),
            source: PolicyEndpoint::ip_group(self.zone_id(&pair.src)?, group_id),
            destination: PolicyEndpoint::any(self.zone_id(&pair.dst)?),
            enabled: true,
            index: None,
            predefined: false,
        })
    }

    /// Ensure one block policy per (shard, zone pair). Lists the
    /// controller's policies once and skips slots whose persisted id is
    /// still present; reorders afterwards when configured.
    pub async fn ensure_policies(
        &self,
        shards: &[ShardRef],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if shards.is_empty() || self.pairs.is_empty() {
            return Ok(());
        }
        if self.dry_run {
            info!(
                site = %self.site,
                family = %self.family,
                slots = shards.len() * self.pairs.len(),
                "dry-run: would ensure zone policies"
            );
            return Ok(());
        }

        let live = self.controller.list_zone_policies(&self.site).await?;
        let live_ids: std::collections::HashSet<&str> =
            live.iter().filter_map(|p| p.id.as_deref()).collect();

        let mut created_any = false;
        for (shard_idx, group_id) in shards {
            for pair in &self.pairs {
                let name = self.policy_name(*shard_idx, pair);
                if let Some(record) = self.store.get_policy(&name).await? {
                    if live_ids.contains(record.unifi_id.as_str()) {
                        continue;
                    }
                    debug!(policy = %name, "Controller forgot policy, recreating");
                }

                if created_any && !self.api_delay.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(self.api_delay) => {}
                    }
                }

                self.create_policy(*shard_idx, pair, group_id).await?;
                created_any = true;
            }
        }

        if self.reorder {
            self.reorder_managed_first().await?;
        }
        Ok(())
    }

    /// Per-shard variant used when a shard is created mid-operation.
    pub async fn ensure_policies_for_shard(
        &self,
        shard_idx: usize,
        group_id: &str,
    ) -> Result<()> {
        if self.dry_run {
            info!(
                site = %self.site,
                shard = shard_idx,
                "dry-run: would create zone policies for shard"
            );
            return Ok(());
        }
        for pair in &self.pairs {
            let name = self.policy_name(shard_idx, pair);
            if self.store.get_policy(&name).await?.is_some() {
                continue;
            }
            self.create_policy(shard_idx, pair, group_id).await?;
        }
        if self.reorder {
            self.reorder_managed_first().await?;
        }
        Ok(())
    }

    async fn create_policy(
        &self,
        shard_idx: usize,
        pair: &ZonePair,
        group_id: &str,
    ) -> Result<()> {
        let policy = self.build_policy(shard_idx, pair, group_id)?;
        let created = self.controller.create_zone_policy(&self.site, &policy).await?;
        let unifi_id = created.id.ok_or(EngineError::Controller(UnifiError::Api {
            status: 200,
            message: "created policy has no id".to_string(),
        }))?;

        let record = PolicyRecord {
            unifi_id,
            site: self.site.clone(),
            mode: PolicyMode::Zone,
        };
        if let Err(error) = self.store.set_policy(&policy.name, &record).await {
            warn!(policy = %policy.name, %error, "Failed to mirror policy record");
        }
        info!(
            site = %self.site,
            policy = %policy.name,
            src = %pair.src,
            dst = %pair.dst,
            "Created block policy"
        );
        Ok(())
    }

    /// Emit a reorder that places managed policies (sorted by name) ahead
    /// of everything else, preserving the relative order of the rest.
    async fn reorder_managed_first(&self) -> Result<()> {
        let live = self.controller.list_zone_policies(&self.site).await?;
        let records = self.store.list_policies().await?;
        let managed_ids: HashMap<&str, &str> = records
            .iter()
            .filter(|(_, r)| r.site == self.site && r.mode == PolicyMode::Zone)
            .map(|(name, r)| (r.unifi_id.as_str(), name.as_str()))
            .collect();

        let mut managed: Vec<(&str, &str)> = Vec::new();
        let mut unmanaged: Vec<&str> = Vec::new();
        for policy in &live {
            let Some(id) = policy.id.as_deref() else {
                continue;
            };
            match managed_ids.get(id) {
                Some(name) => managed.push((name, id)),
                None => unmanaged.push(id),
            }
        }
        if managed.is_empty() {
            return Ok(());
        }
        managed.sort_by(|a, b| a.0.cmp(b.0));

        let ordered: Vec<String> = managed
            .iter()
            .map(|(_, id)| id.to_string())
            .chain(unmanaged.iter().map(|id| id.to_string()))
            .collect();

        self.controller
            .reorder_zone_policies(&self.site, &ordered)
            .await?;
        debug!(
            site = %self.site,
            managed = managed.len(),
            unmanaged = unmanaged.len(),
            "Reordered zone policies"
        );
        Ok(())
    }

    /// Pruning variant: delete all of a shard's policies and their records.
    pub async fn delete_policies_for_shard(&self, shard_idx: usize) -> Result<()> {
        for pair in &self.pairs {
            let name = self.policy_name(shard_idx, pair);
            if self.dry_run {
                info!(site = %self.site, policy = %name, "dry-run: would delete policy");
                continue;
            }

            let Some(record) = self.store.get_policy(&name).await? else {
                continue;
            };
            match self
                .controller
                .delete_zone_policy(&self.site, &record.unifi_id)
                .await
            {
                Ok(()) | Err(UnifiError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            self.store.delete_policy(&name).await?;
            debug!(site = %self.site, policy = %name, "Deleted block policy");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ub_store::SqliteStore;
    use ub_unifi::MockController;

    fn zone_map() -> HashMap<String, String> {
        HashMap::from([
            ("External".to_string(), "z-ext".to_string()),
            ("Internal".to_string(), "z-int".to_string()),
        ])
    }

    async fn provisioner(reorder: bool) -> (ZoneProvisioner, Arc<MockController>) {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let cfg = FirewallConfig {
            api_shard_delay: Duration::ZERO,
            zone_policy_reorder: reorder,
            zone_pairs: vec!["External->Internal".to_string()],
            ..FirewallConfig::default()
        };
        let provisioner = ZoneProvisioner::new(
            "default".to_string(),
            Family::V4,
            &cfg,
            zone_map(),
            false,
            controller.clone(),
            store,
        )
        .unwrap();
        (provisioner, controller)
    }

    #[tokio::test]
    async fn creates_policy_per_shard_and_pair() {
        let (provisioner, controller) = provisioner(false).await;
        let shards = vec![(0, "g0".to_string()), (1, "g1".to_string())];

        provisioner
            .ensure_policies(&shards, &CancellationToken::new())
            .await
            .unwrap();

        let policies = controller.policies("default");
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].action, "BLOCK");
        assert_eq!(policies[0].ip_version, "IPV4");
        assert_eq!(policies[0].source.zone_id, "z-ext");
        assert_eq!(policies[0].source.ip_group_id, vec!["g0"]);
        assert_eq!(policies[0].destination.zone_id, "z-int");
    }

    #[tokio::test]
    async fn unknown_zone_fails_provisioning() {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let cfg = FirewallConfig {
            zone_pairs: vec!["Nowhere->Internal".to_string()],
            ..FirewallConfig::default()
        };
        let provisioner = ZoneProvisioner::new(
            "default".to_string(),
            Family::V4,
            &cfg,
            zone_map(),
            false,
            controller,
            store,
        )
        .unwrap();

        let err = provisioner
            .ensure_policies(&[(0, "g0".to_string())], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownZone(_)));
    }

    #[tokio::test]
    async fn reorder_places_managed_first() {
        let (provisioner, controller) = provisioner(true).await;

        // An unmanaged policy exists before ours.
        controller
            .create_zone_policy(
                "default",
                &ZonePolicy {
                    id: None,
                    name: "user-allow-all".to_string(),
                    action: "ALLOW".to_string(),
                    ip_version: "BOTH".to_string(),
                    source: PolicyEndpoint::any("z-ext"),
                    destination: PolicyEndpoint::any("z-int"),
                    enabled: true,
                    index: None,
                    predefined: false,
                },
            )
            .await
            .unwrap();

        provisioner
            .ensure_policies(&[(0, "g0".to_string())], &CancellationToken::new())
            .await
            .unwrap();

        let reorders = controller.reorder_requests();
        assert_eq!(reorders.len(), 1);
        let managed_id = controller
            .policies("default")
            .iter()
            .find(|p| p.name.starts_with("crowdsec-"))
            .and_then(|p| p.id.clone())
            .unwrap();
        assert_eq!(reorders[0][0], managed_id);
        assert_eq!(reorders[0].len(), 2);
    }

    #[tokio::test]
    async fn delete_policies_for_shard_removes_all_pairs() {
        let (provisioner, controller) = provisioner(false).await;
        provisioner
            .ensure_policies(&[(0, "g0".to_string())], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(controller.policies("default").len(), 1);

        provisioner.delete_policies_for_shard(0).await.unwrap();
        assert!(controller.policies("default").is_empty());

        // Second delete is a no-op.
        provisioner.delete_policies_for_shard(0).await.unwrap();
    }
}
