//! Firewall manager - orchestrator of the projection engine.
//!
//! Owns per-(site, family) shard managers and provisioners, resolves the
//! firewall mode per site, applies bans/unbans, coalesces flushes behind a
//! per-site batch timer, reconciles against the store and prunes empty
//! tail shards.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ub_common::Family;
use ub_config::{FirewallConfig, FirewallMode};
use ub_store::BanStore;
use ub_unifi::{ControllerApi, UnifiError, FEATURE_ZONE_FIREWALL};

use crate::error::{EngineError, Result};
use crate::provision::{LegacyProvisioner, ShardRef, ZoneProvisioner};
use crate::shard::{members_to_remove, AddResult, ShardManager, ShardManagerConfig};

/// Summary of one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub added: u64,
    pub removed: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

enum Provisioner {
    Legacy(LegacyProvisioner),
    Zone(ZoneProvisioner),
}

impl Provisioner {
    async fn ensure_all(
        &self,
        shards: &[ShardRef],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        match self {
            Provisioner::Legacy(p) => p.ensure_rules(shards, shutdown).await,
            Provisioner::Zone(p) => p.ensure_policies(shards, shutdown).await,
        }
    }

    async fn ensure_for_shard(&self, shard_idx: usize, group_id: &str) -> Result<()> {
        match self {
            Provisioner::Legacy(p) => p.ensure_rule_for_shard(shard_idx, group_id).await,
            Provisioner::Zone(p) => p.ensure_policies_for_shard(shard_idx, group_id).await,
        }
    }

    async fn delete_for_shard(&self, shard_idx: usize) -> Result<()> {
        match self {
            Provisioner::Legacy(p) => p.delete_rule_for_shard(shard_idx).await,
            Provisioner::Zone(p) => p.delete_policies_for_shard(shard_idx).await,
        }
    }
}

struct FamilyState {
    shards: Arc<ShardManager>,
    provisioner: Provisioner,
}

struct SiteState {
    mode: FirewallMode,
    families: HashMap<Family, FamilyState>,
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct FirewallManager {
    cfg: FirewallConfig,
    dry_run: bool,
    controller: Arc<dyn ControllerApi>,
    store: Arc<dyn BanStore>,
    sites: RwLock<HashMap<String, Arc<SiteState>>>,
    flush_semaphore: Option<Arc<Semaphore>>,
    /// Per-site batch timers; short critical section, timer lifecycle only.
    timers: parking_lot::Mutex<HashMap<String, TimerEntry>>,
    timer_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl FirewallManager {
    pub fn new(
        cfg: FirewallConfig,
        dry_run: bool,
        controller: Arc<dyn ControllerApi>,
        store: Arc<dyn BanStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let flush_semaphore = if cfg.flush_concurrency > 0 {
            Some(Arc::new(Semaphore::new(cfg.flush_concurrency)))
        } else {
            None
        };
        Self {
            cfg,
            dry_run,
            controller,
            store,
            sites: RwLock::new(HashMap::new()),
            flush_semaphore,
            timers: parking_lot::Mutex::new(HashMap::new()),
            timer_generation: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Resolve the effective mode for a site. `auto` probes the controller
    /// once; any probe error falls back to legacy.
    async fn resolve_mode(&self, site: &str) -> FirewallMode {
        match self.cfg.mode {
            FirewallMode::Legacy => FirewallMode::Legacy,
            FirewallMode::Zone => FirewallMode::Zone,
            FirewallMode::Auto => {
                if self.dry_run {
                    debug!(site, "dry-run: skipping feature probe, assuming legacy");
                    return FirewallMode::Legacy;
                }
                match self.controller.has_feature(site, FEATURE_ZONE_FIREWALL).await {
                    Ok(true) => FirewallMode::Zone,
                    Ok(false) => FirewallMode::Legacy,
                    Err(error) => {
                        warn!(site, %error, "Feature probe failed, falling back to legacy");
                        FirewallMode::Legacy
                    }
                }
            }
        }
    }

    /// Bootstrap every site: construct shard managers, resolve the mode,
    /// and run the provisioner over the existing shards.
    pub async fn ensure_infrastructure(&self, sites: &[String]) -> Result<()> {
        for site in sites {
            let mode = self.resolve_mode(site).await;
            info!(site = %site, ?mode, "Bootstrapping firewall infrastructure");

            let zone_ids: HashMap<String, String> = if mode == FirewallMode::Zone {
                self.controller
                    .list_zones(site)
                    .await?
                    .into_iter()
                    .map(|z| (z.name, z.id))
                    .collect()
            } else {
                HashMap::new()
            };

            let mut families = Vec::with_capacity(2);
            families.push(Family::V4);
            if self.cfg.enable_ipv6 {
                families.push(Family::V6);
            }

            let mut family_states = HashMap::new();
            for family in families {
                let shards = Arc::new(ShardManager::new(
                    site.clone(),
                    family,
                    ShardManagerConfig {
                        capacity: self.cfg.capacity_for(family.is_ipv6()),
                        group_name_template: self.cfg.group_name_template.clone(),
                        api_shard_delay: self.cfg.api_shard_delay,
                        dry_run: self.dry_run,
                    },
                    self.controller.clone(),
                    self.store.clone(),
                    self.flush_semaphore.clone(),
                ));
                shards.ensure_shards().await?;

                let provisioner = match mode {
                    FirewallMode::Zone => Provisioner::Zone(ZoneProvisioner::new(
                        site.clone(),
                        family,
                        &self.cfg,
                        zone_ids.clone(),
                        self.dry_run,
                        self.controller.clone(),
                        self.store.clone(),
                    )?),
                    _ => Provisioner::Legacy(LegacyProvisioner::new(
                        site.clone(),
                        family,
                        &self.cfg,
                        self.dry_run,
                        self.controller.clone(),
                        self.store.clone(),
                    )),
                };

                let refs = shards.shard_refs().await;
                provisioner.ensure_all(&refs, &self.shutdown).await?;

                family_states.insert(
                    family,
                    FamilyState {
                        shards,
                        provisioner,
                    },
                );
            }

            self.sites.write().await.insert(
                site.clone(),
                Arc::new(SiteState {
                    mode,
                    families: family_states,
                }),
            );
        }
        Ok(())
    }

    async fn site_state(&self, site: &str) -> Option<Arc<SiteState>> {
        self.sites.read().await.get(site).cloned()
    }

    /// Resolved mode for a site, for the health surface.
    pub async fn mode_for(&self, site: &str) -> Option<FirewallMode> {
        self.site_state(site).await.map(|s| s.mode)
    }

    pub async fn shard_manager(&self, site: &str, family: Family) -> Option<Arc<ShardManager>> {
        self.site_state(site)
            .await
            .and_then(|s| s.families.get(&family).map(|f| f.shards.clone()))
    }

    /// Apply a ban for one address on one site. Creates a shard on
    /// overflow, provisions its rule/policy and schedules the batch flush.
    pub async fn apply_ban(self: Arc<Self>, site: &str, ip: &str, ipv6: bool) -> Result<()> {
        if self.dry_run {
            info!(site, ip, ipv6, "dry-run: would ban");
            return Ok(());
        }

        let family = Family::from_ipv6(ipv6);
        let state = self
            .site_state(site)
            .await
            .ok_or_else(|| EngineError::UnknownSite {
                site: site.to_string(),
                family,
            })?;
        let family_state =
            state
                .families
                .get(&family)
                .ok_or_else(|| EngineError::UnknownSite {
                    site: site.to_string(),
                    family,
                })?;

        match family_state.shards.add(ip).await? {
            AddResult::AlreadyPresent => {}
            AddResult::Added { new_shard, .. } => {
                if let Some(shard_idx) = new_shard {
                    self.provision_new_shard(site, family_state, shard_idx).await;
                }
            }
        }

        Self::schedule_flush(&self, site);
        Ok(())
    }

    /// Lift a ban. Unknown sites and absent addresses are no-ops.
    pub async fn apply_unban(self: Arc<Self>, site: &str, ip: &str, ipv6: bool) -> Result<()> {
        if self.dry_run {
            info!(site, ip, ipv6, "dry-run: would unban");
            return Ok(());
        }

        let family = Family::from_ipv6(ipv6);
        let Some(state) = self.site_state(site).await else {
            return Ok(());
        };
        let Some(family_state) = state.families.get(&family) else {
            return Ok(());
        };

        if family_state.shards.remove(ip).await? {
            Self::schedule_flush(&self, site);
        }
        Ok(())
    }

    /// Provision rule/policy for a freshly created shard. Failures are
    /// logged, not surfaced: the ban already counts as applied and the
    /// next reconcile repairs the missing rule.
    async fn provision_new_shard(&self, site: &str, family_state: &FamilyState, shard_idx: usize) {
        if !self.cfg.api_shard_delay.is_zero() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.api_shard_delay) => {}
            }
        }

        let refs = family_state.shards.shard_refs().await;
        let Some((_, group_id)) = refs.iter().find(|(idx, _)| *idx == shard_idx) else {
            return;
        };
        if let Err(error) = family_state
            .provisioner
            .ensure_for_shard(shard_idx, group_id)
            .await
        {
            error!(
                site,
                shard = shard_idx,
                %error,
                "Failed to provision new shard, reconcile will repair"
            );
        }
    }

    /// (Re)start the site's batch timer; bursts of applies coalesce into a
    /// single flush at the end of the window.
    fn schedule_flush(this: &Arc<Self>, site: &str) {
        let generation = this.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let manager = this.clone();
        let site_owned = site.to_string();
        let window = this.cfg.batch_window;
        let shutdown = this.shutdown.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }

            // Release the timer slot before flushing: a reset arriving while
            // the flush runs must start a new timer, not abort this task
            // mid-write.
            {
                let mut timers = manager.timers.lock();
                if let Some(entry) = timers.get(&site_owned) {
                    if entry.generation == generation {
                        timers.remove(&site_owned);
                    }
                }
            }

            manager.flush_site(&site_owned).await;
        });

        let mut timers = this.timers.lock();
        if let Some(previous) = timers.insert(
            site.to_string(),
            TimerEntry { generation, handle },
        ) {
            previous.handle.abort();
            debug!(site, "Batch timer reset");
        }
    }

    /// Flush both families' dirty shards, then prune empty tails once.
    pub async fn flush_site(&self, site: &str) {
        let Some(state) = self.site_state(site).await else {
            return;
        };

        for family in [Family::V4, Family::V6] {
            let Some(family_state) = state.families.get(&family) else {
                continue;
            };
            if let Err(error) = family_state.shards.flush_dirty(&self.shutdown).await {
                warn!(site, family = %family, %error, "Batch flush incomplete");
            }

            metrics::gauge!(
                "shard_count",
                "site" => site.to_string(),
                "family" => family.as_str()
            )
            .set(family_state.shards.shard_count().await as f64);
            metrics::gauge!(
                "banned_addresses",
                "site" => site.to_string(),
                "family" => family.as_str()
            )
            .set(family_state.shards.member_count().await as f64);
        }

        if !self.dry_run {
            self.prune_empty_tail_shards(site, &state).await;
        }
    }

    /// Remove empty tail shards: rule/policy first, then the controller
    /// group, then local state. A failure stops pruning for that family
    /// this cycle.
    async fn prune_empty_tail_shards(&self, site: &str, state: &SiteState) {
        for (family, family_state) in &state.families {
            loop {
                let Some((group_id, shard_idx)) = family_state.shards.prunable_tail().await
                else {
                    break;
                };

                if let Err(error) = family_state.provisioner.delete_for_shard(shard_idx).await {
                    warn!(site, family = %family, shard = shard_idx, %error,
                        "Tail prune: rule/policy delete failed, stopping");
                    break;
                }

                if !self.cfg.api_shard_delay.is_zero() {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.cfg.api_shard_delay) => {}
                    }
                }

                match self.controller.delete_firewall_group(site, &group_id).await {
                    Ok(()) | Err(UnifiError::NotFound) => {}
                    Err(error) => {
                        warn!(site, family = %family, shard = shard_idx, %error,
                            "Tail prune: group delete failed, stopping");
                        break;
                    }
                }

                if let Err(error) = family_state.shards.remove_tail().await {
                    warn!(site, family = %family, %error, "Tail prune: local removal failed");
                    break;
                }
                info!(site, family = %family, shard = shard_idx, "Pruned empty tail shard");
            }
        }
    }

    /// Converge shard state to the store's ban list for every site.
    pub async fn reconcile(&self, sites: &[String]) -> ReconcileResult {
        let started = Instant::now();
        let mut result = ReconcileResult::default();

        let bans = match self.store.ban_list().await {
            Ok(bans) => bans,
            Err(error) => {
                error!(%error, "Reconcile aborted: cannot read ban list");
                result.errors += 1;
                result.elapsed = started.elapsed();
                return result;
            }
        };

        let mut desired_v4: HashSet<String> = HashSet::new();
        let mut desired_v6: HashSet<String> = HashSet::new();
        for (value, entry) in &bans {
            if entry.ipv6 {
                desired_v6.insert(value.clone());
            } else {
                desired_v4.insert(value.clone());
            }
        }

        for site in sites {
            let Some(state) = self.site_state(site).await else {
                warn!(site, "Reconcile skipping unknown site");
                result.errors += 1;
                continue;
            };

            for (family, family_state) in &state.families {
                let desired = match family {
                    Family::V4 => &desired_v4,
                    Family::V6 => &desired_v6,
                };

                let current = family_state.shards.all_members().await;
                let mut new_shards: Vec<usize> = Vec::new();

                for value in desired {
                    if current.contains(value) {
                        continue;
                    }
                    match family_state.shards.add(value).await {
                        Ok(AddResult::Added { new_shard, .. }) => {
                            result.added += 1;
                            if let Some(idx) = new_shard {
                                new_shards.push(idx);
                            }
                        }
                        Ok(AddResult::AlreadyPresent) => {}
                        Err(error) => {
                            warn!(site, family = %family, value, %error, "Reconcile add failed");
                            result.errors += 1;
                        }
                    }
                }

                for value in members_to_remove(&current, desired) {
                    match family_state.shards.remove(&value).await {
                        Ok(true) => result.removed += 1,
                        Ok(false) => {}
                        Err(error) => {
                            warn!(site, family = %family, value, %error, "Reconcile remove failed");
                            result.errors += 1;
                        }
                    }
                }

                for shard_idx in new_shards {
                    self.provision_new_shard(site, family_state, shard_idx).await;
                }
            }

            if self.dry_run {
                info!(
                    site,
                    added = result.added,
                    removed = result.removed,
                    "dry-run: reconcile stopping before flush"
                );
                continue;
            }

            for family in [Family::V4, Family::V6] {
                let Some(family_state) = state.families.get(&family) else {
                    continue;
                };
                if let Err(error) = family_state.shards.flush_dirty(&self.shutdown).await {
                    warn!(site, family = %family, %error, "Reconcile flush incomplete");
                    result.errors += 1;
                }
            }
            self.prune_empty_tail_shards(site, &state).await;
        }

        result.elapsed = started.elapsed();
        metrics::counter!("reconcile_runs_total").increment(1);
        info!(
            added = result.added,
            removed = result.removed,
            errors = result.errors,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Reconcile finished"
        );
        result
    }

    /// Cancel timers and flush whatever is still dirty; used on shutdown.
    pub async fn final_flush(&self, sites: &[String]) {
        let handles: Vec<JoinHandle<()>> = {
            let mut timers = self.timers.lock();
            timers
                .drain()
                .map(|(_, entry)| {
                    entry.handle.abort();
                    entry.handle
                })
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        // The shutdown token is already cancelled at this point; flush with
        // a fresh token so the writes still go out.
        let token = CancellationToken::new();
        for site in sites {
            let Some(state) = self.site_state(site).await else {
                continue;
            };
            for family in [Family::V4, Family::V6] {
                if let Some(family_state) = state.families.get(&family) {
                    if let Err(error) = family_state.shards.flush_dirty(&token).await {
                        warn!(site, family = %family, %error, "Final flush incomplete");
                    }
                }
            }
        }
    }
}
