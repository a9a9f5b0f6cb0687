//! Capacity-sharded group membership.
//!
//! One manager per (site, family). Each shard mirrors one controller
//! firewall group; membership is disjoint across shards and the union of
//! all shards equals the set of bans this manager is responsible for.
//! Mutations mark shards dirty; `flush_dirty` pushes dirty shards to the
//! controller in two phases, holding the mutex only while snapshotting so
//! Add/Remove latency stays bounded while slow HTTP writes are in flight.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ub_common::{Family, GroupRecord};
use ub_store::BanStore;
use ub_unifi::{ControllerApi, FirewallGroup, UnifiError};

use crate::error::{EngineError, Result};
use crate::names::{render, NameParts};

struct Shard {
    unifi_id: String,
    name: String,
    members: BTreeSet<String>,
    dirty: bool,
}

/// Outcome of [`ShardManager::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    /// The address was already in some shard; nothing changed.
    AlreadyPresent,
    Added {
        shard_name: String,
        /// Index of a shard created by this add, when capacity overflowed.
        new_shard: Option<usize>,
    },
}

/// Snapshot of one dirty shard, captured under the lock in flush phase 1.
struct FlushSnapshot {
    idx: usize,
    unifi_id: String,
    name: String,
    members: Vec<String>,
}

pub struct ShardManagerConfig {
    pub capacity: usize,
    pub group_name_template: String,
    pub api_shard_delay: Duration,
    pub dry_run: bool,
}

pub struct ShardManager {
    site: String,
    family: Family,
    cfg: ShardManagerConfig,
    controller: Arc<dyn ControllerApi>,
    store: Arc<dyn BanStore>,
    /// Global flush-concurrency limiter shared across families and sites.
    flush_semaphore: Option<Arc<Semaphore>>,
    shards: Mutex<Vec<Shard>>,
}

impl ShardManager {
    pub fn new(
        site: String,
        family: Family,
        cfg: ShardManagerConfig,
        controller: Arc<dyn ControllerApi>,
        store: Arc<dyn BanStore>,
        flush_semaphore: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            site,
            family,
            cfg,
            controller,
            store,
            flush_semaphore,
            shards: Mutex::new(Vec::new()),
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn shard_name(&self, index: usize) -> String {
        render(
            &self.cfg.group_name_template,
            NameParts::new(self.family, index, &self.site),
        )
    }

    /// Rebuild in-memory shards from persisted records, overlaying the
    /// controller's live member lists (the controller wins on conflict:
    /// it is the ground truth and the mirror may be stale after a
    /// restart). Creates shard 0 when nothing exists yet.
    pub async fn ensure_shards(&self) -> Result<()> {
        let mut shards = self.shards.lock().await;
        if !shards.is_empty() {
            return Ok(());
        }

        let records = self.store.list_groups().await?;
        let live: Vec<FirewallGroup> = if self.cfg.dry_run {
            Vec::new()
        } else {
            self.controller.list_firewall_groups(&self.site).await?
        };

        let mut index = 0;
        loop {
            let name = self.shard_name(index);
            let Some(record) = records.get(&name) else {
                break;
            };
            if record.site != self.site || record.ipv6 != self.family.is_ipv6() {
                break;
            }

            let mut shard = Shard {
                unifi_id: record.unifi_id.clone(),
                name: name.clone(),
                members: record.members.iter().cloned().collect(),
                dirty: false,
            };

            if !self.cfg.dry_run {
                match live.iter().find(|g| g.id.as_deref() == Some(&record.unifi_id)) {
                    Some(group) => {
                        shard.members = group.members.iter().cloned().collect();
                    }
                    None => {
                        // Controller forgot the group; recreate it from the
                        // mirror so the rule/policy has something to point at.
                        let created = self
                            .create_group(&name, record.members.clone())
                            .await?;
                        shard.unifi_id = created.0;
                        shard.members = created.1.into_iter().collect();
                    }
                }
                self.persist_shard(&shard).await;
            }

            shards.push(shard);
            index += 1;
        }

        if shards.is_empty() {
            let name = self.shard_name(0);
            let (unifi_id, members) = if self.cfg.dry_run {
                (String::new(), Vec::new())
            } else {
                self.create_group(&name, Vec::new()).await?
            };
            let shard = Shard {
                unifi_id,
                name,
                members: members.into_iter().collect(),
                dirty: false,
            };
            if !self.cfg.dry_run {
                self.persist_shard(&shard).await;
            }
            shards.push(shard);
        }

        info!(
            site = %self.site,
            family = %self.family,
            shards = shards.len(),
            "Shard sequence ready"
        );
        Ok(())
    }

    /// Create the backing controller group, adopting an existing one on a
    /// name conflict (leftover from a previous run; the controller is
    /// authoritative for its members).
    async fn create_group(
        &self,
        name: &str,
        members: Vec<String>,
    ) -> Result<(String, Vec<String>)> {
        let group = FirewallGroup::new(name, self.family.is_ipv6(), members);
        match self.controller.create_firewall_group(&self.site, &group).await {
            Ok(created) => {
                let id = created.id.ok_or(EngineError::Controller(UnifiError::Api {
                    status: 200,
                    message: "created group has no id".to_string(),
                }))?;
                Ok((id, created.members))
            }
            Err(UnifiError::Conflict(_)) => {
                let live = self.controller.list_firewall_groups(&self.site).await?;
                let existing = live
                    .into_iter()
                    .find(|g| g.name == name)
                    .ok_or(EngineError::Controller(UnifiError::Conflict(format!(
                        "group '{name}' conflicted but is not listed"
                    ))))?;
                let id = existing.id.ok_or(EngineError::Controller(UnifiError::Api {
                    status: 200,
                    message: "listed group has no id".to_string(),
                }))?;
                debug!(site = %self.site, name, "Adopted existing controller group");
                Ok((id, existing.members))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mirror one shard into the store. Mirror failures are logged, not
    /// surfaced: the next reconcile repairs the drift.
    async fn persist_shard(&self, shard: &Shard) {
        let record = GroupRecord {
            unifi_id: shard.unifi_id.clone(),
            site: self.site.clone(),
            members: shard.members.iter().cloned().collect(),
            ipv6: self.family.is_ipv6(),
        };
        if let Err(error) = self.store.set_group(&shard.name, &record).await {
            warn!(name = %shard.name, %error, "Failed to mirror group record");
        }
    }

    /// Insert an address. Idempotent; creates a new shard on capacity
    /// overflow.
    pub async fn add(&self, ip: &str) -> Result<AddResult> {
        let mut shards = self.shards.lock().await;

        if shards.iter().any(|s| s.members.contains(ip)) {
            return Ok(AddResult::AlreadyPresent);
        }

        let slot = shards
            .iter()
            .position(|s| s.members.len() < self.cfg.capacity);

        let (idx, new_shard) = match slot {
            Some(idx) => (idx, None),
            None => {
                let idx = shards.len();
                let name = self.shard_name(idx);
                let (unifi_id, members) = if self.cfg.dry_run {
                    (String::new(), Vec::new())
                } else {
                    self.create_group(&name, Vec::new()).await?
                };
                let shard = Shard {
                    unifi_id,
                    name,
                    members: members.into_iter().collect(),
                    dirty: false,
                };
                if !self.cfg.dry_run {
                    self.persist_shard(&shard).await;
                }
                shards.push(shard);
                debug!(
                    site = %self.site,
                    family = %self.family,
                    index = idx,
                    "Created overflow shard"
                );
                (idx, Some(idx))
            }
        };

        let shard = &mut shards[idx];
        shard.members.insert(ip.to_string());
        shard.dirty = true;

        Ok(AddResult::Added {
            shard_name: shard.name.clone(),
            new_shard,
        })
    }

    /// Remove an address from whichever shard holds it. Absence is a no-op.
    pub async fn remove(&self, ip: &str) -> Result<bool> {
        let mut shards = self.shards.lock().await;
        for shard in shards.iter_mut() {
            if shard.members.remove(ip) {
                shard.dirty = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn contains(&self, ip: &str) -> bool {
        let shards = self.shards.lock().await;
        shards.iter().any(|s| s.members.contains(ip))
    }

    /// Copy of the union of all shard members.
    pub async fn all_members(&self) -> BTreeSet<String> {
        let shards = self.shards.lock().await;
        shards
            .iter()
            .flat_map(|s| s.members.iter().cloned())
            .collect()
    }

    pub async fn shard_count(&self) -> usize {
        self.shards.lock().await.len()
    }

    /// (index, controller group id) for every shard, for the provisioners.
    pub async fn shard_refs(&self) -> Vec<(usize, String)> {
        let shards = self.shards.lock().await;
        shards
            .iter()
            .enumerate()
            .map(|(idx, s)| (idx, s.unifi_id.clone()))
            .collect()
    }

    pub async fn member_count(&self) -> usize {
        let shards = self.shards.lock().await;
        shards.iter().map(|s| s.members.len()).sum()
    }

    pub async fn dirty_count(&self) -> usize {
        self.shards.lock().await.iter().filter(|s| s.dirty).count()
    }

    /// Push every dirty shard's members to the controller.
    ///
    /// Phase 1 snapshots the dirty shards and clears their flags under the
    /// lock; phase 2 performs the writes with the lock released, pacing
    /// consecutive writes by the configured delay and honoring the global
    /// flush semaphore. A failed write re-marks its shard dirty and the
    /// remaining snapshots are still attempted; the first error is
    /// returned. Cancellation re-marks everything not yet written.
    pub async fn flush_dirty(&self, shutdown: &CancellationToken) -> Result<()> {
        // Phase 1: snapshot under lock.
        let snapshots: Vec<FlushSnapshot> = {
            let mut shards = self.shards.lock().await;
            shards
                .iter_mut()
                .enumerate()
                .filter(|(_, s)| s.dirty)
                .map(|(idx, s)| {
                    s.dirty = false;
                    FlushSnapshot {
                        idx,
                        unifi_id: s.unifi_id.clone(),
                        name: s.name.clone(),
                        members: s.members.iter().cloned().collect(),
                    }
                })
                .collect()
        };

        if snapshots.is_empty() {
            return Ok(());
        }

        debug!(
            site = %self.site,
            family = %self.family,
            shards = snapshots.len(),
            "Flushing dirty shards"
        );

        // Phase 2: write outside the lock, in ascending shard order.
        let mut first_error: Option<EngineError> = None;

        for (i, snapshot) in snapshots.iter().enumerate() {
            if i > 0 && !self.cfg.api_shard_delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.remark_dirty(&snapshots[i..]).await;
                        return Err(first_error.unwrap_or(EngineError::Cancelled));
                    }
                    _ = tokio::time::sleep(self.cfg.api_shard_delay) => {}
                }
            }

            if self.cfg.dry_run {
                info!(
                    site = %self.site,
                    group = %snapshot.name,
                    members = snapshot.members.len(),
                    "dry-run: would update firewall group"
                );
                continue;
            }

            let _permit = match &self.flush_semaphore {
                Some(semaphore) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.remark_dirty(&snapshots[i..]).await;
                            return Err(first_error.unwrap_or(EngineError::Cancelled));
                        }
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                self.remark_dirty(&snapshots[i..]).await;
                                return Err(first_error.unwrap_or(EngineError::Cancelled));
                            }
                        }
                    }
                }
                None => None,
            };

            let group = FirewallGroup {
                id: Some(snapshot.unifi_id.clone()),
                name: snapshot.name.clone(),
                group_type: ub_unifi::GroupType::for_ipv6(self.family.is_ipv6()),
                members: snapshot.members.clone(),
            };

            match self.controller.update_firewall_group(&self.site, &group).await {
                Ok(()) => {
                    metrics::counter!("shard_flush_total", "result" => "ok").increment(1);
                    let record = GroupRecord {
                        unifi_id: snapshot.unifi_id.clone(),
                        site: self.site.clone(),
                        members: snapshot.members.clone(),
                        ipv6: self.family.is_ipv6(),
                    };
                    if let Err(error) = self.store.set_group(&snapshot.name, &record).await {
                        warn!(name = %snapshot.name, %error, "Failed to mirror flushed group");
                    }
                }
                Err(error) => {
                    metrics::counter!("shard_flush_total", "result" => "error").increment(1);
                    warn!(
                        site = %self.site,
                        group = %snapshot.name,
                        %error,
                        "Group update failed, re-marking shard dirty"
                    );
                    self.remark_dirty(std::slice::from_ref(snapshot)).await;
                    if first_error.is_none() {
                        first_error = Some(error.into());
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn remark_dirty(&self, snapshots: &[FlushSnapshot]) {
        let mut shards = self.shards.lock().await;
        for snapshot in snapshots {
            if let Some(shard) = shards.get_mut(snapshot.idx) {
                if shard.name == snapshot.name {
                    shard.dirty = true;
                }
            }
        }
    }

    /// The last shard's (controller id, index) iff it is empty and not the
    /// only shard. Shard 0 is never pruned.
    pub async fn prunable_tail(&self) -> Option<(String, usize)> {
        let shards = self.shards.lock().await;
        if shards.len() <= 1 {
            return None;
        }
        let last = shards.last().expect("len checked above");
        if last.members.is_empty() {
            Some((last.unifi_id.clone(), shards.len() - 1))
        } else {
            None
        }
    }

    /// Drop the tail shard locally and delete its persisted record. The
    /// caller must already have deleted the rule/policy and the controller
    /// group, in that order.
    pub async fn remove_tail(&self) -> Result<()> {
        let name = {
            let mut shards = self.shards.lock().await;
            if shards.len() <= 1 {
                return Ok(());
            }
            if !shards.last().expect("len checked above").members.is_empty() {
                return Ok(());
            }
            shards.pop().expect("len checked above").name
        };
        self.store.delete_group(&name).await?;
        debug!(site = %self.site, family = %self.family, %name, "Pruned tail shard");
        Ok(())
    }
}

/// Diff helper used by the reconciler: members present in shards but not
/// in `desired`.
pub fn members_to_remove(current: &BTreeSet<String>, desired: &HashSet<String>) -> Vec<String> {
    current
        .iter()
        .filter(|m| !desired.contains(*m))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ub_store::SqliteStore;
    use ub_unifi::MockController;

    fn config(capacity: usize) -> ShardManagerConfig {
        ShardManagerConfig {
            capacity,
            group_name_template: "crowdsec-{family}-{index}".to_string(),
            api_shard_delay: Duration::ZERO,
            dry_run: false,
        }
    }

    async fn manager(capacity: usize) -> (ShardManager, Arc<MockController>) {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let manager = ShardManager::new(
            "default".to_string(),
            Family::V4,
            config(capacity),
            controller.clone(),
            store,
            None,
        );
        manager.ensure_shards().await.unwrap();
        (manager, controller)
    }

    #[tokio::test]
    async fn bootstrap_creates_shard_zero() {
        let (manager, controller) = manager(5).await;
        assert_eq!(manager.shard_count().await, 1);
        assert_eq!(controller.call_count("create_firewall_group"), 1);
    }

    #[tokio::test]
    async fn add_is_idempotent_and_disjoint() {
        let (manager, _) = manager(5).await;

        let first = manager.add("1.1.1.1").await.unwrap();
        assert!(matches!(first, AddResult::Added { new_shard: None, .. }));

        let second = manager.add("1.1.1.1").await.unwrap();
        assert_eq!(second, AddResult::AlreadyPresent);

        assert_eq!(manager.all_members().await.len(), 1);
    }

    #[tokio::test]
    async fn capacity_overflow_creates_new_shard() {
        let (manager, controller) = manager(2).await;

        manager.add("1.1.1.1").await.unwrap();
        manager.add("1.1.1.2").await.unwrap();
        let third = manager.add("1.1.1.3").await.unwrap();

        match third {
            AddResult::Added { new_shard, shard_name } => {
                assert_eq!(new_shard, Some(1));
                assert_eq!(shard_name, "crowdsec-v4-1");
            }
            other => panic!("expected overflow add, got {other:?}"),
        }
        assert_eq!(manager.shard_count().await, 2);
        // Bootstrap + overflow.
        assert_eq!(controller.call_count("create_firewall_group"), 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (manager, _) = manager(5).await;
        manager.add("1.1.1.1").await.unwrap();

        assert!(manager.remove("1.1.1.1").await.unwrap());
        assert!(!manager.remove("1.1.1.1").await.unwrap());
        assert!(!manager.contains("1.1.1.1").await);
    }

    #[tokio::test]
    async fn flush_pushes_sorted_members_and_clears_dirty() {
        let (manager, controller) = manager(5).await;
        manager.add("9.9.9.9").await.unwrap();
        manager.add("1.1.1.1").await.unwrap();
        assert_eq!(manager.dirty_count().await, 1);

        let shutdown = CancellationToken::new();
        manager.flush_dirty(&shutdown).await.unwrap();

        assert_eq!(manager.dirty_count().await, 0);
        let groups = controller.groups("default");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec!["1.1.1.1", "9.9.9.9"]);
    }

    #[tokio::test]
    async fn flush_failure_remarks_dirty_and_returns_first_error() {
        let (manager, controller) = manager(1).await;
        manager.add("1.1.1.1").await.unwrap();
        manager.add("2.2.2.2").await.unwrap();
        assert_eq!(manager.dirty_count().await, 2);

        controller.fail_next(
            "update_firewall_group",
            UnifiError::Api {
                status: 500,
                message: "boom".to_string(),
            },
        );

        let shutdown = CancellationToken::new();
        let err = manager.flush_dirty(&shutdown).await.unwrap_err();
        assert!(matches!(err, EngineError::Controller(_)));

        // First shard re-marked dirty, second flushed clean.
        assert_eq!(manager.dirty_count().await, 1);
        assert_eq!(controller.call_count("update_firewall_group"), 2);

        // Retry succeeds and clears the remaining dirty bit.
        manager.flush_dirty(&shutdown).await.unwrap();
        assert_eq!(manager.dirty_count().await, 0);
    }

    #[tokio::test]
    async fn cancelled_flush_remarks_remaining() {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let mut cfg = config(1);
        cfg.api_shard_delay = Duration::from_secs(60);
        let manager = ShardManager::new(
            "default".to_string(),
            Family::V4,
            cfg,
            controller.clone(),
            store,
            None,
        );
        manager.ensure_shards().await.unwrap();
        manager.add("1.1.1.1").await.unwrap();
        manager.add("2.2.2.2").await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // First write happens (no delay before the first), the inter-shard
        // sleep then observes the cancel and re-marks the rest.
        let err = manager.flush_dirty(&shutdown).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(manager.dirty_count().await, 1);
    }

    #[tokio::test]
    async fn tail_pruning_only_when_empty_and_not_shard_zero() {
        let (manager, _) = manager(1).await;
        manager.add("1.1.1.1").await.unwrap();
        manager.add("2.2.2.2").await.unwrap();
        assert_eq!(manager.shard_count().await, 2);

        // Tail still has a member.
        assert!(manager.prunable_tail().await.is_none());

        manager.remove("2.2.2.2").await.unwrap();
        let (_, idx) = manager.prunable_tail().await.expect("tail prunable");
        assert_eq!(idx, 1);

        manager.remove_tail().await.unwrap();
        assert_eq!(manager.shard_count().await, 1);

        // Shard 0 is never prunable, even when empty.
        manager.remove("1.1.1.1").await.unwrap();
        assert!(manager.prunable_tail().await.is_none());
    }

    #[tokio::test]
    async fn bootstrap_overlays_controller_members() {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());

        // Seed a controller group and a stale mirror for it.
        let created = controller
            .create_firewall_group(
                "default",
                &FirewallGroup::new("crowdsec-v4-0", false, vec!["5.5.5.5".to_string()]),
            )
            .await
            .unwrap();
        store
            .set_group(
                "crowdsec-v4-0",
                &GroupRecord {
                    unifi_id: created.id.clone().unwrap(),
                    site: "default".to_string(),
                    members: vec!["6.6.6.6".to_string()],
                    ipv6: false,
                },
            )
            .await
            .unwrap();

        let manager = ShardManager::new(
            "default".to_string(),
            Family::V4,
            config(5),
            controller,
            store,
            None,
        );
        manager.ensure_shards().await.unwrap();

        // Controller wins over the stale mirror.
        let members = manager.all_members().await;
        assert!(members.contains("5.5.5.5"));
        assert!(!members.contains("6.6.6.6"));
    }

    #[tokio::test]
    async fn create_conflict_adopts_existing_group() {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());

        // A leftover group with the generated name already exists.
        controller
            .create_firewall_group(
                "default",
                &FirewallGroup::new("crowdsec-v4-0", false, vec!["7.7.7.7".to_string()]),
            )
            .await
            .unwrap();

        let manager = ShardManager::new(
            "default".to_string(),
            Family::V4,
            config(5),
            controller,
            store,
            None,
        );
        manager.ensure_shards().await.unwrap();

        assert!(manager.contains("7.7.7.7").await);
    }

    #[tokio::test]
    async fn dry_run_flush_touches_nothing() {
        let controller = Arc::new(MockController::new());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let mut cfg = config(5);
        cfg.dry_run = true;
        let manager = ShardManager::new(
            "default".to_string(),
            Family::V4,
            cfg,
            controller.clone(),
            store,
            None,
        );
        manager.ensure_shards().await.unwrap();
        manager.add("1.1.1.1").await.unwrap();

        let shutdown = CancellationToken::new();
        manager.flush_dirty(&shutdown).await.unwrap();

        assert_eq!(controller.call_count("create_firewall_group"), 0);
        assert_eq!(controller.call_count("update_firewall_group"), 0);
        assert_eq!(manager.dirty_count().await, 0);
    }
}
