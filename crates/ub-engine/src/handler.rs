//! Per-job pipeline: idempotency gate, rate gate, per-site apply,
//! post-apply persistence and usage accounting.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use ub_common::{BanAction, BanEntry};
use ub_lapi::UsageReporter;
use ub_store::BanStore;

use crate::error::{EngineError, Result};
use crate::manager::FirewallManager;
use crate::pool::{Job, JobHandler};

/// Endpoint tag under which group updates are rate-accounted.
pub const RATE_GATE_ENDPOINT: &str = "unifi-group-update";

pub struct DecisionHandler {
    manager: Arc<FirewallManager>,
    store: Arc<dyn BanStore>,
    usage: Arc<UsageReporter>,
    /// Sites a job without an explicit site fans out to.
    sites: Vec<String>,
    rate_window: Duration,
    rate_max: i64,
    /// Fallback expiry for bans without a decision duration; zero = never.
    ban_ttl: Duration,
    dry_run: bool,
}

impl DecisionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<FirewallManager>,
        store: Arc<dyn BanStore>,
        usage: Arc<UsageReporter>,
        sites: Vec<String>,
        rate_window: Duration,
        rate_max: i64,
        ban_ttl: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            manager,
            store,
            usage,
            sites,
            rate_window,
            rate_max,
            ban_ttl,
            dry_run,
        }
    }

    fn drop_job(reason: &'static str, job: &Job) {
        metrics::counter!("jobs_dropped", "reason" => reason).increment(1);
        debug!(value = %job.value, action = %job.action, reason, "Job dropped");
    }

    fn expiry_for(&self, job: &Job) -> Option<chrono::DateTime<Utc>> {
        let ttl = job.duration.or_else(|| {
            (!self.ban_ttl.is_zero()).then_some(self.ban_ttl)
        })?;
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|d| Utc::now() + d)
    }
}

#[async_trait::async_trait]
impl JobHandler for DecisionHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        // 1. Idempotency against the mirror.
        let exists = self.store.ban_exists(&job.value).await?;
        match job.action {
            BanAction::Ban if exists => {
                Self::drop_job("already_banned", job);
                return Ok(());
            }
            BanAction::Delete if !exists => {
                Self::drop_job("not_found", job);
                return Ok(());
            }
            _ => {}
        }

        // 2. Rolling-window rate gate; a denial is retriable so the pool
        // backs off until the window frees up.
        if self.rate_max > 0 && !self.dry_run {
            let admitted = self
                .store
                .api_rate_gate(RATE_GATE_ENDPOINT, self.rate_window, self.rate_max)
                .await?;
            if !admitted {
                Self::drop_job("rate_limited", job);
                return Err(EngineError::RateDeferred);
            }
        }

        // 3. Per-site apply; an explicit job site narrows the fan-out.
        let sites: &[String] = match &job.site {
            Some(site) => std::slice::from_ref(site),
            None => &self.sites,
        };
        for site in sites {
            match job.action {
                BanAction::Ban => {
                    self.manager
                        .clone()
                        .apply_ban(site, &job.value, job.ipv6)
                        .await?
                }
                BanAction::Delete => {
                    self.manager
                        .clone()
                        .apply_unban(site, &job.value, job.ipv6)
                        .await?
                }
            }
        }

        // 4. Persistence and usage events. Mirror failures never roll back
        // controller state; the next reconcile repairs the drift.
        if self.dry_run {
            return Ok(());
        }

        let mirror_result = match job.action {
            BanAction::Ban => {
                let entry = BanEntry {
                    recorded_at: Utc::now(),
                    expires_at: self.expiry_for(job),
                    ipv6: job.ipv6,
                };
                self.store.ban_record(&job.value, &entry).await
            }
            BanAction::Delete => self.store.ban_delete(&job.value).await,
        };
        if let Err(error) = mirror_result {
            warn!(value = %job.value, %error, "Ban mirror write failed, reconcile will repair");
        }

        self.usage.record_processed(&job.origin, job.action.as_str());
        Ok(())
    }
}
