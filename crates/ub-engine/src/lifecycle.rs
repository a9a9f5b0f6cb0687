//! Background tasks of the daemon.
//!
//! Handles:
//! - Decision-stream polling (startup pull, then deltas) feeding the pool
//! - Periodic full reconcile (interval-driven, zero disables)
//! - Janitor: expired-ban and stale rate-entry pruning
//! - Usage-metrics reporting back to the LAPI
//!
//! Every task selects on the root cancellation token and exits cleanly.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ub_lapi::{LapiClient, UsageReporter};
use ub_store::BanStore;

use crate::filter::{DecisionFilter, FilterOutcome};
use crate::manager::FirewallManager;
use crate::pool::{Job, WorkerPool};

pub struct LifecycleConfig {
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub janitor_interval: Duration,
    pub metrics_interval: Duration,
    /// Window used when pruning stale rate-ledger entries.
    pub rate_window: Duration,
}

/// Spawns and tracks the daemon's periodic tasks.
pub struct Lifecycle {
    tasks: Vec<JoinHandle<()>>,
}

impl Lifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        cfg: LifecycleConfig,
        lapi: Arc<LapiClient>,
        filter: Arc<DecisionFilter>,
        pool: Arc<WorkerPool>,
        manager: Arc<FirewallManager>,
        store: Arc<dyn BanStore>,
        usage: Arc<UsageReporter>,
        sites: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut tasks = Vec::new();

        // Decision stream poller.
        {
            let lapi = lapi.clone();
            let usage = usage.clone();
            let shutdown = shutdown.clone();
            let interval = cfg.poll_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut startup = true;

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Decision poller shutting down");
                            break;
                        }
                        _ = ticker.tick() => {}
                    }

                    match lapi.poll_stream(startup).await {
                        Ok(delta) => {
                            startup = false;
                            dispatch_decisions(&filter, &pool, &usage, delta);
                        }
                        Err(error) => {
                            warn!(%error, "Decision stream poll failed");
                        }
                    }
                }
            }));
        }

        // Periodic reconciler.
        if !cfg.reconcile_interval.is_zero() {
            let manager = manager.clone();
            let sites = sites.clone();
            let shutdown = shutdown.clone();
            let interval = cfg.reconcile_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The startup reconcile is the daemon's call; skip the
                // immediate tick.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Reconciler shutting down");
                            break;
                        }
                        _ = ticker.tick() => {
                            debug!("Periodic reconcile starting");
                            manager.reconcile(&sites).await;
                        }
                    }
                }
            }));
        }

        // Janitor: expiry and rate-ledger GC.
        if !cfg.janitor_interval.is_zero() {
            let store = store.clone();
            let shutdown = shutdown.clone();
            let interval = cfg.janitor_interval;
            let rate_window = cfg.rate_window;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Janitor shutting down");
                            break;
                        }
                        _ = ticker.tick() => {
                            if let Err(error) = store.prune_expired_bans().await {
                                warn!(%error, "Janitor: ban pruning failed");
                            }
                            if let Err(error) =
                                store.prune_expired_rate_entries(rate_window).await
                            {
                                warn!(%error, "Janitor: rate-ledger pruning failed");
                            }
                        }
                    }
                }
            }));
        }

        // Usage-metrics reporter.
        if !cfg.metrics_interval.is_zero() {
            let shutdown = shutdown.clone();
            let interval = cfg.metrics_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Usage reporter shutting down");
                            break;
                        }
                        _ = ticker.tick() => {
                            let Some(payload) = usage.drain() else {
                                continue;
                            };
                            if let Err(error) = lapi.push_usage_metrics(&payload).await {
                                warn!(%error, "Usage metrics push failed, retaining window");
                                usage.restore(&payload);
                            }
                        }
                    }
                }
            }));
        }

        info!(tasks = tasks.len(), "Lifecycle tasks started");
        Self { tasks }
    }

    /// Wait for every task to observe the cancellation and exit.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Filter one poll's decisions and enqueue the survivors. The `deleted`
/// list implies an unban regardless of the decision's own type.
fn dispatch_decisions(
    filter: &DecisionFilter,
    pool: &WorkerPool,
    usage: &UsageReporter,
    delta: ub_lapi::DecisionsDelta,
) {
    let deleted = delta.deleted.into_iter().map(|mut decision| {
        decision.action = "delete".to_string();
        decision
    });

    for decision in delta.new.into_iter().chain(deleted) {
        let origin = decision.origin.clone().unwrap_or_default();
        match filter.evaluate(&decision) {
            FilterOutcome::Accepted(verdict) => {
                let job = Job {
                    action: verdict.action,
                    value: verdict.value,
                    ipv6: verdict.ipv6,
                    duration: verdict.duration,
                    origin: origin.clone(),
                    site: None,
                };
                if !pool.enqueue(job) {
                    usage.record_dropped(&origin);
                }
            }
            FilterOutcome::Rejected(_) => {
                usage.record_dropped(&origin);
            }
        }
    }
}
