//! Worker pool with bounded queue and inline retry.
//!
//! A fixed set of workers drains one bounded job queue. Enqueue never
//! blocks: a full queue drops the job (counted). Failed jobs are retried
//! inline by the worker that owns them with exponential backoff; jobs are
//! never re-enqueued, which rules out the send-on-closed-queue race during
//! shutdown. Closing the queue drains everything already accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ub_common::BanAction;
use ub_config::PoolConfig;

use crate::error::Result;

/// Longest single backoff sleep between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// One unit of work: apply or lift a single ban.
#[derive(Debug, Clone)]
pub struct Job {
    pub action: BanAction,
    /// Canonical IP/CIDR text (the store key).
    pub value: String,
    pub ipv6: bool,
    pub duration: Option<Duration>,
    /// Decision origin, carried for usage metrics.
    pub origin: String,
    /// Restrict the job to one site; `None` fans out to all configured
    /// sites.
    pub site: Option<String>,
}

/// Job execution callback.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub accepted: AtomicU64,
    pub dropped_full: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
}

pub struct WorkerPool {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawn the workers and return the running pool.
    pub fn start(
        cfg: &PoolConfig,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_count = cfg.workers.clamp(1, 64);
        let (tx, rx) = mpsc::channel::<Job>(cfg.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = rx.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let max_retries = cfg.max_retries;
            let retry_base = cfg.retry_base;

            workers.push(tokio::spawn(async move {
                Self::worker_loop(
                    worker_id,
                    rx,
                    handler,
                    shutdown,
                    stats,
                    max_retries,
                    retry_base,
                )
                .await;
            }));
        }

        info!(
            workers = worker_count,
            queue_depth = cfg.queue_depth,
            max_retries = cfg.max_retries,
            "Worker pool started"
        );

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            stats,
        }
    }

    /// Non-blocking enqueue. Returns whether the job was accepted; a full
    /// or closed queue drops it.
    pub fn enqueue(&self, job: Job) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!(value = %job.value, "Queue closed, dropping job");
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.stats.dropped_full.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("jobs_dropped", "reason" => "buffer_full").increment(1);
                warn!(value = %job.value, "Job queue full, dropping decision");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the queue (idempotent) and wait for the workers to drain it.
    pub async fn close(&self) {
        let taken = self.tx.lock().take();
        if taken.is_some() {
            info!("Job queue closed, draining workers");
        }
        drop(taken);

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
        stats: Arc<PoolStats>,
        max_retries: u32,
        retry_base: Duration,
    ) {
        debug!(worker_id, "Worker started");

        loop {
            // Hold the receiver lock only while waiting for the next job.
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    job = rx.recv() => job,
                }
            };

            let Some(job) = job else {
                break;
            };

            Self::run_job(
                &job,
                handler.as_ref(),
                &shutdown,
                &stats,
                max_retries,
                retry_base,
            )
            .await;
        }

        debug!(worker_id, "Worker exited");
    }

    /// Execute one job with inline exponential backoff. `max_retries = R`
    /// allows up to R+1 attempts.
    async fn run_job(
        job: &Job,
        handler: &dyn JobHandler,
        shutdown: &CancellationToken,
        stats: &PoolStats,
        max_retries: u32,
        retry_base: Duration,
    ) {
        let mut attempt: u32 = 0;

        loop {
            match handler.handle(job).await {
                Ok(()) => {
                    stats.processed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("jobs_processed", "action" => job.action.as_str())
                        .increment(1);
                    return;
                }
                Err(error) => {
                    if attempt >= max_retries {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("jobs_failed").increment(1);
                        warn!(
                            value = %job.value,
                            action = %job.action,
                            attempts = attempt + 1,
                            %error,
                            "Job failed, retries exhausted"
                        );
                        return;
                    }

                    let backoff = backoff_delay(retry_base, attempt);
                    attempt += 1;
                    debug!(
                        value = %job.value,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %error,
                        "Job errored, backing off"
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            debug!(value = %job.value, "Backoff cancelled, abandoning job");
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, 12), MAX_BACKOFF);
        // Large attempt counts must not overflow.
        assert_eq!(backoff_delay(base, u32::MAX), MAX_BACKOFF);
    }
}
