//! WorkerPool contract tests: retry budget, non-blocking enqueue,
//! drain-on-close and cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use ub_common::BanAction;
use ub_config::PoolConfig;
use ub_engine::error::EngineError;
use ub_engine::{Job, JobHandler, WorkerPool};

struct TestHandler {
    calls: AtomicUsize,
    fail: AtomicBool,
    /// Per-call sleep to keep workers busy for capacity tests.
    busy_for: Duration,
}

impl TestHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            busy_for: Duration::ZERO,
        })
    }

    fn failing() -> Arc<Self> {
        let handler = Self::new();
        handler.fail.store(true, Ordering::SeqCst);
        handler
    }

    fn busy(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            busy_for: duration,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JobHandler for TestHandler {
    async fn handle(&self, _job: &Job) -> ub_engine::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.busy_for.is_zero() {
            tokio::time::sleep(self.busy_for).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            Err(EngineError::RateDeferred)
        } else {
            Ok(())
        }
    }
}

fn job(value: &str) -> Job {
    Job {
        action: BanAction::Ban,
        value: value.to_string(),
        ipv6: false,
        duration: None,
        origin: "crowdsec".to_string(),
        site: None,
    }
}

fn pool_config(workers: usize, queue_depth: usize, max_retries: u32) -> PoolConfig {
    PoolConfig {
        workers,
        queue_depth,
        max_retries,
        retry_base: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn jobs_drain_to_completion_on_close() {
    let handler = TestHandler::new();
    let pool = WorkerPool::start(
        &pool_config(2, 16, 0),
        handler.clone(),
        CancellationToken::new(),
    );

    for i in 0..10 {
        assert!(pool.enqueue(job(&format!("10.0.0.{i}"))));
    }
    pool.close().await;

    assert_eq!(handler.calls(), 10);
    assert_eq!(pool.stats().processed.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn retry_budget_is_max_retries_plus_one() {
    let handler = TestHandler::failing();
    let pool = WorkerPool::start(
        &pool_config(1, 4, 3),
        handler.clone(),
        CancellationToken::new(),
    );

    assert!(pool.enqueue(job("1.2.3.4")));
    pool.close().await;

    assert_eq!(handler.calls(), 4);
    assert_eq!(pool.stats().failed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_retries_means_single_attempt() {
    let handler = TestHandler::failing();
    let pool = WorkerPool::start(
        &pool_config(1, 4, 0),
        handler.clone(),
        CancellationToken::new(),
    );

    assert!(pool.enqueue(job("1.2.3.4")));
    pool.close().await;

    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn full_queue_drops_without_blocking() {
    // One worker stuck on a long job, queue depth 1: the first job occupies
    // the worker, the second fills the queue, the third must be rejected
    // immediately.
    let handler = TestHandler::busy(Duration::from_secs(60));
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::start(&pool_config(1, 1, 0), handler.clone(), shutdown.clone());

    assert!(pool.enqueue(job("1.1.1.1")));
    // Give the worker a moment to pick up the first job.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pool.enqueue(job("1.1.1.2")));

    let started = std::time::Instant::now();
    assert!(!pool.enqueue(job("1.1.1.3")));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(pool.stats().dropped_full.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn enqueue_after_close_is_rejected() {
    let handler = TestHandler::new();
    let pool = WorkerPool::start(
        &pool_config(1, 4, 0),
        handler.clone(),
        CancellationToken::new(),
    );

    pool.close().await;
    assert!(!pool.enqueue(job("1.2.3.4")));

    // Close is idempotent.
    pool.close().await;
}

#[tokio::test]
async fn cancellation_aborts_backoff() {
    let handler = TestHandler::failing();
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::start(
        &PoolConfig {
            workers: 1,
            queue_depth: 4,
            max_retries: 5,
            // Long enough that the test would hang if backoff ignored the
            // cancel.
            retry_base: Duration::from_secs(60),
        },
        handler.clone(),
        shutdown.clone(),
    );

    assert!(pool.enqueue(job("1.2.3.4")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), pool.close())
        .await
        .expect("close must not hang once cancelled");

    // No second attempt was made.
    assert_eq!(handler.calls(), 1);
    assert_eq!(pool.stats().failed.load(Ordering::SeqCst), 1);
}
