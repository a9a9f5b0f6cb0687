//! Full-pipeline tests: a mocked LAPI decision stream drives the filter,
//! pool, handler and manager down to controller group state.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ub_common::Redacted;
use ub_config::{FilterConfig, FirewallConfig, FirewallMode, LapiConfig, PoolConfig};
use ub_engine::{
    DecisionFilter, DecisionHandler, FirewallManager, Lifecycle, LifecycleConfig, WorkerPool,
};
use ub_lapi::{LapiClient, UsageReporter};
use ub_store::{BanStore, SqliteStore};
use ub_unifi::MockController;

fn lapi_config(server: &MockServer, poll_interval: Duration) -> LapiConfig {
    LapiConfig {
        url: server.uri(),
        api_key: Redacted::new("key"),
        poll_interval,
        metrics_interval: Duration::ZERO,
        insecure_skip_verify: false,
    }
}

async fn wait_until<F>(mut probe: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn stream_decisions_reach_the_controller() {
    let lapi_server = MockServer::start().await;

    // Startup pull delivers one ban; subsequent polls delete it again.
    Mock::given(method("GET"))
        .and(path("/v1/decisions/stream"))
        .and(query_param("startup", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "new": [
                {"type": "ban", "scope": "ip", "value": "203.0.113.9",
                 "scenario": "crowdsecurity/http-probing", "origin": "crowdsec",
                 "duration": "4h"}
            ],
            "deleted": null,
        })))
        .up_to_n_times(1)
        .mount(&lapi_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/decisions/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "new": null,
            "deleted": [
                {"type": "ban", "scope": "ip", "value": "203.0.113.9",
                 "scenario": "crowdsecurity/http-probing", "origin": "crowdsec",
                 "duration": "0s"}
            ],
        })))
        .mount(&lapi_server)
        .await;

    let controller = Arc::new(MockController::new());
    let store: Arc<SqliteStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let shutdown = CancellationToken::new();

    let firewall_cfg = FirewallConfig {
        mode: FirewallMode::Legacy,
        enable_ipv6: false,
        batch_window: Duration::from_millis(100),
        api_shard_delay: Duration::ZERO,
        ..FirewallConfig::default()
    };
    let manager = Arc::new(FirewallManager::new(
        firewall_cfg,
        false,
        controller.clone(),
        store.clone(),
        shutdown.clone(),
    ));
    manager
        .ensure_infrastructure(&["default".to_string()])
        .await
        .unwrap();

    let usage = Arc::new(UsageReporter::new());
    let handler = Arc::new(DecisionHandler::new(
        manager.clone(),
        store.clone(),
        usage.clone(),
        vec!["default".to_string()],
        Duration::from_secs(60),
        0,
        Duration::ZERO,
        false,
    ));
    let pool = Arc::new(WorkerPool::start(
        &PoolConfig {
            workers: 2,
            queue_depth: 64,
            max_retries: 2,
            retry_base: Duration::from_millis(10),
        },
        handler,
        shutdown.clone(),
    ));

    let lapi = Arc::new(LapiClient::new(lapi_config(&lapi_server, Duration::from_millis(500))).unwrap());
    let filter = Arc::new(DecisionFilter::new(&FilterConfig::default()).unwrap());

    let lifecycle = Lifecycle::start(
        LifecycleConfig {
            poll_interval: Duration::from_millis(500),
            reconcile_interval: Duration::ZERO,
            janitor_interval: Duration::ZERO,
            metrics_interval: Duration::ZERO,
            rate_window: Duration::from_secs(60),
        },
        lapi,
        filter,
        pool.clone(),
        manager.clone(),
        store.clone(),
        usage,
        vec!["default".to_string()],
        shutdown.clone(),
    );

    // The startup ban lands in the controller group after the batch window.
    let banned_controller = controller.clone();
    wait_until(
        move || {
            banned_controller
                .groups("default")
                .first()
                .is_some_and(|g| g.members.contains(&"203.0.113.9".to_string()))
        },
        "ban to reach the controller",
    )
    .await;

    // The delete from the next poll empties the group again.
    let emptied_controller = controller.clone();
    wait_until(
        move || {
            emptied_controller
                .groups("default")
                .first()
                .is_some_and(|g| g.members.is_empty())
        },
        "unban to reach the controller",
    )
    .await;

    shutdown.cancel();
    pool.close().await;
    lifecycle.join().await;

    assert!(!store.ban_exists("203.0.113.9").await.unwrap());
}
