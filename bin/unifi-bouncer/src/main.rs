//! CrowdSec UniFi bouncer daemon.
//!
//! Consumes blocklist decisions from the CrowdSec LAPI and projects them
//! onto UniFi controller firewall state (address groups plus drop rules or
//! zone policies), with a durable local mirror for deduplication, rate
//! limiting and drift reconciliation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ub_config::{AppConfig, ConfigLoader};
use ub_engine::api::{create_router, AppState};
use ub_engine::{
    DecisionFilter, DecisionHandler, FirewallManager, Lifecycle, LifecycleConfig, WorkerPool,
};
use ub_lapi::{LapiClient, UsageReporter};
use ub_store::{BanStore, SqliteStore};
use ub_unifi::{ControllerApi, UnifiClient};

/// Delay between bootstrap attempts when the controller is unreachable.
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "unifi-bouncer", about = "CrowdSec bouncer for UniFi controllers")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "UNIFI_BOUNCER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Run,
    /// Run one full reconcile and exit.
    Reconcile,
    /// Probe the local health endpoint; exits 0 iff healthy.
    Healthcheck,
    /// Print the version and exit.
    Version,
}

fn load_config(path: &Option<PathBuf>) -> Result<AppConfig> {
    let loader = match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    loader.load().context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    ub_common::logging::init_logging();

    match cli.command {
        Command::Run => run(&cli.config).await,
        Command::Reconcile => reconcile(&cli.config).await,
        Command::Healthcheck => healthcheck(&cli.config).await,
        Command::Version => {
            println!("unifi-bouncer {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let sites = config.unifi.sites.clone();
    let started_at = Instant::now();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sites = ?sites,
        dry_run = config.dry_run,
        "Starting unifi-bouncer"
    );

    // 1. Metrics recorder, installed before anything counts.
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    // 2. Persistent store; open failure is fatal by design.
    let store: Arc<dyn BanStore> = Arc::new(
        SqliteStore::open(std::path::Path::new(&config.store.path))
            .await
            .context("failed to open the bouncer store")?,
    );

    // 3. External clients.
    let controller = Arc::new(
        UnifiClient::new(config.unifi.clone()).context("failed to build controller client")?,
    );
    let lapi =
        Arc::new(LapiClient::new(config.lapi.clone()).context("failed to build LAPI client")?);
    let usage = Arc::new(UsageReporter::new());

    // 4. Engine assembly.
    let shutdown = CancellationToken::new();
    let manager = Arc::new(FirewallManager::new(
        config.firewall.clone(),
        config.dry_run,
        controller.clone(),
        store.clone(),
        shutdown.clone(),
    ));

    if !config.dry_run {
        if let Err(error) = controller.ping().await {
            warn!(%error, "Controller not reachable yet, bootstrap will retry");
        }
    }

    // Controller outages at startup are not fatal: keep trying until the
    // infrastructure is up or we are asked to stop.
    loop {
        match manager.ensure_infrastructure(&sites).await {
            Ok(()) => break,
            Err(error) => {
                error!(%error, "Infrastructure bootstrap failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(BOOTSTRAP_RETRY_DELAY) => {}
                }
            }
        }
    }

    let filter = Arc::new(
        DecisionFilter::new(&config.filter).context("invalid filter configuration")?,
    );
    let handler = Arc::new(DecisionHandler::new(
        manager.clone(),
        store.clone(),
        usage.clone(),
        sites.clone(),
        config.rate_gate.window,
        config.rate_gate.max_calls,
        config.ban_ttl,
        config.dry_run,
    ));
    let pool = Arc::new(WorkerPool::start(&config.pool, handler, shutdown.clone()));

    // 5. Startup reconcile.
    if config.reconcile.on_start {
        manager.reconcile(&sites).await;
    }

    // 6. Background tasks.
    let lifecycle = Lifecycle::start(
        LifecycleConfig {
            poll_interval: config.lapi.poll_interval,
            reconcile_interval: config.reconcile.interval,
            janitor_interval: config.janitor_interval,
            metrics_interval: config.lapi.metrics_interval,
            rate_window: config.rate_gate.window,
        },
        lapi.clone(),
        filter,
        pool.clone(),
        manager.clone(),
        store.clone(),
        usage,
        sites.clone(),
        shutdown.clone(),
    );

    // 7. Health/metrics listener.
    let app_state = AppState {
        lapi,
        store: store.clone(),
        pool: pool.clone(),
        poll_interval: config.lapi.poll_interval,
        prometheus,
        started_at,
    };
    let listener = tokio::net::TcpListener::bind(&config.http.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http.listen_addr))?;
    info!(addr = %config.http.listen_addr, "Health listener up");
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, create_router(app_state))
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(error) = result {
            error!(%error, "Health listener failed");
        }
    });

    // 8. Wait for a shutdown signal.
    shutdown_signal().await;
    info!("Shutdown signal received, draining");

    shutdown.cancel();
    pool.close().await;
    lifecycle.join().await;
    let _ = server.await;
    manager.final_flush(&sites).await;
    store.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn reconcile(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let sites = config.unifi.sites.clone();

    let store: Arc<dyn BanStore> = Arc::new(
        SqliteStore::open(std::path::Path::new(&config.store.path))
            .await
            .context("failed to open the bouncer store")?,
    );
    let controller = Arc::new(
        UnifiClient::new(config.unifi.clone()).context("failed to build controller client")?,
    );

    let shutdown = CancellationToken::new();
    let manager = FirewallManager::new(
        config.firewall.clone(),
        config.dry_run,
        controller,
        store.clone(),
        shutdown,
    );
    manager
        .ensure_infrastructure(&sites)
        .await
        .context("infrastructure bootstrap failed")?;

    let result = manager.reconcile(&sites).await;
    println!(
        "reconcile: added={} removed={} errors={} elapsed={:?}",
        result.added, result.removed, result.errors, result.elapsed
    );
    store.close().await;

    if result.errors > 0 {
        bail!("reconcile finished with {} errors", result.errors);
    }
    Ok(())
}

async fn healthcheck(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let url = format!("http://{}/healthz", config.http.listen_addr);

    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .with_context(|| format!("healthcheck request to {url} failed"))?;

    if response.status().is_success() {
        println!("ok");
        Ok(())
    } else {
        bail!("unhealthy: {}", response.status());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
