//! Local operational HTTP surface.
//!
//! Two endpoints on the loopback listener: `/healthz` for the CLI
//! healthcheck and liveness probes, `/metrics` for Prometheus scrapes.
//! `/status` adds a small JSON snapshot for humans.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use ub_lapi::LapiClient;
use ub_store::BanStore;

use crate::pool::WorkerPool;

/// Stream staleness beyond this many poll intervals reports degraded.
const STALE_POLL_FACTOR: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub lapi: Arc<LapiClient>,
    pub store: Arc<dyn BanStore>,
    pub pool: Arc<WorkerPool>,
    pub poll_interval: Duration,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

fn stream_is_fresh(state: &AppState) -> bool {
    let threshold = state.poll_interval * STALE_POLL_FACTOR;
    match state.lapi.last_poll_age() {
        Some(age) => age <= threshold,
        // Never polled: allow a startup grace of the same length.
        None => state.started_at.elapsed() <= threshold,
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if stream_is_fresh(&state) {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "UP",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "DEGRADED",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: u64,
    last_poll_age_seconds: Option<u64>,
    jobs_accepted: u64,
    jobs_processed: u64,
    jobs_failed: u64,
    jobs_dropped_full: u64,
    store_size_bytes: u64,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pool.stats();
    let response = StatusResponse {
        status: if stream_is_fresh(&state) { "UP" } else { "DEGRADED" },
        uptime_seconds: state.started_at.elapsed().as_secs(),
        last_poll_age_seconds: state.lapi.last_poll_age().map(|d| d.as_secs()),
        jobs_accepted: stats.accepted.load(Ordering::Relaxed),
        jobs_processed: stats.processed.load(Ordering::Relaxed),
        jobs_failed: stats.failed.load(Ordering::Relaxed),
        jobs_dropped_full: stats.dropped_full.load(Ordering::Relaxed),
        store_size_bytes: state.store.size_bytes().await.unwrap_or(0),
    };
    Json(response)
}
