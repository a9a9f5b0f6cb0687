//! CrowdSec LAPI client.
//!
//! Polls the decision stream (one startup pull, then deltas) and reports
//! usage metrics back to the LAPI. The poll loop itself lives in the
//! daemon; this crate stays a passive client.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use ub_common::Decision;
use ub_config::LapiConfig;

const API_KEY_HEADER: &str = "X-Api-Key";
const USER_AGENT: &str = concat!("unifi-bouncer/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum LapiError {
    #[error("LAPI rejected the API key")]
    Unauthorized,

    #[error("LAPI error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, LapiError>;

/// One poll's worth of decisions.
#[derive(Debug, Default)]
pub struct DecisionsDelta {
    pub new: Vec<Decision>,
    pub deleted: Vec<Decision>,
}

/// Wire shape of the stream response; both arrays may arrive as `null`.
#[derive(Debug, Deserialize)]
struct RawStreamResponse {
    #[serde(default)]
    new: Option<Vec<Decision>>,
    #[serde(default)]
    deleted: Option<Vec<Decision>>,
}

pub struct LapiClient {
    http: reqwest::Client,
    cfg: LapiConfig,
    /// Instant of the last successful stream poll, for health reporting.
    last_poll: Mutex<Option<Instant>>,
}

impl LapiClient {
    pub fn new(cfg: LapiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30));
        if cfg.insecure_skip_verify {
            warn!("TLS certificate verification disabled for LAPI connection");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        info!(url = %cfg.url, "LAPI client initialized");
        Ok(Self {
            http,
            cfg,
            last_poll: Mutex::new(None),
        })
    }

    /// Fetch the decision stream. `startup=true` asks the LAPI for the full
    /// active set instead of a delta; the daemon passes it on the first poll
    /// only.
    pub async fn poll_stream(&self, startup: bool) -> Result<DecisionsDelta> {
        let url = format!(
            "{}/v1/decisions/stream?startup={}",
            self.cfg.url.trim_end_matches('/'),
            startup
        );

        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, self.cfg.api_key.expose())
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 403 || status.as_u16() == 401 {
            return Err(LapiError::Unauthorized);
        }
        if !status.is_success() {
            return Err(LapiError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let raw: RawStreamResponse = response.json().await?;
        let delta = DecisionsDelta {
            new: raw.new.unwrap_or_default(),
            deleted: raw.deleted.unwrap_or_default(),
        };

        *self.last_poll.lock() = Some(Instant::now());
        debug!(
            new = delta.new.len(),
            deleted = delta.deleted.len(),
            startup,
            "Polled decision stream"
        );
        Ok(delta)
    }

    /// Age of the last successful poll, `None` before the first one.
    pub fn last_poll_age(&self) -> Option<Duration> {
        self.last_poll.lock().map(|at| at.elapsed())
    }

    pub async fn push_usage_metrics(&self, payload: &UsageMetricsPayload) -> Result<()> {
        let url = format!(
            "{}/v1/usage-metrics",
            self.cfg.url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, self.cfg.api_key.expose())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 403 || status.as_u16() == 401 {
            return Err(LapiError::Unauthorized);
        }
        if !status.is_success() {
            return Err(LapiError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Usage metrics
// ============================================================================

#[derive(Debug, Serialize)]
pub struct UsageMetricsPayload {
    pub remediation_components: Vec<RemediationComponent>,
}

#[derive(Debug, Serialize)]
pub struct RemediationComponent {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub version: String,
    pub utc_startup_timestamp: i64,
    pub metrics: Vec<MetricsDetail>,
}

#[derive(Debug, Serialize)]
pub struct MetricsDetail {
    pub meta: MetricsMeta,
    pub items: Vec<MetricsItem>,
}

#[derive(Debug, Serialize)]
pub struct MetricsMeta {
    pub window_size_seconds: u64,
    pub utc_now_timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct MetricsItem {
    pub name: String,
    pub value: u64,
    pub unit: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct UsageWindow {
    /// (origin, action) -> count of decisions applied upstream.
    processed: HashMap<(String, String), u64>,
    /// origin -> count of decisions dropped before application.
    dropped: HashMap<String, u64>,
    window_start: Option<DateTime<Utc>>,
}

/// Accumulates per-origin decision counts between reports.
///
/// The handler records events on success paths; the daemon flushes on the
/// configured metrics interval. A failed flush keeps the window so counts
/// carry over to the next attempt.
pub struct UsageReporter {
    window: Mutex<UsageWindow>,
    startup: DateTime<Utc>,
}

impl UsageReporter {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(UsageWindow::default()),
            startup: Utc::now(),
        }
    }

    pub fn record_processed(&self, origin: &str, action: &str) {
        let mut window = self.window.lock();
        window.window_start.get_or_insert_with(Utc::now);
        *window
            .processed
            .entry((origin.to_string(), action.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_dropped(&self, origin: &str) {
        let mut window = self.window.lock();
        window.window_start.get_or_insert_with(Utc::now);
        *window.dropped.entry(origin.to_string()).or_insert(0) += 1;
    }

    /// Build the payload for the current window and clear it. Returns `None`
    /// when nothing was recorded. On a failed push, call [`Self::restore`]
    /// with the payload's source window preserved via this two-step shape.
    pub fn drain(&self) -> Option<UsageMetricsPayload> {
        let mut window = self.window.lock();
        if window.processed.is_empty() && window.dropped.is_empty() {
            return None;
        }
        let taken = std::mem::take(&mut *window);
        drop(window);

        let now = Utc::now();
        let window_size = taken
            .window_start
            .map(|start| (now - start).num_seconds().max(0) as u64)
            .unwrap_or(0);

        let mut items = Vec::new();
        for ((origin, action), value) in &taken.processed {
            items.push(MetricsItem {
                name: "processed".to_string(),
                value: *value,
                unit: "request".to_string(),
                labels: HashMap::from([
                    ("origin".to_string(), origin.clone()),
                    ("remediation".to_string(), action.clone()),
                ]),
            });
        }
        for (origin, value) in &taken.dropped {
            items.push(MetricsItem {
                name: "dropped".to_string(),
                value: *value,
                unit: "request".to_string(),
                labels: HashMap::from([("origin".to_string(), origin.clone())]),
            });
        }

        Some(UsageMetricsPayload {
            remediation_components: vec![RemediationComponent {
                name: "unifi-bouncer".to_string(),
                component_type: "unifi-bouncer".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                utc_startup_timestamp: self.startup.timestamp(),
                metrics: vec![MetricsDetail {
                    meta: MetricsMeta {
                        window_size_seconds: window_size,
                        utc_now_timestamp: now.timestamp(),
                    },
                    items,
                }],
            }],
        })
    }

    /// Put counts back after a failed push so they report next time.
    pub fn restore(&self, payload: &UsageMetricsPayload) {
        let mut window = self.window.lock();
        for component in &payload.remediation_components {
            for detail in &component.metrics {
                for item in &detail.items {
                    let origin = item
                        .labels
                        .get("origin")
                        .cloned()
                        .unwrap_or_default();
                    match item.name.as_str() {
                        "processed" => {
                            let action = item
                                .labels
                                .get("remediation")
                                .cloned()
                                .unwrap_or_default();
                            *window.processed.entry((origin, action)).or_insert(0) +=
                                item.value;
                        }
                        _ => {
                            *window.dropped.entry(origin).or_insert(0) += item.value;
                        }
                    }
                }
            }
        }
        window.window_start.get_or_insert_with(Utc::now);
    }
}

impl Default for UsageReporter {
    fn default() -> Self {
        Self::new()
    }
}
