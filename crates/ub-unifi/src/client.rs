//! HTTP client for classic and UniFi-OS controllers.
//!
//! Session handling: cookie store plus captured `x-csrf-token`. Any call
//! that comes back 401 triggers one deduplicated re-auth and one retry;
//! persistent 401s surface to the caller. Re-logins within
//! `min_reauth_interval` of the last success are suppressed so a burst of
//! expired-session calls produces a single login.

use parking_lot::{Mutex, RwLock};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ub_config::UnifiConfig;

use crate::error::{Result, UnifiError};
use crate::types::{Envelope, FirewallGroup, FirewallRule, Zone, ZonePolicy};
use crate::ControllerApi;

/// Header carrying the controller API key, when key auth is configured.
const API_KEY_HEADER: &str = "x-api-key";
const CSRF_HEADER: &str = "x-csrf-token";

pub struct UnifiClient {
    http: reqwest::Client,
    cfg: UnifiConfig,
    csrf: Mutex<Option<String>>,
    /// Serializes logins and records the last success for herd suppression.
    auth: tokio::sync::Mutex<AuthState>,
    /// Probe results cached per (site, feature).
    features: RwLock<HashMap<(String, String), bool>>,
}

#[derive(Default)]
struct AuthState {
    last_success: Option<Instant>,
}

impl UnifiClient {
    pub fn new(cfg: UnifiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(cfg.timeout)
            .connect_timeout(Duration::from_secs(10));

        if cfg.insecure_skip_verify {
            warn!("TLS certificate verification disabled for controller connection");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build()?;

        info!(url = %cfg.url, unifi_os = cfg.is_unifi_os, "UniFi client initialized");

        Ok(Self {
            http,
            cfg,
            csrf: Mutex::new(None),
            auth: tokio::sync::Mutex::new(AuthState::default()),
            features: RwLock::new(HashMap::new()),
        })
    }

    fn uses_api_key(&self) -> bool {
        !self.cfg.api_key.is_empty()
    }

    /// Network-application path prefix; UniFi OS proxies the network app.
    fn network_path(&self, path: &str) -> String {
        if self.cfg.is_unifi_os {
            format!("{}/proxy/network{}", self.cfg.url, path)
        } else {
            format!("{}{}", self.cfg.url, path)
        }
    }

    fn login_url(&self) -> String {
        if self.cfg.is_unifi_os {
            format!("{}/api/auth/login", self.cfg.url)
        } else {
            format!("{}/api/login", self.cfg.url)
        }
    }

    /// Authenticate, deduplicating concurrent attempts. A login that
    /// succeeded within `min_reauth_interval` satisfies later callers
    /// without touching the controller again.
    pub async fn ensure_auth(&self) -> Result<()> {
        if self.uses_api_key() {
            return Ok(());
        }

        let mut state = self.auth.lock().await;
        if let Some(last) = state.last_success {
            if last.elapsed() < self.cfg.min_reauth_interval {
                debug!("Re-auth suppressed, recent login still fresh");
                return Ok(());
            }
        }

        let response = self
            .http
            .post(self.login_url())
            .json(&json!({
                "username": self.cfg.username,
                "password": self.cfg.password.expose(),
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UnifiError::Unauthorized);
        }
        if !status.is_success() {
            return Err(UnifiError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        if let Some(token) = response
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.csrf.lock() = Some(token.to_string());
        }

        state.last_success = Some(Instant::now());
        info!("Authenticated against controller");
        Ok(())
    }

    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let mut request = self.http.request(method.clone(), url);

        if self.uses_api_key() {
            request = request.header(API_KEY_HEADER, self.cfg.api_key.expose());
        }
        if method != Method::GET {
            if let Some(token) = self.csrf.lock().clone() {
                request = request.header(CSRF_HEADER, token);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UnifiError::Unauthorized),
            StatusCode::NOT_FOUND => Err(UnifiError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(UnifiError::RateLimited { retry_after })
            }
            StatusCode::CONFLICT => Err(UnifiError::Conflict(
                response.text().await.unwrap_or_default(),
            )),
            _ if !status.is_success() => Err(UnifiError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(response),
        }
    }

    /// Execute with a single re-auth retry on 401.
    async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        match self.execute(method.clone(), url, body).await {
            Err(UnifiError::Unauthorized) if !self.uses_api_key() => {
                debug!(%url, "Unauthorized, re-authenticating once");
                self.ensure_auth().await?;
                self.execute(method, url, body).await
            }
            other => other,
        }
    }

    /// GET a classic endpoint and unwrap its envelope.
    async fn legacy_list<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let response = self.request(Method::GET, url, None::<&()>).await?;
        let envelope: Envelope<T> = response.json().await?;
        check_envelope(&envelope)?;
        Ok(envelope.data)
    }

    /// POST to a classic endpoint and return the created entity.
    async fn legacy_create<T, B>(&self, url: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.request(Method::POST, url, Some(body)).await?;
        let mut envelope: Envelope<T> = response.json().await?;
        check_envelope(&envelope)?;
        envelope.data.pop().ok_or(UnifiError::Api {
            status: 200,
            message: "create returned no entity".to_string(),
        })
    }

    async fn legacy_update<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<()> {
        let response = self.request(Method::PUT, url, Some(body)).await?;
        let envelope: Envelope<serde_json::Value> = response.json().await?;
        check_envelope(&envelope)
    }

    async fn legacy_delete(&self, url: &str) -> Result<()> {
        let response = self.request(Method::DELETE, url, None::<&()>).await?;
        let envelope: Envelope<serde_json::Value> = response.json().await?;
        check_envelope(&envelope)
    }

    fn group_url(&self, site: &str) -> String {
        self.network_path(&format!("/api/s/{site}/rest/firewallgroup"))
    }

    fn rule_url(&self, site: &str) -> String {
        self.network_path(&format!("/api/s/{site}/rest/firewallrule"))
    }

    fn policy_url(&self, site: &str) -> String {
        self.network_path(&format!("/v2/api/site/{site}/firewall-policies"))
    }
}

/// Map envelope-level errors; duplicate-name creates arrive as rc=error.
fn check_envelope<T>(envelope: &Envelope<T>) -> Result<()> {
    if !envelope.meta.is_error() {
        return Ok(());
    }
    let msg = envelope.meta.msg.clone().unwrap_or_default();
    if msg.contains("Duplicate") {
        Err(UnifiError::Conflict(msg))
    } else {
        Err(UnifiError::Api {
            status: 200,
            message: msg,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureFlag {
    name: String,
    #[serde(default)]
    feature_exists: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReorderEntry<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    index: u32,
}

#[async_trait::async_trait]
impl ControllerApi for UnifiClient {
    async fn list_firewall_groups(&self, site: &str) -> Result<Vec<FirewallGroup>> {
        self.legacy_list(&self.group_url(site)).await
    }

    async fn create_firewall_group(
        &self,
        site: &str,
        group: &FirewallGroup,
    ) -> Result<FirewallGroup> {
        self.legacy_create(&self.group_url(site), group).await
    }

    async fn update_firewall_group(&self, site: &str, group: &FirewallGroup) -> Result<()> {
        let id = group.id.as_deref().ok_or(UnifiError::Api {
            status: 0,
            message: "update requires a group id".to_string(),
        })?;
        let url = format!("{}/{id}", self.group_url(site));
        self.legacy_update(&url, group).await
    }

    async fn delete_firewall_group(&self, site: &str, id: &str) -> Result<()> {
        let url = format!("{}/{id}", self.group_url(site));
        self.legacy_delete(&url).await
    }

    async fn list_firewall_rules(&self, site: &str) -> Result<Vec<FirewallRule>> {
        self.legacy_list(&self.rule_url(site)).await
    }

    async fn create_firewall_rule(
        &self,
        site: &str,
        rule: &FirewallRule,
    ) -> Result<FirewallRule> {
        self.legacy_create(&self.rule_url(site), rule).await
    }

    async fn update_firewall_rule(&self, site: &str, rule: &FirewallRule) -> Result<()> {
        let id = rule.id.as_deref().ok_or(UnifiError::Api {
            status: 0,
            message: "update requires a rule id".to_string(),
        })?;
        let url = format!("{}/{id}", self.rule_url(site));
        self.legacy_update(&url, rule).await
    }

    async fn delete_firewall_rule(&self, site: &str, id: &str) -> Result<()> {
        let url = format!("{}/{id}", self.rule_url(site));
        self.legacy_delete(&url).await
    }

    async fn list_zone_policies(&self, site: &str) -> Result<Vec<ZonePolicy>> {
        let response = self
            .request(Method::GET, &self.policy_url(site), None::<&()>)
            .await?;
        Ok(response.json().await?)
    }

    async fn create_zone_policy(&self, site: &str, policy: &ZonePolicy) -> Result<ZonePolicy> {
        let response = self
            .request(Method::POST, &self.policy_url(site), Some(policy))
            .await?;
        Ok(response.json().await?)
    }

    async fn update_zone_policy(&self, site: &str, policy: &ZonePolicy) -> Result<()> {
        let id = policy.id.as_deref().ok_or(UnifiError::Api {
            status: 0,
            message: "update requires a policy id".to_string(),
        })?;
        let url = format!("{}/{id}", self.policy_url(site));
        self.request(Method::PUT, &url, Some(policy)).await?;
        Ok(())
    }

    async fn delete_zone_policy(&self, site: &str, id: &str) -> Result<()> {
        let url = format!("{}/{id}", self.policy_url(site));
        self.request(Method::DELETE, &url, None::<&()>).await?;
        Ok(())
    }

    async fn reorder_zone_policies(&self, site: &str, ordered_ids: &[String]) -> Result<()> {
        let url = format!("{}/batch-reorder", self.policy_url(site));
        let payload: Vec<ReorderEntry<'_>> = ordered_ids
            .iter()
            .enumerate()
            .map(|(index, id)| ReorderEntry {
                id,
                index: index as u32,
            })
            .collect();
        self.request(Method::POST, &url, Some(&payload)).await?;
        Ok(())
    }

    async fn list_zones(&self, site: &str) -> Result<Vec<Zone>> {
        let url = self.network_path(&format!("/v2/api/site/{site}/firewall/zones"));
        let response = self.request(Method::GET, &url, None::<&()>).await?;
        Ok(response.json().await?)
    }

    async fn has_feature(&self, site: &str, feature: &str) -> Result<bool> {
        let key = (site.to_string(), feature.to_string());
        if let Some(cached) = self.features.read().get(&key) {
            return Ok(*cached);
        }

        let url = self.network_path(&format!("/v2/api/site/{site}/features"));
        let response = self.request(Method::GET, &url, None::<&()>).await?;
        let flags: Vec<FeatureFlag> = response.json().await?;
        let supported = flags
            .iter()
            .any(|flag| flag.name == feature && flag.feature_exists);

        self.features.write().insert(key, supported);
        Ok(supported)
    }

    async fn ping(&self) -> Result<()> {
        let url = self.network_path("/status");
        self.request(Method::GET, &url, None::<&()>).await?;
        Ok(())
    }
}
