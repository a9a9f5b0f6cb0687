//! Durable local mirror of the bouncer's remote state.
//!
//! SQLite-backed key-value store over four logical namespaces:
//! - `bans`: canonical IP/CIDR text -> [`BanEntry`]
//! - `rates`: endpoint tag -> sliding window of call timestamps
//! - `groups`: generated group name -> [`GroupRecord`]
//! - `policies`: generated rule/policy name -> [`PolicyRecord`]
//!
//! The store is a write-through mirror; the controller stays authoritative
//! on conflict during bootstrap. All returned records are copies, never
//! aliases into shared state.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ub_common::{BanEntry, GroupRecord, PolicyMode, PolicyRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record for key '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Capability set the engine consumes; the SQLite store is the production
/// implementation, tests may substitute an in-memory one.
#[async_trait]
pub trait BanStore: Send + Sync {
    async fn ban_exists(&self, value: &str) -> Result<bool>;
    async fn ban_record(&self, value: &str, entry: &BanEntry) -> Result<()>;
    async fn ban_delete(&self, value: &str) -> Result<()>;
    async fn ban_list(&self) -> Result<HashMap<String, BanEntry>>;

    /// Rolling-window admission for one endpoint tag. Entries older than
    /// `window` are pruned; if at least `max` remain the call is denied,
    /// otherwise the current instant is appended and the call admitted.
    /// `max <= 0` always admits.
    async fn api_rate_gate(&self, endpoint: &str, window: Duration, max: i64) -> Result<bool>;

    /// Remove bans whose expiry has passed. Returns the number removed.
    async fn prune_expired_bans(&self) -> Result<u64>;
    /// Remove rate entries older than `window` across all endpoints.
    async fn prune_expired_rate_entries(&self, window: Duration) -> Result<u64>;

    async fn get_group(&self, name: &str) -> Result<Option<GroupRecord>>;
    async fn set_group(&self, name: &str, record: &GroupRecord) -> Result<()>;
    async fn delete_group(&self, name: &str) -> Result<()>;
    async fn list_groups(&self) -> Result<HashMap<String, GroupRecord>>;

    async fn get_policy(&self, name: &str) -> Result<Option<PolicyRecord>>;
    async fn set_policy(&self, name: &str, record: &PolicyRecord) -> Result<()>;
    async fn delete_policy(&self, name: &str) -> Result<()>;
    async fn list_policies(&self) -> Result<HashMap<String, PolicyRecord>>;

    /// On-disk size of the backing file, zero for in-memory stores.
    async fn size_bytes(&self) -> Result<u64>;
    async fn close(&self);
}

/// SQLite-backed [`BanStore`].
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// Serializes the prune-count-append sequence of the rate gate.
    rate_mutex: Mutex<()>,
    path: Option<std::path::PathBuf>,
}

impl SqliteStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            rate_mutex: Mutex::new(()),
            path: Some(path.to_path_buf()),
        };
        store.create_schema().await?;
        info!(path = %path.display(), "Opened bouncer store");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;
        let pool = SqlitePoolOptions::new()
            // A single connection: every handle must see the same memory db.
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            rate_mutex: Mutex::new(()),
            path: None,
        };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bans (
                value TEXT PRIMARY KEY,
                recorded_at INTEGER NOT NULL,
                expires_at INTEGER,
                ipv6 INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_entries (
                endpoint TEXT NOT NULL,
                ts_nanos INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_rate_endpoint_ts
            ON rate_entries (endpoint, ts_nanos)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS firewall_groups (
                name TEXT PRIMARY KEY,
                unifi_id TEXT NOT NULL,
                site TEXT NOT NULL,
                members TEXT NOT NULL,
                ipv6 INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS firewall_policies (
                name TEXT PRIMARY KEY,
                unifi_id TEXT NOT NULL,
                site TEXT NOT NULL,
                mode TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn decode_timestamp(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl BanStore for SqliteStore {
    async fn ban_exists(&self, value: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM bans WHERE value = ?")
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn ban_record(&self, value: &str, entry: &BanEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bans (value, recorded_at, expires_at, ipv6)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(value) DO UPDATE SET
                recorded_at = excluded.recorded_at,
                expires_at = excluded.expires_at,
                ipv6 = excluded.ipv6
            "#,
        )
        .bind(value)
        .bind(entry.recorded_at.timestamp())
        .bind(entry.expires_at.map(|t| t.timestamp()))
        .bind(entry.ipv6 as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ban_delete(&self, value: &str) -> Result<()> {
        sqlx::query("DELETE FROM bans WHERE value = ?")
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ban_list(&self) -> Result<HashMap<String, BanEntry>> {
        let rows = sqlx::query("SELECT value, recorded_at, expires_at, ipv6 FROM bans")
            .fetch_all(&self.pool)
            .await?;

        let mut bans = HashMap::with_capacity(rows.len());
        for row in rows {
            let value: String = row.get("value");
            let entry = BanEntry {
                recorded_at: Self::decode_timestamp(row.get("recorded_at")),
                expires_at: row
                    .get::<Option<i64>, _>("expires_at")
                    .map(Self::decode_timestamp),
                ipv6: row.get::<i64, _>("ipv6") != 0,
            };
            bans.insert(value, entry);
        }
        Ok(bans)
    }

    async fn api_rate_gate(&self, endpoint: &str, window: Duration, max: i64) -> Result<bool> {
        if max <= 0 {
            return Ok(true);
        }

        let _guard = self.rate_mutex.lock().await;

        let now_nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        let cutoff = now_nanos.saturating_sub(window.as_nanos() as i64);

        sqlx::query("DELETE FROM rate_entries WHERE endpoint = ? AND ts_nanos < ?")
            .bind(endpoint)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM rate_entries WHERE endpoint = ?")
                .bind(endpoint)
                .fetch_one(&self.pool)
                .await?
                .get("n");

        if count >= max {
            debug!(endpoint, count, max, "Rate gate denied");
            return Ok(false);
        }

        sqlx::query("INSERT INTO rate_entries (endpoint, ts_nanos) VALUES (?, ?)")
            .bind(endpoint)
            .bind(now_nanos)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn prune_expired_bans(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let result =
            sqlx::query("DELETE FROM bans WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Pruned expired bans");
        }
        Ok(removed)
    }

    async fn prune_expired_rate_entries(&self, window: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
            .saturating_sub(window.as_nanos() as i64);
        let result = sqlx::query("DELETE FROM rate_entries WHERE ts_nanos < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        let row = sqlx::query(
            "SELECT unifi_id, site, members, ipv6 FROM firewall_groups WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let raw: String = row.get("members");
            let members: Vec<String> =
                serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                    key: name.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(GroupRecord {
                unifi_id: row.get("unifi_id"),
                site: row.get("site"),
                members,
                ipv6: row.get::<i64, _>("ipv6") != 0,
            })
        })
        .transpose()
    }

    async fn set_group(&self, name: &str, record: &GroupRecord) -> Result<()> {
        let members = serde_json::to_string(&record.members).map_err(|e| {
            StoreError::Corrupt {
                key: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        sqlx::query(
            r#"
            INSERT INTO firewall_groups (name, unifi_id, site, members, ipv6)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                unifi_id = excluded.unifi_id,
                site = excluded.site,
                members = excluded.members,
                ipv6 = excluded.ipv6
            "#,
        )
        .bind(name)
        .bind(&record.unifi_id)
        .bind(&record.site)
        .bind(members)
        .bind(record.ipv6 as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM firewall_groups WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<HashMap<String, GroupRecord>> {
        let rows =
            sqlx::query("SELECT name, unifi_id, site, members, ipv6 FROM firewall_groups")
                .fetch_all(&self.pool)
                .await?;

        let mut groups = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            let raw: String = row.get("members");
            let members: Vec<String> = match serde_json::from_str(&raw) {
                Ok(members) => members,
                Err(e) => {
                    warn!(name, error = %e, "Skipping corrupt group record");
                    continue;
                }
            };
            groups.insert(
                name,
                GroupRecord {
                    unifi_id: row.get("unifi_id"),
                    site: row.get("site"),
                    members,
                    ipv6: row.get::<i64, _>("ipv6") != 0,
                },
            );
        }
        Ok(groups)
    }

    async fn get_policy(&self, name: &str) -> Result<Option<PolicyRecord>> {
        let row = sqlx::query(
            "SELECT unifi_id, site, mode FROM firewall_policies WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let mode_raw: String = row.get("mode");
            let mode = decode_mode(&mode_raw, name)?;
            Ok(PolicyRecord {
                unifi_id: row.get("unifi_id"),
                site: row.get("site"),
                mode,
            })
        })
        .transpose()
    }

    async fn set_policy(&self, name: &str, record: &PolicyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO firewall_policies (name, unifi_id, site, mode)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                unifi_id = excluded.unifi_id,
                site = excluded.site,
                mode = excluded.mode
            "#,
        )
        .bind(name)
        .bind(&record.unifi_id)
        .bind(&record.site)
        .bind(record.mode.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM firewall_policies WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_policies(&self) -> Result<HashMap<String, PolicyRecord>> {
        let rows = sqlx::query("SELECT name, unifi_id, site, mode FROM firewall_policies")
            .fetch_all(&self.pool)
            .await?;

        let mut policies = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            let mode_raw: String = row.get("mode");
            let mode = match decode_mode(&mode_raw, &name) {
                Ok(mode) => mode,
                Err(e) => {
                    warn!(name, error = %e, "Skipping corrupt policy record");
                    continue;
                }
            };
            policies.insert(
                name,
                PolicyRecord {
                    unifi_id: row.get("unifi_id"),
                    site: row.get("site"),
                    mode,
                },
            );
        }
        Ok(policies)
    }

    async fn size_bytes(&self) -> Result<u64> {
        match &self.path {
            Some(path) => Ok(std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_mode(raw: &str, key: &str) -> Result<PolicyMode> {
    match raw {
        "legacy" => Ok(PolicyMode::Legacy),
        "zone" => Ok(PolicyMode::Zone),
        other => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("unknown policy mode '{other}'"),
        }),
    }
}
