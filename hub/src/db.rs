//! Persistence layer (spec §3.1). Schema bootstrap follows the teacher's
//! `CREATE TABLE IF NOT EXISTS` + additive `ALTER TABLE ... ADD COLUMN IF NOT
//! EXISTS` idiom, run idempotently at boot with no external migration tool.
//!
//! `RecordStore` is a trait rather than a concrete `PgPool` wrapper so tests
//! (and `SystemManager`/`RecordPipeline`/rollup/alerts) can run against an
//! in-memory fake without a real Postgres instance. Async trait methods need
//! `async-trait` to stay dyn-compatible as `Arc<dyn RecordStore>`.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use beszel_core::{
    AlertHistory, AlertRule, ContainerStatsRecord, Fingerprint, SmartDeviceRecord, System,
    SystemDetails, SystemStatsRecord, SystemdServiceRecord, UserNotificationSettings, fnv32,
};

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id uuid PRIMARY KEY,
            email text NOT NULL UNIQUE
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating users table")?;

    sqlx::query("ALTER TABLE users ADD COLUMN IF NOT EXISTS auth_token text")
        .execute(pool)
        .await
        .context("adding users.auth_token column")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS systems (
            id uuid PRIMARY KEY,
            user_id uuid NOT NULL,
            name text NOT NULL,
            host text NOT NULL,
            port text NOT NULL,
            status text NOT NULL DEFAULT 'pending',
            info jsonb,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating systems table")?;
    sqlx::query(r#"ALTER TABLE systems ADD COLUMN IF NOT EXISTS info jsonb;"#)
        .execute(pool)
        .await
        .context("altering systems.info")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            system_id uuid PRIMARY KEY,
            token uuid NOT NULL,
            fingerprint text NOT NULL DEFAULT ''
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating fingerprints table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_details (
            system_id uuid PRIMARY KEY,
            details jsonb NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating system_details table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_stats_records (
            id uuid PRIMARY KEY,
            system_id uuid NOT NULL,
            tier text NOT NULL,
            stats jsonb NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating system_stats_records table")?;
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS system_stats_records_lookup_idx
           ON system_stats_records (system_id, tier, created_at DESC);"#,
    )
    .execute(pool)
    .await
    .context("indexing system_stats_records")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS containers (
            container_key bigint PRIMARY KEY,
            system_id uuid NOT NULL,
            container_id text NOT NULL,
            name text NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating containers table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS container_stats_records (
            id uuid PRIMARY KEY,
            system_id uuid NOT NULL,
            container_key bigint NOT NULL,
            tier text NOT NULL,
            stats jsonb NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating container_stats_records table")?;
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS container_stats_records_lookup_idx
           ON container_stats_records (system_id, container_key, tier, created_at DESC);"#,
    )
    .execute(pool)
    .await
    .context("indexing container_stats_records")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS systemd_service_records (
            service_key bigint PRIMARY KEY,
            system_id uuid NOT NULL,
            info jsonb NOT NULL,
            updated_at timestamptz NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating systemd_service_records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS smart_device_records (
            system_id uuid NOT NULL,
            device_key text NOT NULL,
            info jsonb NOT NULL,
            updated_at timestamptz NOT NULL DEFAULT now(),
            PRIMARY KEY (system_id, device_key)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating smart_device_records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_rules (
            id uuid PRIMARY KEY,
            system_id uuid NOT NULL,
            user_id uuid NOT NULL,
            name text NOT NULL,
            descriptor text,
            threshold double precision NOT NULL DEFAULT 0,
            min_duration_minutes bigint NOT NULL DEFAULT 0,
            enabled boolean NOT NULL DEFAULT true,
            triggered boolean NOT NULL DEFAULT false
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating alert_rules table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_history (
            id uuid PRIMARY KEY,
            alert_rule_id uuid NOT NULL,
            system_id uuid NOT NULL,
            user_id uuid NOT NULL,
            name text NOT NULL,
            triggered_at timestamptz NOT NULL DEFAULT now(),
            resolved_at timestamptz
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating alert_history table")?;
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS alert_history_user_idx ON alert_history (user_id, triggered_at DESC);"#,
    )
    .execute(pool)
    .await
    .context("indexing alert_history")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_notification_settings (
            user_id uuid PRIMARY KEY,
            emails jsonb NOT NULL DEFAULT '[]'::jsonb,
            webhooks jsonb NOT NULL DEFAULT '[]'::jsonb
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating user_notification_settings table")?;

    Ok(())
}

pub async fn reset_db(pool: &PgPool) -> Result<()> {
    warn!("RESET_DB is set; truncating database tables");
    sqlx::query(
        r#"
        TRUNCATE TABLE
            user_notification_settings,
            alert_history,
            alert_rules,
            smart_device_records,
            systemd_service_records,
            container_stats_records,
            containers,
            system_stats_records,
            system_details,
            fingerprints,
            systems,
            users
        CASCADE
        "#,
    )
    .execute(pool)
    .await
    .context("resetting database tables")?;
    Ok(())
}

/// Generic persistence facade over the entities named in spec §3 (ambient
/// addition, §3.1): `SystemManager`, `RecordPipeline`, rollup, and the alert
/// engine all talk to this instead of a concrete pool, so they can run
/// against `InMemoryStore` in tests.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_systems(&self) -> Result<Vec<System>>;
    async fn get_system(&self, id: Uuid) -> Result<Option<System>>;
    async fn upsert_system(&self, system: &System) -> Result<()>;
    async fn set_system_status(&self, id: Uuid, status: &str, info: Option<serde_json::Value>) -> Result<()>;
    async fn delete_system(&self, id: Uuid) -> Result<()>;

    async fn get_fingerprint(&self, system_id: Uuid) -> Result<Option<Fingerprint>>;
    async fn ensure_token(&self, system_id: Uuid) -> Result<Uuid>;
    async fn set_token(&self, system_id: Uuid, token: Uuid) -> Result<()>;
    async fn bind_fingerprint(&self, system_id: Uuid, fingerprint: &str) -> Result<()>;

    /// `(user_id, auth_token)` for every user with a bearer token set, for the
    /// HTTP layer's constant-time per-user lookup (spec §6).
    async fn list_user_tokens(&self) -> Result<Vec<(Uuid, String)>>;
    /// Any single user id, used to own systems created by `config.yml` roster
    /// reconciliation when the entry names no existing system (spec §6).
    async fn any_user_id(&self) -> Result<Option<Uuid>>;

    async fn upsert_system_details(&self, system_id: Uuid, details: &SystemDetails) -> Result<()>;
    async fn insert_system_stats_record(
        &self,
        system_id: Uuid,
        tier: &str,
        stats: &serde_json::Value,
    ) -> Result<()>;
    async fn list_system_stats_in_window(
        &self,
        system_id: Uuid,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemStatsRecord>>;
    async fn longer_tier_exists_within(&self, system_id: Uuid, tier: &str, since: DateTime<Utc>) -> Result<bool>;
    async fn delete_system_stats_older_than(&self, tier: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn upsert_container(&self, system_id: Uuid, container_id: &str, name: &str) -> Result<i64>;
    async fn insert_container_stats_record(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        stats: &serde_json::Value,
    ) -> Result<()>;
    async fn list_container_stats_in_window(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ContainerStatsRecord>>;
    async fn longer_container_tier_exists_within(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_container_stats_older_than(&self, tier: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn upsert_systemd_service(
        &self,
        system_id: Uuid,
        service_key: i64,
        info: &serde_json::Value,
    ) -> Result<()>;
    async fn delete_systemd_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn get_systemd_service(&self, service_key: i64) -> Result<Option<serde_json::Value>>;

    async fn upsert_smart_device(&self, system_id: Uuid, device_key: &str, info: &serde_json::Value) -> Result<()>;

    async fn list_alert_rules(&self, system_id: Uuid) -> Result<Vec<AlertRule>>;
    async fn upsert_alert_rule(&self, rule: &AlertRule) -> Result<()>;
    async fn delete_alert_rules(&self, system_id: Uuid, name: &str) -> Result<u64>;
    async fn set_alert_rule_triggered(&self, id: Uuid, triggered: bool) -> Result<()>;
    async fn insert_alert_history(&self, entry: &AlertHistory) -> Result<()>;
    async fn resolve_open_alert_history(&self, alert_rule_id: Uuid, resolved_at: DateTime<Utc>) -> Result<()>;
    async fn count_alert_history(&self, user_id: Uuid) -> Result<i64>;
    async fn trim_alert_history(&self, user_id: Uuid, keep: i64) -> Result<u64>;

    async fn user_notification_settings(&self, user_id: Uuid) -> Result<UserNotificationSettings>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn list_systems(&self) -> Result<Vec<System>> {
        sqlx::query_as::<_, System>("SELECT * FROM systems ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("listing systems")
    }

    async fn get_system(&self, id: Uuid) -> Result<Option<System>> {
        sqlx::query_as::<_, System>("SELECT * FROM systems WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching system")
    }

    async fn upsert_system(&self, system: &System) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO systems (id, user_id, name, host, port, status, info, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                status = EXCLUDED.status,
                info = EXCLUDED.info,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(system.id)
        .bind(system.user_id)
        .bind(&system.name)
        .bind(&system.host)
        .bind(&system.port)
        .bind(&system.status)
        .bind(&system.info)
        .bind(system.created_at)
        .bind(system.updated_at)
        .execute(&self.pool)
        .await
        .context("upserting system")?;
        Ok(())
    }

    async fn set_system_status(&self, id: Uuid, status: &str, info: Option<serde_json::Value>) -> Result<()> {
        sqlx::query(
            r#"UPDATE systems SET status = $2, info = COALESCE($3, info), updated_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(status)
        .bind(info)
        .execute(&self.pool)
        .await
        .context("updating system status")?;
        Ok(())
    }

    async fn delete_system(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM systems WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting system")?;
        Ok(())
    }

    async fn get_fingerprint(&self, system_id: Uuid) -> Result<Option<Fingerprint>> {
        sqlx::query_as::<_, Fingerprint>("SELECT * FROM fingerprints WHERE system_id = $1")
            .bind(system_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching fingerprint")
    }

    async fn ensure_token(&self, system_id: Uuid) -> Result<Uuid> {
        if let Some(row) = self.get_fingerprint(system_id).await? {
            return Ok(row.token);
        }
        let token = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO fingerprints (system_id, token, fingerprint) VALUES ($1, $2, '')
             ON CONFLICT (system_id) DO NOTHING",
        )
        .bind(system_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .context("creating fingerprint token")?;
        Ok(token)
    }

    async fn set_token(&self, system_id: Uuid, token: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO fingerprints (system_id, token, fingerprint) VALUES ($1, $2, '')
             ON CONFLICT (system_id) DO UPDATE SET token = EXCLUDED.token",
        )
        .bind(system_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .context("setting fingerprint token")?;
        Ok(())
    }

    async fn list_user_tokens(&self) -> Result<Vec<(Uuid, String)>> {
        let rows = sqlx::query("SELECT id, auth_token FROM users WHERE auth_token IS NOT NULL")
            .fetch_all(&self.pool)
            .await
            .context("listing user auth tokens")?;
        rows.into_iter()
            .map(|row| Ok((row.try_get::<Uuid, _>("id")?, row.try_get::<String, _>("auth_token")?)))
            .collect()
    }

    async fn any_user_id(&self) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT id FROM users LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("fetching any user id")?;
        Ok(row.map(|r| r.try_get::<Uuid, _>("id")).transpose()?)
    }

    async fn bind_fingerprint(&self, system_id: Uuid, fingerprint: &str) -> Result<()> {
        sqlx::query("UPDATE fingerprints SET fingerprint = $2 WHERE system_id = $1")
            .bind(system_id)
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .context("binding fingerprint")?;
        Ok(())
    }

    async fn upsert_system_details(&self, system_id: Uuid, details: &SystemDetails) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_details (system_id, details) VALUES ($1, $2)
            ON CONFLICT (system_id) DO UPDATE SET details = EXCLUDED.details
            "#,
        )
        .bind(system_id)
        .bind(Json(details))
        .execute(&self.pool)
        .await
        .context("upserting system details")?;
        Ok(())
    }

    async fn insert_system_stats_record(
        &self,
        system_id: Uuid,
        tier: &str,
        stats: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_stats_records (id, system_id, tier, stats) VALUES ($1,$2,$3,$4)",
        )
        .bind(Uuid::new_v4())
        .bind(system_id)
        .bind(tier)
        .bind(stats)
        .execute(&self.pool)
        .await
        .context("inserting system stats record")?;
        Ok(())
    }

    async fn list_system_stats_in_window(
        &self,
        system_id: Uuid,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemStatsRecord>> {
        sqlx::query_as::<_, SystemStatsRecord>(
            "SELECT * FROM system_stats_records WHERE system_id = $1 AND tier = $2 AND created_at >= $3
             ORDER BY created_at",
        )
        .bind(system_id)
        .bind(tier)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("listing system stats in window")
    }

    async fn longer_tier_exists_within(&self, system_id: Uuid, tier: &str, since: DateTime<Utc>) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM system_stats_records WHERE system_id = $1 AND tier = $2 AND created_at >= $3 LIMIT 1",
        )
        .bind(system_id)
        .bind(tier)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("checking longer tier existence")?;
        Ok(row.is_some())
    }

    async fn delete_system_stats_older_than(&self, tier: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM system_stats_records WHERE tier = $1 AND created_at < $2")
            .bind(tier)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("deleting expired system stats")?;
        Ok(result.rows_affected())
    }

    async fn upsert_container(&self, system_id: Uuid, container_id: &str, name: &str) -> Result<i64> {
        let key = fnv32(format!("{system_id}||{container_id}").as_bytes());
        sqlx::query(
            r#"
            INSERT INTO containers (container_key, system_id, container_id, name) VALUES ($1,$2,$3,$4)
            ON CONFLICT (container_key) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(key)
        .bind(system_id)
        .bind(container_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .context("upserting container")?;
        Ok(key)
    }

    async fn insert_container_stats_record(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        stats: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO container_stats_records (id, system_id, container_key, tier, stats) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(Uuid::new_v4())
        .bind(system_id)
        .bind(container_key)
        .bind(tier)
        .bind(stats)
        .execute(&self.pool)
        .await
        .context("inserting container stats record")?;
        Ok(())
    }

    async fn list_container_stats_in_window(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ContainerStatsRecord>> {
        sqlx::query_as::<_, ContainerStatsRecord>(
            "SELECT * FROM container_stats_records
             WHERE system_id = $1 AND container_key = $2 AND tier = $3 AND created_at >= $4
             ORDER BY created_at",
        )
        .bind(system_id)
        .bind(container_key)
        .bind(tier)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("listing container stats in window")
    }

    async fn longer_container_tier_exists_within(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM container_stats_records
             WHERE system_id = $1 AND container_key = $2 AND tier = $3 AND created_at >= $4 LIMIT 1",
        )
        .bind(system_id)
        .bind(container_key)
        .bind(tier)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("checking longer container tier existence")?;
        Ok(row.is_some())
    }

    async fn delete_container_stats_older_than(&self, tier: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM container_stats_records WHERE tier = $1 AND created_at < $2")
            .bind(tier)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("deleting expired container stats")?;
        Ok(result.rows_affected())
    }

    async fn upsert_systemd_service(
        &self,
        system_id: Uuid,
        service_key: i64,
        info: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO systemd_service_records (service_key, system_id, info, updated_at)
            VALUES ($1,$2,$3,now())
            ON CONFLICT (service_key) DO UPDATE SET info = EXCLUDED.info, updated_at = now()
            "#,
        )
        .bind(service_key)
        .bind(system_id)
        .bind(info)
        .execute(&self.pool)
        .await
        .context("upserting systemd service")?;
        Ok(())
    }

    async fn delete_systemd_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM systemd_service_records WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("deleting stale systemd records")?;
        Ok(result.rows_affected())
    }

    async fn get_systemd_service(&self, service_key: i64) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT info FROM systemd_service_records WHERE service_key = $1")
            .bind(service_key)
            .fetch_optional(&self.pool)
            .await
            .context("fetching systemd service")?;
        row.map(|r| r.try_get::<serde_json::Value, _>("info").map_err(anyhow::Error::from)).transpose()
    }

    async fn upsert_smart_device(&self, system_id: Uuid, device_key: &str, info: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO smart_device_records (system_id, device_key, info, updated_at)
            VALUES ($1,$2,$3,now())
            ON CONFLICT (system_id, device_key) DO UPDATE SET info = EXCLUDED.info, updated_at = now()
            "#,
        )
        .bind(system_id)
        .bind(device_key)
        .bind(info)
        .execute(&self.pool)
        .await
        .context("upserting smart device record")?;
        Ok(())
    }

    async fn list_alert_rules(&self, system_id: Uuid) -> Result<Vec<AlertRule>> {
        sqlx::query_as::<_, AlertRule>("SELECT * FROM alert_rules WHERE system_id = $1 AND enabled")
            .bind(system_id)
            .fetch_all(&self.pool)
            .await
            .context("listing alert rules")
    }

    async fn upsert_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_rules (id, system_id, user_id, name, descriptor, threshold, min_duration_minutes, enabled, triggered)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (id) DO UPDATE SET
                descriptor = EXCLUDED.descriptor,
                threshold = EXCLUDED.threshold,
                min_duration_minutes = EXCLUDED.min_duration_minutes,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(rule.id)
        .bind(rule.system_id)
        .bind(rule.user_id)
        .bind(&rule.name)
        .bind(&rule.descriptor)
        .bind(rule.threshold)
        .bind(rule.min_duration_minutes)
        .bind(rule.enabled)
        .bind(rule.triggered)
        .execute(&self.pool)
        .await
        .context("upserting alert rule")?;
        Ok(())
    }

    async fn delete_alert_rules(&self, system_id: Uuid, name: &str) -> Result<u64> {
        let triggered_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM alert_rules WHERE system_id = $1 AND name = $2 AND triggered",
        )
        .bind(system_id)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context("finding triggered alert rules before deletion")?;

        for rule_id in triggered_ids {
            self.resolve_open_alert_history(rule_id, Utc::now()).await?;
        }

        let result = sqlx::query("DELETE FROM alert_rules WHERE system_id = $1 AND name = $2")
            .bind(system_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("deleting alert rules")?;
        Ok(result.rows_affected())
    }

    async fn set_alert_rule_triggered(&self, id: Uuid, triggered: bool) -> Result<()> {
        sqlx::query("UPDATE alert_rules SET triggered = $2 WHERE id = $1")
            .bind(id)
            .bind(triggered)
            .execute(&self.pool)
            .await
            .context("updating alert rule trigger state")?;
        Ok(())
    }

    async fn insert_alert_history(&self, entry: &AlertHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_history (id, alert_rule_id, system_id, user_id, name, triggered_at, resolved_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.alert_rule_id)
        .bind(entry.system_id)
        .bind(entry.user_id)
        .bind(&entry.name)
        .bind(entry.triggered_at)
        .bind(entry.resolved_at)
        .execute(&self.pool)
        .await
        .context("inserting alert history row")?;
        Ok(())
    }

    async fn resolve_open_alert_history(&self, alert_rule_id: Uuid, resolved_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE alert_history SET resolved_at = $2
             WHERE alert_rule_id = $1 AND resolved_at IS NULL",
        )
        .bind(alert_rule_id)
        .bind(resolved_at)
        .execute(&self.pool)
        .await
        .context("resolving alert history")?;
        Ok(())
    }

    async fn count_alert_history(&self, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM alert_history WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("counting alert history")?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn trim_alert_history(&self, user_id: Uuid, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM alert_history WHERE id IN (
                SELECT id FROM alert_history WHERE user_id = $1
                ORDER BY triggered_at DESC OFFSET $2
            )
            "#,
        )
        .bind(user_id)
        .bind(keep)
        .execute(&self.pool)
        .await
        .context("trimming alert history")?;
        Ok(result.rows_affected())
    }

    async fn user_notification_settings(&self, user_id: Uuid) -> Result<UserNotificationSettings> {
        let row = sqlx::query("SELECT emails, webhooks FROM user_notification_settings WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching user notification settings")?;
        match row {
            Some(row) => {
                let emails: serde_json::Value = row.try_get("emails")?;
                let webhooks: serde_json::Value = row.try_get("webhooks")?;
                Ok(UserNotificationSettings {
                    user_id,
                    emails: serde_json::from_value(emails).unwrap_or_default(),
                    webhooks: serde_json::from_value(webhooks).unwrap_or_default(),
                })
            }
            None => Ok(UserNotificationSettings { user_id, ..Default::default() }),
        }
    }
}

/// In-memory fake used by unit/integration tests so the rest of the hub
/// never needs a live Postgres instance to exercise pipeline/rollup/alert
/// logic.
#[derive(Default)]
pub struct InMemoryStore {
    inner: StdMutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    systems: HashMap<Uuid, System>,
    fingerprints: HashMap<Uuid, Fingerprint>,
    system_details: HashMap<Uuid, SystemDetails>,
    system_stats: Vec<SystemStatsRecord>,
    containers: HashMap<i64, (Uuid, String, String)>,
    container_stats: Vec<ContainerStatsRecord>,
    systemd: HashMap<i64, SystemdServiceRecord>,
    smart: HashMap<(Uuid, String), SmartDeviceRecord>,
    alert_rules: HashMap<Uuid, AlertRule>,
    alert_history: Vec<AlertHistory>,
    notification_settings: HashMap<Uuid, UserNotificationSettings>,
    user_tokens: HashMap<Uuid, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_system(&self, system: System) {
        self.inner.lock().unwrap().systems.insert(system.id, system);
    }

    pub fn seed_alert_rule(&self, rule: AlertRule) {
        self.inner.lock().unwrap().alert_rules.insert(rule.id, rule);
    }

    pub fn seed_notification_settings(&self, settings: UserNotificationSettings) {
        self.inner.lock().unwrap().notification_settings.insert(settings.user_id, settings);
    }

    pub fn seed_user_token(&self, user_id: Uuid, token: &str) {
        self.inner.lock().unwrap().user_tokens.insert(user_id, token.to_string());
    }

    pub fn alert_history_snapshot(&self) -> Vec<AlertHistory> {
        self.inner.lock().unwrap().alert_history.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn list_systems(&self) -> Result<Vec<System>> {
        Ok(self.inner.lock().unwrap().systems.values().cloned().collect())
    }

    async fn get_system(&self, id: Uuid) -> Result<Option<System>> {
        Ok(self.inner.lock().unwrap().systems.get(&id).cloned())
    }

    async fn upsert_system(&self, system: &System) -> Result<()> {
        self.inner.lock().unwrap().systems.insert(system.id, system.clone());
        Ok(())
    }

    async fn set_system_status(&self, id: Uuid, status: &str, info: Option<serde_json::Value>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(system) = guard.systems.get_mut(&id) {
            system.status = status.to_string();
            if let Some(info) = info {
                system.info = Some(info);
            }
            system.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_system(&self, id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().systems.remove(&id);
        Ok(())
    }

    async fn get_fingerprint(&self, system_id: Uuid) -> Result<Option<Fingerprint>> {
        Ok(self.inner.lock().unwrap().fingerprints.get(&system_id).cloned())
    }

    async fn ensure_token(&self, system_id: Uuid) -> Result<Uuid> {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.fingerprints.entry(system_id).or_insert_with(|| Fingerprint {
            system_id,
            token: Uuid::new_v4(),
            fingerprint: String::new(),
        });
        Ok(entry.token)
    }

    async fn set_token(&self, system_id: Uuid, token: Uuid) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard
            .fingerprints
            .entry(system_id)
            .and_modify(|f| f.token = token)
            .or_insert_with(|| Fingerprint { system_id, token, fingerprint: String::new() });
        Ok(())
    }

    async fn list_user_tokens(&self) -> Result<Vec<(Uuid, String)>> {
        Ok(self.inner.lock().unwrap().user_tokens.iter().map(|(id, tok)| (*id, tok.clone())).collect())
    }

    async fn any_user_id(&self) -> Result<Option<Uuid>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard.user_tokens.keys().next().copied().or_else(|| guard.systems.values().next().map(|s| s.user_id)))
    }

    async fn bind_fingerprint(&self, system_id: Uuid, fingerprint: &str) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(row) = guard.fingerprints.get_mut(&system_id) {
            row.fingerprint = fingerprint.to_string();
        }
        Ok(())
    }

    async fn upsert_system_details(&self, system_id: Uuid, details: &SystemDetails) -> Result<()> {
        self.inner.lock().unwrap().system_details.insert(system_id, details.clone());
        Ok(())
    }

    async fn insert_system_stats_record(
        &self,
        system_id: Uuid,
        tier: &str,
        stats: &serde_json::Value,
    ) -> Result<()> {
        self.inner.lock().unwrap().system_stats.push(SystemStatsRecord {
            id: Uuid::new_v4(),
            system_id,
            tier: tier.to_string(),
            stats: stats.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_system_stats_in_window(
        &self,
        system_id: Uuid,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemStatsRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .system_stats
            .iter()
            .filter(|r| r.system_id == system_id && r.tier == tier && r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn longer_tier_exists_within(&self, system_id: Uuid, tier: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .system_stats
            .iter()
            .any(|r| r.system_id == system_id && r.tier == tier && r.created_at >= since))
    }

    async fn delete_system_stats_older_than(&self, tier: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.system_stats.len();
        guard.system_stats.retain(|r| !(r.tier == tier && r.created_at < cutoff));
        Ok((before - guard.system_stats.len()) as u64)
    }

    async fn upsert_container(&self, system_id: Uuid, container_id: &str, name: &str) -> Result<i64> {
        let key = fnv32(format!("{system_id}||{container_id}").as_bytes());
        self.inner
            .lock()
            .unwrap()
            .containers
            .insert(key, (system_id, container_id.to_string(), name.to_string()));
        Ok(key)
    }

    async fn insert_container_stats_record(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        stats: &serde_json::Value,
    ) -> Result<()> {
        self.inner.lock().unwrap().container_stats.push(ContainerStatsRecord {
            id: Uuid::new_v4(),
            system_id,
            container_key,
            tier: tier.to_string(),
            stats: stats.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_container_stats_in_window(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ContainerStatsRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .container_stats
            .iter()
            .filter(|r| {
                r.system_id == system_id
                    && r.container_key == container_key
                    && r.tier == tier
                    && r.created_at >= since
            })
            .cloned()
            .collect())
    }

    async fn longer_container_tier_exists_within(
        &self,
        system_id: Uuid,
        container_key: i64,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.inner.lock().unwrap().container_stats.iter().any(|r| {
            r.system_id == system_id && r.container_key == container_key && r.tier == tier && r.created_at >= since
        }))
    }

    async fn delete_container_stats_older_than(&self, tier: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.container_stats.len();
        guard.container_stats.retain(|r| !(r.tier == tier && r.created_at < cutoff));
        Ok((before - guard.container_stats.len()) as u64)
    }

    async fn upsert_systemd_service(
        &self,
        system_id: Uuid,
        service_key: i64,
        info: &serde_json::Value,
    ) -> Result<()> {
        self.inner.lock().unwrap().systemd.insert(
            service_key,
            SystemdServiceRecord { id: Uuid::new_v4(), system_id, service_key, info: info.clone(), updated_at: Utc::now() },
        );
        Ok(())
    }

    async fn delete_systemd_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.systemd.len();
        guard.systemd.retain(|_, r| r.updated_at >= cutoff);
        Ok((before - guard.systemd.len()) as u64)
    }

    async fn get_systemd_service(&self, service_key: i64) -> Result<Option<serde_json::Value>> {
        Ok(self.inner.lock().unwrap().systemd.get(&service_key).map(|r| r.info.clone()))
    }

    async fn upsert_smart_device(&self, system_id: Uuid, device_key: &str, info: &serde_json::Value) -> Result<()> {
        self.inner.lock().unwrap().smart.insert(
            (system_id, device_key.to_string()),
            SmartDeviceRecord {
                id: Uuid::new_v4(),
                system_id,
                device_key: device_key.to_string(),
                info: info.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_alert_rules(&self, system_id: Uuid) -> Result<Vec<AlertRule>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .alert_rules
            .values()
            .filter(|r| r.system_id == system_id && r.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        self.inner.lock().unwrap().alert_rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn delete_alert_rules(&self, system_id: Uuid, name: &str) -> Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        let resolved_at = Utc::now();
        let triggered_ids: Vec<Uuid> = guard
            .alert_rules
            .values()
            .filter(|r| r.system_id == system_id && r.name == name && r.triggered)
            .map(|r| r.id)
            .collect();
        for entry in guard.alert_history.iter_mut() {
            if triggered_ids.contains(&entry.alert_rule_id) && entry.resolved_at.is_none() {
                entry.resolved_at = Some(resolved_at);
            }
        }
        let before = guard.alert_rules.len();
        guard.alert_rules.retain(|_, r| !(r.system_id == system_id && r.name == name));
        Ok((before - guard.alert_rules.len()) as u64)
    }

    async fn set_alert_rule_triggered(&self, id: Uuid, triggered: bool) -> Result<()> {
        if let Some(rule) = self.inner.lock().unwrap().alert_rules.get_mut(&id) {
            rule.triggered = triggered;
        }
        Ok(())
    }

    async fn insert_alert_history(&self, entry: &AlertHistory) -> Result<()> {
        self.inner.lock().unwrap().alert_history.push(entry.clone());
        Ok(())
    }

    async fn resolve_open_alert_history(&self, alert_rule_id: Uuid, resolved_at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        for entry in guard.alert_history.iter_mut() {
            if entry.alert_rule_id == alert_rule_id && entry.resolved_at.is_none() {
                entry.resolved_at = Some(resolved_at);
            }
        }
        Ok(())
    }

    async fn count_alert_history(&self, user_id: Uuid) -> Result<i64> {
        Ok(self.inner.lock().unwrap().alert_history.iter().filter(|e| e.user_id == user_id).count() as i64)
    }

    async fn trim_alert_history(&self, user_id: Uuid, keep: i64) -> Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        let mut user_entries: Vec<usize> = guard
            .alert_history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.user_id == user_id)
            .map(|(i, _)| i)
            .collect();
        user_entries.sort_by_key(|&i| std::cmp::Reverse(guard.alert_history[i].triggered_at));
        let drop: Vec<usize> = user_entries.into_iter().skip(keep.max(0) as usize).collect();
        let dropped = drop.len() as u64;
        for i in drop.into_iter().rev() {
            guard.alert_history.remove(i);
        }
        Ok(dropped)
    }

    async fn user_notification_settings(&self, user_id: Uuid) -> Result<UserNotificationSettings> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .notification_settings
            .get(&user_id)
            .cloned()
            .unwrap_or(UserNotificationSettings { user_id, ..Default::default() }))
    }
}

pub fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.to_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_system(id: Uuid) -> System {
        System {
            id,
            user_id: Uuid::new_v4(),
            name: "box".into(),
            host: "10.0.0.1".into(),
            port: "45876".into(),
            status: "pending".into(),
            info: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_store_upserts_and_transitions_status() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.upsert_system(&sample_system(id)).await.unwrap();
        store.set_system_status(id, "up", None).await.unwrap();
        let system = store.get_system(id).await.unwrap().unwrap();
        assert_eq!(system.status, "up");
    }

    #[tokio::test]
    async fn ensure_token_is_stable_across_calls() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        let first = store.ensure_token(id).await.unwrap();
        let second = store.ensure_token(id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn container_key_derives_from_system_and_container_id() {
        let store = InMemoryStore::new();
        let system_id = Uuid::new_v4();
        let key_a = store.upsert_container(system_id, "c1", "nginx").await.unwrap();
        let key_b = store.upsert_container(system_id, "c1", "nginx").await.unwrap();
        let key_c = store.upsert_container(system_id, "c2", "redis").await.unwrap();
        assert_eq!(key_a, key_b);
        assert_ne!(key_a, key_c);
    }

    #[tokio::test]
    async fn trim_alert_history_keeps_newest() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .insert_alert_history(&AlertHistory {
                    id: Uuid::new_v4(),
                    alert_rule_id: Uuid::new_v4(),
                    system_id: Uuid::new_v4(),
                    user_id,
                    name: "CPU".into(),
                    triggered_at: Utc::now() + chrono::Duration::seconds(i),
                    resolved_at: None,
                })
                .await
                .unwrap();
        }
        let dropped = store.trim_alert_history(user_id, 2).await.unwrap();
        assert_eq!(dropped, 3);
    }
}
