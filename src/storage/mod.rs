// SPDX-License-Identifier: MIT
//! Durable Store — the relational backend that owns all long-lived state.
//!
//! SQLite via sqlx (WAL mode, crash-safe). Exclusively owns tenants,
//! environments, API keys, models, regions, nodes, usage records, the
//! external-event ledger, and the audit chain. Everything in the Hot-State
//! Store can be rebuilt from here.

pub mod usage;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the request path indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub billing_customer_id: Option<String>,
    pub status: String,
    pub plan: String,
    pub reserved_tokens_per_sec: i64,
    /// JSON mapping of region code → preference weight.
    pub region_preferences: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TenantRow {
    /// Reserved and enterprise plans hold guaranteed throughput and bypass
    /// the global admission layer.
    pub fn has_reserved_capacity(&self) -> bool {
        self.plan == "reserved" || self.plan == "enterprise"
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvironmentRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub region_code: Option<String>,
    /// JSON array of model names this environment may use; empty = all.
    pub allowed_models: String,
    pub daily_token_quota: i64,
    pub per_minute_token_quota: i64,
    pub concurrency_limit: i64,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: String,
    pub key_hash: String,
    pub prefix: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub role: String,
    pub tokens_per_minute: Option<i64>,
    pub requests_per_minute: i64,
    pub concurrency_limit: i64,
    pub status: String,
    pub expires_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegionRow {
    pub code: String,
    pub clouds: String,
    pub cost_multiplier: f64,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModelRow {
    pub id: String,
    pub name: String,
    pub family: String,
    pub size_tag: String,
    pub model_type: String,
    pub context_length: i64,
    pub vram_gb: i64,
    /// Microdollars per million input tokens.
    pub input_price_per_mtok: i64,
    /// Microdollars per million output tokens.
    pub output_price_per_mtok: i64,
    pub throughput_hint: Option<f64>,
    pub status: String,
    pub metadata: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRow {
    pub id: String,
    pub cluster_handle: Option<String>,
    pub tenant_id: Option<String>,
    pub provider: String,
    pub region_code: String,
    pub instance_type: String,
    pub gpu_type: String,
    pub total_vram_gb: i64,
    pub free_vram_gb: i64,
    pub model_id: Option<String>,
    pub endpoint_url: Option<String>,
    pub spot: i64,
    pub spot_price: Option<f64>,
    pub throughput_tps: Option<f64>,
    pub status: String,
    pub health_score: i64,
    pub last_heartbeat_at: Option<String>,
    pub created_at: String,
    pub terminated_at: Option<String>,
}

/// Everything the authenticator needs in one join: key + owning tenant and
/// environment limits.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyAuthRow {
    pub key_id: String,
    pub key_status: String,
    pub role: String,
    pub expires_at: Option<String>,
    pub tokens_per_minute: Option<i64>,
    pub requests_per_minute: i64,
    pub key_concurrency_limit: i64,
    pub tenant_id: String,
    pub tenant_status: String,
    pub plan: String,
    pub reserved_tokens_per_sec: i64,
    pub environment_id: String,
    pub env_status: String,
    pub env_region_code: Option<String>,
    pub allowed_models: String,
    pub daily_token_quota: i64,
    pub per_minute_token_quota: i64,
    pub env_concurrency_limit: i64,
}

// ─── Storage ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .foreign_keys(true)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection — every pooled
    /// connection to `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            sqlx::raw_sql(sql).execute(pool).await?;
        }
        Ok(())
    }

    /// `SELECT 1` probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ── Tenants ───────────────────────────────────────────────────────────────

    pub async fn create_tenant(
        &self,
        name: &str,
        email: &str,
        plan: &str,
        billing_customer_id: Option<&str>,
    ) -> Result<TenantRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO tenants (id, name, email, billing_customer_id, plan, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(name)
            .bind(email)
            .bind(billing_customer_id)
            .bind(plan)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.get_tenant(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("tenant vanished after insert"))
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Option<TenantRow>> {
        Ok(sqlx::query_as("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_tenant_by_billing_customer(
        &self,
        billing_customer_id: &str,
    ) -> Result<Option<TenantRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM tenants WHERE billing_customer_id = ?")
                .bind(billing_customer_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM tenants WHERE status != 'deleted' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn update_tenant_plan(
        &self,
        id: &str,
        plan: &str,
        reserved_tokens_per_sec: i64,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tenants SET plan = ?, reserved_tokens_per_sec = ?, updated_at = ? WHERE id = ?",
        )
        .bind(plan)
        .bind(reserved_tokens_per_sec.max(0))
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_tenant_status(&self, id: &str, status: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE tenants SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Environments ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_environment(
        &self,
        tenant_id: &str,
        name: &str,
        region_code: Option<&str>,
        allowed_models: &[String],
        daily_token_quota: i64,
        per_minute_token_quota: i64,
        concurrency_limit: i64,
    ) -> Result<EnvironmentRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO environments
               (id, tenant_id, name, region_code, allowed_models, daily_token_quota,
                per_minute_token_quota, concurrency_limit, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(name)
        .bind(region_code)
        .bind(serde_json::to_string(allowed_models)?)
        .bind(daily_token_quota)
        .bind(per_minute_token_quota)
        .bind(concurrency_limit)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_environment(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("environment vanished after insert"))
    }

    pub async fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRow>> {
        Ok(sqlx::query_as("SELECT * FROM environments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_environments(&self, tenant_id: &str) -> Result<Vec<EnvironmentRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM environments WHERE tenant_id = ? AND status != 'deleted' ORDER BY created_at",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_environment(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM environments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── API keys ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_api_key(
        &self,
        key_hash: &str,
        prefix: &str,
        tenant_id: &str,
        environment_id: &str,
        role: &str,
        tokens_per_minute: Option<i64>,
        requests_per_minute: i64,
        concurrency_limit: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO api_keys
               (id, key_hash, prefix, tenant_id, environment_id, role, tokens_per_minute,
                requests_per_minute, concurrency_limit, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(key_hash)
        .bind(prefix)
        .bind(tenant_id)
        .bind(environment_id)
        .bind(role)
        .bind(tokens_per_minute)
        .bind(requests_per_minute)
        .bind(concurrency_limit)
        .bind(expires_at.map(|t| t.to_rfc3339()))
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_api_key(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("api key vanished after insert"))
    }

    pub async fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRow>> {
        Ok(sqlx::query_as("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKeyRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM api_keys WHERE tenant_id = ? ORDER BY created_at")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn update_api_key_status(&self, id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The authenticator's one query: key by hash, joined with the owning
    /// tenant and environment. Lookup is by hash — plaintext never stored.
    pub async fn find_key_for_auth(&self, key_hash: &str) -> Result<Option<KeyAuthRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT k.id AS key_id, k.status AS key_status, k.role, k.expires_at,
                        k.tokens_per_minute, k.requests_per_minute,
                        k.concurrency_limit AS key_concurrency_limit,
                        t.id AS tenant_id, t.status AS tenant_status, t.plan,
                        t.reserved_tokens_per_sec,
                        e.id AS environment_id, e.status AS env_status,
                        e.region_code AS env_region_code, e.allowed_models,
                        e.daily_token_quota, e.per_minute_token_quota,
                        e.concurrency_limit AS env_concurrency_limit
                 FROM api_keys k
                 JOIN tenants t ON t.id = k.tenant_id
                 JOIN environments e ON e.id = k.environment_id
                 WHERE k.key_hash = ?",
            )
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await
    }

    // ── Regions ───────────────────────────────────────────────────────────────

    pub async fn upsert_region(
        &self,
        code: &str,
        clouds: &[String],
        cost_multiplier: f64,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO regions (code, clouds, cost_multiplier, status)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET
               clouds = excluded.clouds,
               cost_multiplier = excluded.cost_multiplier,
               status = excluded.status",
        )
        .bind(code)
        .bind(serde_json::to_string(clouds)?)
        .bind(cost_multiplier)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_region(&self, code: &str) -> Result<Option<RegionRow>> {
        Ok(sqlx::query_as("SELECT * FROM regions WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_regions(&self) -> Result<Vec<RegionRow>> {
        Ok(sqlx::query_as("SELECT * FROM regions ORDER BY code")
            .fetch_all(&self.pool)
            .await?)
    }

    // ── Models ────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_model(
        &self,
        name: &str,
        family: &str,
        size_tag: &str,
        model_type: &str,
        context_length: i64,
        vram_gb: i64,
        input_price_per_mtok: i64,
        output_price_per_mtok: i64,
        metadata: &serde_json::Value,
    ) -> Result<ModelRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO models
               (id, name, family, size_tag, model_type, context_length, vram_gb,
                input_price_per_mtok, output_price_per_mtok, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(family)
        .bind(size_tag)
        .bind(model_type)
        .bind(context_length)
        .bind(vram_gb)
        .bind(input_price_per_mtok)
        .bind(output_price_per_mtok)
        .bind(metadata.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_model(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("model vanished after insert"))
    }

    pub async fn get_model(&self, id: &str) -> Result<Option<ModelRow>> {
        Ok(sqlx::query_as("SELECT * FROM models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_model_by_name(&self, name: &str) -> Result<Option<ModelRow>> {
        Ok(sqlx::query_as("SELECT * FROM models WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelRow>> {
        Ok(sqlx::query_as("SELECT * FROM models ORDER BY name")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn update_model_status(&self, id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE models SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Nodes ─────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_node(
        &self,
        id: &str,
        tenant_id: Option<&str>,
        provider: &str,
        region_code: &str,
        instance_type: &str,
        gpu_type: &str,
        total_vram_gb: i64,
        model_id: Option<&str>,
        spot: bool,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO nodes
               (id, tenant_id, provider, region_code, instance_type, gpu_type,
                total_vram_gb, free_vram_gb, model_id, spot, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(provider)
        .bind(region_code)
        .bind(instance_type)
        .bind(gpu_type)
        .bind(total_vram_gb)
        .bind(total_vram_gb)
        .bind(model_id)
        .bind(spot as i64)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<NodeRow>> {
        Ok(sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_node_by_cluster(&self, cluster_handle: &str) -> Result<Option<NodeRow>> {
        Ok(sqlx::query_as("SELECT * FROM nodes WHERE cluster_handle = ?")
            .bind(cluster_handle)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_nodes(&self, status: Option<&str>) -> Result<Vec<NodeRow>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as("SELECT * FROM nodes WHERE status = ? ORDER BY created_at")
                    .bind(s)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM nodes ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// Nodes the registry rehydrates at boot: everything not yet terminal.
    pub async fn list_live_nodes(&self) -> Result<Vec<NodeRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM nodes WHERE status NOT IN ('dead', 'terminated') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn set_node_cluster_handle(&self, id: &str, cluster_handle: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET cluster_handle = ? WHERE id = ?")
            .bind(cluster_handle)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_node_endpoint(&self, id: &str, endpoint_url: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET endpoint_url = ? WHERE id = ?")
            .bind(endpoint_url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_node_status(&self, id: &str, status: &str) -> Result<()> {
        let terminated_at = if status == "terminated" || status == "dead" {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        sqlx::query(
            "UPDATE nodes SET status = ?, terminated_at = COALESCE(?, terminated_at) WHERE id = ?",
        )
        .bind(status)
        .bind(terminated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_node_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        health_score: i64,
        free_vram_gb: i64,
        throughput_tps: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE nodes SET last_heartbeat_at = ?, health_score = ?, free_vram_gb = ?,
                              throughput_tps = COALESCE(?, throughput_tps)
             WHERE id = ?",
        )
        .bind(at.to_rfc3339())
        .bind(health_score.clamp(0, 100))
        .bind(free_vram_gb)
        .bind(throughput_tps)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── External-event ledger ─────────────────────────────────────────────────

    /// Record an external event id. Returns `true` if this is the first
    /// delivery, `false` on replay — the idempotency contract shared by the
    /// billing webhook and usage accounting.
    pub async fn record_external_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO billing_events (external_event_id, event_type, processed_at, payload)
             VALUES (?, ?, ?, ?)",
        )
        .bind(external_event_id)
        .bind(event_type)
        .bind(&now)
        .bind(payload.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
