// SPDX-License-Identifier: MIT
//! Usage-record queries. Records are immutable after insertion except the
//! two billing flags; the CHECK constraint keeps `total = prompt + completion`
//! true even for hand-written SQL.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Storage;

/// One inference request, ready to persist.
#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub tenant_id: String,
    pub environment_id: String,
    pub api_key_id: String,
    pub region_code: String,
    pub model_id: String,
    pub node_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub cost_microdollars: i64,
}

impl UsageDraft {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageRecordRow {
    pub id: String,
    pub at: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub api_key_id: String,
    pub region_code: String,
    pub model_id: String,
    pub node_id: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub cost_microdollars: i64,
    pub billed: i64,
    pub billing_failed: i64,
    pub retry_count: i64,
}

/// Per-tenant billed totals used by the reconciliation sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantBilledTotal {
    pub tenant_id: String,
    pub total_tokens: i64,
}

impl Storage {
    pub async fn insert_usage(&self, draft: &UsageDraft) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO usage_records
               (id, at, tenant_id, environment_id, api_key_id, region_code, model_id,
                node_id, prompt_tokens, completion_tokens, total_tokens, latency_ms,
                cost_microdollars)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&now)
        .bind(&draft.tenant_id)
        .bind(&draft.environment_id)
        .bind(&draft.api_key_id)
        .bind(&draft.region_code)
        .bind(&draft.model_id)
        .bind(&draft.node_id)
        .bind(draft.prompt_tokens as i64)
        .bind(draft.completion_tokens as i64)
        .bind(draft.total_tokens() as i64)
        .bind(draft.latency_ms as i64)
        .bind(draft.cost_microdollars)
        .execute(&self.pool())
        .await?;
        Ok(id)
    }

    /// Unbilled records with `at < window_end`, excluding failures that have
    /// exhausted their retry budget (those wait for the reconciliation sweep
    /// and a human).
    pub async fn unbilled_before(
        &self,
        window_end: DateTime<Utc>,
        retry_ceiling: u32,
    ) -> Result<Vec<UsageRecordRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM usage_records
             WHERE billed = 0 AND at < ? AND retry_count < ?
             ORDER BY at ASC",
        )
        .bind(window_end.to_rfc3339())
        .bind(retry_ceiling as i64)
        .fetch_all(&self.pool())
        .await?)
    }

    /// Mark the covered records billed in one transaction. Returns the number
    /// of rows flipped (idempotent: already-billed rows are skipped).
    pub async fn mark_billed(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let mut flipped = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE usage_records SET billed = 1, billing_failed = 0 WHERE id = ? AND billed = 0",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            flipped += result.rows_affected();
        }
        tx.commit().await?;
        Ok(flipped)
    }

    /// Record an export failure: `billing_failed=1`, `retry_count++`.
    pub async fn mark_export_failed(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE usage_records
                 SET billing_failed = 1, retry_count = retry_count + 1
                 WHERE id = ? AND billed = 0",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Billed token totals per tenant since `since` — the control plane's
    /// side of the daily reconciliation.
    pub async fn billed_totals_by_tenant(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<TenantBilledTotal>> {
        Ok(sqlx::query_as(
            "SELECT tenant_id, SUM(total_tokens) AS total_tokens
             FROM usage_records
             WHERE billed = 1 AND at >= ?
             GROUP BY tenant_id",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool())
        .await?)
    }

    /// Records stuck past the retry ceiling — surfaced by reconciliation.
    pub async fn stuck_failed_count(&self, retry_ceiling: u32) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM usage_records
             WHERE billed = 0 AND billing_failed = 1 AND retry_count >= ?",
        )
        .bind(retry_ceiling as i64)
        .fetch_one(&self.pool())
        .await?;
        Ok(row.0)
    }
}
