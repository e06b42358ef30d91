// SPDX-License-Identifier: MIT
//! Tamper-evident audit log for admin and self-service mutations.
//!
//! Each entry is chained to its predecessor:
//! `entry_hash = sha256(prev_hash || at || actor || action || target || detail_hash)`.
//! Detail payloads are stored only as a SHA-256 digest — correlation without
//! retaining potentially sensitive values. Rewriting or deleting any row
//! breaks every hash after it, which `verify_chain` detects.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::storage::Storage;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub seq: i64,
    pub at: String,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub detail_hash: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Append-only hash-chained audit log backed by the Durable Store.
pub struct AuditLog {
    storage: Storage,
    /// Serialises appends so two concurrent writers cannot both chain off
    /// the same predecessor.
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one entry. Errors are logged at WARN and never propagated —
    /// a broken audit sink must not fail the admin operation itself.
    pub async fn append(&self, actor: &str, action: &str, target: &str, detail: &serde_json::Value) {
        if let Err(e) = self.try_append(actor, action, target, detail).await {
            tracing::warn!(err = %e, action, "audit log write failed");
        }
    }

    async fn try_append(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        detail: &serde_json::Value,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let prev_hash: String =
            sqlx::query_scalar("SELECT entry_hash FROM audit_log ORDER BY seq DESC LIMIT 1")
                .fetch_optional(&self.storage.pool())
                .await?
                .unwrap_or_else(|| GENESIS_HASH.to_string());

        let at = Utc::now().to_rfc3339();
        let detail_hash = sha256_hex(detail.to_string().as_bytes());
        let entry_hash = chain_hash(&prev_hash, &at, actor, action, target, &detail_hash);

        sqlx::query(
            "INSERT INTO audit_log (at, actor, action, target, detail_hash, prev_hash, entry_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&at)
        .bind(actor)
        .bind(action)
        .bind(target)
        .bind(&detail_hash)
        .bind(&prev_hash)
        .bind(&entry_hash)
        .execute(&self.storage.pool())
        .await?;
        Ok(())
    }

    pub async fn entries(&self, limit: i64) -> Result<Vec<AuditRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM audit_log ORDER BY seq DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.storage.pool())
                .await?,
        )
    }

    /// Walk the full chain and recompute every hash. Returns the sequence
    /// number of the first broken entry, or `None` if the chain is intact.
    pub async fn verify_chain(&self) -> Result<Option<i64>> {
        let rows: Vec<AuditRow> = sqlx::query_as("SELECT * FROM audit_log ORDER BY seq ASC")
            .fetch_all(&self.storage.pool())
            .await?;

        let mut expected_prev = GENESIS_HASH.to_string();
        for row in rows {
            let recomputed = chain_hash(
                &expected_prev,
                &row.at,
                &row.actor,
                &row.action,
                &row.target,
                &row.detail_hash,
            );
            if row.prev_hash != expected_prev || row.entry_hash != recomputed {
                return Ok(Some(row.seq));
            }
            expected_prev = row.entry_hash;
        }
        Ok(None)
    }
}

fn chain_hash(
    prev_hash: &str,
    at: &str,
    actor: &str,
    action: &str,
    target: &str,
    detail_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(at.as_bytes());
    hasher.update(actor.as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(target.as_bytes());
    hasher.update(detail_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
