// SPDX-License-Identifier: MIT
//! Authenticator — resolves a bearer credential to (tenant, environment,
//! key, role, limits).
//!
//! The plaintext is hashed with SHA-256 and looked up in a process-local
//! copy-on-write cache (entry TTL ≤ 60 s); on miss the Durable Store is
//! queried. Revocations propagate through the event bus so cached decisions
//! are dropped within seconds instead of lingering a full TTL.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::AuthErrorKind;
use crate::events::{kind, EventBus};
use crate::storage::{KeyAuthRow, Storage};

/// Role carried by an API key. Checked at handler dispatch, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Developer,
    ReadOnly,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "developer" => Some(Role::Developer),
            "read-only" => Some(Role::ReadOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Developer => "developer",
            Role::ReadOnly => "read-only",
        }
    }

    /// Read-only keys may list and inspect but never create inference
    /// requests or mutate state.
    pub fn can_write(&self) -> bool {
        !matches!(self, Role::ReadOnly)
    }
}

/// Effective limits resolved at authentication time, consumed by the rate
/// limiter's four admission layers.
#[derive(Debug, Clone)]
pub struct AuthLimits {
    /// Key layer: requests per minute.
    pub key_rpm: u64,
    /// Key layer: tokens per minute (falls back to the environment quota
    /// when the key carries no override).
    pub key_tpm: u64,
    /// Key layer: concurrent in-flight requests (0 = unlimited).
    pub key_concurrency: u64,
    /// Environment layer: tokens per minute (0 = unlimited).
    pub env_tpm: u64,
    /// Environment layer: tokens per day (0 = unlimited).
    pub env_daily_tokens: u64,
    /// Environment layer: concurrent in-flight requests (0 = unlimited).
    pub env_concurrency: u64,
}

/// The resolved identity attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub environment_id: String,
    pub key_id: String,
    pub role: Role,
    pub limits: AuthLimits,
    /// Reserved-capacity tenants skip the global admission layer and get a
    /// relaxed scheduler health floor.
    pub reserved_capacity: bool,
    /// Guaranteed throughput for reserved-capacity tenants (tokens/sec).
    pub reserved_tokens_per_sec: u64,
    /// Environment's preferred region, if configured.
    pub region_code: Option<String>,
    /// Model names this environment may use; empty = all.
    pub allowed_models: Vec<String>,
}

impl AuthContext {
    pub fn may_use_model(&self, model_name: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model_name)
    }
}

struct CacheEntry {
    ctx: AuthContext,
    cached_at: DateTime<Utc>,
}

/// Copy-on-write snapshot cache: readers clone an `Arc` and never block
/// other readers; writers rebuild the map.
type CacheSnapshot = Arc<HashMap<String, Arc<CacheEntry>>>;

pub struct Authenticator {
    storage: Storage,
    cache: RwLock<CacheSnapshot>,
    ttl: Duration,
}

impl Authenticator {
    pub fn new(storage: Storage, ttl: Duration) -> Self {
        Self {
            storage,
            cache: RwLock::new(Arc::new(HashMap::new())),
            ttl,
        }
    }

    /// Resolve a raw `Authorization` header value to an [`AuthContext`].
    pub async fn authenticate(&self, header: Option<&str>) -> Result<AuthContext, AuthErrorKind> {
        let bearer = header.ok_or(AuthErrorKind::MissingCredential)?;
        let token = bearer
            .strip_prefix("Bearer ")
            .ok_or(AuthErrorKind::MalformedCredential)?
            .trim();
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_graphic()) {
            return Err(AuthErrorKind::MalformedCredential);
        }

        let hash = hash_key(token);

        // Fast path: cached decision within TTL.
        {
            let snapshot = self.cache.read().await.clone();
            if let Some(entry) = snapshot.get(&hash) {
                let age = Utc::now() - entry.cached_at;
                if age.num_milliseconds() >= 0 && age.to_std().unwrap_or_default() < self.ttl {
                    return Ok(entry.ctx.clone());
                }
            }
        }

        let row = self
            .storage
            .find_key_for_auth(&hash)
            .await
            .map_err(|e| {
                warn!(err = %e, "auth lookup failed");
                AuthErrorKind::UnknownKey
            })?
            .ok_or(AuthErrorKind::UnknownKey)?;

        let ctx = validate_row(row)?;

        // Cache the positive decision (copy-on-write insert).
        {
            let mut guard = self.cache.write().await;
            let mut next: HashMap<String, Arc<CacheEntry>> = (**guard).clone();
            next.insert(
                hash,
                Arc::new(CacheEntry {
                    ctx: ctx.clone(),
                    cached_at: Utc::now(),
                }),
            );
            *guard = Arc::new(next);
        }

        Ok(ctx)
    }

    /// Drop every cached decision for `key_id`. Called from the bus listener
    /// so revocation takes effect without waiting out the TTL.
    pub async fn invalidate_key(&self, key_id: &str) {
        let mut guard = self.cache.write().await;
        let next: HashMap<String, Arc<CacheEntry>> = guard
            .iter()
            .filter(|(_, e)| e.ctx.key_id != key_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        *guard = Arc::new(next);
    }

    /// Subscribe to `key.revoked` events and invalidate matching entries.
    pub fn spawn_invalidation_listener(self: Arc<Self>, bus: &EventBus) {
        let auth = self;
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.kind != kind::KEY_REVOKED {
                    continue;
                }
                if let Some(key_id) = event.payload.get("key_id").and_then(|v| v.as_str()) {
                    debug!(key_id, "invalidating cached auth decisions");
                    auth.invalidate_key(key_id).await;
                }
            }
        });
    }
}

fn validate_row(row: KeyAuthRow) -> Result<AuthContext, AuthErrorKind> {
    match row.key_status.as_str() {
        "active" => {}
        "revoked" => return Err(AuthErrorKind::KeyRevoked),
        // Suspended keys behave like revoked ones externally.
        _ => return Err(AuthErrorKind::KeyRevoked),
    }
    if let Some(expiry) = &row.expires_at {
        if let Ok(t) = DateTime::parse_from_rfc3339(expiry) {
            if t.with_timezone(&Utc) <= Utc::now() {
                return Err(AuthErrorKind::KeyExpired);
            }
        }
    }
    if row.tenant_status != "active" {
        return Err(AuthErrorKind::TenantSuspended);
    }
    if row.env_status != "active" {
        return Err(AuthErrorKind::TenantSuspended);
    }

    let role = Role::parse(&row.role).ok_or(AuthErrorKind::UnknownKey)?;
    let allowed_models: Vec<String> =
        serde_json::from_str(&row.allowed_models).unwrap_or_default();

    let env_tpm = row.per_minute_token_quota.max(0) as u64;
    Ok(AuthContext {
        tenant_id: row.tenant_id,
        environment_id: row.environment_id,
        key_id: row.key_id,
        role,
        limits: AuthLimits {
            key_rpm: row.requests_per_minute.max(0) as u64,
            key_tpm: row
                .tokens_per_minute
                .map(|t| t.max(0) as u64)
                .unwrap_or(env_tpm),
            key_concurrency: row.key_concurrency_limit.max(0) as u64,
            env_tpm,
            env_daily_tokens: row.daily_token_quota.max(0) as u64,
            env_concurrency: row.env_concurrency_limit.max(0) as u64,
        },
        reserved_capacity: row.plan == "reserved" || row.plan == "enterprise",
        reserved_tokens_per_sec: row.reserved_tokens_per_sec.max(0) as u64,
        region_code: row.env_region_code,
        allowed_models,
    })
}

/// SHA-256 hex digest of a plaintext key — the only form ever stored.
pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a fresh API key. Returns `(plaintext, hash, prefix)` — the
/// plaintext is shown to the caller exactly once and never persisted.
pub fn generate_key(mode: &str) -> (String, String, String) {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let plaintext = format!("tg_{mode}_{a}");
    let hash = hash_key(&plaintext);
    let prefix: String = plaintext.chars().take(12).collect();
    (plaintext, hash, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn seed(db: &Storage) -> (String, String) {
        let t = db
            .create_tenant("acme", "auth@acme.test", "serverless", None)
            .await
            .unwrap();
        let e = db
            .create_environment(&t.id, "prod", Some("us-east"), &[], 100_000, 10_000, 8)
            .await
            .unwrap();
        (t.id, e.id)
    }

    #[tokio::test]
    async fn resolves_active_key() {
        let db = Storage::in_memory().await.unwrap();
        let (tenant_id, env_id) = seed(&db).await;
        let (plaintext, hash, prefix) = generate_key("live");
        assert!(plaintext.starts_with("tg_live_"));
        assert_eq!(prefix.len(), 12);
        db.create_api_key(&hash, &prefix, &tenant_id, &env_id, "developer", Some(5_000), 60, 4, None)
            .await
            .unwrap();

        let auth = Authenticator::new(db, Duration::from_secs(60));
        let ctx = auth
            .authenticate(Some(&format!("Bearer {plaintext}")))
            .await
            .unwrap();
        assert_eq!(ctx.tenant_id, tenant_id);
        assert_eq!(ctx.role, Role::Developer);
        assert_eq!(ctx.limits.key_tpm, 5_000);
        assert_eq!(ctx.limits.env_tpm, 10_000);
        assert!(!ctx.reserved_capacity);
    }

    #[tokio::test]
    async fn malformed_and_missing_credentials() {
        let db = Storage::in_memory().await.unwrap();
        let auth = Authenticator::new(db, Duration::from_secs(60));
        assert_eq!(
            auth.authenticate(None).await.unwrap_err(),
            AuthErrorKind::MissingCredential
        );
        assert_eq!(
            auth.authenticate(Some("Basic abc")).await.unwrap_err(),
            AuthErrorKind::MalformedCredential
        );
        assert_eq!(
            auth.authenticate(Some("Bearer ")).await.unwrap_err(),
            AuthErrorKind::MalformedCredential
        );
        assert_eq!(
            auth.authenticate(Some("Bearer nope")).await.unwrap_err(),
            AuthErrorKind::UnknownKey
        );
    }

    #[tokio::test]
    async fn suspended_tenant_is_rejected() {
        let db = Storage::in_memory().await.unwrap();
        let (tenant_id, env_id) = seed(&db).await;
        let (plaintext, hash, prefix) = generate_key("live");
        db.create_api_key(&hash, &prefix, &tenant_id, &env_id, "developer", None, 60, 0, None)
            .await
            .unwrap();
        db.update_tenant_status(&tenant_id, "suspended").await.unwrap();

        let auth = Authenticator::new(db, Duration::from_secs(60));
        assert_eq!(
            auth.authenticate(Some(&format!("Bearer {plaintext}")))
                .await
                .unwrap_err(),
            AuthErrorKind::TenantSuspended
        );
    }

    #[tokio::test]
    async fn revoked_key_rejected_and_cache_invalidated() {
        let db = Storage::in_memory().await.unwrap();
        let (tenant_id, env_id) = seed(&db).await;
        let (plaintext, hash, prefix) = generate_key("live");
        let key = db
            .create_api_key(&hash, &prefix, &tenant_id, &env_id, "developer", None, 60, 0, None)
            .await
            .unwrap();

        let auth = Authenticator::new(db.clone(), Duration::from_secs(60));
        let header = format!("Bearer {plaintext}");
        auth.authenticate(Some(&header)).await.unwrap();

        // Revoke, then drop the cached decision the way the bus listener does.
        db.update_api_key_status(&key.id, "revoked").await.unwrap();
        auth.invalidate_key(&key.id).await;

        assert_eq!(
            auth.authenticate(Some(&header)).await.unwrap_err(),
            AuthErrorKind::KeyRevoked
        );
    }

    #[tokio::test]
    async fn expired_key_rejected() {
        let db = Storage::in_memory().await.unwrap();
        let (tenant_id, env_id) = seed(&db).await;
        let (plaintext, hash, prefix) = generate_key("live");
        db.create_api_key(
            &hash,
            &prefix,
            &tenant_id,
            &env_id,
            "developer",
            None,
            60,
            0,
            Some(Utc::now() - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();

        let auth = Authenticator::new(db, Duration::from_secs(60));
        assert_eq!(
            auth.authenticate(Some(&format!("Bearer {plaintext}")))
                .await
                .unwrap_err(),
            AuthErrorKind::KeyExpired
        );
    }
}
