// SPDX-License-Identifier: MIT
//! Four-layer admission control: API key → environment → tenant → global.
//!
//! Each layer limits two dimensions — tokens/requests per window and
//! concurrent in-flight requests. Counters live in the Hot-State Store as
//! window-bucketed keys (`ratelimit:{layer}:{id}:{window}`); every check is
//! an atomic increment-and-compare that commits nothing on violation.
//!
//! Ordering: the most specific layer is checked first and admission aborts
//! on the first refusal, so the caller learns which layer rejected them.
//! Increments already committed by earlier layers are rolled back — a
//! refused request is never charged.
//!
//! Reserved-capacity tenants skip the global layer entirely.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, warn};

use crate::auth::AuthContext;
use crate::error::{ApiError, LimitLayer};
use crate::hot::{ratelimit_key, HotStore};

/// Consecutive hot-store failures before the limiter flips to bypass mode.
/// Bypass admits everything and logs loudly — operationally explicit, never
/// silent.
const BYPASS_AFTER_FAILURES: u32 = 3;

/// Concurrency gauges refresh this TTL on every increment; a crashed
/// process's leaked slots expire instead of wedging a tenant forever.
const CONCURRENCY_TTL: Duration = Duration::from_secs(3600);

const MINUTE: u64 = 60;
const DAY: u64 = 86_400;

/// Default limits for layers whose entities carry no explicit configuration.
#[derive(Debug, Clone)]
pub struct LimiterDefaults {
    /// Tenant layer: tokens per minute for non-reserved tenants.
    pub tenant_tpm: u64,
    /// Tenant layer: tokens per day for non-reserved tenants.
    pub tenant_daily_tokens: u64,
    /// Tenant layer: concurrent in-flight requests.
    pub tenant_concurrency: u64,
    /// Global layer: requests per minute.
    pub global_rpm: u64,
    /// Global layer: tokens per minute.
    pub global_tpm: u64,
    /// Global layer: concurrent in-flight requests.
    pub global_concurrency: u64,
}

impl Default for LimiterDefaults {
    fn default() -> Self {
        Self {
            tenant_tpm: 500_000,
            tenant_daily_tokens: 50_000_000,
            tenant_concurrency: 256,
            global_rpm: 10_000,
            global_tpm: 10_000_000,
            global_concurrency: 2_000,
        }
    }
}

/// Values for the `X-RateLimit-*` response headers, taken from the API-key
/// request counter (the limit clients can actually reason about).
#[derive(Debug, Clone, Copy)]
pub struct LimitSnapshot {
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterKind {
    Requests,
    Tokens,
    /// Day-window token counters; refusals surface as `QuotaExceeded`.
    DailyTokens,
    Concurrency,
}

/// One committed hot-store increment, remembered so it can be rolled back
/// (refusal, upstream failure) or reconciled (actual token usage).
#[derive(Debug, Clone)]
struct CommittedOp {
    key: String,
    delta: u64,
    kind: CounterKind,
    ttl: Duration,
}

/// Granted admission: holds the reserved concurrency slots and estimated
/// token budget until closed or released.
///
/// Dropping a live ticket releases it in the background — a request that
/// panics or is cancelled cannot leak its slots.
#[derive(Debug)]
pub struct AdmissionTicket {
    store: HotStore,
    ops: Vec<CommittedOp>,
    estimated_tokens: u64,
    pub headers: LimitSnapshot,
    armed: bool,
}

impl AdmissionTicket {
    /// Complete the request: decrement concurrency, reconcile the token
    /// delta (actual vs estimate) into the windowed counters.
    pub async fn close(mut self, actual_tokens: u64) {
        self.armed = false;
        let delta = actual_tokens as i64 - self.estimated_tokens as i64;
        for op in &self.ops {
            match op.kind {
                CounterKind::Concurrency => {
                    let _ = self.store.decr_clamped(&op.key, op.delta).await;
                }
                CounterKind::Tokens | CounterKind::DailyTokens if delta != 0 => {
                    let _ = self.store.adjust(&op.key, delta, op.ttl).await;
                }
                _ => {}
            }
        }
    }

    /// Undo the admission entirely — the request never reached the upstream,
    /// so the caller is not charged for it.
    pub async fn release(mut self) {
        self.armed = false;
        let store = self.store.clone();
        let ops = std::mem::take(&mut self.ops);
        rollback(&store, &ops).await;
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.armed && !self.ops.is_empty() {
            let store = self.store.clone();
            let ops = std::mem::take(&mut self.ops);
            tokio::spawn(async move {
                rollback(&store, &ops).await;
            });
        }
    }
}

async fn rollback(store: &HotStore, ops: &[CommittedOp]) {
    for op in ops {
        let _ = store.decr_clamped(&op.key, op.delta).await;
    }
}

pub struct RateLimiter {
    store: HotStore,
    defaults: LimiterDefaults,
    consecutive_failures: AtomicU32,
    bypass: AtomicBool,
}

impl RateLimiter {
    pub fn new(store: HotStore, defaults: LimiterDefaults) -> Self {
        Self {
            store,
            defaults,
            consecutive_failures: AtomicU32::new(0),
            bypass: AtomicBool::new(false),
        }
    }

    /// Whether the limiter is currently admitting without counting.
    pub fn bypassing(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    /// Admit one request estimated at `estimated_tokens`. Checks layers from
    /// most to least specific and aborts (rolling back) on the first refusal.
    pub async fn admit(
        &self,
        ctx: &AuthContext,
        estimated_tokens: u64,
    ) -> Result<AdmissionTicket, ApiError> {
        if self.bypass.load(Ordering::Relaxed) {
            error!(
                tenant = %ctx.tenant_id,
                "rate limiter in BYPASS mode — admitting without counting"
            );
            return Ok(self.empty_ticket());
        }

        let now = chrono::Utc::now().timestamp() as u64;
        let minute_window = now / MINUTE;
        let day_window = now / DAY;
        let minute_ttl = Duration::from_secs(MINUTE - now % MINUTE);
        let day_ttl = Duration::from_secs(DAY - now % DAY);

        let l = &ctx.limits;
        let (tenant_tpm, tenant_daily) = if ctx.reserved_capacity {
            // Reserved tenants are limited by their purchased throughput.
            let per_min = (ctx.reserved_tokens_per_sec * MINUTE).max(self.defaults.tenant_tpm);
            (per_min, per_min.saturating_mul(DAY / MINUTE))
        } else {
            (self.defaults.tenant_tpm, self.defaults.tenant_daily_tokens)
        };

        // (layer, key, delta, ttl, limit, kind) — in refusal-priority order.
        // A limit of 0 means unlimited and is skipped.
        let mut checks: Vec<(LimitLayer, String, u64, Duration, u64, CounterKind)> = vec![
            (
                LimitLayer::ApiKey,
                ratelimit_key("key", &format!("{}:req", ctx.key_id), minute_window as i64),
                1,
                minute_ttl,
                l.key_rpm,
                CounterKind::Requests,
            ),
            (
                LimitLayer::ApiKey,
                ratelimit_key("key", &format!("{}:tok", ctx.key_id), minute_window as i64),
                estimated_tokens,
                minute_ttl,
                l.key_tpm,
                CounterKind::Tokens,
            ),
            (
                LimitLayer::ApiKey,
                ratelimit_key("key", &format!("{}:conc", ctx.key_id), 0),
                1,
                CONCURRENCY_TTL,
                l.key_concurrency,
                CounterKind::Concurrency,
            ),
            (
                LimitLayer::Environment,
                ratelimit_key("env", &format!("{}:tok", ctx.environment_id), minute_window as i64),
                estimated_tokens,
                minute_ttl,
                l.env_tpm,
                CounterKind::Tokens,
            ),
            (
                LimitLayer::Environment,
                ratelimit_key("env", &format!("{}:day", ctx.environment_id), day_window as i64),
                estimated_tokens,
                day_ttl,
                l.env_daily_tokens,
                CounterKind::DailyTokens,
            ),
            (
                LimitLayer::Environment,
                ratelimit_key("env", &format!("{}:conc", ctx.environment_id), 0),
                1,
                CONCURRENCY_TTL,
                l.env_concurrency,
                CounterKind::Concurrency,
            ),
            (
                LimitLayer::Tenant,
                ratelimit_key("tenant", &format!("{}:tok", ctx.tenant_id), minute_window as i64),
                estimated_tokens,
                minute_ttl,
                tenant_tpm,
                CounterKind::Tokens,
            ),
            (
                LimitLayer::Tenant,
                ratelimit_key("tenant", &format!("{}:day", ctx.tenant_id), day_window as i64),
                estimated_tokens,
                day_ttl,
                tenant_daily,
                CounterKind::DailyTokens,
            ),
            (
                LimitLayer::Tenant,
                ratelimit_key("tenant", &format!("{}:conc", ctx.tenant_id), 0),
                1,
                CONCURRENCY_TTL,
                self.defaults.tenant_concurrency,
                CounterKind::Concurrency,
            ),
        ];

        if !ctx.reserved_capacity {
            checks.push((
                LimitLayer::Global,
                ratelimit_key("global", "req", minute_window as i64),
                1,
                minute_ttl,
                self.defaults.global_rpm,
                CounterKind::Requests,
            ));
            checks.push((
                LimitLayer::Global,
                ratelimit_key("global", "tok", minute_window as i64),
                estimated_tokens,
                minute_ttl,
                self.defaults.global_tpm,
                CounterKind::Tokens,
            ));
            checks.push((
                LimitLayer::Global,
                ratelimit_key("global", "conc", 0),
                1,
                CONCURRENCY_TTL,
                self.defaults.global_concurrency,
                CounterKind::Concurrency,
            ));
        }

        let mut committed: Vec<CommittedOp> = Vec::with_capacity(checks.len());
        let mut headers = LimitSnapshot {
            limit: l.key_rpm,
            remaining: l.key_rpm,
            reset_secs: minute_ttl.as_secs(),
        };

        for (layer, key, delta, ttl, limit, kind) in checks {
            if limit == 0 {
                continue;
            }
            match self.store.incr_check(&key, delta, ttl, limit).await {
                Ok(outcome) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    if !outcome.admitted {
                        rollback(&self.store, &committed).await;
                        let retry_after_secs = match kind {
                            // A freed slot can show up at any moment.
                            CounterKind::Concurrency => 1,
                            _ => outcome.reset_secs.max(1),
                        };
                        if layer == LimitLayer::ApiKey && kind == CounterKind::Requests {
                            headers.remaining = limit.saturating_sub(outcome.value);
                        }
                        return Err(if kind == CounterKind::DailyTokens {
                            ApiError::QuotaExceeded {
                                layer,
                                retry_after_secs,
                                limit,
                            }
                        } else {
                            ApiError::RateLimited {
                                layer,
                                retry_after_secs,
                                limit,
                            }
                        });
                    }
                    if layer == LimitLayer::ApiKey && kind == CounterKind::Requests {
                        headers = LimitSnapshot {
                            limit,
                            remaining: limit.saturating_sub(outcome.value),
                            reset_secs: outcome.reset_secs,
                        };
                    }
                    committed.push(CommittedOp { key, delta, kind, ttl });
                }
                Err(e) => {
                    rollback(&self.store, &committed).await;
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= BYPASS_AFTER_FAILURES {
                        self.bypass.store(true, Ordering::Relaxed);
                        error!(
                            err = %e,
                            failures,
                            "hot store lost — opening rate-limit bypass"
                        );
                        return Ok(self.empty_ticket());
                    }
                    warn!(err = %e, failures, "hot store failure — failing closed");
                    return Err(ApiError::DependencyUnavailable(
                        "rate limit store".to_string(),
                    ));
                }
            }
        }

        Ok(AdmissionTicket {
            store: self.store.clone(),
            ops: committed,
            estimated_tokens,
            headers,
            armed: true,
        })
    }

    /// Current header values for a key without admitting anything.
    pub async fn peek_key(&self, key_id: &str, key_rpm: u64) -> LimitSnapshot {
        let now = chrono::Utc::now().timestamp() as u64;
        let window = (now / MINUTE) as i64;
        let key = ratelimit_key("key", &format!("{key_id}:req"), window);
        match self.store.counter(&key).await {
            Ok(Some((value, reset_secs))) => LimitSnapshot {
                limit: key_rpm,
                remaining: key_rpm.saturating_sub(value),
                reset_secs,
            },
            _ => LimitSnapshot {
                limit: key_rpm,
                remaining: key_rpm,
                reset_secs: MINUTE - now % MINUTE,
            },
        }
    }

    fn empty_ticket(&self) -> AdmissionTicket {
        AdmissionTicket {
            store: self.store.clone(),
            ops: Vec::new(),
            estimated_tokens: 0,
            headers: LimitSnapshot {
                limit: 0,
                remaining: 0,
                reset_secs: 0,
            },
            armed: false,
        }
    }
}

/// Token estimate used for admission when the request has not yet run:
/// `max_tokens` when the caller supplied it, else a bytes/4 heuristic on the
/// body. Reconciled to actual usage at ticket close.
pub fn estimate_tokens(body_len: usize, max_tokens: Option<u64>) -> u64 {
    let prompt_estimate = (body_len as u64 / 4).max(1);
    prompt_estimate + max_tokens.unwrap_or(256)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthContext, AuthLimits, Role};

    fn ctx(key_rpm: u64, key_tpm: u64, key_conc: u64) -> AuthContext {
        AuthContext {
            tenant_id: "t1".to_string(),
            environment_id: "e1".to_string(),
            key_id: "k1".to_string(),
            role: Role::Developer,
            limits: AuthLimits {
                key_rpm,
                key_tpm,
                key_concurrency: key_conc,
                env_tpm: 0,
                env_daily_tokens: 0,
                env_concurrency: 0,
            },
            reserved_capacity: false,
            reserved_tokens_per_sec: 0,
            region_code: None,
            allowed_models: Vec::new(),
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(HotStore::new(), LimiterDefaults::default())
    }

    #[tokio::test]
    async fn admits_until_request_limit() {
        let rl = limiter();
        let c = ctx(3, 0, 0);
        for _ in 0..3 {
            let ticket = rl.admit(&c, 10).await.unwrap();
            ticket.close(10).await;
        }
        let err = rl.admit(&c, 10).await.unwrap_err();
        match err {
            ApiError::RateLimited { layer, limit, .. } => {
                assert_eq!(layer, LimitLayer::ApiKey);
                assert_eq!(limit, 3);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn headers_track_remaining() {
        let rl = limiter();
        let c = ctx(10, 0, 0);
        let t1 = rl.admit(&c, 1).await.unwrap();
        assert_eq!(t1.headers.limit, 10);
        assert_eq!(t1.headers.remaining, 9);
        let t2 = rl.admit(&c, 1).await.unwrap();
        assert_eq!(t2.headers.remaining, 8);
        t1.close(1).await;
        t2.close(1).await;
    }

    #[tokio::test]
    async fn concurrency_slot_released_on_close() {
        let rl = limiter();
        let c = ctx(100, 0, 1);
        let ticket = rl.admit(&c, 5).await.unwrap();
        // Slot is held — a second request is refused at the key layer.
        let err = rl.admit(&c, 5).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::RateLimited {
                layer: LimitLayer::ApiKey,
                ..
            }
        ));
        ticket.close(5).await;
        // Slot freed.
        let t = rl.admit(&c, 5).await.unwrap();
        t.close(5).await;
    }

    #[tokio::test]
    async fn refusal_rolls_back_earlier_layers() {
        let rl = limiter();
        // Token limit refuses; the request counter must not retain the
        // aborted admission.
        let c = ctx(100, 50, 0);
        let t = rl.admit(&c, 40).await.unwrap();
        let err = rl.admit(&c, 40).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
        t.close(40).await;

        // Only the one successful admission is counted.
        let snap = rl.peek_key("k1", 100).await;
        assert_eq!(snap.remaining, 99);
    }

    #[tokio::test]
    async fn release_uncharges_the_caller() {
        let rl = limiter();
        let c = ctx(10, 1000, 4);
        let ticket = rl.admit(&c, 100).await.unwrap();
        ticket.release().await;
        let snap = rl.peek_key("k1", 10).await;
        assert_eq!(snap.remaining, 10, "released admission must not count");
    }

    #[tokio::test]
    async fn close_reconciles_token_delta() {
        let rl = limiter();
        let c = ctx(0, 1000, 0);
        // Estimate 600, actual 100 — 500 tokens return to the window.
        let ticket = rl.admit(&c, 600).await.unwrap();
        ticket.close(100).await;
        let t2 = rl.admit(&c, 900).await.unwrap();
        t2.close(900).await;
    }

    #[tokio::test]
    async fn reserved_tenant_skips_global_layer() {
        let rl = RateLimiter::new(
            HotStore::new(),
            LimiterDefaults {
                global_rpm: 1,
                ..Default::default()
            },
        );
        let mut c = ctx(0, 0, 0);
        c.reserved_capacity = true;
        c.reserved_tokens_per_sec = 100;
        // Global rpm of 1 would refuse the second request; reserved skips it.
        for _ in 0..3 {
            rl.admit(&c, 10).await.unwrap().close(10).await;
        }
    }

    #[tokio::test]
    async fn boundary_exact_fit_admits() {
        let rl = limiter();
        let c = ctx(0, 100, 0);
        let t = rl.admit(&c, 100).await.unwrap();
        t.close(100).await;
        let err = rl.admit(&c, 1).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
    }

    #[test]
    fn estimate_has_floor() {
        assert!(estimate_tokens(0, None) >= 1);
        assert_eq!(estimate_tokens(400, Some(1000)), 1100);
    }
}
