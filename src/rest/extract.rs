// SPDX-License-Identifier: MIT
//! Request authentication helpers shared by all route modules.

use axum::http::HeaderMap;
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::error::{ApiError, AuthErrorKind};
use crate::metrics::Metrics;
use crate::AppContext;

/// Resolve the caller's API key. Counts failures in metrics.
pub async fn api_auth(ctx: &AppContext, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match ctx.auth.authenticate(header).await {
        Ok(auth) => Ok(auth),
        Err(kind) => {
            tracing::debug!(kind = kind.as_str(), "authentication refused");
            Metrics::inc(&ctx.metrics.auth_failures);
            Err(ApiError::Auth(kind))
        }
    }
}

/// Guard for the /admin surface: a single admin token, compared in constant
/// time. Accepts `X-Admin-Token: <token>` or `Authorization: Bearer <token>`.
pub fn admin_auth(ctx: &Arc<AppContext>, headers: &HeaderMap) -> Result<(), ApiError> {
    if ctx.config.admin_token.is_empty() {
        // No token configured — the admin surface is disabled outright.
        return Err(ApiError::Auth(AuthErrorKind::UnknownKey));
    }
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .unwrap_or("");

    if constant_time_eq(presented.as_bytes(), ctx.config.admin_token.as_bytes()) {
        Ok(())
    } else {
        Metrics::inc(&ctx.metrics.auth_failures);
        Err(ApiError::Auth(AuthErrorKind::UnknownKey))
    }
}

/// Timing-safe byte comparison: always walks the full length of both
/// inputs, accumulating the difference bitwise.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}
