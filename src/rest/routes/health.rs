// SPDX-License-Identifier: MIT
//! Liveness and metrics endpoints (unauthenticated, local-operations use).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

use crate::AppContext;

/// `GET /healthz` — checks the Durable Store and the Hot-State Store.
pub async fn healthz(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let database_ok = ctx.storage.ping().await.is_ok();
    let hot_ok = ctx
        .hot
        .counter("healthz:probe")
        .await
        .is_ok();

    let healthy = database_ok && hot_ok;
    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "checks": {
            "database": database_ok,
            "hot_store": hot_ok,
        },
        "rate_limiter_bypass": ctx.limiter.bypassing(),
    }));
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        ctx.metrics.render(),
    )
}
