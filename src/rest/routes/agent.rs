// SPDX-License-Identifier: MIT
//! Node agent → control plane ingress: registration, heartbeats, spot
//! warnings, graceful-shutdown notifications, metrics push.
//!
//! Agents authenticate with the fleet-shared node token when one is
//! configured; in development (no token) the surface is open.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ApiError, AuthErrorKind};
use crate::lifecycle::DrainReason;
use crate::metrics::Metrics;
use crate::registry::{Heartbeat, NodeRegistration};
use crate::rest::extract::constant_time_eq;
use crate::AppContext;

/// Pushed node metrics stay readable for five minutes.
const NODE_METRICS_TTL: Duration = Duration::from_secs(300);

fn agent_auth(ctx: &AppContext, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = ctx.proxy.node_bearer() else {
        return Ok(());
    };
    let presented = headers
        .get("x-node-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::Auth(AuthErrorKind::UnknownKey))
    }
}

/// `POST /nodes/register` — a booted worker announces itself. Returns the
/// node id it must use for every subsequent call.
pub async fn register(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(registration): Json<NodeRegistration>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    agent_auth(&ctx, &headers)?;
    let state = ctx.registry.register(registration).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "node_id": state.id, "status": state.status.as_str() })),
    ))
}

/// Periodic heartbeat. The response tells the agent its current status so
/// a draining node can stop accepting work promptly.
pub async fn heartbeat(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Json(hb): Json<Heartbeat>,
) -> Result<Json<Value>, ApiError> {
    agent_auth(&ctx, &headers)?;
    Metrics::inc(&ctx.metrics.heartbeats_total);
    let status = ctx.registry.ingest_heartbeat(&node_id, &hb).await?;
    Ok(Json(json!({ "node_id": node_id, "status": status.as_str() })))
}

/// Imminent spot preemption reported by the worker.
pub async fn spot_warning(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    agent_auth(&ctx, &headers)?;
    let state = ctx.lifecycle.spot_interrupt(&node_id).await?;
    Ok(Json(json!({ "node_id": node_id, "status": state.status.as_str() })))
}

/// Worker-initiated graceful shutdown: drain, then terminate on sweep.
pub async fn shutdown(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    agent_auth(&ctx, &headers)?;
    let state = ctx.lifecycle.drain(&node_id, DrainReason::AdminRequest).await?;
    Ok(Json(json!({ "node_id": node_id, "status": state.status.as_str() })))
}

/// Opaque metrics push — kept hot for dashboards, never persisted.
pub async fn push_metrics(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ApiError> {
    agent_auth(&ctx, &headers)?;
    if ctx.registry.get(&node_id).await.is_none() {
        return Err(ApiError::NotFound("node".to_string()));
    }
    let key = format!("node_metrics:{node_id}");
    ctx.hot.remove(&key).await;
    ctx.hot
        .list_append(&key, payload, NODE_METRICS_TTL)
        .await
        .map_err(|e| ApiError::DependencyUnavailable(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
