// SPDX-License-Identifier: MIT
//! Admin node management: launch, terminate, status, logs, listing.
//! Guarded by the single admin token; every mutation lands in the audit
//! chain.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ApiError;
use crate::hot::node_logs_key;
use crate::lifecycle::launch::LaunchRequest;
use crate::registry::NodeState;
use crate::rest::extract::admin_auth;
use crate::AppContext;

#[derive(Deserialize)]
pub struct AdminLaunchRequest {
    pub provider: String,
    pub region_code: String,
    pub instance_type: String,
    #[serde(default)]
    pub gpu_type: String,
    /// Catalog model name; resolved to the model id here.
    pub model_name: String,
    #[serde(default)]
    pub total_vram_gb: i64,
    #[serde(default)]
    pub spot: bool,
    /// Present for tenant-owned capacity, absent for the platform pool.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub runtime_flags: Vec<String>,
}

pub async fn launch_node(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<AdminLaunchRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    admin_auth(&ctx, &headers)?;
    let model = ctx
        .storage
        .get_model_by_name(&request.model_name)
        .await
        .map_err(ApiError::Internal)?
        .filter(|m| m.status == "active")
        .ok_or_else(|| ApiError::NotFound("model".to_string()))?;

    let detail = json!({
        "provider": request.provider,
        "region": request.region_code,
        "model": request.model_name,
        "spot": request.spot,
    });
    let (job_id, node_id) = ctx
        .lifecycle
        .launch_node(LaunchRequest {
            provider: request.provider,
            region_code: request.region_code,
            instance_type: request.instance_type,
            gpu_type: request.gpu_type,
            model_name: model.name,
            model_id: model.id,
            total_vram_gb: request.total_vram_gb,
            spot: request.spot,
            tenant_id: request.tenant_id,
            runtime_flags: request.runtime_flags,
        })
        .await?;
    ctx.audit
        .append("admin", "node.launch", &node_id, &detail)
        .await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "node_id": node_id })),
    ))
}

pub async fn terminate_node(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(cluster): Path<String>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let state = ctx.lifecycle.terminate_by_cluster(&cluster).await?;
    ctx.audit
        .append("admin", "node.terminate", &state.id, &json!({ "cluster": cluster }))
        .await;
    Ok(Json(node_json(&state)))
}

pub async fn node_status(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(cluster): Path<String>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let state = ctx
        .registry
        .get_by_cluster(&cluster)
        .await
        .ok_or_else(|| ApiError::NotFound("node".to_string()))?;
    Ok(Json(node_json(&state)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_nodes(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let mut nodes = ctx.registry.snapshot().await;
    if let Some(filter) = &query.status {
        nodes.retain(|n| n.status.as_str() == filter);
    }
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let list: Vec<Value> = nodes.iter().map(node_json).collect();
    Ok(Json(json!({ "nodes": list })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    /// Last N entries (default: everything in the buffer).
    pub tail: Option<usize>,
    /// Only entries at or after this RFC-3339 timestamp.
    pub since: Option<String>,
}

/// Snapshot view over `node_logs:{id}`.
pub async fn node_logs(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    if ctx.registry.get(&node_id).await.is_none() {
        return Err(ApiError::NotFound("node".to_string()));
    }
    let entries = fetch_log_entries(&ctx, &node_id, query.tail, query.since.as_deref()).await?;
    Ok(Json(json!({ "node_id": node_id, "entries": entries })))
}

pub async fn job_status(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let job = ctx
        .lifecycle
        .job_status(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound("launch job".to_string()))?;
    Ok(Json(serde_json::to_value(job).unwrap_or_default()))
}

pub async fn audit_entries(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let entries = ctx.audit.entries(100).await.map_err(ApiError::Internal)?;
    let list: Vec<Value> = entries
        .iter()
        .map(|e| {
            json!({
                "seq": e.seq,
                "at": e.at,
                "actor": e.actor,
                "action": e.action,
                "target": e.target,
                "entry_hash": e.entry_hash,
            })
        })
        .collect();
    Ok(Json(json!({ "entries": list })))
}

/// Shared by the snapshot route and the SSE bridge.
pub(crate) async fn fetch_log_entries(
    ctx: &AppContext,
    node_id: &str,
    tail: Option<usize>,
    since: Option<&str>,
) -> Result<Vec<Value>, ApiError> {
    let key = node_logs_key(node_id);
    let mut entries = match tail {
        Some(n) => ctx.hot.list_tail(&key, n).await,
        None => ctx.hot.list_from(&key, 0).await,
    }
    .map_err(|e| ApiError::DependencyUnavailable(e.to_string()))?;

    if let Some(since) = since {
        if let Ok(cutoff) = chrono::DateTime::parse_from_rfc3339(since) {
            entries.retain(|e| {
                e.get("at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t >= cutoff)
                    .unwrap_or(true)
            });
        }
    }
    Ok(entries)
}

pub(crate) fn node_json(n: &NodeState) -> Value {
    json!({
        "id": n.id,
        "cluster_handle": n.cluster_handle,
        "tenant_id": n.tenant_id,
        "provider": n.provider,
        "region": n.region_code,
        "instance_type": n.instance_type,
        "gpu_type": n.gpu_type,
        "model_id": n.model_id,
        "endpoint_url": n.endpoint_url,
        "spot": n.spot,
        "status": n.status.as_str(),
        "health_score": n.health_score,
        "last_heartbeat_at": n.last_heartbeat.map(|t| t.to_rfc3339()),
        "created_at": n.created_at.to_rfc3339(),
    })
}
