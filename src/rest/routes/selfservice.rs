// SPDX-License-Identifier: MIT
//! Self-service surface for reserved/enterprise tenants: credential
//! management and tenant-owned instance launch/list/terminate/logs.
//!
//! The tenant id always comes from the authenticated credential — never
//! from the URL.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{AuthContext, Role};
use crate::error::ApiError;
use crate::lifecycle::launch::LaunchRequest;
use crate::rest::extract::api_auth;
use crate::rest::routes::admin_crud::{self, key_json, CreateKey};
use crate::rest::routes::admin_nodes::{fetch_log_entries, node_json, LogsQuery};
use crate::AppContext;

/// Gate: the self-service surface exists only for paid tiers.
fn require_self_service(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.reserved_capacity {
        return Err(ApiError::InvalidRequest(
            "self-service requires a reserved or enterprise plan".to_string(),
        ));
    }
    Ok(())
}

fn require_admin_role(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role != Role::Admin {
        return Err(ApiError::InvalidRequest(
            "this operation requires an admin-role key".to_string(),
        ));
    }
    Ok(())
}

// ── Keys ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SelfServiceCreateKey {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub tokens_per_minute: Option<i64>,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: i64,
    #[serde(default)]
    pub concurrency_limit: i64,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_role() -> String {
    "developer".to_string()
}

fn default_rpm() -> i64 {
    60
}

pub async fn create_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<SelfServiceCreateKey>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    require_admin_role(&auth)?;
    // Self-service keys cannot mint admin credentials.
    if body.role == "admin" {
        return Err(ApiError::InvalidRequest(
            "self-service keys cannot have the admin role".to_string(),
        ));
    }
    let actor = format!("tenant:{}", auth.tenant_id);
    admin_crud::create_key_inner(
        &ctx,
        &actor,
        CreateKey {
            tenant_id: auth.tenant_id.clone(),
            environment_id: auth.environment_id.clone(),
            role: body.role,
            tokens_per_minute: body.tokens_per_minute,
            requests_per_minute: body.requests_per_minute,
            concurrency_limit: body.concurrency_limit,
            expires_at: body.expires_at,
            mode: "live".to_string(),
        },
    )
    .await
}

pub async fn list_keys(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    let keys = ctx
        .storage
        .list_api_keys(&auth.tenant_id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({
        "keys": keys.iter().map(key_json).collect::<Vec<_>>()
    })))
}

pub async fn revoke_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    require_admin_role(&auth)?;
    // Only keys belonging to the caller's tenant are visible at all.
    let key = ctx
        .storage
        .get_api_key(&id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|k| k.tenant_id == auth.tenant_id)
        .ok_or_else(|| ApiError::NotFound("api key".to_string()))?;
    let actor = format!("tenant:{}", auth.tenant_id);
    admin_crud::revoke_key_inner(&ctx, &actor, &key.id).await
}

// ── Tenant-owned nodes ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SelfServiceLaunch {
    pub provider: String,
    pub region_code: String,
    pub instance_type: String,
    #[serde(default)]
    pub gpu_type: String,
    pub model_name: String,
    #[serde(default)]
    pub total_vram_gb: i64,
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub runtime_flags: Vec<String>,
}

pub async fn launch_node(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<SelfServiceLaunch>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    require_admin_role(&auth)?;

    let model = ctx
        .storage
        .get_model_by_name(&body.model_name)
        .await
        .map_err(ApiError::Internal)?
        .filter(|m| m.status == "active")
        .ok_or_else(|| ApiError::NotFound("model".to_string()))?;

    let request = LaunchRequest {
        provider: body.provider.clone(),
        region_code: body.region_code.clone(),
        instance_type: body.instance_type,
        gpu_type: body.gpu_type,
        model_name: model.name,
        model_id: model.id,
        total_vram_gb: body.total_vram_gb,
        spot: body.spot,
        // Ownership comes from the credential, never the request body.
        tenant_id: Some(auth.tenant_id.clone()),
        runtime_flags: body.runtime_flags,
    };
    let detail = json!({ "provider": body.provider, "region": body.region_code });
    let (job_id, node_id) = ctx.lifecycle.launch_node(request).await?;
    ctx.audit
        .append(
            &format!("tenant:{}", auth.tenant_id),
            "node.launch",
            &node_id,
            &detail,
        )
        .await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "node_id": node_id })),
    ))
}

pub async fn list_nodes(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    let mut nodes = ctx.registry.snapshot().await;
    nodes.retain(|n| n.tenant_id.as_deref() == Some(auth.tenant_id.as_str()));
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(Json(json!({
        "nodes": nodes.iter().map(node_json).collect::<Vec<_>>()
    })))
}

pub async fn terminate_node(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    require_admin_role(&auth)?;
    let node = owned_node(&ctx, &auth, &node_id).await?;
    let state = ctx
        .lifecycle
        .drain(&node.id, crate::lifecycle::DrainReason::AdminRequest)
        .await?;
    ctx.audit
        .append(
            &format!("tenant:{}", auth.tenant_id),
            "node.terminate",
            &node.id,
            &json!({}),
        )
        .await;
    Ok(Json(node_json(&state)))
}

pub async fn node_logs(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let auth = api_auth(&ctx, &headers).await?;
    require_self_service(&auth)?;
    let node = owned_node(&ctx, &auth, &node_id).await?;
    let entries = fetch_log_entries(&ctx, &node.id, query.tail, query.since.as_deref()).await?;
    Ok(Json(json!({ "node_id": node.id, "entries": entries })))
}

async fn owned_node(
    ctx: &AppContext,
    auth: &AuthContext,
    node_id: &str,
) -> Result<crate::registry::NodeState, ApiError> {
    ctx.registry
        .get(node_id)
        .await
        .filter(|n| n.tenant_id.as_deref() == Some(auth.tenant_id.as_str()))
        .ok_or_else(|| ApiError::NotFound("node".to_string()))
}
