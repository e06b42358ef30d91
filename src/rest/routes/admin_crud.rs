// SPDX-License-Identifier: MIT
//! Admin CRUD over the entity catalogs: tenants, environments, API keys,
//! models, regions. Mutations append to the audit chain.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::generate_key;
use crate::error::ApiError;
use crate::events::kind;
use crate::rest::extract::admin_auth;
use crate::storage::{ApiKeyRow, EnvironmentRow, ModelRow, TenantRow};
use crate::AppContext;

// ── Tenants ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTenant {
    pub name: String,
    pub email: String,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default)]
    pub billing_customer_id: Option<String>,
}

fn default_plan() -> String {
    "serverless".to_string()
}

pub async fn create_tenant(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateTenant>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    admin_auth(&ctx, &headers)?;
    if !["serverless", "reserved", "enterprise"].contains(&body.plan.as_str()) {
        return Err(ApiError::InvalidRequest(format!("unknown plan {}", body.plan)));
    }
    let tenant = ctx
        .storage
        .create_tenant(
            &body.name,
            &body.email,
            &body.plan,
            body.billing_customer_id.as_deref(),
        )
        .await
        .map_err(|e| conflict_on_unique(e, "a tenant with this email already exists"))?;
    ctx.audit
        .append("admin", "tenant.create", &tenant.id, &json!({ "email": body.email }))
        .await;
    Ok((StatusCode::CREATED, Json(tenant_json(&tenant))))
}

pub async fn list_tenants(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let tenants = ctx.storage.list_tenants().await.map_err(ApiError::Internal)?;
    Ok(Json(json!({
        "tenants": tenants.iter().map(tenant_json).collect::<Vec<_>>()
    })))
}

pub async fn get_tenant(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let tenant = ctx
        .storage
        .get_tenant(&id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("tenant".to_string()))?;
    Ok(Json(tenant_json(&tenant)))
}

#[derive(Deserialize)]
pub struct UpdateTenantStatus {
    pub status: String,
}

pub async fn update_tenant_status(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateTenantStatus>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    if !["active", "suspended", "deleted"].contains(&body.status.as_str()) {
        return Err(ApiError::InvalidRequest(format!(
            "unknown status {}",
            body.status
        )));
    }
    let updated = ctx
        .storage
        .update_tenant_status(&id, &body.status)
        .await
        .map_err(ApiError::Internal)?;
    if !updated {
        return Err(ApiError::NotFound("tenant".to_string()));
    }
    ctx.audit
        .append("admin", "tenant.status", &id, &json!({ "status": body.status }))
        .await;
    Ok(Json(json!({ "id": id, "status": body.status })))
}

#[derive(Deserialize)]
pub struct UpdateTenantPlan {
    pub plan: String,
    /// Guaranteed throughput for reserved/enterprise tenants (tokens/sec).
    #[serde(default)]
    pub reserved_tokens_per_sec: i64,
}

pub async fn update_tenant_plan(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateTenantPlan>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    if !["serverless", "reserved", "enterprise"].contains(&body.plan.as_str()) {
        return Err(ApiError::InvalidRequest(format!("unknown plan {}", body.plan)));
    }
    let updated = ctx
        .storage
        .update_tenant_plan(&id, &body.plan, body.reserved_tokens_per_sec)
        .await
        .map_err(ApiError::Internal)?;
    if !updated {
        return Err(ApiError::NotFound("tenant".to_string()));
    }
    ctx.audit
        .append(
            "admin",
            "tenant.plan",
            &id,
            &json!({ "plan": body.plan, "reserved_tokens_per_sec": body.reserved_tokens_per_sec }),
        )
        .await;
    Ok(Json(json!({
        "id": id,
        "plan": body.plan,
        "reserved_tokens_per_sec": body.reserved_tokens_per_sec.max(0),
    })))
}

// ── Environments ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateEnvironment {
    pub name: String,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub daily_token_quota: i64,
    #[serde(default)]
    pub per_minute_token_quota: i64,
    #[serde(default)]
    pub concurrency_limit: i64,
}

pub async fn create_environment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<CreateEnvironment>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    admin_auth(&ctx, &headers)?;
    if ctx
        .storage
        .get_tenant(&tenant_id)
        .await
        .map_err(ApiError::Internal)?
        .is_none()
    {
        return Err(ApiError::NotFound("tenant".to_string()));
    }
    let env = ctx
        .storage
        .create_environment(
            &tenant_id,
            &body.name,
            body.region_code.as_deref(),
            &body.allowed_models,
            body.daily_token_quota,
            body.per_minute_token_quota,
            body.concurrency_limit,
        )
        .await
        .map_err(|e| conflict_on_unique(e, "an environment with this name already exists"))?;
    ctx.audit
        .append("admin", "environment.create", &env.id, &json!({ "tenant": tenant_id }))
        .await;
    Ok((StatusCode::CREATED, Json(environment_json(&env))))
}

pub async fn list_environments(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let envs = ctx
        .storage
        .list_environments(&tenant_id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({
        "environments": envs.iter().map(environment_json).collect::<Vec<_>>()
    })))
}

pub async fn delete_environment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    admin_auth(&ctx, &headers)?;
    let deleted = ctx
        .storage
        .delete_environment(&id)
        .await
        .map_err(ApiError::Internal)?;
    if !deleted {
        return Err(ApiError::NotFound("environment".to_string()));
    }
    ctx.audit
        .append("admin", "environment.delete", &id, &json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── API keys ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateKey {
    pub tenant_id: String,
    pub environment_id: String,
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
    /// Key mode embedded in the plaintext prefix (`live` or `test`).
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_role() -> String {
    "developer".to_string()
}

fn default_rpm() -> i64 {
    60
}

fn default_mode() -> String {
    "live".to_string()
}

pub async fn create_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateKey>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    admin_auth(&ctx, &headers)?;
    create_key_inner(&ctx, "admin", body).await
}

/// Shared with the self-service surface. The plaintext appears in the
/// response exactly once and is never stored.
pub(crate) async fn create_key_inner(
    ctx: &Arc<AppContext>,
    actor: &str,
    body: CreateKey,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if crate::auth::Role::parse(&body.role).is_none() {
        return Err(ApiError::InvalidRequest(format!("unknown role {}", body.role)));
    }
    if ctx
        .storage
        .get_environment(&body.environment_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|e| e.tenant_id == body.tenant_id)
        .is_none()
    {
        return Err(ApiError::NotFound("environment".to_string()));
    }

    let mode = if body.mode == "test" { "test" } else { "live" };
    let (plaintext, hash, prefix) = generate_key(mode);
    let key = ctx
        .storage
        .create_api_key(
            &hash,
            &prefix,
            &body.tenant_id,
            &body.environment_id,
            &body.role,
            body.tokens_per_minute,
            body.requests_per_minute,
            body.concurrency_limit,
            body.expires_at,
        )
        .await
        .map_err(ApiError::Internal)?;
    ctx.audit
        .append(
            actor,
            "key.create",
            &key.id,
            &json!({ "tenant": body.tenant_id, "role": body.role }),
        )
        .await;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "key": plaintext,
            "prefix": key.prefix,
            "role": key.role,
            "expires_at": key.expires_at,
        })),
    ))
}

pub async fn list_keys(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let keys = ctx
        .storage
        .list_api_keys(&tenant_id)
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
    admin_auth(&ctx, &headers)?;
    revoke_key_inner(&ctx, "admin", &id).await
}

pub(crate) async fn revoke_key_inner(
    ctx: &Arc<AppContext>,
    actor: &str,
    id: &str,
) -> Result<Json<Value>, ApiError> {
    let updated = ctx
        .storage
        .update_api_key_status(id, "revoked")
        .await
        .map_err(ApiError::Internal)?;
    if !updated {
        return Err(ApiError::NotFound("api key".to_string()));
    }
    // Cached decisions for this key are dropped by the bus listener.
    ctx.bus.publish(kind::KEY_REVOKED, json!({ "key_id": id }));
    ctx.audit.append(actor, "key.revoke", id, &json!({})).await;
    Ok(Json(json!({ "id": id, "status": "revoked" })))
}

// ── Models ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateModel {
    pub name: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub size_tag: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default = "default_context")]
    pub context_length: i64,
    #[serde(default)]
    pub vram_gb: i64,
    #[serde(default)]
    pub input_price_per_mtok: i64,
    #[serde(default)]
    pub output_price_per_mtok: i64,
    #[serde(default)]
    pub metadata: Value,
}

fn default_model_type() -> String {
    "chat".to_string()
}

fn default_context() -> i64 {
    4096
}

/// Model names become URL path segments and billing meter dimensions, so
/// the charset is locked down at creation time.
static MODEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/-]{0,63}$").expect("valid regex"));

pub async fn create_model(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateModel>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    admin_auth(&ctx, &headers)?;
    if !MODEL_NAME.is_match(&body.name) {
        return Err(ApiError::InvalidRequest(format!(
            "invalid model name {:?}",
            body.name
        )));
    }
    if !["completion", "chat", "embedding"].contains(&body.model_type.as_str()) {
        return Err(ApiError::InvalidRequest(format!(
            "unknown model type {}",
            body.model_type
        )));
    }
    let model = ctx
        .storage
        .create_model(
            &body.name,
            &body.family,
            &body.size_tag,
            &body.model_type,
            body.context_length,
            body.vram_gb,
            body.input_price_per_mtok,
            body.output_price_per_mtok,
            &body.metadata,
        )
        .await
        .map_err(|e| conflict_on_unique(e, "a model with this name already exists"))?;
    ctx.audit
        .append("admin", "model.create", &model.id, &json!({ "name": model.name }))
        .await;
    Ok((StatusCode::CREATED, Json(model_json(&model))))
}

pub async fn list_models(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let models = ctx.storage.list_models().await.map_err(ApiError::Internal)?;
    Ok(Json(json!({
        "models": models.iter().map(model_json).collect::<Vec<_>>()
    })))
}

#[derive(Deserialize)]
pub struct UpdateModelStatus {
    pub status: String,
}

pub async fn update_model_status(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateModelStatus>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    if !["active", "deprecated", "beta"].contains(&body.status.as_str()) {
        return Err(ApiError::InvalidRequest(format!(
            "unknown status {}",
            body.status
        )));
    }
    let updated = ctx
        .storage
        .update_model_status(&id, &body.status)
        .await
        .map_err(ApiError::Internal)?;
    if !updated {
        return Err(ApiError::NotFound("model".to_string()));
    }
    ctx.audit
        .append("admin", "model.status", &id, &json!({ "status": body.status }))
        .await;
    Ok(Json(json!({ "id": id, "status": body.status })))
}

// ── Regions ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UpsertRegion {
    #[serde(default)]
    pub clouds: Vec<String>,
    #[serde(default = "default_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default = "default_region_status")]
    pub status: String,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_region_status() -> String {
    "active".to_string()
}

pub async fn upsert_region(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(code): Path<String>,
    Json(body): Json<UpsertRegion>,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    if !["active", "degraded", "maintenance", "offline"].contains(&body.status.as_str()) {
        return Err(ApiError::InvalidRequest(format!(
            "unknown status {}",
            body.status
        )));
    }
    ctx.storage
        .upsert_region(&code, &body.clouds, body.cost_multiplier, &body.status)
        .await
        .map_err(ApiError::Internal)?;
    ctx.audit
        .append("admin", "region.upsert", &code, &json!({ "status": body.status }))
        .await;
    Ok(Json(json!({ "code": code, "status": body.status })))
}

pub async fn list_regions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    admin_auth(&ctx, &headers)?;
    let regions = ctx.storage.list_regions().await.map_err(ApiError::Internal)?;
    let list: Vec<Value> = regions
        .iter()
        .map(|r| {
            json!({
                "code": r.code,
                "clouds": serde_json::from_str::<Vec<String>>(&r.clouds).unwrap_or_default(),
                "cost_multiplier": r.cost_multiplier,
                "status": r.status,
            })
        })
        .collect();
    Ok(Json(json!({ "regions": list })))
}

// ── JSON shapes ──────────────────────────────────────────────────────────────

fn conflict_on_unique(e: anyhow::Error, message: &str) -> ApiError {
    let text = e.to_string();
    if text.contains("UNIQUE constraint failed") {
        ApiError::Conflict(message.to_string())
    } else {
        ApiError::Internal(e)
    }
}

fn tenant_json(t: &TenantRow) -> Value {
    json!({
        "id": t.id,
        "name": t.name,
        "email": t.email,
        "status": t.status,
        "plan": t.plan,
        "reserved_tokens_per_sec": t.reserved_tokens_per_sec,
        "billing_customer_id": t.billing_customer_id,
        "created_at": t.created_at,
    })
}

fn environment_json(e: &EnvironmentRow) -> Value {
    json!({
        "id": e.id,
        "tenant_id": e.tenant_id,
        "name": e.name,
        "region_code": e.region_code,
        "allowed_models": serde_json::from_str::<Vec<String>>(&e.allowed_models).unwrap_or_default(),
        "daily_token_quota": e.daily_token_quota,
        "per_minute_token_quota": e.per_minute_token_quota,
        "concurrency_limit": e.concurrency_limit,
        "status": e.status,
    })
}

pub(crate) fn key_json(k: &ApiKeyRow) -> Value {
    json!({
        "id": k.id,
        "prefix": k.prefix,
        "tenant_id": k.tenant_id,
        "environment_id": k.environment_id,
        "role": k.role,
        "status": k.status,
        "requests_per_minute": k.requests_per_minute,
        "tokens_per_minute": k.tokens_per_minute,
        "expires_at": k.expires_at,
        "created_at": k.created_at,
    })
}

fn model_json(m: &ModelRow) -> Value {
    json!({
        "id": m.id,
        "name": m.name,
        "family": m.family,
        "size_tag": m.size_tag,
        "model_type": m.model_type,
        "context_length": m.context_length,
        "vram_gb": m.vram_gb,
        "input_price_per_mtok": m.input_price_per_mtok,
        "output_price_per_mtok": m.output_price_per_mtok,
        "status": m.status,
    })
}
