// SPDX-License-Identifier: MIT
//! The request dispatch pipeline: authenticate → admit → schedule →
//! proxy → account.
//!
//! `POST /v1/chat/completions`, `POST /v1/completions`, `POST /v1/embeddings`
//! and `GET /v1/models`. Request bodies are forwarded byte-for-byte; only
//! `model`, `stream` and `max_tokens` are inspected here.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::proxy::headers::{new_request_id, upstream_headers};
use crate::proxy::sse::estimate_tokens_from_bytes;
use crate::proxy::{StreamDecision, StreamOutcome};
use crate::ratelimit::{estimate_tokens, AdmissionTicket, LimitSnapshot};
use crate::registry::NodeState;
use crate::rest::extract::api_auth;
use crate::scheduler::TenantClass;
use crate::storage::usage::UsageDraft;
use crate::storage::ModelRow;
use crate::usage::compute_cost;
use crate::AppContext;

/// How many distinct nodes one request may be offered to before giving up.
/// A reschedule happens only when the first node failed before any response
/// bytes were produced.
const MAX_NODE_ATTEMPTS: usize = 2;

/// The only fields the control plane reads out of an inference body.
#[derive(Debug, Deserialize)]
struct InferenceBody {
    model: String,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_tokens: Option<u64>,
}

pub async fn chat_completions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(ctx, headers, body, "/v1/chat/completions", "chat").await
}

pub async fn completions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(ctx, headers, body, "/v1/completions", "completion").await
}

pub async fn embeddings(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(ctx, headers, body, "/v1/embeddings", "embedding").await
}

/// `GET /v1/models` — the active catalog in OpenAI list shape.
pub async fn list_models(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    api_auth(&ctx, &headers).await?;
    let models = ctx.storage.list_models().await.map_err(ApiError::Internal)?;
    let data: Vec<serde_json::Value> = models
        .iter()
        .filter(|m| m.status == "active")
        .map(|m| {
            json!({
                "id": m.name,
                "object": "model",
                "created": chrono::DateTime::parse_from_rfc3339(&m.created_at)
                    .map(|t| t.timestamp())
                    .unwrap_or(0),
                "owned_by": "tensorgate",
                "context_length": m.context_length,
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })))
}

async fn dispatch(
    ctx: Arc<AppContext>,
    headers: HeaderMap,
    body: Bytes,
    path: &'static str,
    expected_type: &'static str,
) -> Response {
    Metrics::inc(&ctx.metrics.requests_total);
    let started = Instant::now();

    let auth = match api_auth(&ctx, &headers).await {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };
    if !auth.role.can_write() {
        return ApiError::InvalidRequest("read-only keys cannot run inference".to_string())
            .into_response();
    }

    let parsed: InferenceBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return ApiError::InvalidRequest(format!("invalid request body: {e}")).into_response()
        }
    };

    // Model resolution against the catalog and the environment allow-list.
    let model = match resolve_model(&ctx, &auth, &parsed.model, expected_type).await {
        Ok(m) => m,
        Err(e) => return e.into_response(),
    };

    // Admission: reserve a concurrency slot and an estimated token budget.
    let estimate = estimate_tokens(body.len(), parsed.max_tokens);
    let ticket = match ctx.limiter.admit(&auth, estimate).await {
        Ok(t) => t,
        Err(e) => {
            Metrics::inc(&ctx.metrics.rate_limited_total);
            return rate_limited_response(e);
        }
    };
    let snapshot = ticket.headers;

    let class = TenantClass {
        reserved_capacity: auth.reserved_capacity,
    };
    let request_id = new_request_id();
    let client_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("tensorgate")
        .to_string();
    let up_headers = upstream_headers(
        &headers,
        &client_addr,
        &host,
        &request_id,
        ctx.proxy.node_bearer(),
    );

    // Try up to two distinct nodes; a second node is only tried when the
    // first failed before producing any response bytes.
    let mut last_err = ApiError::NoCapacity {
        reason: crate::error::NoCapacityReason::Health,
    };
    let mut tried: Vec<String> = Vec::new();
    let mut ticket = Some(ticket);

    for _attempt in 0..MAX_NODE_ATTEMPTS {
        let node = match ctx
            .scheduler
            .schedule(&model.id, auth.region_code.as_deref(), &auth.tenant_id, class)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                last_err = e;
                break;
            }
        };
        if tried.contains(&node.id) {
            // The scheduler keeps picking the same node — nothing fresh left.
            break;
        }
        tried.push(node.id.clone());

        let endpoint = node.endpoint_url.clone().unwrap_or_default();
        ctx.scheduler.mark_dispatch(&node.id, estimate).await;

        if parsed.stream {
            match ctx
                .proxy
                .stream(&endpoint, path, up_headers.clone(), body.clone())
                .await
            {
                Ok(StreamDecision::Stream(start)) => {
                    let t = ticket.take().expect("ticket is present until consumed");
                    return stream_response(ctx, start, t, snapshot, auth, model, node, request_id, started, estimate);
                }
                Ok(StreamDecision::Passthrough(pt)) => {
                    // Worker-side client error — the caller pays nothing.
                    ctx.scheduler.mark_complete(&node.id, estimate).await;
                    if let Some(t) = ticket.take() {
                        t.release().await;
                    }
                    return passthrough_response(pt.status, pt.headers, pt.body, snapshot);
                }
                Err(e) => {
                    ctx.scheduler.mark_complete(&node.id, estimate).await;
                    Metrics::inc(&ctx.metrics.upstream_failures);
                    warn!(request_id = %request_id, node = %node.id, err = %e, "stream dispatch failed");
                    last_err = e.into();
                }
            }
        } else {
            match ctx
                .proxy
                .forward(&endpoint, path, up_headers.clone(), body.clone())
                .await
            {
                Ok(resp) => {
                    ctx.scheduler.mark_complete(&node.id, estimate).await;
                    let t = ticket.take().expect("ticket is present until consumed");
                    return unary_response(ctx, resp, t, snapshot, auth, model, node, request_id, started, body.len()).await;
                }
                Err(e) => {
                    ctx.scheduler.mark_complete(&node.id, estimate).await;
                    Metrics::inc(&ctx.metrics.upstream_failures);
                    warn!(request_id = %request_id, node = %node.id, err = %e, "unary dispatch failed");
                    last_err = e.into();
                }
            }
        }
    }

    // Every path out of the loop failed before any response bytes: release
    // the admission so the caller is not charged.
    if let Some(t) = ticket.take() {
        t.release().await;
    }
    if matches!(last_err, ApiError::NoCapacity { .. }) {
        Metrics::inc(&ctx.metrics.no_capacity_total);
    }
    last_err.into_response()
}

async fn resolve_model(
    ctx: &AppContext,
    auth: &crate::auth::AuthContext,
    name: &str,
    expected_type: &str,
) -> Result<ModelRow, ApiError> {
    if !auth.may_use_model(name) {
        return Err(ApiError::NotFound("model".to_string()));
    }
    let model = ctx
        .storage
        .get_model_by_name(name)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("model".to_string()))?;
    if model.status != "active" {
        return Err(ApiError::NotFound("model".to_string()));
    }
    if model.model_type != expected_type {
        return Err(ApiError::InvalidRequest(format!(
            "model {name} is a {} model",
            model.model_type
        )));
    }
    Ok(model)
}

/// 429 with the standard rate-limit headers.
fn rate_limited_response(err: ApiError) -> Response {
    let (limit, retry_after) = match &err {
        ApiError::RateLimited {
            limit,
            retry_after_secs,
            ..
        }
        | ApiError::QuotaExceeded {
            limit,
            retry_after_secs,
            ..
        } => (*limit, *retry_after_secs),
        _ => return err.into_response(),
    };
    let mut resp = err.into_response();
    let h = resp.headers_mut();
    insert_num(h, "x-ratelimit-limit", limit);
    insert_num(h, "x-ratelimit-remaining", 0);
    insert_num(h, "x-ratelimit-reset", retry_after);
    resp
}

fn apply_limit_headers(resp: &mut Response, snapshot: LimitSnapshot) {
    let h = resp.headers_mut();
    insert_num(h, "x-ratelimit-limit", snapshot.limit);
    insert_num(h, "x-ratelimit-remaining", snapshot.remaining);
    insert_num(h, "x-ratelimit-reset", snapshot.reset_secs);
}

fn insert_num(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}

fn passthrough_response(
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    snapshot: LimitSnapshot,
) -> Response {
    let mut resp = Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *resp.headers_mut() = headers;
    apply_limit_headers(&mut resp, snapshot);
    resp
}

#[allow(clippy::too_many_arguments)]
async fn unary_response(
    ctx: Arc<AppContext>,
    resp: crate::proxy::UnaryResponse,
    ticket: AdmissionTicket,
    snapshot: LimitSnapshot,
    auth: crate::auth::AuthContext,
    model: ModelRow,
    node: NodeState,
    request_id: String,
    started: Instant,
    request_bytes: usize,
) -> Response {
    // Token accounting: upstream usage when present, byte estimate otherwise.
    let (prompt, completion) = match resp.usage {
        Some(u) => (u.prompt_tokens, u.completion_tokens),
        None => {
            info!(request_id = %request_id, "usage unavailable — estimating from bytes");
            (
                estimate_tokens_from_bytes(request_bytes as u64),
                estimate_tokens_from_bytes(resp.body.len() as u64),
            )
        }
    };
    let total = prompt + completion;
    ticket.close(total).await;

    account(
        &ctx, &auth, &model, &node, prompt, completion,
        started.elapsed().as_millis() as u64,
    )
    .await;

    let mut out = Response::builder()
        .status(resp.status)
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *out.headers_mut() = resp.headers;
    out.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&request_id).unwrap_or(HeaderValue::from_static("req_invalid")),
    );
    apply_limit_headers(&mut out, snapshot);
    out
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    ctx: Arc<AppContext>,
    start: crate::proxy::StreamStart,
    ticket: AdmissionTicket,
    snapshot: LimitSnapshot,
    auth: crate::auth::AuthContext,
    model: ModelRow,
    node: NodeState,
    request_id: String,
    started: Instant,
    estimate: u64,
) -> Response {
    let crate::proxy::StreamStart {
        status,
        headers: up_headers,
        body_rx,
        outcome,
    } = start;

    // Accounting happens when the relay finishes, without holding up the
    // response: close the ticket, release the node gauges, persist usage.
    {
        let ctx = ctx.clone();
        let node_id = node.id.clone();
        tokio::spawn(async move {
            let outcome = outcome.await.unwrap_or(StreamOutcome {
                usage: None,
                stream_bytes: 0,
                completed: false,
            });
            ctx.scheduler.mark_complete(&node_id, estimate).await;

            let (prompt, completion) = match outcome.usage {
                Some(u) if u.consistent() => (u.prompt_tokens, u.completion_tokens),
                Some(u) => {
                    warn!(
                        request_id = %request_id,
                        prompt = u.prompt_tokens,
                        completion = u.completion_tokens,
                        total = u.total_tokens,
                        "upstream usage inconsistent — falling back to estimate"
                    );
                    (0, estimate_tokens_from_bytes(outcome.stream_bytes))
                }
                None => {
                    info!(request_id = %request_id, "usage unavailable — estimating from stream bytes");
                    (0, estimate_tokens_from_bytes(outcome.stream_bytes))
                }
            };
            let total = prompt + completion;
            ticket.close(total).await;

            if outcome.completed || outcome.stream_bytes > 0 {
                account(
                    &ctx, &auth, &model, &node, prompt, completion,
                    started.elapsed().as_millis() as u64,
                )
                .await;
            }
        });
    }

    let body = Body::from_stream(ReceiverStream::new(body_rx));
    let mut resp = Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *resp.headers_mut() = up_headers;

    // Normalise the streaming contract towards the client.
    let h = resp.headers_mut();
    h.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Disable proxy buffering so tokens reach the client as they arrive.
    h.insert("x-accel-buffering", HeaderValue::from_static("no"));
    h.remove(header::CONTENT_LENGTH);
    apply_limit_headers(&mut resp, snapshot);
    resp
}

async fn account(
    ctx: &AppContext,
    auth: &crate::auth::AuthContext,
    model: &ModelRow,
    node: &NodeState,
    prompt_tokens: u64,
    completion_tokens: u64,
    latency_ms: u64,
) {
    Metrics::inc(&ctx.metrics.usage_records);
    ctx.accountant
        .record(UsageDraft {
            tenant_id: auth.tenant_id.clone(),
            environment_id: auth.environment_id.clone(),
            api_key_id: auth.key_id.clone(),
            region_code: node.region_code.clone(),
            model_id: model.id.clone(),
            node_id: Some(node.id.clone()),
            prompt_tokens,
            completion_tokens,
            latency_ms,
            cost_microdollars: compute_cost(model, prompt_tokens, completion_tokens),
        })
        .await;
    tracing::debug!(
        tenant = %auth.tenant_id,
        model = %model.name,
        prompt_tokens,
        completion_tokens,
        at = %Utc::now(),
        "usage recorded"
    );
}
