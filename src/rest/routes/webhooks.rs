// SPDX-License-Identifier: MIT
//! Billing-provider webhook ingress.
//!
//! One endpoint: verify the HMAC signature over the raw body, consult the
//! external-event ledger for idempotency, then dispatch by event type.
//! Duplicates return 200 with no state change; persistent failures return a
//! retry-inviting 5xx.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::billing::verify_webhook_signature;
use crate::error::ApiError;
use crate::hot::processed_event_key;
use crate::AppContext;

/// Fast-path dedup markers outlive any plausible provider retry horizon.
const DEDUP_TTL: Duration = Duration::from_secs(3 * 86_400);

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

pub async fn billing_webhook(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = &ctx.config.billing.webhook_secret;
    if secret.is_empty() {
        // No secret configured — unverifiable deliveries must not be acked.
        return Err(ApiError::DependencyUnavailable(
            "webhook secret not configured".to_string(),
        ));
    }
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_webhook_signature(secret, &body, signature) {
        return Err(ApiError::Auth(crate::error::AuthErrorKind::MalformedCredential));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid webhook body: {e}")))?;

    // Fast-path dedup in the hot store, authoritative dedup in the ledger.
    let fresh_marker = ctx
        .hot
        .mark_once(&processed_event_key(&event.id), DEDUP_TTL)
        .await
        .unwrap_or(true);
    let first_delivery = ctx
        .storage
        .record_external_event(&event.id, &event.event_type, &event.data)
        .await
        .map_err(ApiError::Internal)?;

    if !first_delivery || !fresh_marker {
        // Replays are acknowledged without re-processing.
        return Ok(Json(json!({ "received": true, "duplicate": true })));
    }

    dispatch_event(&ctx, &event).await?;
    Ok(Json(json!({ "received": true, "duplicate": false })))
}

async fn dispatch_event(ctx: &AppContext, event: &WebhookEvent) -> Result<(), ApiError> {
    match event.event_type.as_str() {
        "invoice.payment_failed" => {
            if let Some(tenant) = tenant_for_event(ctx, event).await? {
                warn!(tenant = %tenant.id, event = %event.id, "payment failed — suspending tenant");
                ctx.storage
                    .update_tenant_status(&tenant.id, "suspended")
                    .await
                    .map_err(ApiError::Internal)?;
                ctx.audit
                    .append("billing-webhook", "tenant.suspend", &tenant.id, &event.data)
                    .await;
            }
        }
        "invoice.paid" => {
            if let Some(tenant) = tenant_for_event(ctx, event).await? {
                if tenant.status == "suspended" {
                    info!(tenant = %tenant.id, event = %event.id, "payment received — reactivating");
                    ctx.storage
                        .update_tenant_status(&tenant.id, "active")
                        .await
                        .map_err(ApiError::Internal)?;
                    ctx.audit
                        .append("billing-webhook", "tenant.reactivate", &tenant.id, &event.data)
                        .await;
                }
            }
        }
        other => {
            // Unknown types are acknowledged; the ledger keeps the payload.
            info!(event_type = other, event = %event.id, "unhandled webhook type");
        }
    }
    Ok(())
}

async fn tenant_for_event(
    ctx: &AppContext,
    event: &WebhookEvent,
) -> Result<Option<crate::storage::TenantRow>, ApiError> {
    let Some(customer) = event
        .data
        .get("customer_id")
        .and_then(|v| v.as_str())
    else {
        warn!(event = %event.id, "webhook event carries no customer_id");
        return Ok(None);
    };
    ctx.storage
        .get_tenant_by_billing_customer(customer)
        .await
        .map_err(ApiError::Internal)
}
