// SPDX-License-Identifier: MIT
//! Metered-billing provider integration.
//!
//! Outbound: the usage accountant converts aggregated windows into meter
//! increments; every call carries a deterministic idempotency key so network
//! retries cannot double-charge. Inbound: the provider's webhooks are
//! HMAC-verified and deduplicated against the external-event ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// One aggregated (tenant, model, window) increment.
#[derive(Debug, Clone, Serialize)]
pub struct MeterIncrement {
    pub idempotency_key: String,
    /// The provider-side customer id (from the tenant record).
    pub external_customer_id: String,
    pub model_name: String,
    pub quantity_tokens: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Deterministic idempotency key: replaying the same (tenant, model,
/// window) produces the same key, which the provider deduplicates.
pub fn idempotency_key(
    tenant_id: &str,
    model_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b":");
    hasher.update(model_id.as_bytes());
    hasher.update(b":");
    hasher.update(window_start.to_rfc3339().as_bytes());
    hasher.update(b":");
    hasher.update(window_end.to_rfc3339().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait BillingExporter: Send + Sync {
    /// Record one meter increment. Must be safe to replay with the same
    /// idempotency key.
    async fn record_increment(&self, increment: &MeterIncrement) -> anyhow::Result<()>;

    /// The provider's recorded token total for a customer since `since` —
    /// the other side of the daily reconciliation.
    async fn customer_total_since(
        &self,
        external_customer_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64>;
}

/// HTTP backend for the metered-billing provider.
pub struct HttpBillingExporter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct CustomerTotalResponse {
    total_tokens: i64,
}

impl HttpBillingExporter {
    pub fn new(base_url: String, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl BillingExporter for HttpBillingExporter {
    async fn record_increment(&self, increment: &MeterIncrement) -> anyhow::Result<()> {
        let url = format!("{}/v1/meters/increments", self.base_url);
        self.client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &increment.idempotency_key)
            .json(increment)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn customer_total_since(
        &self,
        external_customer_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let url = format!(
            "{}/v1/customers/{external_customer_id}/usage",
            self.base_url
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("since", since.to_rfc3339())])
            .send()
            .await?
            .error_for_status()?;
        let body: CustomerTotalResponse = resp.json().await?;
        Ok(body.total_tokens)
    }
}

/// Verify an inbound webhook signature: hex HMAC-SHA256 of the raw body.
/// Comparison happens inside the MAC verification, in constant time.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Produce the signature a sender would attach (used by tests and the
/// local development webhook replayer).
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(60);
        let a = idempotency_key("t1", "m1", start, end);
        let b = idempotency_key("t1", "m1", start, end);
        assert_eq!(a, b);
        assert_ne!(a, idempotency_key("t2", "m1", start, end));
        assert_ne!(a, idempotency_key("t1", "m2", start, end));
    }

    #[test]
    fn webhook_signature_roundtrip() {
        let secret = "whsec_test";
        let body = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let sig = sign_webhook(secret, body);
        assert!(verify_webhook_signature(secret, body, &sig));
        assert!(!verify_webhook_signature(secret, b"tampered", &sig));
        assert!(!verify_webhook_signature("wrong", body, &sig));
        assert!(!verify_webhook_signature(secret, body, "not-hex!"));
    }
}
