// SPDX-License-Identifier: MIT
//! Orchestrator Adapter — the seam to the cloud-provisioning engine.
//!
//! Provisioning is an asynchronous job on the orchestrator's side: `submit`
//! returns an opaque cluster handle immediately and the lifecycle manager
//! polls for completion. The control plane never blocks on a VM boot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Instance description handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSpec {
    pub provider: String,
    pub region_code: String,
    pub instance_type: String,
    pub gpu_type: String,
    /// Model artifact the worker should load at boot.
    pub model_name: String,
    pub spot: bool,
    /// Extra flags for the inference runtime (passed through opaquely).
    #[serde(default)]
    pub runtime_flags: Vec<String>,
}

/// Where an asynchronous provisioning job currently stands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisionState {
    /// Accepted, not yet scheduled onto hardware.
    Pending,
    /// Hardware is being acquired and imaged.
    Provisioning { progress: Option<u8> },
    /// The instance is up; the worker endpoint is reachable.
    Ready { endpoint_url: String },
    Failed { error: String },
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit a provisioning job. Returns the opaque cluster handle that
    /// refers to the underlying cloud resource from now on.
    async fn submit(&self, spec: &ProvisionSpec) -> anyhow::Result<String>;

    /// Poll a previously submitted job.
    async fn poll(&self, cluster_handle: &str) -> anyhow::Result<ProvisionState>;

    /// Tear the resource down. Idempotent on the orchestrator side.
    async fn terminate(&self, cluster_handle: &str) -> anyhow::Result<()>;
}

/// HTTP backend speaking the orchestration engine's asynchronous-request API.
pub struct HttpOrchestrator {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    cluster_handle: String,
}

impl HttpOrchestrator {
    pub fn new(base_url: String, api_token: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_token)
        }
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn submit(&self, spec: &ProvisionSpec) -> anyhow::Result<String> {
        let url = format!("{}/v1/clusters", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .json(spec)
            .send()
            .await?
            .error_for_status()?;
        let body: SubmitResponse = resp.json().await?;
        Ok(body.cluster_handle)
    }

    async fn poll(&self, cluster_handle: &str) -> anyhow::Result<ProvisionState> {
        let url = format!("{}/v1/clusters/{cluster_handle}", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn terminate(&self, cluster_handle: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1/clusters/{cluster_handle}", self.base_url);
        self.authed(self.client.delete(&url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_state_deserializes() {
        let ready: ProvisionState =
            serde_json::from_str(r#"{"state":"ready","endpoint_url":"http://10.0.0.9:8000"}"#)
                .unwrap();
        assert_eq!(
            ready,
            ProvisionState::Ready {
                endpoint_url: "http://10.0.0.9:8000".to_string()
            }
        );

        let failed: ProvisionState =
            serde_json::from_str(r#"{"state":"failed","error":"quota exhausted"}"#).unwrap();
        assert!(matches!(failed, ProvisionState::Failed { .. }));

        let provisioning: ProvisionState =
            serde_json::from_str(r#"{"state":"provisioning","progress":40}"#).unwrap();
        assert!(matches!(
            provisioning,
            ProvisionState::Provisioning { progress: Some(40) }
        ));
    }
}
