// SPDX-License-Identifier: MIT
//! Asynchronous node-launch workflow.
//!
//! `launch()` persists a node row in `initializing`, submits a provisioning
//! job to the orchestrator, and returns the job id immediately. A background
//! task polls the orchestrator (exponential 5 → 30 s) and appends structured
//! log entries to the Hot-State Store at `node_logs:{node_id}` (TTL 24 h).
//! Entries are ordered and append-only; phases and progress bands are fixed
//! so every consumer sees the same stream shape.
//!
//! | phase          | progress |
//! |----------------|----------|
//! | queued         | 0–5      |
//! | provisioning   | 10–50    |
//! | instance_ready | 50–60    |
//! | installing     | 60–70    |
//! | model_loading  | 70–85    |
//! | health_check   | 85–95    |
//! | active         | 100      |

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::events::{kind, EventBus};
use crate::hot::{node_logs_key, HotStore};
use crate::orchestrator::{Orchestrator, ProvisionSpec, ProvisionState};
use crate::registry::{NodeRegistry, NodeRegistration, NodeStatus};

/// Launch-log buffers and job state live for one day.
pub const LAUNCH_LOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// First orchestrator poll delay; doubles up to [`POLL_MAX`].
const POLL_INITIAL: Duration = Duration::from_secs(5);
const POLL_MAX: Duration = Duration::from_secs(30);
/// A launch that has not gone active within this window has failed.
const LAUNCH_DEADLINE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPhase {
    Queued,
    Provisioning,
    InstanceReady,
    Installing,
    ModelLoading,
    HealthCheck,
    Active,
    Failed,
}

impl LaunchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchPhase::Queued => "queued",
            LaunchPhase::Provisioning => "provisioning",
            LaunchPhase::InstanceReady => "instance_ready",
            LaunchPhase::Installing => "installing",
            LaunchPhase::ModelLoading => "model_loading",
            LaunchPhase::HealthCheck => "health_check",
            LaunchPhase::Active => "active",
            LaunchPhase::Failed => "failed",
        }
    }

    /// Fixed progress band `(low, high)` for this phase.
    pub fn band(&self) -> (u8, u8) {
        match self {
            LaunchPhase::Queued => (0, 5),
            LaunchPhase::Provisioning => (10, 50),
            LaunchPhase::InstanceReady => (50, 60),
            LaunchPhase::Installing => (60, 70),
            LaunchPhase::ModelLoading => (70, 85),
            LaunchPhase::HealthCheck => (85, 95),
            LaunchPhase::Active => (100, 100),
            LaunchPhase::Failed => (0, 100),
        }
    }

    /// True once no further entries will be appended.
    pub fn terminal(&self) -> bool {
        matches!(self, LaunchPhase::Active | LaunchPhase::Failed)
    }

    /// Map an orchestrator-reported fraction (0–100) into this phase's band.
    pub fn progress_within(&self, fraction: u8) -> u8 {
        let (low, high) = self.band();
        let span = (high - low) as u32;
        low + ((fraction.min(100) as u32 * span) / 100) as u8
    }
}

/// One ordered entry in a node's launch log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchLogEntry {
    pub at: chrono::DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub phase: LaunchPhase,
    pub progress: u8,
}

/// Admin- or tenant-supplied launch request.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchRequest {
    pub provider: String,
    pub region_code: String,
    pub instance_type: String,
    #[serde(default)]
    pub gpu_type: String,
    pub model_name: String,
    pub model_id: String,
    #[serde(default)]
    pub total_vram_gb: i64,
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub runtime_flags: Vec<String>,
}

/// Transient job descriptor kept in the Hot-State Store for 24 h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchJob {
    pub job_id: String,
    pub node_id: String,
    pub cluster_handle: Option<String>,
    pub phase: LaunchPhase,
    pub progress: u8,
    pub error: Option<String>,
}

fn job_key(job_id: &str) -> String {
    format!("launch_jobs:{job_id}")
}

/// Writer half: appends entries to the log list and mirrors job state.
#[derive(Clone)]
pub struct LaunchLogWriter {
    hot: HotStore,
    bus: EventBus,
    node_id: String,
    job_id: String,
}

impl LaunchLogWriter {
    pub fn new(hot: HotStore, bus: EventBus, node_id: String, job_id: String) -> Self {
        Self {
            hot,
            bus,
            node_id,
            job_id,
        }
    }

    pub async fn log(&self, level: &str, phase: LaunchPhase, progress: u8, message: impl Into<String>) {
        let entry = LaunchLogEntry {
            at: Utc::now(),
            level: level.to_string(),
            message: message.into(),
            phase,
            progress,
        };
        let value = serde_json::to_value(&entry).unwrap_or_default();
        if let Err(e) = self
            .hot
            .list_append(&node_logs_key(&self.node_id), value.clone(), LAUNCH_LOG_TTL)
            .await
        {
            warn!(err = %e, node = %self.node_id, "launch log append failed");
        }
        self.bus.publish(
            kind::NODE_LAUNCH_LOG,
            json!({ "node_id": self.node_id, "entry": value }),
        );
        self.update_job(phase, progress, None).await;
    }

    pub async fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let entry = LaunchLogEntry {
            at: Utc::now(),
            level: "error".to_string(),
            message: message.clone(),
            phase: LaunchPhase::Failed,
            progress: 100,
        };
        let value = serde_json::to_value(&entry).unwrap_or_default();
        let _ = self
            .hot
            .list_append(&node_logs_key(&self.node_id), value.clone(), LAUNCH_LOG_TTL)
            .await;
        self.bus.publish(
            kind::NODE_LAUNCH_LOG,
            json!({ "node_id": self.node_id, "entry": value }),
        );
        self.update_job(LaunchPhase::Failed, 100, Some(message)).await;
    }

    async fn update_job(&self, phase: LaunchPhase, progress: u8, error: Option<String>) {
        let current = read_job(&self.hot, &self.job_id).await;
        let job = LaunchJob {
            job_id: self.job_id.clone(),
            node_id: self.node_id.clone(),
            cluster_handle: current.as_ref().and_then(|j| j.cluster_handle.clone()),
            phase,
            progress,
            error,
        };
        self.hot.remove(&job_key(&self.job_id)).await;
        if let Ok(value) = serde_json::to_value(&job) {
            let _ = self
                .hot
                .list_append(&job_key(&self.job_id), value, LAUNCH_LOG_TTL)
                .await;
        }
    }

    async fn set_cluster_handle(&self, handle: &str) {
        if let Some(mut job) = read_job(&self.hot, &self.job_id).await {
            job.cluster_handle = Some(handle.to_string());
            self.hot.remove(&job_key(&self.job_id)).await;
            if let Ok(value) = serde_json::to_value(&job) {
                let _ = self
                    .hot
                    .list_append(&job_key(&self.job_id), value, LAUNCH_LOG_TTL)
                    .await;
            }
        }
    }
}

/// Latest job state, if the job is still within its 24 h lifetime.
pub async fn read_job(hot: &HotStore, job_id: &str) -> Option<LaunchJob> {
    let entries = hot.list_tail(&job_key(job_id), 1).await.ok()?;
    entries
        .into_iter()
        .next()
        .and_then(|v| serde_json::from_value(v).ok())
}

/// Kick off a launch. Returns `(job_id, node_id)` immediately; all progress
/// flows through the log stream.
pub async fn launch(
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    hot: HotStore,
    bus: EventBus,
    request: LaunchRequest,
) -> Result<(String, String), crate::error::ApiError> {
    let node = registry
        .register(NodeRegistration {
            tenant_id: request.tenant_id.clone(),
            provider: request.provider.clone(),
            region_code: request.region_code.clone(),
            instance_type: request.instance_type.clone(),
            gpu_type: request.gpu_type.clone(),
            total_vram_gb: request.total_vram_gb,
            model_id: Some(request.model_id.clone()),
            endpoint_url: None,
            spot: request.spot,
        })
        .await?;

    let job_id = format!("job_{}", uuid::Uuid::new_v4().simple());
    let writer = LaunchLogWriter::new(hot, bus, node.id.clone(), job_id.clone());
    writer
        .log("info", LaunchPhase::Queued, 0, "launch request accepted")
        .await;

    tokio::spawn(run_launch(
        registry,
        orchestrator,
        writer,
        node.id.clone(),
        request,
    ));

    Ok((job_id, node.id))
}

async fn run_launch(
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    writer: LaunchLogWriter,
    node_id: String,
    request: LaunchRequest,
) {
    let spec = ProvisionSpec {
        provider: request.provider,
        region_code: request.region_code,
        instance_type: request.instance_type,
        gpu_type: request.gpu_type,
        model_name: request.model_name,
        spot: request.spot,
        runtime_flags: request.runtime_flags,
    };

    writer
        .log("info", LaunchPhase::Queued, 3, "submitting to orchestrator")
        .await;

    let handle = match orchestrator.submit(&spec).await {
        Ok(h) => h,
        Err(e) => {
            warn!(node = %node_id, err = %e, "orchestrator submit failed");
            let _ = registry.transition(&node_id, NodeStatus::Terminated).await;
            writer.fail(format!("orchestrator rejected the launch: {e}")).await;
            return;
        }
    };
    if let Err(e) = registry.set_cluster_handle(&node_id, &handle).await {
        warn!(node = %node_id, err = %e, "failed to record cluster handle");
    }
    writer.set_cluster_handle(&handle).await;
    writer
        .log(
            "info",
            LaunchPhase::Provisioning,
            LaunchPhase::Provisioning.band().0,
            format!("provisioning started (cluster {handle})"),
        )
        .await;

    // Poll the orchestrator until the instance is up.
    let deadline = tokio::time::Instant::now() + LAUNCH_DEADLINE;
    let mut poll_delay = POLL_INITIAL;
    let endpoint = loop {
        if tokio::time::Instant::now() >= deadline {
            let _ = orchestrator.terminate(&handle).await;
            let _ = registry.transition(&node_id, NodeStatus::Terminated).await;
            writer.fail("provisioning deadline exceeded").await;
            return;
        }
        tokio::time::sleep(poll_delay).await;
        poll_delay = (poll_delay * 2).min(POLL_MAX);

        match orchestrator.poll(&handle).await {
            Ok(ProvisionState::Pending) => {
                writer
                    .log("info", LaunchPhase::Provisioning, 10, "waiting for capacity")
                    .await;
            }
            Ok(ProvisionState::Provisioning { progress }) => {
                let fraction = progress.unwrap_or(50);
                writer
                    .log(
                        "info",
                        LaunchPhase::Provisioning,
                        LaunchPhase::Provisioning.progress_within(fraction),
                        "instance coming up",
                    )
                    .await;
            }
            Ok(ProvisionState::Ready { endpoint_url }) => break endpoint_url,
            Ok(ProvisionState::Failed { error }) => {
                let _ = registry.transition(&node_id, NodeStatus::Terminated).await;
                writer.fail(format!("provisioning failed: {error}")).await;
                return;
            }
            Err(e) => {
                // Transient poll failure — keep trying until the deadline.
                writer
                    .log("warn", LaunchPhase::Provisioning, 30, format!("poll failed: {e}"))
                    .await;
            }
        }
    };

    if let Err(e) = registry.set_endpoint(&node_id, &endpoint).await {
        warn!(node = %node_id, err = %e, "failed to record endpoint");
    }
    writer
        .log("info", LaunchPhase::InstanceReady, 55, format!("instance ready at {endpoint}"))
        .await;
    writer
        .log("info", LaunchPhase::Installing, 65, "runtime installing")
        .await;
    writer
        .log("info", LaunchPhase::ModelLoading, 75, "model loading")
        .await;

    // The node stays `initializing` until its first healthy heartbeat; the
    // registry flips it to `active` the moment the worker reports in.
    let mut logged_health_check = false;
    loop {
        if tokio::time::Instant::now() >= deadline {
            let _ = orchestrator.terminate(&handle).await;
            let _ = registry.transition(&node_id, NodeStatus::Terminated).await;
            writer.fail("worker never became healthy").await;
            return;
        }
        tokio::time::sleep(POLL_INITIAL).await;

        let Some(state) = registry.get(&node_id).await else {
            writer.fail("node vanished from the registry").await;
            return;
        };
        if !logged_health_check && state.last_heartbeat.is_some() {
            logged_health_check = true;
            writer
                .log("info", LaunchPhase::HealthCheck, 90, "first heartbeat received")
                .await;
        }
        match state.status {
            NodeStatus::Active => {
                writer
                    .log("info", LaunchPhase::Active, 100, "node active and routable")
                    .await;
                info!(node = %node_id, "launch complete");
                return;
            }
            NodeStatus::Terminated | NodeStatus::Dead => {
                writer.fail("node terminated during launch").await;
                return;
            }
            _ => {}
        }
    }
}
