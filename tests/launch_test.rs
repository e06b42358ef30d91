//! End-to-end node-launch workflow: orchestrator polling, phase/progress
//! log stream, activation on first heartbeat, failure handling.
//!
//! Tests run with paused time — the workflow's 5→30 s poll backoff elapses
//! instantly while ordering is preserved.

mod common;

use common::{test_context, ScriptedOrchestrator};
use std::sync::Arc;
use std::time::Duration;

use tensorgate::hot::node_logs_key;
use tensorgate::lifecycle::launch::{LaunchPhase, LaunchRequest};
use tensorgate::lifecycle::LifecycleManager;
use tensorgate::orchestrator::ProvisionState;
use tensorgate::registry::{Heartbeat, NodeStatus};
use tensorgate::AppContext;

fn launch_request(model_id: &str) -> LaunchRequest {
    LaunchRequest {
        provider: "aws".to_string(),
        region_code: "us-east".to_string(),
        instance_type: "g5.2xlarge".to_string(),
        gpu_type: "A10G".to_string(),
        model_name: "m-chat".to_string(),
        model_id: model_id.to_string(),
        total_vram_gb: 24,
        spot: true,
        tenant_id: None,
        runtime_flags: vec!["--max-model-len=8192".to_string()],
    }
}

/// Swap in a lifecycle manager driven by the given orchestrator script.
fn lifecycle_with(ctx: &Arc<AppContext>, orchestrator: Arc<ScriptedOrchestrator>) -> Arc<LifecycleManager> {
    Arc::new(LifecycleManager::new(
        ctx.registry.clone(),
        ctx.scheduler.clone(),
        orchestrator,
        ctx.storage.clone(),
        ctx.hot.clone(),
        ctx.bus.clone(),
    ))
}

async fn wait_for<F, Fut>(mut probe: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..600 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn launch_reaches_active_with_ordered_phases() {
    let ctx = test_context().await;
    let orchestrator = ScriptedOrchestrator::new(vec![
        ProvisionState::Pending,
        ProvisionState::Provisioning { progress: Some(40) },
        ProvisionState::Ready {
            endpoint_url: "http://10.0.0.7:8000".to_string(),
        },
    ]);
    let lifecycle = lifecycle_with(&ctx, orchestrator);

    let (job_id, node_id) = lifecycle.launch_node(launch_request("m1")).await.unwrap();
    assert!(job_id.starts_with("job_"));

    // The call returned immediately with the node still initializing.
    let node = ctx.registry.get(&node_id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Initializing);

    // Wait for the workflow to record the endpoint.
    {
        let ctx = ctx.clone();
        let node_id = node_id.clone();
        wait_for(
            move || {
                let ctx = ctx.clone();
                let node_id = node_id.clone();
                async move {
                    ctx.registry
                        .get(&node_id)
                        .await
                        .and_then(|n| n.endpoint_url)
                        .is_some()
                }
            },
            "endpoint recorded",
        )
        .await;
    }

    // The worker boots and heartbeats; the registry activates the node and
    // the workflow closes the log stream with phase=active.
    ctx.registry
        .ingest_heartbeat(
            &node_id,
            &Heartbeat {
                at: chrono::Utc::now(),
                vram_used_gb: 4,
                temperature_c: None,
                throughput_tps: Some(120.0),
                active_requests: 0,
                spot: true,
                health_score: 97,
            },
        )
        .await
        .unwrap();

    {
        let ctx = ctx.clone();
        let job_id = job_id.clone();
        let lifecycle = lifecycle.clone();
        wait_for(
            move || {
                let lifecycle = lifecycle.clone();
                let job_id = job_id.clone();
                let _ctx = ctx.clone();
                async move {
                    lifecycle
                        .job_status(&job_id)
                        .await
                        .map(|j| j.phase == LaunchPhase::Active)
                        .unwrap_or(false)
                }
            },
            "job active",
        )
        .await;
    }

    // The log stream shows the fixed phases, in order, with progress inside
    // each phase's band.
    let entries = ctx.hot.list_from(&node_logs_key(&node_id), 0).await.unwrap();
    let phases: Vec<String> = entries
        .iter()
        .filter_map(|e| e.get("phase").and_then(|p| p.as_str()).map(str::to_string))
        .collect();

    let expected_order = [
        "queued",
        "provisioning",
        "instance_ready",
        "installing",
        "model_loading",
        "health_check",
        "active",
    ];
    let mut cursor = 0;
    for phase in &phases {
        while cursor < expected_order.len() && expected_order[cursor] != phase {
            cursor += 1;
        }
        assert!(
            cursor < expected_order.len(),
            "phase {phase} out of order in {phases:?}"
        );
    }
    assert_eq!(phases.last().map(String::as_str), Some("active"));

    for entry in &entries {
        let phase = entry.get("phase").and_then(|p| p.as_str()).unwrap();
        let progress = entry.get("progress").and_then(|p| p.as_u64()).unwrap() as u8;
        let (low, high) = match phase {
            "queued" => (0, 5),
            "provisioning" => (10, 50),
            "instance_ready" => (50, 60),
            "installing" => (60, 70),
            "model_loading" => (70, 85),
            "health_check" => (85, 95),
            "active" => (100, 100),
            other => panic!("unexpected phase {other}"),
        };
        assert!(
            progress >= low && progress <= high,
            "progress {progress} outside {phase} band"
        );
    }

    let job = lifecycle.job_status(&job_id).await.unwrap();
    assert_eq!(job.progress, 100);
    assert!(job.cluster_handle.is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_provisioning_terminates_the_node() {
    let ctx = test_context().await;
    let orchestrator = ScriptedOrchestrator::new(vec![
        ProvisionState::Pending,
        ProvisionState::Failed {
            error: "gpu quota exhausted".to_string(),
        },
    ]);
    let lifecycle = lifecycle_with(&ctx, orchestrator);

    let (job_id, node_id) = lifecycle.launch_node(launch_request("m1")).await.unwrap();

    {
        let lifecycle = lifecycle.clone();
        let job_id = job_id.clone();
        wait_for(
            move || {
                let lifecycle = lifecycle.clone();
                let job_id = job_id.clone();
                async move {
                    lifecycle
                        .job_status(&job_id)
                        .await
                        .map(|j| j.phase == LaunchPhase::Failed)
                        .unwrap_or(false)
                }
            },
            "job failed",
        )
        .await;
    }

    let node = ctx.registry.get(&node_id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Terminated);

    let job = lifecycle.job_status(&job_id).await.unwrap();
    assert!(job.error.unwrap().contains("gpu quota exhausted"));

    // The final log entry carries phase=failed.
    let entries = ctx.hot.list_tail(&node_logs_key(&node_id), 1).await.unwrap();
    assert_eq!(
        entries[0].get("phase").and_then(|p| p.as_str()),
        Some("failed")
    );
}
