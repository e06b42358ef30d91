// SPDX-License-Identifier: MIT
//! Node Lifecycle Manager.
//!
//! Owns the running state machine around the registry: the periodic
//! liveness sweep, drain handling (admin request, spot interrupt, model
//! upgrade), termination, and the asynchronous launch workflow in
//! [`launch`]. Spot interrupts flip the node to `draining` immediately,
//! emit `node.termination_warning` exactly once, and can trigger a
//! replacement launch.

pub mod launch;

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::events::{kind, EventBus};
use crate::hot::HotStore;
use crate::orchestrator::Orchestrator;
use crate::registry::{NodeRegistry, NodeState, NodeStatus};
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use launch::{LaunchRequest, LaunchJob};

/// Liveness sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Why a node is being drained — recorded on the status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    AdminRequest,
    SpotInterrupt,
    ModelUpgrade,
}

impl DrainReason {
    fn as_str(&self) -> &'static str {
        match self {
            DrainReason::AdminRequest => "admin_request",
            DrainReason::SpotInterrupt => "spot_interrupt",
            DrainReason::ModelUpgrade => "model_upgrade",
        }
    }
}

pub struct LifecycleManager {
    registry: Arc<NodeRegistry>,
    scheduler: Arc<Scheduler>,
    orchestrator: Arc<dyn Orchestrator>,
    storage: Storage,
    hot: HotStore,
    bus: EventBus,
    /// Launch a replacement when a spot node is reclaimed.
    pub spot_replacement: bool,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        scheduler: Arc<Scheduler>,
        orchestrator: Arc<dyn Orchestrator>,
        storage: Storage,
        hot: HotStore,
        bus: EventBus,
    ) -> Self {
        Self {
            registry,
            scheduler,
            orchestrator,
            storage,
            hot,
            bus,
            spot_replacement: false,
        }
    }

    /// Start the asynchronous launch workflow; returns `(job_id, node_id)`.
    pub async fn launch_node(&self, request: LaunchRequest) -> ApiResult<(String, String)> {
        launch::launch(
            self.registry.clone(),
            self.orchestrator.clone(),
            self.hot.clone(),
            self.bus.clone(),
            request,
        )
        .await
    }

    pub async fn job_status(&self, job_id: &str) -> Option<LaunchJob> {
        launch::read_job(&self.hot, job_id).await
    }

    /// Begin draining a node. Idempotent: draining an already-draining node
    /// changes nothing and emits nothing.
    pub async fn drain(&self, node_id: &str, reason: DrainReason) -> ApiResult<NodeState> {
        let current = self
            .registry
            .get(node_id)
            .await
            .ok_or_else(|| ApiError::NotFound("node".to_string()))?;
        if current.status == NodeStatus::Draining {
            return Ok(current);
        }
        let state = self.registry.transition(node_id, NodeStatus::Draining).await?;
        info!(node = node_id, reason = reason.as_str(), "drain started");
        Ok(state)
    }

    /// Spot-interrupt path: immediate drain, a single
    /// `node.termination_warning`, and an optional replacement launch.
    pub async fn spot_interrupt(&self, node_id: &str) -> ApiResult<NodeState> {
        let current = self
            .registry
            .get(node_id)
            .await
            .ok_or_else(|| ApiError::NotFound("node".to_string()))?;
        if current.status == NodeStatus::Draining || current.status.terminal() {
            // Duplicate warnings from the agent must not re-emit the event.
            return Ok(current);
        }

        let state = self.registry.transition(node_id, NodeStatus::Draining).await?;
        self.bus.publish(
            kind::NODE_TERMINATION_WARNING,
            json!({
                "node_id": node_id,
                "region": state.region_code,
                "spot": true,
            }),
        );

        if self.spot_replacement {
            if let Err(e) = self.launch_replacement(&state).await {
                warn!(node = node_id, err = %e, "replacement launch failed");
            }
        }
        Ok(state)
    }

    async fn launch_replacement(&self, dying: &NodeState) -> ApiResult<()> {
        let Some(model_id) = dying.model_id.clone() else {
            return Ok(());
        };
        let model_name = self
            .storage
            .get_model(&model_id)
            .await
            .map_err(ApiError::Internal)?
            .map(|m| m.name)
            .unwrap_or_else(|| model_id.clone());

        let (job_id, node_id) = self
            .launch_node(LaunchRequest {
                provider: dying.provider.clone(),
                region_code: dying.region_code.clone(),
                instance_type: dying.instance_type.clone(),
                gpu_type: dying.gpu_type.clone(),
                model_name,
                model_id,
                total_vram_gb: dying.total_vram_gb,
                // The replacement is on-demand; a second spot instance would
                // just get reclaimed with the same market pressure.
                spot: false,
                tenant_id: dying.tenant_id.clone(),
                runtime_flags: Vec::new(),
            })
            .await?;
        info!(
            dying = %dying.id,
            replacement = %node_id,
            job = %job_id,
            "replacement launch started"
        );
        Ok(())
    }

    /// Admin termination by cluster handle: drain now, finish in the sweep.
    pub async fn terminate_by_cluster(&self, cluster_handle: &str) -> ApiResult<NodeState> {
        let node = self
            .registry
            .get_by_cluster(cluster_handle)
            .await
            .ok_or_else(|| ApiError::NotFound("node".to_string()))?;
        match node.status {
            NodeStatus::Terminated | NodeStatus::Dead => Ok(node),
            NodeStatus::Initializing => {
                // Nothing in flight to wait for.
                let state = self.registry.transition(&node.id, NodeStatus::Terminated).await?;
                let _ = self.orchestrator.terminate(cluster_handle).await;
                Ok(state)
            }
            _ => self.drain(&node.id, DrainReason::AdminRequest).await,
        }
    }

    /// One pass of the periodic sweep: liveness transitions, then drain
    /// completion (in-flight drained or deadline elapsed).
    pub async fn sweep_once(&self) {
        let now = Utc::now();
        for (node_id, status) in self.registry.sweep_liveness(now).await {
            if status == NodeStatus::Dead {
                self.cleanup_cluster(&node_id).await;
            }
        }

        // Draining nodes finish when their in-flight count hits zero or the
        // drain deadline elapses, whichever comes first.
        let draining: Vec<NodeState> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|n| n.status == NodeStatus::Draining)
            .collect();
        let deadline_expired: Vec<String> = self.registry.drained_nodes(now).await;

        for node in draining {
            let idle = self.scheduler.inflight(&node.id).await == 0;
            let expired = deadline_expired.contains(&node.id);
            if !idle && !expired {
                continue;
            }
            match self.registry.transition(&node.id, NodeStatus::Terminated).await {
                Ok(_) => {
                    info!(node = %node.id, idle, expired, "drain complete — terminated");
                    self.cleanup_cluster(&node.id).await;
                }
                Err(e) => warn!(node = %node.id, err = %e, "drain completion failed"),
            }
        }
    }

    async fn cleanup_cluster(&self, node_id: &str) {
        let Some(node) = self.registry.get(node_id).await else {
            return;
        };
        if let Some(handle) = &node.cluster_handle {
            if let Err(e) = self.orchestrator.terminate(handle).await {
                warn!(node = node_id, err = %e, "orchestrator terminate failed");
            }
        }
    }

    /// Spawn the background sweep loop.
    pub fn spawn_monitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessConfig;
    use crate::events::EventBus;
    use crate::hot::HotStore;
    use crate::orchestrator::{ProvisionSpec, ProvisionState};
    use crate::proxy::breaker::{BreakerConfig, BreakerRegistry};
    use crate::registry::{Heartbeat, NodeRegistration};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted orchestrator: submit hands out handles, poll replays a
    /// fixed sequence of states.
    struct ScriptedOrchestrator {
        states: Mutex<Vec<ProvisionState>>,
        terminated: Mutex<Vec<String>>,
    }

    impl ScriptedOrchestrator {
        fn new(states: Vec<ProvisionState>) -> Self {
            Self {
                states: Mutex::new(states),
                terminated: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Orchestrator for ScriptedOrchestrator {
        async fn submit(&self, _spec: &ProvisionSpec) -> anyhow::Result<String> {
            Ok(format!("cl-{}", uuid::Uuid::new_v4().simple()))
        }

        async fn poll(&self, _handle: &str) -> anyhow::Result<ProvisionState> {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                Ok(states.remove(0))
            } else {
                Ok(states[0].clone())
            }
        }

        async fn terminate(&self, handle: &str) -> anyhow::Result<()> {
            self.terminated.lock().unwrap().push(handle.to_string());
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<LifecycleManager>,
        registry: Arc<NodeRegistry>,
        scheduler: Arc<Scheduler>,
        bus: EventBus,
        orchestrator: Arc<ScriptedOrchestrator>,
    }

    async fn fixture(liveness: LivenessConfig, states: Vec<ProvisionState>) -> Fixture {
        let storage = Storage::in_memory().await.unwrap();
        let bus = EventBus::new();
        let hot = HotStore::new();
        let registry = Arc::new(NodeRegistry::new(storage.clone(), bus.clone(), liveness));
        let breakers = BreakerRegistry::new(BreakerConfig::default());
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            storage.clone(),
            hot.clone(),
            breakers,
        ));
        let orchestrator = Arc::new(ScriptedOrchestrator::new(states));
        let manager = Arc::new(LifecycleManager::new(
            registry.clone(),
            scheduler.clone(),
            orchestrator.clone(),
            storage,
            hot,
            bus.clone(),
        ));
        Fixture {
            manager,
            registry,
            scheduler,
            bus,
            orchestrator,
        }
    }

    async fn active_node(f: &Fixture, spot: bool) -> String {
        let node = f
            .registry
            .register(NodeRegistration {
                tenant_id: None,
                provider: "aws".to_string(),
                region_code: "us-east".to_string(),
                instance_type: "g5".to_string(),
                gpu_type: "A10G".to_string(),
                total_vram_gb: 24,
                model_id: Some("m1".to_string()),
                endpoint_url: Some("http://10.0.0.1:8000".to_string()),
                spot,
            })
            .await
            .unwrap();
        f.registry
            .ingest_heartbeat(
                &node.id,
                &Heartbeat {
                    at: Utc::now(),
                    vram_used_gb: 4,
                    temperature_c: None,
                    throughput_tps: None,
                    active_requests: 0,
                    spot,
                    health_score: 95,
                },
            )
            .await
            .unwrap();
        node.id
    }

    #[tokio::test]
    async fn spot_interrupt_drains_and_warns_exactly_once() {
        let f = fixture(LivenessConfig::default(), vec![ProvisionState::Pending]).await;
        let node_id = active_node(&f, true).await;
        let mut rx = f.bus.subscribe();

        let state = f.manager.spot_interrupt(&node_id).await.unwrap();
        assert_eq!(state.status, NodeStatus::Draining);

        // A duplicate warning from the agent is a no-op.
        let state = f.manager.spot_interrupt(&node_id).await.unwrap();
        assert_eq!(state.status, NodeStatus::Draining);

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if event.kind == kind::NODE_TERMINATION_WARNING {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn idle_draining_node_terminates_on_sweep() {
        let f = fixture(LivenessConfig::default(), vec![ProvisionState::Pending]).await;
        let node_id = active_node(&f, false).await;
        f.manager.drain(&node_id, DrainReason::AdminRequest).await.unwrap();

        f.manager.sweep_once().await;
        let node = f.registry.get(&node_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Terminated);
    }

    #[tokio::test]
    async fn draining_waits_for_inflight_until_deadline() {
        let liveness = LivenessConfig {
            drain_deadline: Duration::from_secs(3600),
            ..Default::default()
        };
        let f = fixture(liveness, vec![ProvisionState::Pending]).await;
        let node_id = active_node(&f, false).await;

        // One request in flight — the node must stay draining.
        f.scheduler.mark_dispatch(&node_id, 100).await;
        f.manager.drain(&node_id, DrainReason::SpotInterrupt).await.unwrap();
        f.manager.sweep_once().await;
        assert_eq!(
            f.registry.get(&node_id).await.unwrap().status,
            NodeStatus::Draining
        );

        // Request completes — the next sweep terminates it.
        f.scheduler.mark_complete(&node_id, 100).await;
        f.manager.sweep_once().await;
        assert_eq!(
            f.registry.get(&node_id).await.unwrap().status,
            NodeStatus::Terminated
        );
    }

    #[tokio::test]
    async fn terminate_by_cluster_drains_active_nodes() {
        let f = fixture(LivenessConfig::default(), vec![ProvisionState::Pending]).await;
        let node_id = active_node(&f, false).await;
        f.registry.set_cluster_handle(&node_id, "cl-42").await.unwrap();

        let state = f.manager.terminate_by_cluster("cl-42").await.unwrap();
        assert_eq!(state.status, NodeStatus::Draining);

        f.manager.sweep_once().await;
        assert_eq!(
            f.registry.get(&node_id).await.unwrap().status,
            NodeStatus::Terminated
        );
        // The cloud resource was released.
        assert_eq!(
            f.orchestrator.terminated.lock().unwrap().as_slice(),
            ["cl-42"]
        );
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let f = fixture(LivenessConfig::default(), vec![ProvisionState::Pending]).await;
        let err = f.manager.terminate_by_cluster("cl-missing").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
