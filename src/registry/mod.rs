// SPDX-License-Identifier: MIT
//! Node Registry — the authoritative in-memory view of GPU workers.
//!
//! Hydrated from the Durable Store at boot, kept current by heartbeat
//! ingest and lifecycle transitions, and consulted by the scheduler on
//! every request. Status changes go through the declared automaton; an
//! invalid transition is a `Conflict`, never a silent overwrite.
//!
//! Heartbeats from one node are processed in arrival order; a heartbeat
//! whose timestamp is not newer than the last accepted one is dropped
//! (last-write-wins on timestamp), which also makes replays idempotent.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::LivenessConfig;
use crate::error::{ApiError, ApiResult};
use crate::events::{kind, EventBus};
use crate::storage::{NodeRow, Storage};

/// Node status automaton. Variants are ordered; transitions only move
/// forward except the `unhealthy ⇄ active` recovery pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeStatus {
    Initializing,
    Active,
    Draining,
    Unhealthy,
    Dead,
    Terminated,
}

impl NodeStatus {
    pub fn parse(s: &str) -> Option<NodeStatus> {
        match s {
            "initializing" => Some(NodeStatus::Initializing),
            "active" => Some(NodeStatus::Active),
            "draining" => Some(NodeStatus::Draining),
            "unhealthy" => Some(NodeStatus::Unhealthy),
            "dead" => Some(NodeStatus::Dead),
            "terminated" => Some(NodeStatus::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Initializing => "initializing",
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Unhealthy => "unhealthy",
            NodeStatus::Dead => "dead",
            NodeStatus::Terminated => "terminated",
        }
    }

    /// `draining` and everything after it accepts no new routing.
    pub fn routable(&self) -> bool {
        matches!(self, NodeStatus::Active)
    }

    pub fn terminal(&self) -> bool {
        matches!(self, NodeStatus::Dead | NodeStatus::Terminated)
    }

    /// The declared automaton. A node that held `active` can never reach a
    /// terminal state without passing through `draining` or `unhealthy`.
    pub fn can_transition(from: NodeStatus, to: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (from, to),
            (Initializing, Active)
                | (Initializing, Unhealthy)
                | (Initializing, Terminated)
                | (Active, Draining)
                | (Active, Unhealthy)
                | (Unhealthy, Active)
                | (Unhealthy, Draining)
                | (Unhealthy, Dead)
                | (Draining, Terminated)
                | (Draining, Dead)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic report posted by the node agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub vram_used_gb: i64,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub throughput_tps: Option<f64>,
    #[serde(default)]
    pub active_requests: u64,
    #[serde(default)]
    pub spot: bool,
    /// Self-reported health score; defaults to fully healthy.
    #[serde(default = "default_health")]
    pub health_score: i64,
}

fn default_health() -> i64 {
    100
}

/// In-memory node state. A superset of the durable row plus probe counters.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: String,
    pub cluster_handle: Option<String>,
    pub tenant_id: Option<String>,
    pub provider: String,
    pub region_code: String,
    pub instance_type: String,
    pub gpu_type: String,
    pub total_vram_gb: i64,
    pub free_vram_gb: i64,
    pub model_id: Option<String>,
    pub endpoint_url: Option<String>,
    pub spot: bool,
    pub throughput_tps: Option<f64>,
    pub status: NodeStatus,
    pub health_score: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub draining_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Consecutive probes with health score < 50.
    pub(crate) low_health_probes: u32,
    /// Consecutive healthy probes while `unhealthy` (recovery progress).
    pub(crate) recovery_probes: u32,
}

impl NodeState {
    fn from_row(row: &NodeRow) -> Option<NodeState> {
        Some(NodeState {
            id: row.id.clone(),
            cluster_handle: row.cluster_handle.clone(),
            tenant_id: row.tenant_id.clone(),
            provider: row.provider.clone(),
            region_code: row.region_code.clone(),
            instance_type: row.instance_type.clone(),
            gpu_type: row.gpu_type.clone(),
            total_vram_gb: row.total_vram_gb,
            free_vram_gb: row.free_vram_gb,
            model_id: row.model_id.clone(),
            endpoint_url: row.endpoint_url.clone(),
            spot: row.spot != 0,
            throughput_tps: row.throughput_tps,
            status: NodeStatus::parse(&row.status)?,
            health_score: row.health_score,
            last_heartbeat: row
                .last_heartbeat_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            draining_since: None,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            low_health_probes: 0,
            recovery_probes: 0,
        })
    }

    /// A node whose last heartbeat is exactly at the liveness deadline is
    /// still healthy; one tick later it is not.
    pub fn heartbeat_stale(&self, now: DateTime<Utc>, liveness: &LivenessConfig) -> bool {
        match self.last_heartbeat {
            Some(at) => (now - at).num_milliseconds() > liveness.heartbeat_timeout.as_millis() as i64,
            // Nodes that never heartbeated are judged by their age.
            None => (now - self.created_at).num_milliseconds()
                > liveness.heartbeat_timeout.as_millis() as i64,
        }
    }
}

/// Registration payload from the node agent or the launch workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRegistration {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub provider: String,
    pub region_code: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub gpu_type: String,
    #[serde(default)]
    pub total_vram_gb: i64,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub spot: bool,
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeState>>,
    storage: Storage,
    bus: EventBus,
    liveness: LivenessConfig,
}

impl NodeRegistry {
    pub fn new(storage: Storage, bus: EventBus, liveness: LivenessConfig) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            storage,
            bus,
            liveness,
        }
    }

    pub fn liveness(&self) -> &LivenessConfig {
        &self.liveness
    }

    /// Rebuild the in-memory view from the Durable Store (boot path).
    pub async fn hydrate(&self) -> anyhow::Result<usize> {
        let rows = self.storage.list_live_nodes().await?;
        let mut map = self.nodes.write().await;
        map.clear();
        for row in &rows {
            if let Some(state) = NodeState::from_row(row) {
                map.insert(state.id.clone(), state);
            }
        }
        Ok(map.len())
    }

    /// Insert a brand-new node in `initializing`, persisting the row first.
    pub async fn register(&self, reg: NodeRegistration) -> ApiResult<NodeState> {
        let id = uuid::Uuid::new_v4().to_string();
        self.storage
            .insert_node(
                &id,
                reg.tenant_id.as_deref(),
                &reg.provider,
                &reg.region_code,
                &reg.instance_type,
                &reg.gpu_type,
                reg.total_vram_gb,
                reg.model_id.as_deref(),
                reg.spot,
            )
            .await
            .map_err(ApiError::Internal)?;
        if let Some(url) = &reg.endpoint_url {
            self.storage
                .set_node_endpoint(&id, url)
                .await
                .map_err(ApiError::Internal)?;
        }

        let state = NodeState {
            id: id.clone(),
            cluster_handle: None,
            tenant_id: reg.tenant_id,
            provider: reg.provider,
            region_code: reg.region_code,
            instance_type: reg.instance_type,
            gpu_type: reg.gpu_type,
            total_vram_gb: reg.total_vram_gb,
            free_vram_gb: reg.total_vram_gb,
            model_id: reg.model_id,
            endpoint_url: reg.endpoint_url,
            spot: reg.spot,
            throughput_tps: None,
            status: NodeStatus::Initializing,
            health_score: 100,
            last_heartbeat: None,
            draining_since: None,
            created_at: Utc::now(),
            low_health_probes: 0,
            recovery_probes: 0,
        };
        self.nodes.write().await.insert(id.clone(), state.clone());
        self.bus
            .publish(kind::NODE_REGISTERED, json!({ "node_id": id }));
        Ok(state)
    }

    pub async fn get(&self, id: &str) -> Option<NodeState> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn get_by_cluster(&self, cluster_handle: &str) -> Option<NodeState> {
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.cluster_handle.as_deref() == Some(cluster_handle))
            .cloned()
    }

    /// Point-in-time copy of every tracked node.
    pub async fn snapshot(&self) -> Vec<NodeState> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Record the orchestrator's cluster handle once provisioning starts.
    pub async fn set_cluster_handle(&self, id: &str, handle: &str) -> ApiResult<()> {
        self.storage
            .set_node_cluster_handle(id, handle)
            .await
            .map_err(ApiError::Internal)?;
        if let Some(n) = self.nodes.write().await.get_mut(id) {
            n.cluster_handle = Some(handle.to_string());
        }
        Ok(())
    }

    pub async fn set_endpoint(&self, id: &str, url: &str) -> ApiResult<()> {
        self.storage
            .set_node_endpoint(id, url)
            .await
            .map_err(ApiError::Internal)?;
        if let Some(n) = self.nodes.write().await.get_mut(id) {
            n.endpoint_url = Some(url.to_string());
        }
        Ok(())
    }

    /// Drive one automaton transition, persist it, and emit the status
    /// event. `Conflict` if the automaton forbids the move.
    pub async fn transition(&self, id: &str, to: NodeStatus) -> ApiResult<NodeState> {
        let (from, updated) = {
            let mut map = self.nodes.write().await;
            let node = map
                .get_mut(id)
                .ok_or_else(|| ApiError::NotFound("node".to_string()))?;
            let from = node.status;
            if from == to {
                return Ok(node.clone());
            }
            if !NodeStatus::can_transition(from, to) {
                return Err(ApiError::Conflict(format!(
                    "node cannot move from {from} to {to}"
                )));
            }
            node.status = to;
            if to == NodeStatus::Draining {
                node.draining_since = Some(Utc::now());
            }
            if to == NodeStatus::Active {
                node.recovery_probes = 0;
                node.low_health_probes = 0;
            }
            (from, node.clone())
        };

        self.storage
            .update_node_status(id, to.as_str())
            .await
            .map_err(ApiError::Internal)?;
        info!(node = id, %from, %to, "node status changed");
        self.bus.publish(
            kind::NODE_STATUS_CHANGED,
            json!({ "node_id": id, "from": from.as_str(), "to": to.as_str() }),
        );
        Ok(updated)
    }

    /// Ingest one heartbeat. Returns the node's (possibly updated) status.
    ///
    /// Out-of-order or replayed heartbeats are dropped. The first healthy
    /// heartbeat activates an `initializing` node; `recovery_probe_count`
    /// consecutive healthy probes recover an `unhealthy` one.
    pub async fn ingest_heartbeat(&self, id: &str, hb: &Heartbeat) -> ApiResult<NodeStatus> {
        let (decision, free_vram) = {
            let mut map = self.nodes.write().await;
            let node = map
                .get_mut(id)
                .ok_or_else(|| ApiError::NotFound("node".to_string()))?;

            if node.status.terminal() {
                return Err(ApiError::Conflict(format!(
                    "node is {} and accepts no heartbeats",
                    node.status
                )));
            }
            if let Some(last) = node.last_heartbeat {
                if hb.at <= last {
                    // Stale or replayed — drop without side effects.
                    return Ok(node.status);
                }
            }

            node.last_heartbeat = Some(hb.at);
            node.health_score = hb.health_score.clamp(0, 100);
            node.free_vram_gb = (node.total_vram_gb - hb.vram_used_gb).max(0);
            if hb.throughput_tps.is_some() {
                node.throughput_tps = hb.throughput_tps;
            }

            let healthy = node.health_score >= 50;
            if healthy {
                node.low_health_probes = 0;
            } else {
                node.low_health_probes += 1;
            }

            let decision = match node.status {
                NodeStatus::Initializing if healthy => Some(NodeStatus::Active),
                NodeStatus::Active
                    if node.low_health_probes >= self.liveness.unhealthy_probe_count =>
                {
                    Some(NodeStatus::Unhealthy)
                }
                NodeStatus::Unhealthy if healthy => {
                    node.recovery_probes += 1;
                    if node.recovery_probes >= self.liveness.recovery_probe_count {
                        Some(NodeStatus::Active)
                    } else {
                        None
                    }
                }
                NodeStatus::Unhealthy => {
                    node.recovery_probes = 0;
                    None
                }
                _ => None,
            };
            (decision, node.free_vram_gb)
        };

        self.storage
            .update_node_heartbeat(id, hb.at, hb.health_score, free_vram, hb.throughput_tps)
            .await
            .map_err(ApiError::Internal)?;

        match decision {
            Some(next) => self.transition(id, next).await.map(|n| n.status),
            None => Ok(self
                .get(id)
                .await
                .map(|n| n.status)
                .unwrap_or(NodeStatus::Unhealthy)),
        }
    }

    /// Liveness sweep, called periodically by the lifecycle manager.
    /// Returns the ids of nodes that changed status.
    pub async fn sweep_liveness(&self, now: DateTime<Utc>) -> Vec<(String, NodeStatus)> {
        let candidates: Vec<(String, NodeStatus)> = {
            let map = self.nodes.read().await;
            map.values()
                .filter_map(|n| {
                    let next = match n.status {
                        // `initializing` nodes are exempt: the launch
                        // workflow owns their deadline until the first
                        // heartbeat arrives.
                        NodeStatus::Active if n.heartbeat_stale(now, &self.liveness) => {
                            Some(NodeStatus::Unhealthy)
                        }
                        NodeStatus::Unhealthy => {
                            let silent_for = n
                                .last_heartbeat
                                .map(|at| now - at)
                                .unwrap_or_else(|| now - n.created_at);
                            if silent_for.num_milliseconds()
                                > self.liveness.dead_after.as_millis() as i64
                            {
                                Some(NodeStatus::Dead)
                            } else {
                                None
                            }
                        }
                        _ => None,
                    };
                    next.map(|s| (n.id.clone(), s))
                })
                .collect()
        };

        let mut changed = Vec::new();
        for (id, next) in candidates {
            match self.transition(&id, next).await {
                Ok(state) => changed.push((id, state.status)),
                Err(e) => warn!(node = %id, err = %e, "liveness transition failed"),
            }
        }
        changed
    }

    /// Draining nodes past their deadline (or with the given in-flight
    /// check returning zero) that should now terminate.
    pub async fn drained_nodes(&self, now: DateTime<Utc>) -> Vec<String> {
        let map = self.nodes.read().await;
        map.values()
            .filter(|n| {
                n.status == NodeStatus::Draining
                    && n.draining_since
                        .map(|since| {
                            (now - since).num_milliseconds()
                                >= self.liveness.drain_deadline.as_millis() as i64
                        })
                        .unwrap_or(true)
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Forget terminal nodes older than the retention horizon. The durable
    /// rows remain; only the in-memory view shrinks.
    pub async fn evict_terminal(&self) {
        let mut map = self.nodes.write().await;
        map.retain(|_, n| !n.status.terminal());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn liveness() -> LivenessConfig {
        LivenessConfig::default()
    }

    async fn registry() -> Arc<NodeRegistry> {
        let storage = Storage::in_memory().await.unwrap();
        Arc::new(NodeRegistry::new(storage, EventBus::new(), liveness()))
    }

    fn registration() -> NodeRegistration {
        NodeRegistration {
            tenant_id: None,
            provider: "aws".to_string(),
            region_code: "us-east".to_string(),
            instance_type: "g5.2xlarge".to_string(),
            gpu_type: "A10G".to_string(),
            total_vram_gb: 24,
            model_id: Some("m1".to_string()),
            endpoint_url: Some("http://10.0.0.1:8000".to_string()),
            spot: false,
        }
    }

    fn heartbeat(at: DateTime<Utc>, health: i64) -> Heartbeat {
        Heartbeat {
            at,
            vram_used_gb: 10,
            temperature_c: None,
            throughput_tps: Some(100.0),
            active_requests: 0,
            spot: false,
            health_score: health,
        }
    }

    #[tokio::test]
    async fn first_healthy_heartbeat_activates() {
        let reg = registry().await;
        let node = reg.register(registration()).await.unwrap();
        assert_eq!(node.status, NodeStatus::Initializing);

        let status = reg
            .ingest_heartbeat(&node.id, &heartbeat(Utc::now(), 95))
            .await
            .unwrap();
        assert_eq!(status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn out_of_order_heartbeats_dropped() {
        let reg = registry().await;
        let node = reg.register(registration()).await.unwrap();
        let t0 = Utc::now();
        reg.ingest_heartbeat(&node.id, &heartbeat(t0, 95)).await.unwrap();
        // An older heartbeat with a bad score must not change anything.
        reg.ingest_heartbeat(&node.id, &heartbeat(t0 - chrono::Duration::seconds(5), 10))
            .await
            .unwrap();
        let state = reg.get(&node.id).await.unwrap();
        assert_eq!(state.health_score, 95);
        assert_eq!(state.status, NodeStatus::Active);

        // Replaying the same heartbeat is a no-op (idempotent).
        reg.ingest_heartbeat(&node.id, &heartbeat(t0, 95)).await.unwrap();
        assert_eq!(reg.get(&node.id).await.unwrap().health_score, 95);
    }

    #[tokio::test]
    async fn three_low_probes_flip_unhealthy_and_two_recover() {
        let reg = registry().await;
        let node = reg.register(registration()).await.unwrap();
        let mut t = Utc::now();
        reg.ingest_heartbeat(&node.id, &heartbeat(t, 95)).await.unwrap();

        for _ in 0..3 {
            t += chrono::Duration::seconds(5);
            reg.ingest_heartbeat(&node.id, &heartbeat(t, 30)).await.unwrap();
        }
        assert_eq!(reg.get(&node.id).await.unwrap().status, NodeStatus::Unhealthy);

        // One healthy probe is not enough.
        t += chrono::Duration::seconds(5);
        reg.ingest_heartbeat(&node.id, &heartbeat(t, 90)).await.unwrap();
        assert_eq!(reg.get(&node.id).await.unwrap().status, NodeStatus::Unhealthy);

        t += chrono::Duration::seconds(5);
        let status = reg.ingest_heartbeat(&node.id, &heartbeat(t, 90)).await.unwrap();
        assert_eq!(status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn automaton_rejects_skipping_drain() {
        let reg = registry().await;
        let node = reg.register(registration()).await.unwrap();
        reg.ingest_heartbeat(&node.id, &heartbeat(Utc::now(), 95))
            .await
            .unwrap();

        // active → terminated skips draining.
        let err = reg
            .transition(&node.id, NodeStatus::Terminated)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        reg.transition(&node.id, NodeStatus::Draining).await.unwrap();
        reg.transition(&node.id, NodeStatus::Terminated).await.unwrap();
        // Terminal states accept no heartbeats.
        let err = reg
            .ingest_heartbeat(&node.id, &heartbeat(Utc::now(), 95))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn liveness_sweep_boundary() {
        let reg = registry().await;
        let node = reg.register(registration()).await.unwrap();
        let t0 = Utc::now();
        reg.ingest_heartbeat(&node.id, &heartbeat(t0, 95)).await.unwrap();

        // Exactly at the deadline — still healthy.
        let at_deadline = t0 + chrono::Duration::seconds(15);
        assert!(reg.sweep_liveness(at_deadline).await.is_empty());

        // One tick past — unhealthy.
        let past = at_deadline + chrono::Duration::milliseconds(1);
        let changed = reg.sweep_liveness(past).await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].1, NodeStatus::Unhealthy);

        // 60 s of continued silence — dead.
        let much_later = t0 + chrono::Duration::seconds(76);
        let changed = reg.sweep_liveness(much_later).await;
        assert_eq!(changed[0].1, NodeStatus::Dead);
    }
}
