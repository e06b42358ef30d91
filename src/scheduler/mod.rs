// SPDX-License-Identifier: MIT
//! Scheduler — selects one healthy worker per request.
//!
//! Pipeline: resolve the model, resolve the region hint (unknown regions
//! log and fall back to an unconstrained search), filter the registry
//! snapshot down to routable candidates, then hand the set to the
//! configured strategy. Candidates are sorted by node id before the
//! strategy runs so identical inputs always schedule identically.
//!
//! Health floor: 80 for serverless traffic, relaxed to 60 for
//! reserved-capacity tenants, which may also use their own tenant-owned
//! nodes. Endpoints whose circuit breaker is currently rejecting calls are
//! excluded up front.

pub mod strategy;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ApiError, NoCapacityReason};
use crate::hot::{node_concurrency_key, node_pending_tokens_key, HotStore};
use crate::proxy::breaker::BreakerRegistry;
use crate::registry::{NodeRegistry, NodeState};
use crate::storage::Storage;
use strategy::{LeastLoaded, Strategy};

/// Health floor for ordinary traffic.
const HEALTH_FLOOR: i64 = 80;
/// Relaxed floor for reserved-capacity tenants.
const RESERVED_HEALTH_FLOOR: i64 = 60;
/// Assumed per-node request slots when the worker reports nothing better.
const DEFAULT_NODE_CAPACITY: u64 = 16;
/// Assumed throughput when neither the node nor the model hints at one.
const DEFAULT_TOKENS_PER_SEC: f64 = 100.0;

/// One routable node plus its live load figures.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: NodeState,
    pub active_concurrency: u64,
    pub pending_tokens: u64,
    pub capacity: u64,
    pub tokens_per_sec_capacity: f64,
    pub region_match: bool,
}

/// What the dispatch pipeline knows about the caller.
#[derive(Debug, Clone, Copy)]
pub struct TenantClass {
    pub reserved_capacity: bool,
}

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    storage: Storage,
    hot: HotStore,
    breakers: BreakerRegistry,
    strategy: Box<dyn Strategy>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        storage: Storage,
        hot: HotStore,
        breakers: BreakerRegistry,
    ) -> Self {
        Self {
            registry,
            storage,
            hot,
            breakers,
            strategy: Box::new(LeastLoaded),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Pick a node for `model_id`. The caller has already resolved the model
    /// name against the catalog (and its allow-list).
    pub async fn schedule(
        &self,
        model_id: &str,
        region_hint: Option<&str>,
        tenant_id: &str,
        class: TenantClass,
    ) -> Result<NodeState, ApiError> {
        // Resolve the region hint; an unknown region logs and widens the
        // search instead of failing the request.
        let region = match region_hint {
            Some(code) => match self.storage.get_region(code).await {
                Ok(Some(r)) if r.status == "active" => Some(r.code),
                Ok(_) => {
                    warn!(region = code, "unknown or inactive region hint — searching everywhere");
                    None
                }
                Err(e) => {
                    warn!(err = %e, "region lookup failed — searching everywhere");
                    None
                }
            },
            None => None,
        };

        let floor = if class.reserved_capacity {
            RESERVED_HEALTH_FLOOR
        } else {
            HEALTH_FLOOR
        };

        let snapshot = self.registry.snapshot().await;
        let mut had_model_match = false;
        let mut health_filtered = false;

        let mut candidates: Vec<Candidate> = Vec::new();
        for node in snapshot {
            if node.model_id.as_deref() != Some(model_id) {
                continue;
            }
            had_model_match = true;
            if !node.status.routable() || node.endpoint_url.is_none() {
                continue;
            }
            // Tenant-owned nodes serve only their owner.
            if let Some(owner) = &node.tenant_id {
                if owner != tenant_id {
                    continue;
                }
            }
            if node.health_score < floor {
                health_filtered = true;
                continue;
            }
            let endpoint = node.endpoint_url.clone().unwrap_or_default();
            if !self.breakers.endpoint_available(&endpoint).await {
                continue;
            }

            let active_concurrency = self
                .hot
                .counter(&node_concurrency_key(&node.id))
                .await
                .ok()
                .flatten()
                .map(|(v, _)| v)
                .unwrap_or(0);
            let pending_tokens = self
                .hot
                .counter(&node_pending_tokens_key(&node.id))
                .await
                .ok()
                .flatten()
                .map(|(v, _)| v)
                .unwrap_or(0);

            let region_match = region
                .as_deref()
                .map(|r| r == node.region_code)
                .unwrap_or(true);
            let tokens_per_sec_capacity =
                node.throughput_tps.unwrap_or(DEFAULT_TOKENS_PER_SEC).max(1.0);

            candidates.push(Candidate {
                node,
                active_concurrency,
                pending_tokens,
                capacity: DEFAULT_NODE_CAPACITY,
                tokens_per_sec_capacity,
                region_match,
            });
        }

        if candidates.is_empty() {
            let reason = if !had_model_match {
                NoCapacityReason::Model
            } else if health_filtered {
                NoCapacityReason::Health
            } else if region.is_some() {
                NoCapacityReason::Region
            } else {
                NoCapacityReason::Health
            };
            return Err(ApiError::NoCapacity { reason });
        }

        // Stable input order → deterministic strategies.
        candidates.sort_by(|a, b| a.node.id.cmp(&b.node.id));
        let picked = self.strategy.pick(&candidates);
        let chosen = candidates
            .into_iter()
            .nth(picked)
            .expect("strategy returned a valid index");
        debug!(
            node = %chosen.node.id,
            strategy = self.strategy.name(),
            "scheduled"
        );
        Ok(chosen.node)
    }

    /// Reserve a slot on the chosen node: bump the per-node concurrency and
    /// pending-token gauges the ranking reads.
    pub async fn mark_dispatch(&self, node_id: &str, estimated_tokens: u64) {
        let ttl = std::time::Duration::from_secs(3600);
        let _ = self.hot.incr(&node_concurrency_key(node_id), 1, ttl).await;
        let _ = self
            .hot
            .incr(&node_pending_tokens_key(node_id), estimated_tokens, ttl)
            .await;
    }

    /// Release the slot on completion. Clamped at zero — a restart cannot
    /// drive the gauges negative.
    pub async fn mark_complete(&self, node_id: &str, estimated_tokens: u64) {
        let _ = self
            .hot
            .decr_clamped(&node_concurrency_key(node_id), 1)
            .await;
        let _ = self
            .hot
            .decr_clamped(&node_pending_tokens_key(node_id), estimated_tokens)
            .await;
    }

    /// Live in-flight count for a node (drain decisions read this).
    pub async fn inflight(&self, node_id: &str) -> u64 {
        self.hot
            .counter(&node_concurrency_key(node_id))
            .await
            .ok()
            .flatten()
            .map(|(v, _)| v)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessConfig;
    use crate::events::EventBus;
    use crate::proxy::breaker::BreakerConfig;
    use crate::registry::{Heartbeat, NodeRegistration, NodeStatus};
    use chrono::Utc;

    struct Fixture {
        scheduler: Scheduler,
        registry: Arc<NodeRegistry>,
        breakers: BreakerRegistry,
    }

    async fn fixture() -> Fixture {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .upsert_region("us-east", &["aws".to_string()], 1.0, "active")
            .await
            .unwrap();
        storage
            .upsert_region("eu-west", &["aws".to_string()], 1.2, "active")
            .await
            .unwrap();
        let registry = Arc::new(NodeRegistry::new(
            storage.clone(),
            EventBus::new(),
            LivenessConfig::default(),
        ));
        let breakers = BreakerRegistry::new(BreakerConfig::default());
        let scheduler = Scheduler::new(
            registry.clone(),
            storage,
            HotStore::new(),
            breakers.clone(),
        );
        Fixture {
            scheduler,
            registry,
            breakers,
        }
    }

    async fn add_node(
        f: &Fixture,
        region: &str,
        model: &str,
        health: i64,
        tenant: Option<&str>,
    ) -> String {
        let node = f
            .registry
            .register(NodeRegistration {
                tenant_id: tenant.map(str::to_string),
                provider: "aws".to_string(),
                region_code: region.to_string(),
                instance_type: "g5".to_string(),
                gpu_type: "A10G".to_string(),
                total_vram_gb: 24,
                model_id: Some(model.to_string()),
                endpoint_url: Some(format!("http://node-{}.internal:8000", uuid::Uuid::new_v4())),
                spot: false,
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
                    throughput_tps: Some(100.0),
                    active_requests: 0,
                    spot: false,
                    health_score: health,
                },
            )
            .await
            .unwrap();
        node.id
    }

    fn serverless() -> TenantClass {
        TenantClass {
            reserved_capacity: false,
        }
    }

    #[tokio::test]
    async fn schedules_healthy_node_for_model() {
        let f = fixture().await;
        let id = add_node(&f, "us-east", "m-chat", 95, None).await;
        let node = f
            .scheduler
            .schedule("m-chat", None, "t1", serverless())
            .await
            .unwrap();
        assert_eq!(node.id, id);
    }

    #[tokio::test]
    async fn no_model_match_reports_model_reason() {
        let f = fixture().await;
        add_node(&f, "us-east", "m-chat", 95, None).await;
        let err = f
            .scheduler
            .schedule("m-embed", None, "t1", serverless())
            .await
            .unwrap_err();
        match err {
            ApiError::NoCapacity { reason } => assert_eq!(reason, NoCapacityReason::Model),
            other => panic!("expected NoCapacity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_floor_excludes_unless_reserved() {
        let f = fixture().await;
        add_node(&f, "us-east", "m-chat", 70, None).await;

        let err = f
            .scheduler
            .schedule("m-chat", None, "t1", serverless())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::NoCapacity {
                reason: NoCapacityReason::Health
            }
        ));

        // Reserved tenants drop the floor to 60.
        let node = f
            .scheduler
            .schedule(
                "m-chat",
                None,
                "t1",
                TenantClass {
                    reserved_capacity: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(node.health_score, 70);
    }

    #[tokio::test]
    async fn region_preference_with_fallback() {
        let f = fixture().await;
        let eu = add_node(&f, "eu-west", "m-chat", 95, None).await;
        let us = add_node(&f, "us-east", "m-chat", 95, None).await;

        let picked = f
            .scheduler
            .schedule("m-chat", Some("eu-west"), "t1", serverless())
            .await
            .unwrap();
        assert_eq!(picked.id, eu);

        // Drain the eu node; the us node is the ranked-down fallback.
        f.registry.transition(&eu, NodeStatus::Draining).await.unwrap();
        let picked = f
            .scheduler
            .schedule("m-chat", Some("eu-west"), "t1", serverless())
            .await
            .unwrap();
        assert_eq!(picked.id, us);
    }

    #[tokio::test]
    async fn unknown_region_hint_searches_everywhere() {
        let f = fixture().await;
        let id = add_node(&f, "us-east", "m-chat", 95, None).await;
        let picked = f
            .scheduler
            .schedule("m-chat", Some("mars-1"), "t1", serverless())
            .await
            .unwrap();
        assert_eq!(picked.id, id);
    }

    #[tokio::test]
    async fn tenant_owned_nodes_serve_only_their_owner() {
        let f = fixture().await;
        add_node(&f, "us-east", "m-chat", 95, Some("t-owner")).await;

        assert!(f
            .scheduler
            .schedule("m-chat", None, "t-other", serverless())
            .await
            .is_err());
        assert!(f
            .scheduler
            .schedule("m-chat", None, "t-owner", serverless())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn open_breaker_excludes_node() {
        let f = fixture().await;
        let a = add_node(&f, "us-east", "m-chat", 95, None).await;
        let b = add_node(&f, "us-east", "m-chat", 95, None).await;

        let node_a = f.registry.get(&a).await.unwrap();
        let breaker = f
            .breakers
            .for_endpoint(node_a.endpoint_url.as_deref().unwrap())
            .await;
        for _ in 0..5 {
            breaker.record_failure().await;
        }

        let picked = f
            .scheduler
            .schedule("m-chat", None, "t1", serverless())
            .await
            .unwrap();
        assert_eq!(picked.id, b);

        // With every endpoint broken there is nothing left.
        let node_b = f.registry.get(&b).await.unwrap();
        let breaker_b = f
            .breakers
            .for_endpoint(node_b.endpoint_url.as_deref().unwrap())
            .await;
        for _ in 0..5 {
            breaker_b.record_failure().await;
        }
        assert!(f
            .scheduler
            .schedule("m-chat", None, "t1", serverless())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn least_loaded_follows_the_gauges() {
        let f = fixture().await;
        let a = add_node(&f, "us-east", "m-chat", 95, None).await;
        let b = add_node(&f, "us-east", "m-chat", 95, None).await;

        f.scheduler.mark_dispatch(&a, 500).await;
        f.scheduler.mark_dispatch(&a, 500).await;
        f.scheduler.mark_dispatch(&b, 500).await;

        let picked = f
            .scheduler
            .schedule("m-chat", None, "t1", serverless())
            .await
            .unwrap();
        assert_eq!(picked.id, b);

        // Completion releases the gauges.
        f.scheduler.mark_complete(&a, 500).await;
        f.scheduler.mark_complete(&a, 500).await;
        assert_eq!(f.scheduler.inflight(&a).await, 0);
    }
}
