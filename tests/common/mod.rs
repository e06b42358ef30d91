//! Shared fixtures for integration tests: a fully wired `AppContext` on an
//! in-memory database, with a scripted orchestrator.

// Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tensorgate::{
    audit::AuditLog,
    auth::{generate_key, Authenticator},
    config::ControlPlaneConfig,
    events::EventBus,
    hot::HotStore,
    lifecycle::LifecycleManager,
    metrics::Metrics,
    orchestrator::{Orchestrator, ProvisionSpec, ProvisionState},
    proxy::{breaker::BreakerConfig, retry::RetryPolicy, ProxyConfig, ProxyEngine},
    ratelimit::{LimiterDefaults, RateLimiter},
    registry::{Heartbeat, NodeRegistration, NodeRegistry},
    scheduler::Scheduler,
    storage::Storage,
    usage::UsageAccountant,
    AppContext,
};

pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Orchestrator whose polls replay a scripted state sequence.
pub struct ScriptedOrchestrator {
    states: Mutex<Vec<ProvisionState>>,
    pub terminated: Mutex<Vec<String>>,
}

impl ScriptedOrchestrator {
    pub fn new(states: Vec<ProvisionState>) -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(states),
            terminated: Mutex::new(Vec::new()),
        })
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

/// A fully wired context. The proxy retries instantly so failure tests do
/// not wait out real backoff.
pub async fn test_context() -> Arc<AppContext> {
    let data_dir = std::env::temp_dir().join(format!("tg-test-{}", uuid::Uuid::new_v4()));
    std::env::set_var("TG_BILLING_WEBHOOK_SECRET", WEBHOOK_SECRET);
    let config = Arc::new(ControlPlaneConfig::new(
        None,
        Some(data_dir),
        None,
        Some(ADMIN_TOKEN.to_string()),
    ));

    let storage = Storage::in_memory().await.unwrap();
    let hot = HotStore::new();
    let bus = EventBus::new();

    let auth = Arc::new(Authenticator::new(storage.clone(), Duration::from_secs(60)));
    auth.clone().spawn_invalidation_listener(&bus);

    let limiter = Arc::new(RateLimiter::new(hot.clone(), LimiterDefaults::default()));
    let registry = Arc::new(NodeRegistry::new(
        storage.clone(),
        bus.clone(),
        config.liveness.clone(),
    ));

    let proxy = Arc::new(
        ProxyEngine::new(ProxyConfig {
            retry: RetryPolicy::instant(),
            breaker: BreakerConfig::default(),
            ..Default::default()
        })
        .unwrap(),
    );

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        storage.clone(),
        hot.clone(),
        proxy.breakers().clone(),
    ));

    let orchestrator = ScriptedOrchestrator::new(vec![ProvisionState::Pending]);
    let lifecycle = Arc::new(LifecycleManager::new(
        registry.clone(),
        scheduler.clone(),
        orchestrator,
        storage.clone(),
        hot.clone(),
        bus.clone(),
    ));

    let (accountant, _writer) = UsageAccountant::spawn(storage.clone(), hot.clone(), 64);
    let audit = Arc::new(AuditLog::new(storage.clone()));

    Arc::new(AppContext {
        config,
        storage,
        hot,
        bus,
        auth,
        limiter,
        registry,
        scheduler,
        proxy,
        lifecycle,
        accountant,
        audit,
        metrics: Arc::new(Metrics::new()),
    })
}

/// Seed one tenant + environment + key. Returns (tenant_id, env_id,
/// plaintext key).
pub async fn seed_tenant(ctx: &AppContext, rpm: i64) -> (String, String, String) {
    let tenant = ctx
        .storage
        .create_tenant(
            "acme",
            &format!("ops+{}@acme.test", uuid::Uuid::new_v4().simple()),
            "serverless",
            Some("cus_test"),
        )
        .await
        .unwrap();
    let env = ctx
        .storage
        .create_environment(&tenant.id, "prod", Some("us-east"), &[], 0, 0, 0)
        .await
        .unwrap();
    let (plaintext, hash, prefix) = generate_key("live");
    ctx.storage
        .create_api_key(
            &hash,
            &prefix,
            &tenant.id,
            &env.id,
            "developer",
            None,
            rpm,
            0,
            None,
        )
        .await
        .unwrap();
    (tenant.id, env.id, plaintext)
}

/// Seed a chat model and a healthy active node pointing at `endpoint`.
pub async fn seed_model_and_node(ctx: &AppContext, model_name: &str, endpoint: &str) -> (String, String) {
    ctx.storage
        .upsert_region("us-east", &["aws".to_string()], 1.0, "active")
        .await
        .unwrap();
    let model = ctx
        .storage
        .create_model(
            model_name,
            "llama",
            "8b",
            "chat",
            8192,
            16,
            500_000,
            1_500_000,
            &serde_json::json!({}),
        )
        .await
        .unwrap();

    let node = ctx
        .registry
        .register(NodeRegistration {
            tenant_id: None,
            provider: "aws".to_string(),
            region_code: "us-east".to_string(),
            instance_type: "g5.2xlarge".to_string(),
            gpu_type: "A10G".to_string(),
            total_vram_gb: 24,
            model_id: Some(model.id.clone()),
            endpoint_url: Some(endpoint.to_string()),
            spot: false,
        })
        .await
        .unwrap();
    ctx.registry
        .ingest_heartbeat(
            &node.id,
            &Heartbeat {
                at: chrono::Utc::now(),
                vram_used_gb: 4,
                temperature_c: None,
                throughput_tps: Some(100.0),
                active_requests: 0,
                spot: false,
                health_score: 95,
            },
        )
        .await
        .unwrap();
    (model.id, node.id)
}
