// SPDX-License-Identifier: MIT
//! TensorGate — multi-tenant LLM inference control plane.
//!
//! One always-on daemon: authenticates OpenAI-compatible requests, admits
//! them through four rate-limit layers, schedules a healthy GPU worker,
//! proxies the request (unary or SSE), accounts token usage for billing,
//! and manages worker lifecycle across clouds.

pub mod audit;
pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod events;
pub mod hot;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod rest;
pub mod scheduler;
pub mod storage;
pub mod usage;

use std::sync::Arc;

use audit::AuditLog;
use auth::Authenticator;
use config::ControlPlaneConfig;
use events::EventBus;
use hot::HotStore;
use lifecycle::LifecycleManager;
use metrics::Metrics;
use proxy::ProxyEngine;
use ratelimit::RateLimiter;
use registry::NodeRegistry;
use scheduler::Scheduler;
use storage::Storage;
use usage::UsageAccountant;

/// Shared application state passed to every handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ControlPlaneConfig>,
    pub storage: Storage,
    pub hot: HotStore,
    pub bus: EventBus,
    pub auth: Arc<Authenticator>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<NodeRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub proxy: Arc<ProxyEngine>,
    pub lifecycle: Arc<LifecycleManager>,
    pub accountant: UsageAccountant,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
}
