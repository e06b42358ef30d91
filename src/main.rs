// SPDX-License-Identifier: MIT
//! tensorgated — the control-plane daemon entry point.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use tensorgate::{
    audit::AuditLog,
    auth::Authenticator,
    billing::HttpBillingExporter,
    config::ControlPlaneConfig,
    events::EventBus,
    hot::HotStore,
    lifecycle::LifecycleManager,
    metrics::Metrics,
    orchestrator::HttpOrchestrator,
    proxy::{breaker::BreakerConfig, ProxyConfig, ProxyEngine},
    ratelimit::{LimiterDefaults, RateLimiter},
    registry::NodeRegistry,
    rest,
    scheduler::Scheduler,
    storage::Storage,
    usage::{UsageAccountant, UsageExporter},
    AppContext,
};

#[derive(Parser)]
#[command(
    name = "tensorgated",
    about = "TensorGate — multi-tenant LLM inference control plane",
    version
)]
struct Args {
    /// HTTP listen port
    #[arg(long, env = "TG_PORT")]
    port: Option<u16>,

    /// Data directory for config, and the SQLite database
    #[arg(long, env = "TG_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "TG_LOG")]
    log: Option<String>,

    /// Admin token guarding the /admin surface
    #[arg(long, env = "TG_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TG_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Emit logs as JSON lines (for log shippers)
    #[arg(long, env = "TG_LOG_JSON")]
    json_logs: bool,
}

fn init_logging(filter: &str, log_file: Option<&std::path::Path>, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::new(filter.to_string());

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "tensorgated.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            // The guard must live for the process lifetime.
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            Box::leak(Box::new(guard));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
                .init();
        }
        None if json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(ControlPlaneConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.admin_token,
    ));
    init_logging(&config.log, args.log_file.as_deref(), args.json_logs);
    info!(version = env!("CARGO_PKG_VERSION"), "tensorgated starting");
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    if config.admin_token.is_empty() {
        warn!("TG_ADMIN_TOKEN not set — the /admin surface is disabled");
    }

    // ── Stores ────────────────────────────────────────────────────────────────
    let storage = Storage::new(&config.database_path).await?;
    let hot = HotStore::new();
    let _sweeper = hot.spawn_sweeper(std::time::Duration::from_secs(30));
    let bus = EventBus::new();

    // ── Core components ───────────────────────────────────────────────────────
    let auth = Arc::new(Authenticator::new(storage.clone(), config.auth_cache_ttl));
    auth.clone().spawn_invalidation_listener(&bus);

    let limiter = Arc::new(RateLimiter::new(
        hot.clone(),
        LimiterDefaults {
            global_rpm: config.global_rpm,
            global_tpm: config.global_tpm,
            global_concurrency: config.global_concurrency,
            ..Default::default()
        },
    ));

    let registry = Arc::new(NodeRegistry::new(
        storage.clone(),
        bus.clone(),
        config.liveness.clone(),
    ));
    let hydrated = registry.hydrate().await?;
    if hydrated > 0 {
        info!(nodes = hydrated, "registry rehydrated from the durable store");
    }

    let proxy = Arc::new(ProxyEngine::new(ProxyConfig {
        node_bearer: std::env::var("TG_NODE_TOKEN").ok().filter(|t| !t.is_empty()),
        breaker: BreakerConfig::default(),
        ..Default::default()
    })?);

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        storage.clone(),
        hot.clone(),
        proxy.breakers().clone(),
    ));

    let orchestrator = Arc::new(HttpOrchestrator::new(
        config.orchestrator.api_url.clone(),
        config.orchestrator.api_token.clone(),
    )?);
    if config.orchestrator.api_url.is_empty() {
        warn!("TG_ORCHESTRATOR_URL not set — node launches will fail until configured");
    }

    let lifecycle = Arc::new(LifecycleManager::new(
        registry.clone(),
        scheduler.clone(),
        orchestrator,
        storage.clone(),
        hot.clone(),
        bus.clone(),
    ));
    let _monitor = lifecycle.clone().spawn_monitor();

    // ── Usage accounting + billing export ─────────────────────────────────────
    let (accountant, usage_writer) =
        UsageAccountant::spawn(storage.clone(), hot.clone(), config.usage_buffer);

    if config.billing.api_url.is_empty() {
        warn!("TG_BILLING_API_URL not set — usage accrues unbilled");
    } else {
        let exporter = Arc::new(UsageExporter::new(
            storage.clone(),
            Arc::new(HttpBillingExporter::new(
                config.billing.api_url.clone(),
                config.billing.api_key.clone(),
            )?),
            bus.clone(),
            config.export_interval,
            config.export_retry_ceiling,
            config.reconcile_epsilon_tokens,
        ));
        exporter.spawn();
    }

    let audit = Arc::new(AuditLog::new(storage.clone()));
    let metrics = Arc::new(Metrics::new());

    // Billing export outcomes arrive on the bus; count them for /metrics.
    {
        let metrics = metrics.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.kind == tensorgate::events::kind::BILLING_EXPORTED {
                    Metrics::inc(&metrics.billing_exports);
                }
            }
        });
    }

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        storage,
        hot,
        bus,
        auth,
        limiter,
        registry,
        scheduler,
        proxy,
        lifecycle,
        accountant: accountant.clone(),
        audit,
        metrics,
    });

    // ── Serve until ctrl-c, then drain ────────────────────────────────────────
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received — draining");
    };
    rest::serve(ctx, shutdown).await?;

    // In-flight requests got their grace period from axum's graceful
    // shutdown; now flush the usage ingest buffer before exit.
    info!(
        grace_secs = config.shutdown_grace.as_secs(),
        "flushing usage buffer"
    );
    accountant.close();
    if tokio::time::timeout(config.shutdown_grace, usage_writer)
        .await
        .is_err()
    {
        warn!("usage writer did not drain within the grace period");
    }
    info!("tensorgated stopped");
    Ok(())
}
