use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOG: &str = "info";
const DEFAULT_GLOBAL_RPM: u64 = 10_000;
const DEFAULT_GLOBAL_TPM: u64 = 10_000_000;
const DEFAULT_GLOBAL_CONCURRENCY: u64 = 2_000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_AUTH_CACHE_TTL_SECS: u64 = 60;
const DEFAULT_EXPORT_INTERVAL_SECS: u64 = 60;
const DEFAULT_EXPORT_RETRY_CEILING: u32 = 8;
const DEFAULT_USAGE_BUFFER: usize = 4096;
const DEFAULT_RECONCILE_EPSILON_TOKENS: i64 = 1_000;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP listen port (default: 8080).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,tensorgate=trace".
    log: Option<String>,
    /// SQLite database path (default: `{data_dir}/tensorgate.db`).
    database_path: Option<PathBuf>,
    /// Global admission layer: requests per minute.
    global_rpm: Option<u64>,
    /// Global admission layer: tokens per minute.
    global_tpm: Option<u64>,
    /// Global admission layer: concurrent in-flight requests.
    global_concurrency: Option<u64>,
    /// Seconds granted to in-flight requests on shutdown.
    shutdown_grace_secs: Option<u64>,
    /// Authenticator cache entry TTL, capped at 60 s.
    auth_cache_ttl_secs: Option<u64>,
    /// Billing export loop interval.
    export_interval_secs: Option<u64>,
    /// Maximum retry attempts for a failed billing export.
    export_retry_ceiling: Option<u32>,
    /// Usage-record ingest buffer size before back-pressure kicks in.
    usage_buffer: Option<usize>,
    /// Token diff tolerated by the daily reconciliation sweep.
    reconcile_epsilon_tokens: Option<i64>,
    /// Liveness schedule overrides.
    liveness: Option<TomlLiveness>,
}

#[derive(Deserialize, Default)]
struct TomlLiveness {
    heartbeat_timeout_secs: Option<u64>,
    dead_after_secs: Option<u64>,
    drain_deadline_secs: Option<u64>,
    unhealthy_probe_count: Option<u32>,
    recovery_probe_count: Option<u32>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Sub-configs ──────────────────────────────────────────────────────────────

/// The single canonical liveness schedule. Every deadline the registry,
/// lifecycle manager, and scheduler consult lives here.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// No heartbeat for this long → `unhealthy`.
    pub heartbeat_timeout: Duration,
    /// `unhealthy` with continued silence for this long → `dead`.
    pub dead_after: Duration,
    /// `draining` nodes are terminated after this deadline even with
    /// requests still in flight.
    pub drain_deadline: Duration,
    /// Consecutive probes with health score < 50 before `unhealthy`.
    pub unhealthy_probe_count: u32,
    /// Consecutive healthy probes required to re-enter `active`.
    pub recovery_probe_count: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(15),
            dead_after: Duration::from_secs(60),
            drain_deadline: Duration::from_secs(120),
            unhealthy_probe_count: 3,
            recovery_probe_count: 2,
        }
    }
}

/// Billing provider endpoint + credentials (`TG_BILLING_*`).
#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    /// Metered-billing provider base URL. Empty disables export (records
    /// accumulate unbilled; the export loop logs and idles).
    pub api_url: String,
    pub api_key: String,
    /// Shared secret for inbound webhook signature verification.
    pub webhook_secret: String,
}

/// Cloud-orchestration engine endpoint (`TG_ORCHESTRATOR_*`).
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub api_url: String,
    pub api_token: String,
}

// ─── ControlPlaneConfig ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Admin token (`TG_ADMIN_TOKEN`). Guards the whole /admin surface;
    /// compared in constant time. Empty disables the admin surface.
    pub admin_token: String,
    pub billing: BillingConfig,
    pub orchestrator: OrchestratorConfig,
    pub liveness: LivenessConfig,
    pub global_rpm: u64,
    pub global_tpm: u64,
    pub global_concurrency: u64,
    pub shutdown_grace: Duration,
    pub auth_cache_ttl: Duration,
    pub export_interval: Duration,
    pub export_retry_ceiling: u32,
    pub usage_buffer: usize,
    pub reconcile_epsilon_tokens: i64,
}

impl ControlPlaneConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        admin_token: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| DEFAULT_LOG.to_string());
        let database_path = toml
            .database_path
            .unwrap_or_else(|| data_dir.join("tensorgate.db"));

        // The admin token only comes from CLI/env — a TOML-readable admin
        // credential would widen the file-permission attack surface.
        let admin_token = admin_token
            .or_else(|| std::env::var("TG_ADMIN_TOKEN").ok())
            .filter(|t| !t.is_empty())
            .unwrap_or_default();

        let billing = BillingConfig {
            api_url: env_or_default("TG_BILLING_API_URL"),
            api_key: env_or_default("TG_BILLING_API_KEY"),
            webhook_secret: env_or_default("TG_BILLING_WEBHOOK_SECRET"),
        };

        let orchestrator = OrchestratorConfig {
            api_url: env_or_default("TG_ORCHESTRATOR_URL"),
            api_token: env_or_default("TG_ORCHESTRATOR_TOKEN"),
        };

        let tl = toml.liveness.unwrap_or_default();
        let defaults = LivenessConfig::default();
        let liveness = LivenessConfig {
            heartbeat_timeout: tl
                .heartbeat_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            dead_after: tl
                .dead_after_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.dead_after),
            drain_deadline: tl
                .drain_deadline_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_deadline),
            unhealthy_probe_count: tl
                .unhealthy_probe_count
                .unwrap_or(defaults.unhealthy_probe_count),
            recovery_probe_count: tl
                .recovery_probe_count
                .unwrap_or(defaults.recovery_probe_count),
        };

        Self {
            port,
            data_dir,
            log,
            database_path,
            admin_token,
            billing,
            orchestrator,
            liveness,
            global_rpm: toml.global_rpm.unwrap_or(DEFAULT_GLOBAL_RPM),
            global_tpm: toml.global_tpm.unwrap_or(DEFAULT_GLOBAL_TPM),
            global_concurrency: toml
                .global_concurrency
                .unwrap_or(DEFAULT_GLOBAL_CONCURRENCY),
            shutdown_grace: Duration::from_secs(
                toml.shutdown_grace_secs.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            auth_cache_ttl: Duration::from_secs(
                toml.auth_cache_ttl_secs
                    .unwrap_or(DEFAULT_AUTH_CACHE_TTL_SECS)
                    .min(DEFAULT_AUTH_CACHE_TTL_SECS),
            ),
            export_interval: Duration::from_secs(
                toml.export_interval_secs
                    .unwrap_or(DEFAULT_EXPORT_INTERVAL_SECS),
            ),
            export_retry_ceiling: toml
                .export_retry_ceiling
                .unwrap_or(DEFAULT_EXPORT_RETRY_CEILING),
            usage_buffer: toml.usage_buffer.unwrap_or(DEFAULT_USAGE_BUFFER),
            reconcile_epsilon_tokens: toml
                .reconcile_epsilon_tokens
                .unwrap_or(DEFAULT_RECONCILE_EPSILON_TOKENS),
        }
    }
}

fn env_or_default(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TG_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs_fallback().join("tensorgate")
}

fn dirs_fallback() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share");
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml() {
        let cfg = ControlPlaneConfig::new(
            None,
            Some(std::env::temp_dir().join("tg-config-test-nonexistent")),
            None,
            Some("admintoken".to_string()),
        );
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.liveness.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(cfg.liveness.dead_after, Duration::from_secs(60));
        assert_eq!(cfg.liveness.drain_deadline, Duration::from_secs(120));
        assert_eq!(cfg.admin_token, "admintoken");
    }

    #[test]
    fn cli_overrides_defaults() {
        let cfg = ControlPlaneConfig::new(
            Some(9000),
            Some(std::env::temp_dir().join("tg-config-test-nonexistent")),
            Some("debug".to_string()),
            None,
        );
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn auth_cache_ttl_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "auth_cache_ttl_secs = 600\n",
        )
        .unwrap();
        let cfg = ControlPlaneConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.auth_cache_ttl, Duration::from_secs(60));
    }
}
