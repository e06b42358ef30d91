// SPDX-License-Identifier: MIT
//! Per-endpoint circuit breaker.
//!
//! Keyed by endpoint URL, not node id — a node rebuilt with a new URL
//! starts with a clean breaker. When an upstream starts failing repeatedly
//! the circuit opens and requests fail fast instead of waiting out timeouts.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                        │
//!   └──(probe succeeds)────────── HalfOpen ◄─(timeout elapsed)──┘
//! ```
//!
//! - **Closed**: calls are allowed; failures are counted.
//! - **Open**: calls are rejected immediately for `open_for`; then HalfOpen.
//! - **HalfOpen**: exactly one probe call is admitted. Success closes the
//!   circuit, failure reopens it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens. Default: 5
    pub failure_threshold: u32,
    /// How long the circuit stays Open before admitting a probe. Default: 30 s
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// True while the single HalfOpen probe is in flight.
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            probe_in_flight: false,
        }
    }
}

/// Thread-safe circuit breaker for one endpoint URL.
/// Cheaply cloneable — all clones share state via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: Arc<BreakerConfig>,
    endpoint: Arc<str>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner::new())),
            config: Arc::new(config),
            endpoint: Arc::from(endpoint.into().as_str()),
        }
    }

    /// Try to acquire permission for a call.
    ///
    /// - `Closed` → allowed.
    /// - `Open`   → rejected until `open_for` elapses, then the breaker
    ///   moves to `HalfOpen` and admits exactly one probe.
    /// - `HalfOpen` → rejected while the probe is in flight.
    pub async fn acquire(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed => return true,
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        return false;
                    }
                    // Fall through to claim the probe under the write lock.
                }
                CircuitState::Open => {
                    if let Some(last) = inner.last_failure {
                        if last.elapsed() < self.config.open_for {
                            return false;
                        }
                        // Timeout elapsed — fall through to upgrade.
                    } else {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;
        // Re-check after acquiring the write lock.
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|l| l.elapsed() >= self.config.open_for)
                    .unwrap_or(false);
                if elapsed {
                    info!(endpoint = %self.endpoint, "circuit breaker → HalfOpen (probe)");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Non-mutating view for the scheduler: would a call be admitted right
    /// now? Does not claim the HalfOpen probe.
    pub async fn available(&self) -> bool {
        let inner = self.inner.read().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.probe_in_flight,
            CircuitState::Open => inner
                .last_failure
                .map(|l| l.elapsed() >= self.config.open_for)
                .unwrap_or(true),
        }
    }

    /// Record a successful call. A HalfOpen probe success closes the circuit.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                info!(endpoint = %self.endpoint, "circuit breaker → Closed (recovered)");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.last_failure = None;
                inner.probe_in_flight = false;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. A HalfOpen probe failure reopens the circuit.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = inner.failure_count,
                        "circuit breaker → Open (threshold reached)"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(endpoint = %self.endpoint, "circuit breaker → Open (probe failed)");
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }
}

/// Registry of breakers keyed by endpoint URL.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub async fn for_endpoint(&self, endpoint: &str) -> CircuitBreaker {
        {
            let map = self.breakers.read().await;
            if let Some(b) = map.get(endpoint) {
                return b.clone();
            }
        }
        let mut map = self.breakers.write().await;
        map.entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(endpoint, self.config.clone()))
            .clone()
    }

    /// Scheduler-side filter: false when the endpoint's circuit currently
    /// rejects calls.
    pub async fn endpoint_available(&self, endpoint: &str) -> bool {
        let map = self.breakers.read().await;
        match map.get(endpoint) {
            Some(b) => b.available().await,
            None => true,
        }
    }
}
