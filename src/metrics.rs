// SPDX-License-Identifier: MIT
//! In-process counters exposed as `GET /metrics` in Prometheus text format.
//! No external library needed — all counters are `AtomicU64` incremented
//! inline on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Control-plane performance counters shared across all requests.
#[derive(Debug)]
pub struct Metrics {
    /// Total inference requests received since start.
    pub requests_total: AtomicU64,
    /// Requests refused by authentication.
    pub auth_failures: AtomicU64,
    /// Requests refused by an admission layer.
    pub rate_limited_total: AtomicU64,
    /// Requests that found no routable node.
    pub no_capacity_total: AtomicU64,
    /// Upstream forwarding failures (after retries).
    pub upstream_failures: AtomicU64,
    /// Usage records handed to the accountant.
    pub usage_records: AtomicU64,
    /// Billing export passes that marked at least one record.
    pub billing_exports: AtomicU64,
    /// Heartbeats ingested from node agents.
    pub heartbeats_total: AtomicU64,
    pub started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            no_capacity_total: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
            usage_records: AtomicU64::new(0),
            billing_exports: AtomicU64::new(0),
            heartbeats_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::with_capacity(1024);
        let counters: [(&str, &str, &AtomicU64); 8] = [
            (
                "tensorgate_requests_total",
                "Inference requests received",
                &self.requests_total,
            ),
            (
                "tensorgate_auth_failures_total",
                "Requests refused by authentication",
                &self.auth_failures,
            ),
            (
                "tensorgate_rate_limited_total",
                "Requests refused by admission control",
                &self.rate_limited_total,
            ),
            (
                "tensorgate_no_capacity_total",
                "Requests with no routable node",
                &self.no_capacity_total,
            ),
            (
                "tensorgate_upstream_failures_total",
                "Upstream forwarding failures after retries",
                &self.upstream_failures,
            ),
            (
                "tensorgate_usage_records_total",
                "Usage records enqueued for persistence",
                &self.usage_records,
            ),
            (
                "tensorgate_billing_exports_total",
                "Billing export passes with records billed",
                &self.billing_exports,
            ),
            (
                "tensorgate_heartbeats_total",
                "Heartbeats ingested from node agents",
                &self.heartbeats_total,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.load(Ordering::Relaxed));
        }
        let _ = writeln!(out, "# HELP tensorgate_uptime_seconds Seconds since process start");
        let _ = writeln!(out, "# TYPE tensorgate_uptime_seconds gauge");
        let _ = writeln!(
            out,
            "tensorgate_uptime_seconds {}",
            self.started_at.elapsed().as_secs()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_text() {
        let m = Metrics::new();
        Metrics::inc(&m.requests_total);
        Metrics::inc(&m.requests_total);
        Metrics::inc(&m.rate_limited_total);

        let text = m.render();
        assert!(text.contains("tensorgate_requests_total 2"));
        assert!(text.contains("tensorgate_rate_limited_total 1"));
        assert!(text.contains("# TYPE tensorgate_requests_total counter"));
        assert!(text.contains("tensorgate_uptime_seconds"));
    }
}
