// SPDX-License-Identifier: MIT
//! Pluggable node-selection strategies.
//!
//! Every strategy receives the filtered candidate set and returns the index
//! of its pick. Candidates arrive pre-sorted by node id so that strategies
//! without internal state are deterministic given identical inputs —
//! replay-based tests depend on that.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::Candidate;

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Pick one candidate index. `candidates` is never empty.
    fn pick(&self, candidates: &[Candidate]) -> usize;
}

/// Default: rank by `(active_concurrency / capacity, pending_tokens /
/// tokens_per_sec)` ascending; prefer region matches; tie-break by health
/// score descending, then node id ascending for determinism.
pub struct LeastLoaded;

impl Strategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn pick(&self, candidates: &[Candidate]) -> usize {
        let mut best = 0;
        for i in 1..candidates.len() {
            if rank_key(&candidates[i]) < rank_key(&candidates[best]) {
                best = i;
            }
        }
        best
    }
}

/// Region mismatch sorts strictly after any match; within a region class,
/// the two load ratios decide, then health, then id.
fn rank_key(c: &Candidate) -> (u8, u64, u64, i64, &str) {
    let concurrency_ratio = scaled_ratio(c.active_concurrency, c.capacity);
    let token_ratio = scaled_ratio(c.pending_tokens, c.tokens_per_sec_capacity as u64);
    (
        if c.region_match { 0 } else { 1 },
        concurrency_ratio,
        token_ratio,
        -c.node.health_score,
        c.node.id.as_str(),
    )
}

/// Fixed-point ratio (per-mille) — avoids float ordering headaches.
fn scaled_ratio(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return u64::MAX;
    }
    numerator.saturating_mul(1000) / denominator
}

/// Rotates through candidates in node-id order.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&self, candidates: &[Candidate]) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

/// Random pick weighted by health score — healthier nodes draw more traffic
/// without starving the rest.
pub struct WeightedByHealth;

impl Strategy for WeightedByHealth {
    fn name(&self) -> &'static str {
        "weighted_by_health"
    }

    fn pick(&self, candidates: &[Candidate]) -> usize {
        let total: i64 = candidates.iter().map(|c| c.node.health_score.max(1)).sum();
        let mut roll = fastrand::i64(0..total);
        for (i, c) in candidates.iter().enumerate() {
            roll -= c.node.health_score.max(1);
            if roll < 0 {
                return i;
            }
        }
        candidates.len() - 1
    }
}

/// Uniform random pick.
pub struct UniformRandom;

impl Strategy for UniformRandom {
    fn name(&self) -> &'static str {
        "uniform_random"
    }

    fn pick(&self, candidates: &[Candidate]) -> usize {
        fastrand::usize(0..candidates.len())
    }
}
