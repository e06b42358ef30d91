// SPDX-License-Identifier: MIT
//! Hot-State Store — in-process TTL key/value engine.
//!
//! Holds everything ephemeral: rate-limit window counters, concurrency
//! gauges, node launch-log buffers, and webhook dedup markers. Keys follow
//! the namespaced layout used across the control plane:
//!
//! ```text
//! ratelimit:{layer}:{id}:{window}
//! scheduler:nodes:{id}:concurrency
//! scheduler:nodes:{id}:pending_tokens
//! node_logs:{id}
//! notification:processed:{event_id}
//! ```
//!
//! All state here is rebuildable from the Durable Store; losing it costs at
//! most one rate-limit window of accuracy. Counter mutations are atomic
//! multi-operations under one lock: increment, set TTL on first write, read
//! the new value, compare against the limit — on violation nothing commits.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Hot-store failures. The in-process engine itself cannot go away, but the
/// API stays fallible so callers (the rate limiter's fail-closed path) treat
/// the store as the external dependency it is in larger deployments.
#[derive(Debug, Error)]
pub enum HotError {
    #[error("hot store unavailable: {0}")]
    Unavailable(String),
    #[error("key {0} holds a different value type")]
    WrongType(String),
}

/// Outcome of a limit-checked increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrOutcome {
    /// Whether the increment was committed.
    pub admitted: bool,
    /// Counter value after the operation (unchanged when refused).
    pub value: u64,
    /// Seconds until the key expires (window reset).
    pub reset_secs: u64,
}

#[derive(Debug)]
enum Slot {
    Counter(u64),
    List(Vec<Value>),
    Marker,
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// In-process TTL store. Cheaply cloneable — clones share state via `Arc`.
#[derive(Clone, Debug)]
pub struct HotStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Default for HotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HotStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Atomic limit-checked increment.
    ///
    /// Adds `delta` to the counter at `key`, setting `ttl` on first write.
    /// If the incremented value would exceed `limit`, nothing is committed
    /// and the pre-existing value is reported. A value landing exactly on
    /// the limit is admitted (remaining=1 admits, remaining=0 refuses).
    pub async fn incr_check(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
        limit: u64,
    ) -> Result<IncrOutcome, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        let entry = live_entry(&mut map, key, now);

        match entry {
            Some(e) => {
                let cur = match &mut e.slot {
                    Slot::Counter(v) => v,
                    _ => return Err(HotError::WrongType(key.to_string())),
                };
                let reset_secs = secs_until(e.expires_at, now);
                let candidate = cur.saturating_add(delta);
                if candidate > limit {
                    return Ok(IncrOutcome {
                        admitted: false,
                        value: *cur,
                        reset_secs,
                    });
                }
                *cur = candidate;
                Ok(IncrOutcome {
                    admitted: true,
                    value: candidate,
                    reset_secs,
                })
            }
            None => {
                if delta > limit {
                    return Ok(IncrOutcome {
                        admitted: false,
                        value: 0,
                        reset_secs: 0,
                    });
                }
                let expires_at = now + chrono_ttl(ttl);
                map.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Counter(delta),
                        expires_at,
                    },
                );
                Ok(IncrOutcome {
                    admitted: true,
                    value: delta,
                    reset_secs: ttl.as_secs(),
                })
            }
        }
    }

    /// Unconditional increment (no limit). Sets `ttl` on first write.
    pub async fn incr(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        match live_entry(&mut map, key, now) {
            Some(e) => match &mut e.slot {
                Slot::Counter(v) => {
                    *v = v.saturating_add(delta);
                    Ok(*v)
                }
                _ => Err(HotError::WrongType(key.to_string())),
            },
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Counter(delta),
                        expires_at: now + chrono_ttl(ttl),
                    },
                );
                Ok(delta)
            }
        }
    }

    /// Decrement clamped at zero — the self-healing floor for concurrency
    /// gauges whose increment half was lost to a restart or expiry.
    pub async fn decr_clamped(&self, key: &str, delta: u64) -> Result<u64, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        match live_entry(&mut map, key, now) {
            Some(e) => match &mut e.slot {
                Slot::Counter(v) => {
                    *v = v.saturating_sub(delta);
                    Ok(*v)
                }
                _ => Err(HotError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }

    /// Signed adjustment used for estimate-vs-actual reconciliation.
    /// Negative deltas clamp at zero; the key's TTL is left untouched.
    pub async fn adjust(&self, key: &str, delta: i64, ttl: Duration) -> Result<u64, HotError> {
        if delta >= 0 {
            self.incr(key, delta as u64, ttl).await
        } else {
            self.decr_clamped(key, delta.unsigned_abs()).await
        }
    }

    /// Current counter value and seconds to reset, if the key is live.
    pub async fn counter(&self, key: &str) -> Result<Option<(u64, u64)>, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        match live_entry(&mut map, key, now) {
            Some(e) => match &e.slot {
                Slot::Counter(v) => Ok(Some((*v, secs_until(e.expires_at, now)))),
                _ => Err(HotError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    /// Append a JSON value to the ordered list at `key`.
    ///
    /// The list is append-only; `ttl` is applied on first write and refreshed
    /// on every append (a live log stream keeps its buffer alive). Returns
    /// the index of the appended entry.
    pub async fn list_append(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<usize, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        match live_entry(&mut map, key, now) {
            Some(e) => match &mut e.slot {
                Slot::List(items) => {
                    items.push(value);
                    e.expires_at = now + chrono_ttl(ttl);
                    Ok(items.len() - 1)
                }
                _ => Err(HotError::WrongType(key.to_string())),
            },
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::List(vec![value]),
                        expires_at: now + chrono_ttl(ttl),
                    },
                );
                Ok(0)
            }
        }
    }

    /// Read list entries starting at `from` (0 = everything).
    pub async fn list_from(&self, key: &str, from: usize) -> Result<Vec<Value>, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        match live_entry(&mut map, key, now) {
            Some(e) => match &e.slot {
                Slot::List(items) => Ok(items.iter().skip(from).cloned().collect()),
                _ => Err(HotError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    /// Read the last `n` list entries (the whole list when `n` covers it).
    pub async fn list_tail(&self, key: &str, n: usize) -> Result<Vec<Value>, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        match live_entry(&mut map, key, now) {
            Some(e) => match &e.slot {
                Slot::List(items) => {
                    let start = items.len().saturating_sub(n);
                    Ok(items[start..].to_vec())
                }
                _ => Err(HotError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    /// Set-if-absent marker used for idempotent webhook processing.
    /// Returns `true` if the marker was newly set, `false` if already present.
    pub async fn mark_once(&self, key: &str, ttl: Duration) -> Result<bool, HotError> {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        if live_entry(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Marker,
                expires_at: now + chrono_ttl(ttl),
            },
        );
        Ok(true)
    }

    /// Drop a key outright (used by tests and drain cleanup).
    pub async fn remove(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }

    /// Evict every expired entry. Called by the background sweeper.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, e| e.live(now));
        before - map.len()
    }

    /// Spawn the periodic expiry sweeper.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = store.sweep().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "hot store sweep");
                }
            }
        })
    }
}

/// Look up `key`, dropping it first if expired. Returns a live entry only.
fn live_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| !e.live(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn secs_until(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expires_at - now).num_seconds().max(0) as u64
}

fn chrono_ttl(ttl: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(ttl.as_millis() as i64)
}

// ─── Key builders ─────────────────────────────────────────────────────────────

/// `ratelimit:{layer}:{id}:{window}` — window-bucketed counters.
pub fn ratelimit_key(layer: &str, id: &str, window: i64) -> String {
    format!("ratelimit:{layer}:{id}:{window}")
}

pub fn node_concurrency_key(node_id: &str) -> String {
    format!("scheduler:nodes:{node_id}:concurrency")
}

pub fn node_pending_tokens_key(node_id: &str) -> String {
    format!("scheduler:nodes:{node_id}:pending_tokens")
}

pub fn node_logs_key(node_id: &str) -> String {
    format!("node_logs:{node_id}")
}

pub fn processed_event_key(event_id: &str) -> String {
    format!("notification:processed:{event_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn incr_check_admits_up_to_limit() {
        let store = HotStore::new();
        for i in 1..=5 {
            let out = store.incr_check("k", 1, TTL, 5).await.unwrap();
            assert!(out.admitted, "increment {i} should be admitted");
            assert_eq!(out.value, i);
        }
        // remaining = 0 → refused, value unchanged.
        let out = store.incr_check("k", 1, TTL, 5).await.unwrap();
        assert!(!out.admitted);
        assert_eq!(out.value, 5);
    }

    #[tokio::test]
    async fn refused_increment_commits_nothing() {
        let store = HotStore::new();
        store.incr_check("k", 3, TTL, 10).await.unwrap();
        let refused = store.incr_check("k", 20, TTL, 10).await.unwrap();
        assert!(!refused.admitted);
        let (value, _) = store.counter("k").await.unwrap().unwrap();
        assert_eq!(value, 3, "refused increment must not commit");
    }

    #[tokio::test]
    async fn exact_boundary_is_admitted() {
        let store = HotStore::new();
        store.incr_check("k", 9, TTL, 10).await.unwrap();
        // remaining = 1 → admitted.
        let out = store.incr_check("k", 1, TTL, 10).await.unwrap();
        assert!(out.admitted);
        assert_eq!(out.value, 10);
    }

    #[tokio::test]
    async fn decrement_clamps_at_zero() {
        let store = HotStore::new();
        store.incr("gauge", 2, TTL).await.unwrap();
        assert_eq!(store.decr_clamped("gauge", 5).await.unwrap(), 0);
        // Decrementing a missing key is also zero, not an error.
        assert_eq!(store.decr_clamped("missing", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_counter_reads_as_absent() {
        let store = HotStore::new();
        store
            .incr("short", 1, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.counter("short").await.unwrap().is_none());
        // A fresh window starts clean.
        let out = store.incr_check("short", 1, TTL, 5).await.unwrap();
        assert_eq!(out.value, 1);
    }

    #[tokio::test]
    async fn list_append_preserves_order() {
        let store = HotStore::new();
        for i in 0..4 {
            store
                .list_append("logs", json!({ "seq": i }), TTL)
                .await
                .unwrap();
        }
        let all = store.list_from("logs", 0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0]["seq"], 0);
        assert_eq!(all[3]["seq"], 3);

        let tail = store.list_tail("logs", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0]["seq"], 2);

        let since = store.list_from("logs", 3).await.unwrap();
        assert_eq!(since.len(), 1);
    }

    #[tokio::test]
    async fn mark_once_is_idempotent() {
        let store = HotStore::new();
        assert!(store.mark_once("evt:1", TTL).await.unwrap());
        assert!(!store.mark_once("evt:1", TTL).await.unwrap());
        assert!(store.mark_once("evt:2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired() {
        let store = HotStore::new();
        store
            .incr("dead", 1, Duration::from_millis(5))
            .await
            .unwrap();
        store.incr("live", 1, TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.sweep().await, 1);
        assert!(store.counter("live").await.unwrap().is_some());
    }
}
