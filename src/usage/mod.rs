// SPDX-License-Identifier: MIT
//! Usage Accountant — persistence, aggregation, export, reconciliation.
//!
//! Ingest is fire-and-forget from the request path: drafts go into a
//! bounded queue and a writer task persists them. A full queue falls back
//! to synchronous persistence (back-pressure) so records are never dropped.
//!
//! A periodic export job groups unbilled records by (tenant, model),
//! converts each group into one metered-billing increment with a
//! deterministic idempotency key, and marks the covered records billed in
//! one transaction. Failures set `billing_failed` and count retries up to a
//! ceiling; a daily reconciliation sweep compares our billed totals against
//! the provider's per tenant and alerts above an epsilon.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::billing::{idempotency_key, BillingExporter, MeterIncrement};
use crate::events::{kind, EventBus};
use crate::hot::HotStore;
use crate::storage::usage::{UsageDraft, UsageRecordRow};
use crate::storage::{ModelRow, Storage};

/// Advisory short-horizon counters live twice their window.
const MINUTE_TTL: Duration = Duration::from_secs(120);
const DAY_TTL: Duration = Duration::from_secs(2 * 86_400);

/// Cost of one request in integer microdollars, from the model's per-million
/// token prices.
pub fn compute_cost(model: &ModelRow, prompt_tokens: u64, completion_tokens: u64) -> i64 {
    let input = model.input_price_per_mtok as i128 * prompt_tokens as i128 / 1_000_000;
    let output = model.output_price_per_mtok as i128 * completion_tokens as i128 / 1_000_000;
    (input + output) as i64
}

/// Ingest handle — cheap to clone into every request task.
#[derive(Clone)]
pub struct UsageAccountant {
    tx: mpsc::Sender<UsageDraft>,
    storage: Storage,
    hot: HotStore,
}

impl UsageAccountant {
    /// Spawn the writer task; returns the handle plus the writer's join
    /// handle (awaited during graceful shutdown, after the sender side has
    /// been dropped).
    pub fn spawn(storage: Storage, hot: HotStore, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageDraft>(buffer.max(1));
        let writer_storage = storage.clone();
        let writer_hot = hot.clone();
        let handle = tokio::spawn(async move {
            while let Some(draft) = rx.recv().await {
                persist(&writer_storage, &writer_hot, &draft).await;
            }
            debug!("usage writer drained and stopped");
        });
        (
            Self { tx, storage, hot },
            handle,
        )
    }

    /// Queue a record. Guaranteed to be enqueued (or persisted) before this
    /// returns: when the buffer is full the write happens synchronously.
    pub async fn record(&self, draft: UsageDraft) {
        match self.tx.try_send(draft) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(draft)) => {
                warn!("usage ingest buffer full — persisting synchronously");
                persist(&self.storage, &self.hot, &draft).await;
            }
            Err(mpsc::error::TrySendError::Closed(draft)) => {
                // Shutdown path: the writer is gone, write directly.
                persist(&self.storage, &self.hot, &draft).await;
            }
        }
    }

    /// Drop the ingest sender so the writer task can drain and exit.
    pub fn close(self) {}
}

async fn persist(storage: &Storage, hot: &HotStore, draft: &UsageDraft) {
    if let Err(e) = storage.insert_usage(draft).await {
        error!(err = %e, tenant = %draft.tenant_id, "usage record insert failed");
        return;
    }

    // Advisory short-horizon counters; ground truth stays in the store.
    let total = draft.total_tokens();
    let now = Utc::now().timestamp();
    let minute = now / 60;
    let day = now / 86_400;
    for (scope, id) in [
        ("key", draft.api_key_id.as_str()),
        ("env", draft.environment_id.as_str()),
        ("tenant", draft.tenant_id.as_str()),
    ] {
        let _ = hot
            .incr(&format!("usage:{scope}:{id}:minute:{minute}"), total, MINUTE_TTL)
            .await;
        let _ = hot
            .incr(&format!("usage:{scope}:{id}:day:{day}"), total, DAY_TTL)
            .await;
    }
}

/// The periodic export + reconciliation machinery.
pub struct UsageExporter {
    storage: Storage,
    exporter: Arc<dyn BillingExporter>,
    bus: EventBus,
    pub export_interval: Duration,
    pub retry_ceiling: u32,
    pub reconcile_epsilon_tokens: i64,
}

impl UsageExporter {
    pub fn new(
        storage: Storage,
        exporter: Arc<dyn BillingExporter>,
        bus: EventBus,
        export_interval: Duration,
        retry_ceiling: u32,
        reconcile_epsilon_tokens: i64,
    ) -> Self {
        Self {
            storage,
            exporter,
            bus,
            export_interval,
            retry_ceiling,
            reconcile_epsilon_tokens,
        }
    }

    /// One export pass. Returns the number of records marked billed.
    pub async fn export_once(&self) -> anyhow::Result<u64> {
        let window_end = Utc::now();
        let rows = self
            .storage
            .unbilled_before(window_end, self.retry_ceiling)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        // Group by (tenant, model). BTreeMap keeps export order stable.
        let mut groups: BTreeMap<(String, String), Vec<UsageRecordRow>> = BTreeMap::new();
        for row in rows {
            groups
                .entry((row.tenant_id.clone(), row.model_id.clone()))
                .or_default()
                .push(row);
        }

        let mut billed = 0u64;
        for ((tenant_id, model_id), records) in groups {
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();

            let customer = match self.storage.get_tenant(&tenant_id).await? {
                Some(t) => t.billing_customer_id,
                None => None,
            };
            let Some(external_customer_id) = customer else {
                debug!(tenant = %tenant_id, "no billing customer id — deferring export");
                self.storage.mark_export_failed(&ids).await?;
                continue;
            };

            // Window boundaries come from the record set itself so a replay
            // of the same set produces the same idempotency key.
            let (window_start, window_end) = record_window(&records);
            let quantity: u64 = records.iter().map(|r| r.total_tokens.max(0) as u64).sum();
            let model_name = self
                .storage
                .get_model(&model_id)
                .await?
                .map(|m| m.name)
                .unwrap_or_else(|| model_id.clone());

            let increment = MeterIncrement {
                idempotency_key: idempotency_key(&tenant_id, &model_id, window_start, window_end),
                external_customer_id,
                model_name,
                quantity_tokens: quantity,
                window_start,
                window_end,
            };

            match self.exporter.record_increment(&increment).await {
                Ok(()) => {
                    let flipped = self.storage.mark_billed(&ids).await?;
                    billed += flipped;
                    self.bus.publish(
                        kind::BILLING_EXPORTED,
                        json!({
                            "tenant_id": tenant_id,
                            "model_id": model_id,
                            "records": ids.len(),
                            "tokens": quantity,
                        }),
                    );
                }
                Err(e) => {
                    warn!(tenant = %tenant_id, model = %model_id, err = %e, "billing export failed");
                    self.storage.mark_export_failed(&ids).await?;
                    self.bus.publish(
                        kind::BILLING_EXPORT_FAILED,
                        json!({
                            "tenant_id": tenant_id,
                            "model_id": model_id,
                            "records": ids.len(),
                            "error": e.to_string(),
                        }),
                    );
                }
            }
        }
        Ok(billed)
    }

    /// Daily reconciliation: compare our billed totals with the provider's
    /// per tenant; a diff above epsilon raises an alert event.
    pub async fn reconcile_once(&self) -> anyhow::Result<u32> {
        let since = Utc::now() - ChronoDuration::days(1);
        let mut alerts = 0;

        let stuck = self.storage.stuck_failed_count(self.retry_ceiling).await?;
        if stuck > 0 {
            error!(stuck, "usage records stuck past the export retry ceiling");
        }

        for ours in self.storage.billed_totals_by_tenant(since).await? {
            let Some(tenant) = self.storage.get_tenant(&ours.tenant_id).await? else {
                continue;
            };
            let Some(customer) = tenant.billing_customer_id else {
                continue;
            };
            let theirs = match self.exporter.customer_total_since(&customer, since).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(tenant = %ours.tenant_id, err = %e, "provider total unavailable");
                    continue;
                }
            };
            let diff = (ours.total_tokens - theirs).abs();
            if diff > self.reconcile_epsilon_tokens {
                alerts += 1;
                error!(
                    tenant = %ours.tenant_id,
                    ours = ours.total_tokens,
                    theirs,
                    diff,
                    "billing reconciliation diff above epsilon"
                );
                self.bus.publish(
                    kind::BILLING_RECONCILIATION_ALERT,
                    json!({
                        "tenant_id": ours.tenant_id,
                        "our_total": ours.total_tokens,
                        "provider_total": theirs,
                        "diff": diff,
                    }),
                );
            }
        }
        Ok(alerts)
    }

    /// Spawn the export loop and the daily reconciliation loop.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let exporter = self.clone();
        let export = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(exporter.export_interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                match exporter.export_once().await {
                    Ok(n) if n > 0 => info!(records = n, "billing export complete"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "billing export pass failed"),
                }
            }
        });

        let reconciler = self;
        let reconcile = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match reconciler.reconcile_once().await {
                    Ok(0) => {}
                    Ok(alerts) => warn!(alerts, "reconciliation raised alerts"),
                    Err(e) => warn!(err = %e, "reconciliation pass failed"),
                }
            }
        });
        (export, reconcile)
    }
}

/// Deterministic window for a record group: (earliest, latest) timestamps.
fn record_window(records: &[UsageRecordRow]) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut start = Utc::now();
    let mut end = DateTime::<Utc>::MIN_UTC;
    for r in records {
        if let Ok(at) = DateTime::parse_from_rfc3339(&r.at) {
            let at = at.with_timezone(&Utc);
            if at < start {
                start = at;
            }
            if at > end {
                end = at;
            }
        }
    }
    if end < start {
        end = start;
    }
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every increment; optionally fails the first N calls.
    struct FakeBilling {
        increments: Mutex<Vec<MeterIncrement>>,
        fail_next: Mutex<u32>,
        provider_total: Mutex<i64>,
    }

    impl FakeBilling {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                increments: Mutex::new(Vec::new()),
                fail_next: Mutex::new(0),
                provider_total: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl BillingExporter for FakeBilling {
        async fn record_increment(&self, increment: &MeterIncrement) -> anyhow::Result<()> {
            {
                let mut fail = self.fail_next.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    anyhow::bail!("provider unavailable");
                }
            }
            let mut incs = self.increments.lock().unwrap();
            // Provider-side idempotency: duplicate keys are dropped.
            if !incs
                .iter()
                .any(|i| i.idempotency_key == increment.idempotency_key)
            {
                *self.provider_total.lock().unwrap() += increment.quantity_tokens as i64;
                incs.push(increment.clone());
            }
            Ok(())
        }

        async fn customer_total_since(
            &self,
            _external_customer_id: &str,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<i64> {
            Ok(*self.provider_total.lock().unwrap())
        }
    }

    async fn seeded_storage() -> (Storage, String, String) {
        let storage = Storage::in_memory().await.unwrap();
        let tenant = storage
            .create_tenant("acme", "bill@acme.test", "serverless", Some("cus_123"))
            .await
            .unwrap();
        let model = storage
            .create_model("m-chat", "llama", "8b", "chat", 8192, 16, 500, 1500, &json!({}))
            .await
            .unwrap();
        (storage, tenant.id, model.id)
    }

    fn draft(tenant: &str, model: &str, prompt: u64, completion: u64) -> UsageDraft {
        UsageDraft {
            tenant_id: tenant.to_string(),
            environment_id: "env".to_string(),
            api_key_id: "key".to_string(),
            region_code: "us-east".to_string(),
            model_id: model.to_string(),
            node_id: None,
            prompt_tokens: prompt,
            completion_tokens: completion,
            latency_ms: 10,
            cost_microdollars: 0,
        }
    }

    fn exporter(storage: Storage, billing: Arc<FakeBilling>) -> UsageExporter {
        UsageExporter::new(
            storage,
            billing,
            EventBus::new(),
            Duration::from_secs(60),
            3,
            1_000,
        )
    }

    #[tokio::test]
    async fn accountant_persists_through_the_queue() {
        let (storage, tenant, model) = seeded_storage().await;
        let (accountant, writer) = UsageAccountant::spawn(storage.clone(), HotStore::new(), 16);
        accountant.record(draft(&tenant, &model, 10, 20)).await;
        accountant.close();
        writer.await.unwrap();

        let rows = storage
            .unbilled_before(Utc::now() + ChronoDuration::seconds(1), 8)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_tokens, 30);
    }

    #[tokio::test]
    async fn stalled_writer_falls_back_to_synchronous_writes() {
        let (storage, tenant, model) = seeded_storage().await;
        let (accountant, writer) = UsageAccountant::spawn(storage.clone(), HotStore::new(), 1);
        // Kill the writer: the queue can no longer drain, so every record
        // must take the synchronous path before `record` returns.
        writer.abort();
        let _ = writer.await;

        for _ in 0..3 {
            accountant.record(draft(&tenant, &model, 1, 1)).await;
        }
        let rows = storage
            .unbilled_before(Utc::now() + ChronoDuration::seconds(1), 8)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3, "back-pressure must persist synchronously");
    }

    #[tokio::test]
    async fn export_groups_and_marks_billed() {
        let (storage, tenant, model) = seeded_storage().await;
        for _ in 0..3 {
            storage.insert_usage(&draft(&tenant, &model, 100, 50)).await.unwrap();
        }
        let billing = FakeBilling::new();
        let ex = exporter(storage.clone(), billing.clone());

        let billed = ex.export_once().await.unwrap();
        assert_eq!(billed, 3);

        let incs = billing.increments.lock().unwrap();
        assert_eq!(incs.len(), 1, "one increment per (tenant, model)");
        assert_eq!(incs[0].quantity_tokens, 450);
        assert_eq!(incs[0].external_customer_id, "cus_123");
        drop(incs);

        // Nothing left to export.
        assert_eq!(ex.export_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replayed_export_does_not_double_charge() {
        let (storage, tenant, model) = seeded_storage().await;
        storage.insert_usage(&draft(&tenant, &model, 100, 100)).await.unwrap();
        let billing = FakeBilling::new();

        // First pass: provider records the increment but we "lose" the ack —
        // simulate by failing after the provider processed it. Here we model
        // the replay at the key level: run export twice against a store
        // where mark_billed was rolled back.
        let ex = exporter(storage.clone(), billing.clone());
        ex.export_once().await.unwrap();
        sqlx::query("UPDATE usage_records SET billed = 0")
            .execute(&storage.pool())
            .await
            .unwrap();
        ex.export_once().await.unwrap();

        // Identical record set → identical idempotency key → one increment.
        assert_eq!(*billing.provider_total.lock().unwrap(), 200);
    }

    #[tokio::test]
    async fn failed_export_counts_retries_and_succeeds_later() {
        let (storage, tenant, model) = seeded_storage().await;
        storage.insert_usage(&draft(&tenant, &model, 10, 10)).await.unwrap();
        let billing = FakeBilling::new();
        *billing.fail_next.lock().unwrap() = 1;
        let ex = exporter(storage.clone(), billing.clone());

        assert_eq!(ex.export_once().await.unwrap(), 0);
        let rows = storage
            .unbilled_before(Utc::now() + ChronoDuration::seconds(1), 8)
            .await
            .unwrap();
        assert_eq!(rows[0].billing_failed, 1);
        assert_eq!(rows[0].retry_count, 1);

        // Next pass succeeds and retry_count stays ≤ 1.
        assert_eq!(ex.export_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconciliation_alerts_on_large_diff() {
        let (storage, tenant, model) = seeded_storage().await;
        let id = storage.insert_usage(&draft(&tenant, &model, 5000, 5000)).await.unwrap();
        storage.mark_billed(&[id]).await.unwrap();

        // Provider saw nothing — a 10k-token diff, well past epsilon.
        let billing = FakeBilling::new();
        let ex = exporter(storage, billing);
        assert_eq!(ex.reconcile_once().await.unwrap(), 1);
    }

    #[test]
    fn cost_computation() {
        let model = ModelRow {
            id: "m".into(),
            name: "m".into(),
            family: String::new(),
            size_tag: String::new(),
            model_type: "chat".into(),
            context_length: 8192,
            vram_gb: 16,
            input_price_per_mtok: 500_000,  // $0.50 per mtok
            output_price_per_mtok: 1_500_000, // $1.50 per mtok
            throughput_hint: None,
            status: "active".into(),
            metadata: "{}".into(),
            created_at: String::new(),
        };
        // 1M input + 1M output = 0.5 + 1.5 dollars = 2_000_000 microdollars.
        assert_eq!(compute_cost(&model, 1_000_000, 1_000_000), 2_000_000);
        assert_eq!(compute_cost(&model, 0, 0), 0);
    }
}
