// =============================================================================
// Pending-Order Worker — claim, dispatch, settle, reconcile
// =============================================================================
//
// A single long-lived task polls the durable queue: stale `processing`
// rows are requeued first, then each pending row is claimed with a
// compare-and-set and dispatched according to its execution mode. Signal
// rows fan out to notification channels; live rows go through the
// two-phase exchange protocol in `live.rs`. Position reconciliation runs
// on its own cadence between polls.
// =============================================================================

pub mod fills;
pub mod live;
pub mod reconcile;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::engine::EngineContext;
use crate::notify::SignalNote;
use crate::store::pending_orders::PendingOrder;
use crate::types::ExecutionMode;

pub struct PendingOrderWorker {
    ctx: Arc<EngineContext>,
}

impl PendingOrderWorker {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run forever. Spawn as a background task.
    pub async fn run(self) {
        info!(
            poll_sec = self.ctx.config.worker_poll_interval_sec,
            batch = self.ctx.config.worker_batch_size,
            "pending-order worker started"
        );
        let mut last_sync: Option<Instant> = None;
        loop {
            if let Err(e) = self.tick(&mut last_sync).await {
                warn!(error = %e, "worker tick error");
            }
            tokio::time::sleep(Duration::from_secs_f64(
                self.ctx.config.worker_poll_interval_sec.max(0.1),
            ))
            .await;
        }
    }

    async fn tick(&self, last_sync: &mut Option<Instant>) -> anyhow::Result<()> {
        // Crash recovery first, so abandoned claims rejoin this batch.
        self.ctx
            .store
            .requeue_stale_processing(self.ctx.config.pending_order_stale_sec)
            .await?;

        let orders = self
            .ctx
            .store
            .fetch_pending_batch(self.ctx.config.worker_batch_size)
            .await?;

        for order in &orders {
            // The CAS claim is the dispatch lock: losing it means another
            // pass already owns this row.
            if !self.ctx.store.claim_pending_order(order.id).await? {
                continue;
            }
            if let Err(e) = self.dispatch_one(order).await {
                let _ = self
                    .ctx
                    .store
                    .mark_order_failed(order.id, &e.to_string())
                    .await;
            }
        }

        self.maybe_sync_positions(last_sync).await;
        Ok(())
    }

    async fn maybe_sync_positions(&self, last_sync: &mut Option<Instant>) {
        if !self.ctx.config.position_sync_enabled {
            return;
        }
        let interval = self.ctx.config.position_sync_interval_sec;
        if interval <= 0.0 {
            return;
        }
        if let Some(at) = last_sync {
            if at.elapsed() < Duration::from_secs_f64(interval) {
                return;
            }
        }
        *last_sync = Some(Instant::now());
        if let Err(e) = reconcile::sync_positions_best_effort(&self.ctx).await {
            info!(error = %e, "position sync skipped");
        }
    }

    async fn dispatch_one(&self, order: &PendingOrder) -> anyhow::Result<()> {
        let payload = order.payload();
        let mut mode = ExecutionMode::parse(&order.execution_mode);

        // A queued signal row whose strategy has since switched to live is
        // upgraded so the system keeps moving.
        if mode != ExecutionMode::Live {
            if let Ok(Some(strategy)) = self.ctx.store.load_strategy(order.strategy_id).await {
                if strategy.execution_mode == ExecutionMode::Live {
                    mode = ExecutionMode::Live;
                }
            }
        }

        match mode {
            ExecutionMode::Signal => self.dispatch_signal(order, &payload).await,
            ExecutionMode::Live => self.execute_live_order(order, &payload).await,
        }
    }

    /// Signal-only dispatch: fan out notifications; any channel success
    /// marks the row sent.
    async fn dispatch_signal(&self, order: &PendingOrder, payload: &Value) -> anyhow::Result<()> {
        let mut notification_config = payload
            .get("notification_config")
            .cloned()
            .unwrap_or(Value::Null);
        if !notification_config.is_object()
            || notification_config.as_object().map_or(true, |o| o.is_empty())
        {
            notification_config = self
                .ctx
                .store
                .load_notification_config(order.strategy_id)
                .await;
        }

        let note = self.build_note(order, payload, Value::Null).await;
        let results = self.ctx.notifier.notify(&note, &notification_config).await;

        let mut ok_channels: Vec<&str> = Vec::new();
        let mut fail_channels: Vec<&str> = Vec::new();
        let mut first_err = String::new();
        for (channel, res) in &results {
            if res.ok {
                ok_channels.push(channel);
            } else {
                fail_channels.push(channel);
                if first_err.is_empty() {
                    if let Some(err) = &res.error {
                        first_err = format!("{channel}:{err}");
                    }
                }
            }
        }
        ok_channels.sort_unstable();
        fail_channels.sort_unstable();

        if !ok_channels.is_empty() {
            let mut note_str = format!("notified_ok={}", ok_channels.join(","));
            if !fail_channels.is_empty() {
                note_str.push_str(&format!(";fail={}", fail_channels.join(",")));
            }
            note_str.truncate(200);
            self.ctx
                .store
                .mark_order_sent(
                    order.id,
                    &crate::store::pending_orders::SentUpdate {
                        note: note_str,
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            let err = if first_err.is_empty() {
                "notify_failed".to_string()
            } else {
                first_err
            };
            self.ctx.store.mark_order_failed(order.id, &err).await?;
        }
        Ok(())
    }

    /// Assemble the notification payload for an order.
    async fn build_note(&self, order: &PendingOrder, payload: &Value, extra: Value) -> SignalNote {
        let mut strategy_name = payload
            .get("strategy_name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if strategy_name.is_empty() {
            strategy_name = self.ctx.store.load_strategy_name(order.strategy_id).await;
        }
        if strategy_name.is_empty() {
            strategy_name = format!("Strategy_{}", order.strategy_id);
        }
        let direction = if order.signal_type.contains("short") {
            "short"
        } else {
            "long"
        };
        SignalNote {
            strategy_id: order.strategy_id,
            strategy_name,
            symbol: order.symbol.clone(),
            signal_type: order.signal_type.clone(),
            price: order.price,
            amount: order.amount,
            direction: direction.to_string(),
            extra,
        }
    }

    /// Best-effort live-outcome notification. Never blocks or changes the
    /// order status.
    #[allow(clippy::too_many_arguments)]
    async fn notify_live_best_effort(
        &self,
        order: &PendingOrder,
        payload: &Value,
        status: &str,
        error: &str,
        exchange_id: &str,
        exchange_order_id: &str,
        price_hint: f64,
        amount_hint: f64,
    ) {
        let mut notification_config = payload
            .get("notification_config")
            .cloned()
            .unwrap_or(Value::Null);
        if !notification_config.is_object()
            || notification_config.as_object().map_or(true, |o| o.is_empty())
        {
            notification_config = self
                .ctx
                .store
                .load_notification_config(order.strategy_id)
                .await;
        }
        if notification_config
            .as_object()
            .map_or(true, |o| o.is_empty())
        {
            return;
        }

        let extra = serde_json::json!({
            "pending_order_id": order.id,
            "mode": "live",
            "status": status,
            "error": error,
            "exchange_id": exchange_id,
            "exchange_order_id": exchange_order_id,
        });
        let mut note = self.build_note(order, payload, extra).await;
        if price_hint > 0.0 {
            note.price = price_hint;
        }
        if amount_hint > 0.0 {
            note.amount = amount_hint;
        }
        let results = self.ctx.notifier.notify(&note, &notification_config).await;
        let ok = results.values().filter(|r| r.ok).count();
        let fail = results.len() - ok;
        if ok + fail > 0 {
            info!(
                pending_id = order.id,
                strategy_id = order.strategy_id,
                ok,
                fail,
                "live notification dispatched"
            );
        }
    }
}
