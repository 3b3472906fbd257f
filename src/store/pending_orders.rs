// =============================================================================
// Pending-order queue — the durable dispatch unit between runner and worker
// =============================================================================
//
// Rows progress pending -> processing -> {sent | failed | deferred}. The
// claim is a compare-and-set on status='pending' so at most one worker pass
// dispatches a given row; stale `processing` rows are requeued after
// `stale_sec` as long as the attempt budget allows.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, info};

use crate::store::{now_ts, Store};
use crate::types::{ExecutionMode, MarketType, OrderStatus, SignalType};

/// Seconds within which a repeated identical signal (without a candle key)
/// is refused at enqueue time.
const ENQUEUE_COOLDOWN_SEC: i64 = 30;

/// Default retry budget for a queued order.
const DEFAULT_MAX_ATTEMPTS: i64 = 10;

/// One row of the `pending_orders` table.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub id: i64,
    pub user_id: i64,
    pub strategy_id: i64,
    pub symbol: String,
    pub signal_type: String,
    pub signal_ts: i64,
    pub market_type: String,
    pub order_type: String,
    pub amount: f64,
    pub price: f64,
    pub execution_mode: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: String,
    pub payload_json: String,
    pub exchange_id: String,
    pub exchange_order_id: String,
    pub exchange_response_json: String,
    pub filled: f64,
    pub avg_price: f64,
    pub dispatch_note: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub executed_at: Option<i64>,
}

impl PendingOrder {
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload_json).unwrap_or(Value::Null)
    }

    pub fn order_status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }

    /// Terminal rows never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.order_status(),
            Some(OrderStatus::Sent) | Some(OrderStatus::Failed)
        )
    }
}

/// Everything needed to enqueue one order intent.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub strategy_id: i64,
    pub symbol: String,
    pub signal_type: SignalType,
    pub signal_ts: i64,
    pub market_type: MarketType,
    pub amount: f64,
    pub price: f64,
    pub leverage: f64,
    pub execution_mode: ExecutionMode,
    pub notification_config: Value,
    pub margin_mode: String,
}

/// Terminal `sent` update payload.
#[derive(Debug, Clone, Default)]
pub struct SentUpdate {
    pub note: String,
    pub exchange_id: String,
    pub exchange_order_id: String,
    pub exchange_response_json: String,
    pub filled: f64,
    pub avg_price: f64,
    pub executed_at: Option<i64>,
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> Result<PendingOrder> {
    Ok(PendingOrder {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        strategy_id: row.try_get("strategy_id")?,
        symbol: row.try_get("symbol")?,
        signal_type: row.try_get("signal_type")?,
        signal_ts: row.try_get("signal_ts")?,
        market_type: row.try_get("market_type")?,
        order_type: row.try_get("order_type")?,
        amount: row.try_get("amount")?,
        price: row.try_get("price")?,
        execution_mode: row.try_get("execution_mode")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        payload_json: row.try_get("payload_json")?,
        exchange_id: row.try_get("exchange_id")?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        exchange_response_json: row.try_get("exchange_response_json")?,
        filled: row.try_get("filled")?,
        avg_price: row.try_get("avg_price")?,
        dispatch_note: row.try_get("dispatch_note")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processed_at: row.try_get("processed_at")?,
        sent_at: row.try_get("sent_at")?,
        executed_at: row.try_get("executed_at")?,
    })
}

impl Store {
    /// Insert a pending order and return its id, or `None` when the
    /// DB-side duplicate guard refused it.
    ///
    /// Guard rules:
    /// * open_* with a candle timestamp: any existing row with the same
    ///   (strategy, symbol, signal, signal_ts) blocks the insert. Scale-in
    ///   and exit signals are exempt so they can legitimately repeat within
    ///   one candle on higher timeframes.
    /// * otherwise: an in-flight (pending/processing) row, or any row
    ///   younger than the cooldown, blocks the insert.
    pub async fn enqueue_pending_order(&self, req: &EnqueueRequest) -> Result<Option<i64>> {
        let now = now_ts();
        let signal = req.signal_type.as_str();
        let strict_candle_dedup = req.signal_ts > 0 && req.signal_type.is_open();

        let last = if strict_candle_dedup {
            sqlx::query(
                r#"
                SELECT id, status, created_at FROM pending_orders
                WHERE strategy_id = ? AND symbol = ? AND signal_type = ? AND signal_ts = ?
                ORDER BY id DESC LIMIT 1
                "#,
            )
            .bind(req.strategy_id)
            .bind(&req.symbol)
            .bind(signal)
            .bind(req.signal_ts)
            .fetch_optional(self.pool())
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, status, created_at FROM pending_orders
                WHERE strategy_id = ? AND symbol = ? AND signal_type = ?
                ORDER BY id DESC LIMIT 1
                "#,
            )
            .bind(req.strategy_id)
            .bind(&req.symbol)
            .bind(signal)
            .fetch_optional(self.pool())
            .await?
        };

        if let Some(row) = last {
            let last_id: i64 = row.try_get("id")?;
            let last_status: String = row.try_get("status")?;
            let last_created: i64 = row.try_get("created_at")?;

            if strict_candle_dedup {
                info!(
                    existing_id = last_id,
                    strategy_id = req.strategy_id,
                    symbol = %req.symbol,
                    signal,
                    signal_ts = req.signal_ts,
                    "enqueue skipped: same-candle order already exists"
                );
                return Ok(None);
            }
            if last_status == "pending" || last_status == "processing" {
                info!(
                    existing_id = last_id,
                    strategy_id = req.strategy_id,
                    symbol = %req.symbol,
                    signal,
                    status = %last_status,
                    "enqueue skipped: identical order in flight"
                );
                return Ok(None);
            }
            if last_created > 0 && now - last_created < ENQUEUE_COOLDOWN_SEC {
                info!(
                    existing_id = last_id,
                    age_sec = now - last_created,
                    strategy_id = req.strategy_id,
                    symbol = %req.symbol,
                    signal,
                    "enqueue skipped: cooldown"
                );
                return Ok(None);
            }
        }

        let user_id = self.strategy_user_id(req.strategy_id).await;
        let payload = serde_json::json!({
            "strategy_id": req.strategy_id,
            "symbol": req.symbol,
            "signal_type": signal,
            "market_type": req.market_type.to_string(),
            "amount": req.amount,
            "price": req.price,
            "ref_price": req.price,
            "leverage": req.leverage,
            "execution_mode": req.execution_mode.to_string(),
            "notification_config": req.notification_config,
            "signal_ts": req.signal_ts,
            "margin_mode": req.margin_mode,
        });

        let res = sqlx::query(
            r#"
            INSERT INTO pending_orders
                (user_id, strategy_id, symbol, signal_type, signal_ts, market_type,
                 order_type, amount, price, execution_mode, status, priority,
                 attempts, max_attempts, last_error, payload_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'market', ?, ?, ?, 'pending', 0, 0, ?, '', ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(req.strategy_id)
        .bind(&req.symbol)
        .bind(signal)
        .bind(req.signal_ts)
        .bind(req.market_type.to_string())
        .bind(req.amount)
        .bind(req.price)
        .bind(req.execution_mode.to_string())
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .context("failed to enqueue pending order")?;

        Ok(Some(res.last_insert_rowid()))
    }

    /// Requeue `processing` rows whose `updated_at` is older than
    /// `stale_sec` and that still have attempts left. Idempotent crash
    /// recovery; returns the number of requeued rows.
    pub async fn requeue_stale_processing(&self, stale_sec: i64) -> Result<u64> {
        if stale_sec <= 0 {
            return Ok(0);
        }
        let now = now_ts();
        let cutoff = now - stale_sec;
        let res = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'pending',
                updated_at = ?,
                dispatch_note = CASE
                    WHEN dispatch_note IS NULL OR dispatch_note = ''
                        THEN 'requeued_stale_processing'
                    ELSE dispatch_note
                END
            WHERE status = 'processing'
              AND updated_at < ?
              AND attempts < max_attempts
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(self.pool())
        .await
        .context("failed to requeue stale processing orders")?;

        let n = res.rows_affected();
        if n > 0 {
            debug!(count = n, "requeued stale processing orders");
        }
        Ok(n)
    }

    /// Fetch the next dispatch batch: pending rows with attempts left,
    /// highest priority first, FIFO within a priority.
    pub async fn fetch_pending_batch(&self, limit: i64) -> Result<Vec<PendingOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_orders
            WHERE status = 'pending' AND attempts < max_attempts
            ORDER BY priority DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("failed to fetch pending orders")?;
        rows.iter().map(row_to_order).collect()
    }

    /// Claim one order for dispatch. The update only matches rows still in
    /// `pending`, so a second claim of the same row is a no-op.
    pub async fn claim_pending_order(&self, order_id: i64) -> Result<bool> {
        let now = now_ts();
        let res = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'processing',
                attempts = attempts + 1,
                processed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(order_id)
        .execute(self.pool())
        .await
        .context("failed to claim pending order")?;
        Ok(res.rows_affected() == 1)
    }

    /// Terminal success. Clears `last_error` and records the execution
    /// outcome.
    pub async fn mark_order_sent(&self, order_id: i64, update: &SentUpdate) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'sent',
                last_error = '',
                dispatch_note = ?,
                sent_at = ?,
                executed_at = ?,
                exchange_id = ?,
                exchange_order_id = ?,
                exchange_response_json = ?,
                filled = ?,
                avg_price = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.note)
        .bind(now)
        .bind(update.executed_at)
        .bind(&update.exchange_id)
        .bind(&update.exchange_order_id)
        .bind(&update.exchange_response_json)
        .bind(update.filled)
        .bind(update.avg_price)
        .bind(now)
        .bind(order_id)
        .execute(self.pool())
        .await
        .context("failed to mark order sent")?;
        Ok(())
    }

    /// Terminal failure with a compact error string.
    pub async fn mark_order_failed(&self, order_id: i64, error: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE pending_orders SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(if error.is_empty() { "failed" } else { error })
        .bind(now)
        .bind(order_id)
        .execute(self.pool())
        .await
        .context("failed to mark order failed")?;
        Ok(())
    }

    /// Park an order without consuming its retry budget further.
    pub async fn mark_order_deferred(&self, order_id: i64, reason: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE pending_orders SET status = 'deferred', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(if reason.is_empty() { "deferred" } else { reason })
        .bind(now)
        .bind(order_id)
        .execute(self.pool())
        .await
        .context("failed to mark order deferred")?;
        Ok(())
    }

    /// Load one pending order by id (test and inspection helper).
    pub async fn pending_order(&self, order_id: i64) -> Result<Option<PendingOrder>> {
        let row = sqlx::query("SELECT * FROM pending_orders WHERE id = ?")
            .bind(order_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    /// Force queue row fields; only used by tests to simulate crashes.
    #[cfg(test)]
    pub async fn force_order_state(
        &self,
        order_id: i64,
        status: &str,
        updated_at: i64,
        attempts: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE pending_orders SET status = ?, updated_at = ?, attempts = ? WHERE id = ?",
        )
        .bind(status)
        .bind(updated_at)
        .bind(attempts)
        .bind(order_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue_req(signal: SignalType, signal_ts: i64) -> EnqueueRequest {
        EnqueueRequest {
            strategy_id: 1,
            symbol: "BTC/USDT".to_string(),
            signal_type: signal,
            signal_ts,
            market_type: MarketType::Swap,
            amount: 5.0,
            price: 100.0,
            leverage: 5.0,
            execution_mode: ExecutionMode::Live,
            notification_config: Value::Null,
            margin_mode: "cross".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_claim_sent_lifecycle() {
        let store = Store::memory().await.unwrap();
        let id = store
            .enqueue_pending_order(&enqueue_req(SignalType::OpenLong, 1_700_000_000))
            .await
            .unwrap()
            .unwrap();

        let batch = store.fetch_pending_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].status, "pending");

        // First claim wins, second is a no-op.
        assert!(store.claim_pending_order(id).await.unwrap());
        assert!(!store.claim_pending_order(id).await.unwrap());

        store
            .mark_order_sent(
                id,
                &SentUpdate {
                    note: "live_order_sent".to_string(),
                    exchange_id: "okx".to_string(),
                    exchange_order_id: "123".to_string(),
                    filled: 5.0,
                    avg_price: 99.98,
                    executed_at: Some(now_ts()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let row = store.pending_order(id).await.unwrap().unwrap();
        assert_eq!(row.status, "sent");
        assert_eq!(row.order_status(), Some(OrderStatus::Sent));
        assert!(row.is_terminal());
        assert!((row.filled - 5.0).abs() < f64::EPSILON);
        assert!((row.avg_price - 99.98).abs() < 1e-9);
        assert!(row.sent_at.is_some());
        // Terminal rows never return to the dispatch batch.
        assert!(store.fetch_pending_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_candle_open_is_enqueued_once() {
        let store = Store::memory().await.unwrap();
        let first = store
            .enqueue_pending_order(&enqueue_req(SignalType::OpenLong, 1_700_000_000))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .enqueue_pending_order(&enqueue_req(SignalType::OpenLong, 1_700_000_000))
            .await
            .unwrap();
        assert!(second.is_none());

        // A different candle is a different key.
        let third = store
            .enqueue_pending_order(&enqueue_req(SignalType::OpenLong, 1_700_003_600))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn inflight_guard_blocks_non_open_duplicates() {
        let store = Store::memory().await.unwrap();
        let id = store
            .enqueue_pending_order(&enqueue_req(SignalType::CloseLong, 1_700_000_000))
            .await
            .unwrap()
            .unwrap();

        // Same close signal while the first row is still pending: blocked.
        let dup = store
            .enqueue_pending_order(&enqueue_req(SignalType::CloseLong, 1_700_000_000))
            .await
            .unwrap();
        assert!(dup.is_none());

        // After the first completes, the cooldown still applies.
        store.claim_pending_order(id).await.unwrap();
        store.mark_order_failed(id, "boom").await.unwrap();
        let dup = store
            .enqueue_pending_order(&enqueue_req(SignalType::CloseLong, 1_700_000_000))
            .await
            .unwrap();
        assert!(dup.is_none());
    }

    #[tokio::test]
    async fn stale_processing_rows_are_requeued() {
        let store = Store::memory().await.unwrap();
        let id = store
            .enqueue_pending_order(&enqueue_req(SignalType::OpenShort, 1_700_000_000))
            .await
            .unwrap()
            .unwrap();
        assert!(store.claim_pending_order(id).await.unwrap());

        // Simulate a crash 120s ago.
        store
            .force_order_state(id, "processing", now_ts() - 120, 1)
            .await
            .unwrap();
        let requeued = store.requeue_stale_processing(90).await.unwrap();
        assert_eq!(requeued, 1);

        let batch = store.fetch_pending_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].dispatch_note, "requeued_stale_processing");

        // Rows out of attempts stay parked.
        store
            .force_order_state(id, "processing", now_ts() - 120, 10)
            .await
            .unwrap();
        assert_eq!(store.requeue_stale_processing(90).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dispatch_order_is_priority_then_fifo() {
        let store = Store::memory().await.unwrap();
        let a = store
            .enqueue_pending_order(&enqueue_req(SignalType::OpenLong, 100))
            .await
            .unwrap()
            .unwrap();
        let b = store
            .enqueue_pending_order(&enqueue_req(SignalType::CloseLong, 200))
            .await
            .unwrap()
            .unwrap();
        let batch = store.fetch_pending_batch(10).await.unwrap();
        // Same priority: FIFO by id.
        assert_eq!(batch[0].id, a);
        assert_eq!(batch[1].id, b);
    }
}
