// =============================================================================
// Trade journal — append-only record of every fill
// =============================================================================

use anyhow::{Context, Result};
use sqlx::Row;

use crate::store::{now_ts, Store};
use crate::types::SignalType;

/// One journal row.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: i64,
    pub strategy_id: i64,
    pub symbol: String,
    pub trade_type: String,
    pub price: f64,
    pub amount: f64,
    pub value: f64,
    pub commission: f64,
    pub commission_ccy: String,
    pub profit: Option<f64>,
    pub created_at: i64,
}

impl Store {
    /// Append a trade. `value` is always `price * amount`; commission is
    /// stored in whatever currency the venue charged it.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_trade(
        &self,
        strategy_id: i64,
        symbol: &str,
        trade_type: SignalType,
        price: f64,
        amount: f64,
        commission: f64,
        commission_ccy: &str,
        profit: Option<f64>,
    ) -> Result<i64> {
        let user_id = self.strategy_user_id(strategy_id).await;
        let res = sqlx::query(
            r#"
            INSERT INTO qd_strategy_trades
                (user_id, strategy_id, symbol, type, price, amount, value,
                 commission, commission_ccy, profit, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(strategy_id)
        .bind(symbol)
        .bind(trade_type.as_str())
        .bind(price)
        .bind(amount)
        .bind(price * amount)
        .bind(commission)
        .bind(commission_ccy.trim().to_uppercase())
        .bind(profit)
        .bind(now_ts())
        .execute(self.pool())
        .await
        .context("failed to record trade")?;
        Ok(res.last_insert_rowid())
    }

    /// Most recent trades of a strategy, newest first.
    pub async fn trades_for_strategy(&self, strategy_id: i64, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT id, strategy_id, symbol, type, price, amount, value,
                   commission, commission_ccy, profit, created_at
            FROM qd_strategy_trades
            WHERE strategy_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            trades.push(Trade {
                id: row.try_get("id")?,
                strategy_id: row.try_get("strategy_id")?,
                symbol: row.try_get("symbol")?,
                trade_type: row.try_get("type")?,
                price: row.try_get("price")?,
                amount: row.try_get("amount")?,
                value: row.try_get("value")?,
                commission: row.try_get("commission")?,
                commission_ccy: row.try_get("commission_ccy")?,
                profit: row.try_get("profit")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(trades)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trade_value_is_price_times_amount() {
        let store = Store::memory().await.unwrap();
        store
            .record_trade(
                1,
                "BTC/USDT",
                SignalType::OpenLong,
                100.0,
                5.0,
                0.25,
                "usdt",
                None,
            )
            .await
            .unwrap();

        let trades = store.trades_for_strategy(1, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].value - 500.0).abs() < f64::EPSILON);
        assert_eq!(trades[0].commission_ccy, "USDT");
        assert!(trades[0].profit.is_none());
    }

    #[tokio::test]
    async fn close_trade_keeps_profit() {
        let store = Store::memory().await.unwrap();
        store
            .record_trade(
                1,
                "BTC/USDT",
                SignalType::CloseLong,
                110.0,
                5.0,
                0.0,
                "",
                Some(50.0),
            )
            .await
            .unwrap();
        let trades = store.trades_for_strategy(1, 10).await.unwrap();
        assert_eq!(trades[0].profit, Some(50.0));
        assert_eq!(trades[0].trade_type, "close_long");
    }
}
