// =============================================================================
// Persisted notifications — the browser channel's backing rows
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;

use crate::store::{now_ts, Store};

impl Store {
    /// Persist a notification row for the browser panel. Best-effort
    /// callers ignore the result; the write itself is still a single
    /// statement.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_notification(
        &self,
        strategy_id: i64,
        symbol: &str,
        signal_type: &str,
        channels: &str,
        title: &str,
        message: &str,
        payload: &Value,
    ) -> Result<i64> {
        let user_id = self.strategy_user_id(strategy_id).await;
        let res = sqlx::query(
            r#"
            INSERT INTO qd_strategy_notifications
                (user_id, strategy_id, symbol, signal_type, channels, title,
                 message, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(strategy_id)
        .bind(symbol)
        .bind(signal_type)
        .bind(channels)
        .bind(title)
        .bind(message)
        .bind(payload.to_string())
        .bind(now_ts())
        .execute(self.pool())
        .await
        .context("failed to insert notification")?;
        Ok(res.last_insert_rowid())
    }

    /// Number of persisted notification rows for a strategy (test helper).
    pub async fn notification_count(&self, strategy_id: i64) -> Result<i64> {
        use sqlx::Row;
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM qd_strategy_notifications WHERE strategy_id = ?")
                .bind(strategy_id)
                .fetch_one(self.pool())
                .await?;
        Ok(row.try_get("n")?)
    }
}
