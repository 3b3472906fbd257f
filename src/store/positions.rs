// =============================================================================
// Position rows — at most one per (strategy_id, symbol, side)
// =============================================================================
//
// Position rows are the engine's local truth about exposure. The runner is
// the single writer in signal mode; in live mode the worker applies fills
// and reconciliation corrects drift against the exchange.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::Row;

use crate::store::{now_ts, Store};
use crate::types::{PositionState, Side};

/// One open position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub strategy_id: i64,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub updated_at: i64,
}

/// Position state implied by the rows of a strategy+symbol. Single-direction
/// mode: the first row decides.
pub fn position_state(positions: &[Position]) -> PositionState {
    match positions.first() {
        Some(p) => match p.side {
            Side::Long => PositionState::Long,
            Side::Short => PositionState::Short,
        },
        None => PositionState::Flat,
    }
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
    let side_raw: String = row.try_get("side")?;
    Ok(Position {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        strategy_id: row.try_get("strategy_id")?,
        symbol: row.try_get("symbol")?,
        side: Side::parse(&side_raw).context("position row has invalid side")?,
        size: row.try_get("size")?,
        entry_price: row.try_get("entry_price")?,
        current_price: row.try_get("current_price")?,
        highest_price: row.try_get("highest_price")?,
        lowest_price: row.try_get("lowest_price")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Symbols match when their pre-contract-suffix part is identical
/// (`BNB/USDT` matches `BNB/USDT:USDT`).
fn symbol_matches(a: &str, b: &str) -> bool {
    let head = |s: &str| s.split(':').next().unwrap_or(s).to_uppercase();
    head(a) == head(b)
}

impl Store {
    /// All position rows of a strategy whose symbol matches `symbol`.
    pub async fn positions_for(&self, strategy_id: i64, symbol: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, strategy_id, symbol, side, size, entry_price,
                   current_price, highest_price, lowest_price, updated_at
            FROM qd_strategy_positions
            WHERE strategy_id = ?
            "#,
        )
        .bind(strategy_id)
        .fetch_all(self.pool())
        .await
        .context("failed to load positions")?;

        let mut positions = Vec::new();
        for row in &rows {
            let pos = row_to_position(row)?;
            if symbol_matches(&pos.symbol, symbol) {
                positions.push(pos);
            }
        }
        Ok(positions)
    }

    /// All position rows of a strategy regardless of symbol.
    pub async fn positions_for_strategy(&self, strategy_id: i64) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, strategy_id, symbol, side, size, entry_price,
                   current_price, highest_price, lowest_price, updated_at
            FROM qd_strategy_positions
            WHERE strategy_id = ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(strategy_id)
        .fetch_all(self.pool())
        .await
        .context("failed to load strategy positions")?;
        rows.iter().map(row_to_position).collect()
    }

    /// Insert or update a position row. Highest/lowest tracking only moves
    /// when a positive value is supplied, so callers that do not track the
    /// extremes never clobber them.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_position(
        &self,
        strategy_id: i64,
        user_id: i64,
        symbol: &str,
        side: Side,
        size: f64,
        entry_price: f64,
        current_price: f64,
        highest_price: f64,
        lowest_price: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO qd_strategy_positions
                (user_id, strategy_id, symbol, side, size, entry_price,
                 current_price, highest_price, lowest_price, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(strategy_id, symbol, side) DO UPDATE SET
                size = excluded.size,
                entry_price = excluded.entry_price,
                current_price = excluded.current_price,
                highest_price = CASE WHEN excluded.highest_price > 0
                    THEN excluded.highest_price
                    ELSE qd_strategy_positions.highest_price END,
                lowest_price = CASE WHEN excluded.lowest_price > 0
                    THEN excluded.lowest_price
                    ELSE qd_strategy_positions.lowest_price END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(strategy_id)
        .bind(symbol)
        .bind(side.to_string())
        .bind(size)
        .bind(entry_price)
        .bind(current_price)
        .bind(highest_price)
        .bind(lowest_price)
        .bind(now_ts())
        .execute(self.pool())
        .await
        .context("failed to upsert position")?;
        Ok(())
    }

    /// Delete the position row of a (strategy, symbol, side).
    pub async fn close_position(&self, strategy_id: i64, symbol: &str, side: Side) -> Result<()> {
        sqlx::query(
            "DELETE FROM qd_strategy_positions WHERE strategy_id = ? AND symbol = ? AND side = ?",
        )
        .bind(strategy_id)
        .bind(symbol)
        .bind(side.to_string())
        .execute(self.pool())
        .await
        .context("failed to close position")?;
        Ok(())
    }

    /// Refresh `current_price` on every row of a strategy+symbol.
    pub async fn update_position_prices(
        &self,
        strategy_id: i64,
        symbol: &str,
        current_price: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE qd_strategy_positions SET current_price = ? WHERE strategy_id = ? AND symbol = ?",
        )
        .bind(current_price)
        .bind(strategy_id)
        .bind(symbol)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Apply reconciliation results in one transaction: delete ghost rows
    /// and update diverged sizes. Returns (deleted, updated).
    pub async fn apply_reconciliation(
        &self,
        delete_ids: &[i64],
        size_updates: &[(i64, f64)],
    ) -> Result<(usize, usize)> {
        if delete_ids.is_empty() && size_updates.is_empty() {
            return Ok((0, 0));
        }
        let mut tx = self.pool().begin().await?;
        for id in delete_ids {
            sqlx::query("DELETE FROM qd_strategy_positions WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let now = now_ts();
        for (id, size) in size_updates {
            sqlx::query("UPDATE qd_strategy_positions SET size = ?, updated_at = ? WHERE id = ?")
                .bind(size)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.context("failed to commit reconciliation")?;
        Ok((delete_ids.len(), size_updates.len()))
    }
}
