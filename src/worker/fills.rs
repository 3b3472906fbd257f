// =============================================================================
// Canonical fill transitions — one function mutates local positions
// =============================================================================
//
// Both execution paths funnel through here: the runner's signal-mode
// simulation and the worker's live settlement. The state transitions:
//
//   flat  + open_*   -> position (entry = fill price, size = fill)
//   pos   + add_*    -> entry = weighted average, size += fill
//   pos   + reduce_* -> size -= fill, entry unchanged
//                       (remaining <= 0.1% of the old size closes instead)
//   pos   + close_*  -> row deleted, realized PnL returned
//
// The return value is the realized profit for reduce/close fills, `None`
// for entries.
// =============================================================================

use anyhow::Result;
use tracing::{info, warn};

use crate::store::Store;
use crate::types::SignalType;

/// Remaining size at or below this fraction of the pre-fill size closes
/// the position outright.
const RESIDUAL_CLOSE_FRACTION: f64 = 0.001;

pub async fn apply_fill_to_local_position(
    store: &Store,
    strategy_id: i64,
    user_id: i64,
    symbol: &str,
    signal_type: SignalType,
    filled: f64,
    avg_price: f64,
) -> Result<Option<f64>> {
    if filled <= 0.0 || avg_price <= 0.0 {
        return Ok(None);
    }

    let side = signal_type.side();
    let positions = store.positions_for(strategy_id, symbol).await?;
    let existing = positions.iter().find(|p| p.side == side);

    if signal_type.is_open() || signal_type.is_add() {
        let (new_size, new_entry) = match existing {
            Some(old) if old.size > 0.0 => {
                let total = old.size + filled;
                let entry = (old.size * old.entry_price + filled * avg_price) / total;
                (total, entry)
            }
            _ => (filled, avg_price),
        };
        store
            .upsert_position(
                strategy_id, user_id, symbol, side, new_size, new_entry, avg_price, 0.0, 0.0,
            )
            .await?;
        info!(
            strategy_id,
            symbol,
            side = %side,
            size = new_size,
            entry = new_entry,
            "position opened/increased"
        );
        return Ok(None);
    }

    let Some(old) = existing else {
        warn!(strategy_id, symbol, signal = %signal_type, "fill without matching position");
        return Ok(None);
    };

    if signal_type.is_reduce() {
        let profit = side.direction() * (avg_price - old.entry_price) * filled;
        let new_size = (old.size - filled).max(0.0);
        if new_size <= old.size * RESIDUAL_CLOSE_FRACTION {
            store.close_position(strategy_id, &old.symbol, side).await?;
            info!(strategy_id, symbol, side = %side, profit, "residual close after reduce");
        } else {
            store
                .upsert_position(
                    strategy_id,
                    user_id,
                    &old.symbol,
                    side,
                    new_size,
                    old.entry_price,
                    avg_price,
                    0.0,
                    0.0,
                )
                .await?;
            info!(
                strategy_id,
                symbol,
                side = %side,
                remaining = new_size,
                profit,
                "position reduced"
            );
        }
        return Ok(Some(profit));
    }

    // close_*: realized PnL over the whole remaining position.
    let profit = side.direction() * (avg_price - old.entry_price) * old.size;
    store.close_position(strategy_id, &old.symbol, side).await?;
    info!(strategy_id, symbol, side = %side, profit, "position closed");
    Ok(Some(profit))
}
