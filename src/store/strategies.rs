// =============================================================================
// Strategy model — persisted configuration plus the typed trading config
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;

use crate::store::Store;
use crate::types::{ExecutionMode, MarketCategory, MarketType, TradeDirection};

/// Which candle index set a signal sweep inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    /// Only the last closed candle.
    Confirmed,
    /// The forming candle as well.
    Aggressive,
}

/// How a pending signal is confirmed before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Fire when the current price crosses the trigger level.
    Price,
    /// Fire on the next tick without price confirmation.
    Immediate,
}

fn default_timeframe() -> String {
    "1H".to_string()
}

fn default_leverage() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_signal_mode() -> SignalMode {
    SignalMode::Confirmed
}

fn default_exit_signal_mode() -> SignalMode {
    SignalMode::Aggressive
}

fn default_entry_trigger() -> TriggerMode {
    TriggerMode::Price
}

fn default_exit_trigger() -> TriggerMode {
    TriggerMode::Immediate
}

/// Flat per-strategy trading parameters, deserialized from the
/// `trading_config` JSON column. Unknown keys are ignored; every field has
/// a default so older rows keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub symbol: String,

    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    #[serde(default = "default_leverage")]
    pub leverage: f64,

    #[serde(default)]
    pub market_type: MarketType,

    #[serde(default, alias = "tradeDirection")]
    pub trade_direction: TradeDirection,

    /// Capital ratio used for open signals; overrides the script-provided
    /// size when present. Accepts 0..1 and 0..100.
    #[serde(default, alias = "entryPct")]
    pub entry_pct: Option<f64>,

    // --- Server-side exits ---------------------------------------------------
    /// Margin-PnL stop-loss percentage; disabled when <= 0.
    #[serde(default, alias = "stopLossPct")]
    pub stop_loss_pct: f64,

    /// Margin-PnL fixed take-profit percentage; disabled when <= 0 and
    /// whenever trailing is active.
    #[serde(default, alias = "takeProfitPct")]
    pub take_profit_pct: f64,

    #[serde(default, alias = "trailingEnabled")]
    pub trailing_enabled: bool,

    #[serde(default, alias = "trailingStopPct")]
    pub trailing_stop_pct: f64,

    /// Margin-PnL gain required before the trailing stop arms. Falls back
    /// to `take_profit_pct` when absent.
    #[serde(default, alias = "trailingActivationPct")]
    pub trailing_activation_pct: f64,

    #[serde(default = "default_true")]
    pub enable_server_side_stop_loss: bool,

    // --- Signal extraction & triggering --------------------------------------
    #[serde(default = "default_signal_mode")]
    pub signal_mode: SignalMode,

    #[serde(default = "default_exit_signal_mode")]
    pub exit_signal_mode: SignalMode,

    #[serde(default = "default_entry_trigger")]
    pub entry_trigger_mode: TriggerMode,

    #[serde(default = "default_exit_trigger")]
    pub exit_trigger_mode: TriggerMode,
}

impl Default for TradingConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .expect("TradingConfig defaults deserialize")
    }
}

impl TradingConfig {
    /// Enforce the market/leverage/direction invariants:
    /// spot <=> 1x, spot is long-only, derivatives normalize to swap with
    /// leverage clamped to [1, 125].
    pub fn sanitize(&mut self, row_leverage: f64) {
        if self.leverage <= 0.0 {
            self.leverage = if row_leverage > 0.0 { row_leverage } else { 1.0 };
        }
        if (self.leverage - 1.0).abs() < f64::EPSILON {
            self.market_type = MarketType::Spot;
        } else {
            self.market_type = MarketType::Swap;
        }
        if self.market_type == MarketType::Spot {
            self.leverage = 1.0;
            self.trade_direction = TradeDirection::Long;
        } else {
            if self.leverage < 1.0 {
                self.leverage = 1.0;
            }
            if self.leverage > 125.0 {
                self.leverage = 125.0;
            }
        }
    }
}

/// A strategy row with its JSON columns parsed.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: i64,
    pub user_id: i64,
    pub status: String,
    pub strategy_name: String,
    pub strategy_type: String,
    pub initial_capital: f64,
    pub leverage: f64,
    pub decide_interval: i64,
    pub execution_mode: ExecutionMode,
    pub notification_config: Value,
    pub indicator_config: Value,
    pub exchange_config: Value,
    pub trading: TradingConfig,
    pub ai_model_config: Value,
}

impl Strategy {
    pub fn indicator_code(&self) -> String {
        self.indicator_config
            .get("indicator_code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn exchange_id(&self) -> String {
        self.exchange_config
            .get("exchange_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_lowercase()
    }

    pub fn market_category(&self) -> MarketCategory {
        self.exchange_config
            .get("market_category")
            .and_then(|v| v.as_str())
            .map(MarketCategory::parse)
            .unwrap_or_default()
    }
}

fn parse_json_column(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
}

impl Store {
    /// Load one strategy with its JSON columns parsed. Returns `None` when
    /// the id does not exist.
    pub async fn load_strategy(&self, strategy_id: i64) -> Result<Option<Strategy>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, strategy_name, strategy_type,
                   initial_capital, leverage, decide_interval, execution_mode,
                   notification_config, indicator_config, exchange_config,
                   trading_config, ai_model_config
            FROM qd_strategies_trading
            WHERE id = ?
            "#,
        )
        .bind(strategy_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to load strategy")?;

        let Some(row) = row else { return Ok(None) };

        let trading_raw: String = row.try_get("trading_config")?;
        let trading: TradingConfig =
            serde_json::from_str(&trading_raw).unwrap_or_else(|_| TradingConfig::default());

        let notification_raw: String = row.try_get("notification_config")?;
        let indicator_raw: String = row.try_get("indicator_config")?;
        let exchange_raw: String = row.try_get("exchange_config")?;
        let ai_raw: String = row.try_get("ai_model_config")?;
        let execution_raw: String = row.try_get("execution_mode")?;

        Ok(Some(Strategy {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            strategy_name: row.try_get("strategy_name")?,
            strategy_type: row.try_get("strategy_type")?,
            initial_capital: row.try_get("initial_capital")?,
            leverage: row.try_get("leverage")?,
            decide_interval: row.try_get("decide_interval")?,
            execution_mode: ExecutionMode::parse(&execution_raw),
            notification_config: parse_json_column(&notification_raw),
            indicator_config: parse_json_column(&indicator_raw),
            exchange_config: parse_json_column(&exchange_raw),
            trading,
            ai_model_config: parse_json_column(&ai_raw),
        }))
    }

    /// Persisted status string for a strategy, if it exists.
    pub async fn strategy_status(&self, strategy_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT status FROM qd_strategies_trading WHERE id = ?")
            .bind(strategy_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("status")?),
            None => None,
        })
    }

    pub async fn is_strategy_running(&self, strategy_id: i64) -> bool {
        matches!(self.strategy_status(strategy_id).await, Ok(Some(s)) if s == "running")
    }

    pub async fn set_strategy_status(&self, strategy_id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE qd_strategies_trading SET status = ? WHERE id = ?")
            .bind(status)
            .bind(strategy_id)
            .execute(self.pool())
            .await
            .context("failed to update strategy status")?;
        Ok(())
    }

    /// Ids of all strategies currently flagged as running (used to resume
    /// runners after a restart).
    pub async fn running_strategy_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM qd_strategies_trading WHERE status = 'running'")
            .fetch_all(self.pool())
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for r in rows {
            ids.push(r.try_get("id")?);
        }
        Ok(ids)
    }

    /// Strategy ids that own at least one local position row.
    pub async fn strategy_ids_with_positions(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT strategy_id FROM qd_strategy_positions ORDER BY strategy_id",
        )
        .fetch_all(self.pool())
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for r in rows {
            ids.push(r.try_get("strategy_id")?);
        }
        Ok(ids)
    }

    pub async fn load_notification_config(&self, strategy_id: i64) -> Value {
        let raw: Option<String> =
            sqlx::query("SELECT notification_config FROM qd_strategies_trading WHERE id = ?")
                .bind(strategy_id)
                .fetch_optional(self.pool())
                .await
                .ok()
                .flatten()
                .and_then(|r| r.try_get("notification_config").ok());
        parse_json_column(raw.as_deref().unwrap_or(""))
    }

    pub async fn load_strategy_name(&self, strategy_id: i64) -> String {
        sqlx::query("SELECT strategy_name FROM qd_strategies_trading WHERE id = ?")
            .bind(strategy_id)
            .fetch_optional(self.pool())
            .await
            .ok()
            .flatten()
            .and_then(|r| r.try_get::<String, _>("strategy_name").ok())
            .unwrap_or_default()
    }

    pub async fn strategy_user_id(&self, strategy_id: i64) -> i64 {
        sqlx::query("SELECT user_id FROM qd_strategies_trading WHERE id = ?")
            .bind(strategy_id)
            .fetch_optional(self.pool())
            .await
            .ok()
            .flatten()
            .and_then(|r| r.try_get::<i64, _>("user_id").ok())
            .unwrap_or(1)
    }

    /// Insert a strategy row; primarily used by seeds and tests.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_strategy(
        &self,
        user_id: i64,
        strategy_name: &str,
        status: &str,
        initial_capital: f64,
        leverage: f64,
        execution_mode: ExecutionMode,
        notification_config: &Value,
        indicator_config: &Value,
        exchange_config: &Value,
        trading_config: &Value,
        ai_model_config: &Value,
    ) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO qd_strategies_trading
                (user_id, status, strategy_name, strategy_type, initial_capital,
                 leverage, decide_interval, execution_mode, notification_config,
                 indicator_config, exchange_config, trading_config, ai_model_config)
            VALUES (?, ?, ?, 'IndicatorStrategy', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(strategy_name)
        .bind(initial_capital)
        .bind(leverage)
        .bind(10_i64)
        .bind(execution_mode.to_string())
        .bind(notification_config.to_string())
        .bind(indicator_config.to_string())
        .bind(exchange_config.to_string())
        .bind(trading_config.to_string())
        .bind(ai_model_config.to_string())
        .execute(self.pool())
        .await
        .context("failed to insert strategy")?;
        Ok(res.last_insert_rowid())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trading_config_defaults() {
        let cfg: TradingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.timeframe, "1H");
        assert_eq!(cfg.signal_mode, SignalMode::Confirmed);
        assert_eq!(cfg.exit_signal_mode, SignalMode::Aggressive);
        assert_eq!(cfg.entry_trigger_mode, TriggerMode::Price);
        assert_eq!(cfg.exit_trigger_mode, TriggerMode::Immediate);
        assert!(cfg.enable_server_side_stop_loss);
        assert!(cfg.entry_pct.is_none());
    }

    #[test]
    fn sanitize_spot_forces_long_and_1x() {
        let mut cfg = TradingConfig::default();
        cfg.leverage = 1.0;
        cfg.trade_direction = TradeDirection::Both;
        cfg.sanitize(1.0);
        assert_eq!(cfg.market_type, MarketType::Spot);
        assert_eq!(cfg.trade_direction, TradeDirection::Long);
        assert!((cfg.leverage - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sanitize_clamps_leverage_and_normalizes_swap() {
        let mut cfg = TradingConfig::default();
        cfg.leverage = 500.0;
        cfg.market_type = MarketType::Spot;
        cfg.sanitize(1.0);
        assert_eq!(cfg.market_type, MarketType::Swap);
        assert!((cfg.leverage - 125.0).abs() < f64::EPSILON);
    }

    #[test]
    fn camel_case_aliases_accepted() {
        let cfg: TradingConfig = serde_json::from_value(json!({
            "tradeDirection": "both",
            "entryPct": 0.2,
            "stopLossPct": 0.05,
            "trailingEnabled": true,
            "trailingStopPct": 0.03
        }))
        .unwrap();
        assert_eq!(cfg.trade_direction, TradeDirection::Both);
        assert_eq!(cfg.entry_pct, Some(0.2));
        assert!((cfg.stop_loss_pct - 0.05).abs() < f64::EPSILON);
        assert!(cfg.trailing_enabled);
    }

    #[tokio::test]
    async fn insert_and_load_round_trip() {
        let store = Store::memory().await.unwrap();
        let id = store
            .insert_strategy(
                7,
                "ma-cross",
                "running",
                1500.0,
                5.0,
                ExecutionMode::Live,
                &json!({"telegram": {"enabled": false}}),
                &json!({"indicator_code": "fast=5\nslow=20"}),
                &json!({"exchange_id": "okx", "market_category": "Crypto"}),
                &json!({"symbol": "BTC/USDT", "timeframe": "1m", "leverage": 5}),
                &json!({}),
            )
            .await
            .unwrap();

        let strat = store.load_strategy(id).await.unwrap().unwrap();
        assert_eq!(strat.user_id, 7);
        assert_eq!(strat.strategy_name, "ma-cross");
        assert_eq!(strat.execution_mode, ExecutionMode::Live);
        assert_eq!(strat.trading.symbol, "BTC/USDT");
        assert_eq!(strat.indicator_code(), "fast=5\nslow=20");
        assert_eq!(strat.exchange_id(), "okx");
        assert_eq!(strat.market_category(), MarketCategory::Crypto);
        assert!(store.is_strategy_running(id).await);

        store.set_strategy_status(id, "stopped").await.unwrap();
        assert!(!store.is_strategy_running(id).await);
        assert!(store.load_strategy(id + 99).await.unwrap().is_none());
    }
}
