// =============================================================================
// Engine Configuration — environment-driven settings with safe defaults
// =============================================================================
//
// Every operational knob of the engine lives here and is read once at
// startup. Values come from the environment so deployments can be tuned
// without a rebuild; anything missing or malformed falls back to the
// documented default.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Order dispatch mode for live execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Maker,
    Limit,
    LimitFirst,
    MakerThenMarket,
    Market,
}

impl Default for OrderMode {
    fn default() -> Self {
        Self::Maker
    }
}

impl OrderMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "limit" => Self::Limit,
            "limit_first" => Self::LimitFirst,
            "maker_then_market" => Self::MakerThenMarket,
            "market" => Self::Market,
            _ => Self::Maker,
        }
    }

    /// Whether execution starts with a resting limit order before falling
    /// back to market for the remainder.
    pub fn use_limit_first(&self) -> bool {
        !matches!(self, Self::Market)
    }

    /// Whether the limit phase should request post-only where the venue
    /// supports it.
    pub fn post_only(&self) -> bool {
        matches!(
            self,
            Self::Maker | Self::MakerThenMarket | Self::LimitFirst | Self::Limit
        )
    }
}

/// Top-level engine configuration assembled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database URL.
    pub database_url: String,

    // --- Strategy runner -----------------------------------------------------
    /// Seconds between runner ticks (min 1).
    pub tick_interval_sec: u64,
    /// Maximum number of concurrently running strategies.
    pub max_threads: usize,
    /// TTL of the shared per-symbol price cache.
    pub price_cache_ttl_sec: u64,
    /// Candle history fetched on (re)initialization.
    pub kline_history_limit: u32,

    // --- Live order execution ------------------------------------------------
    pub order_mode: OrderMode,
    /// Seconds to wait for maker-phase fills before falling back to market.
    pub maker_wait_sec: f64,
    /// Maker price skew in basis points.
    pub maker_offset_bps: f64,

    // --- Pending-order worker ------------------------------------------------
    /// Seconds between queue polls.
    pub worker_poll_interval_sec: f64,
    /// Queue batch size per poll.
    pub worker_batch_size: i64,
    /// Age after which a `processing` row is requeued.
    pub pending_order_stale_sec: i64,

    // --- Position reconciliation ---------------------------------------------
    pub position_sync_enabled: bool,
    pub position_sync_interval_sec: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://quantdesk.db".to_string(),
            tick_interval_sec: 10,
            max_threads: 64,
            price_cache_ttl_sec: 10,
            kline_history_limit: 500,
            order_mode: OrderMode::Maker,
            maker_wait_sec: 10.0,
            maker_offset_bps: 2.0,
            worker_poll_interval_sec: 1.0,
            worker_batch_size: 50,
            pending_order_stale_sec: 90,
            position_sync_enabled: true,
            position_sync_interval_sec: 10.0,
        }
    }
}

impl EngineConfig {
    /// Build the configuration from the process environment. Unset or
    /// unparsable variables keep their defaults (with a warning for the
    /// latter).
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(d.database_url),
            tick_interval_sec: env_parse("STRATEGY_TICK_INTERVAL_SEC", d.tick_interval_sec).max(1),
            max_threads: env_parse("STRATEGY_MAX_THREADS", d.max_threads),
            price_cache_ttl_sec: env_parse("PRICE_CACHE_TTL_SEC", d.price_cache_ttl_sec),
            kline_history_limit: env_parse("K_LINE_HISTORY_GET_NUMBER", d.kline_history_limit),
            order_mode: std::env::var("ORDER_MODE")
                .map(|s| OrderMode::parse(&s))
                .unwrap_or(d.order_mode),
            maker_wait_sec: positive_or(env_parse("MAKER_WAIT_SEC", d.maker_wait_sec), 10.0),
            maker_offset_bps: env_parse("MAKER_OFFSET_BPS", d.maker_offset_bps).max(0.0),
            worker_poll_interval_sec: positive_or(
                env_parse("PENDING_ORDER_POLL_SEC", d.worker_poll_interval_sec),
                1.0,
            ),
            worker_batch_size: env_parse("PENDING_ORDER_BATCH_SIZE", d.worker_batch_size),
            pending_order_stale_sec: env_parse("PENDING_ORDER_STALE_SEC", d.pending_order_stale_sec),
            position_sync_enabled: env_parse_bool("POSITION_SYNC_ENABLED", d.position_sync_enabled),
            position_sync_interval_sec: env_parse(
                "POSITION_SYNC_INTERVAL_SEC",
                d.position_sync_interval_sec,
            ),
        }
    }

    /// Maker offset as a fraction (`bps / 10_000`).
    pub fn maker_offset(&self) -> f64 {
        self.maker_offset_bps / 10_000.0
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparsable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn positive_or(v: f64, fallback: f64) -> f64 {
    if v > 0.0 {
        v
    } else {
        fallback
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tick_interval_sec, 10);
        assert_eq!(cfg.max_threads, 64);
        assert_eq!(cfg.price_cache_ttl_sec, 10);
        assert_eq!(cfg.kline_history_limit, 500);
        assert_eq!(cfg.order_mode, OrderMode::Maker);
        assert!((cfg.maker_wait_sec - 10.0).abs() < f64::EPSILON);
        assert!((cfg.maker_offset_bps - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.pending_order_stale_sec, 90);
        assert!(cfg.position_sync_enabled);
        assert!((cfg.position_sync_interval_sec - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn maker_offset_converts_bps() {
        let cfg = EngineConfig::default();
        assert!((cfg.maker_offset() - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn order_mode_limit_first_selection() {
        assert!(OrderMode::Maker.use_limit_first());
        assert!(OrderMode::Limit.use_limit_first());
        assert!(OrderMode::LimitFirst.use_limit_first());
        assert!(OrderMode::MakerThenMarket.use_limit_first());
        assert!(!OrderMode::Market.use_limit_first());
    }

    #[test]
    fn order_mode_parse_unknown_falls_back_to_maker() {
        assert_eq!(OrderMode::parse("weird"), OrderMode::Maker);
        assert_eq!(OrderMode::parse("MARKET"), OrderMode::Market);
        assert_eq!(OrderMode::parse("maker_then_market"), OrderMode::MakerThenMarket);
    }
}
