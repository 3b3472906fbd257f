// =============================================================================
// State Store — durable tables behind a pooled SQLite connection
// =============================================================================
//
// All engine state that must survive a restart lives here: strategy
// definitions, open positions, the trade journal, the pending-order queue,
// and persisted notifications. Every logical operation uses one short
// statement or transaction; no connection is held across awaits into
// external services.
// =============================================================================

pub mod notifications;
pub mod pending_orders;
pub mod positions;
pub mod strategies;
pub mod trades;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Shared handle to the engine database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and ensure the
    /// schema exists. WAL journaling keeps runner ticks and worker polls
    /// from serializing on each other.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url: {url}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        info!(url, "database connected");
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps the whole
    /// database on one handle.
    pub async fn memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS qd_strategies_trading (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'stopped',
                strategy_name TEXT NOT NULL DEFAULT '',
                strategy_type TEXT NOT NULL DEFAULT 'IndicatorStrategy',
                initial_capital REAL NOT NULL DEFAULT 1000,
                leverage REAL NOT NULL DEFAULT 1,
                decide_interval INTEGER NOT NULL DEFAULT 10,
                execution_mode TEXT NOT NULL DEFAULT 'signal',
                notification_config TEXT NOT NULL DEFAULT '{}',
                indicator_config TEXT NOT NULL DEFAULT '{}',
                exchange_config TEXT NOT NULL DEFAULT '{}',
                trading_config TEXT NOT NULL DEFAULT '{}',
                ai_model_config TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create qd_strategies_trading")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS qd_strategy_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL DEFAULT 1,
                strategy_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL DEFAULT 0,
                entry_price REAL NOT NULL DEFAULT 0,
                current_price REAL NOT NULL DEFAULT 0,
                highest_price REAL NOT NULL DEFAULT 0,
                lowest_price REAL NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0,
                UNIQUE(strategy_id, symbol, side)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create qd_strategy_positions")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS qd_strategy_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL DEFAULT 1,
                strategy_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                type TEXT NOT NULL,
                price REAL NOT NULL DEFAULT 0,
                amount REAL NOT NULL DEFAULT 0,
                value REAL NOT NULL DEFAULT 0,
                commission REAL NOT NULL DEFAULT 0,
                commission_ccy TEXT NOT NULL DEFAULT '',
                profit REAL,
                created_at INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create qd_strategy_trades")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL DEFAULT 1,
                strategy_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                signal_ts INTEGER NOT NULL DEFAULT 0,
                market_type TEXT NOT NULL DEFAULT 'swap',
                order_type TEXT NOT NULL DEFAULT 'market',
                amount REAL NOT NULL DEFAULT 0,
                price REAL NOT NULL DEFAULT 0,
                execution_mode TEXT NOT NULL DEFAULT 'signal',
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 10,
                last_error TEXT NOT NULL DEFAULT '',
                payload_json TEXT NOT NULL DEFAULT '',
                exchange_id TEXT NOT NULL DEFAULT '',
                exchange_order_id TEXT NOT NULL DEFAULT '',
                exchange_response_json TEXT NOT NULL DEFAULT '',
                filled REAL NOT NULL DEFAULT 0,
                avg_price REAL NOT NULL DEFAULT 0,
                dispatch_note TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER,
                sent_at INTEGER,
                executed_at INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create pending_orders")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_orders_dispatch
            ON pending_orders (status, priority DESC, id ASC);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create pending_orders index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS qd_strategy_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL DEFAULT 1,
                strategy_id INTEGER NOT NULL,
                symbol TEXT NOT NULL DEFAULT '',
                signal_type TEXT NOT NULL DEFAULT '',
                channels TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT '',
                payload_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create qd_strategy_notifications")?;

        Ok(())
    }
}

/// Current UNIX timestamp in seconds.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
