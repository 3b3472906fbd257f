// =============================================================================
// Shared types used across the QuantDesk trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which market a strategy trades on. Spot is always 1x long-only; swap is
/// the USDT-margined perpetual market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Swap,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Swap
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Swap => write!(f, "swap"),
        }
    }
}

impl MarketType {
    /// Parse a market-type string, folding the common futures aliases into
    /// swap. Unknown values fall back to swap.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "spot" => Self::Spot,
            "futures" | "future" | "perp" | "perpetual" | "swap" => Self::Swap,
            _ => Self::Swap,
        }
    }
}

/// How a strategy's orders are dispatched by the pending-order worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Notifications only; fills are simulated locally by the runner.
    Signal,
    /// Real orders via an exchange client; fills are applied by the worker.
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Signal
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "live" => Self::Live,
            _ => Self::Signal,
        }
    }
}

/// Which directions a strategy is allowed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl Default for TradeDirection {
    fn default() -> Self {
        Self::Long
    }
}

/// Position side. A strategy+symbol holds at most one direction at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1.0 for long, -1.0 for short. Used in PnL math.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

/// Current position state of a strategy+symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    Long,
    Short,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

// =============================================================================
// Signal types
// =============================================================================

/// A discrete trading intent produced at a candle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    OpenLong,
    OpenShort,
    AddLong,
    AddShort,
    ReduceLong,
    ReduceShort,
    CloseLong,
    CloseShort,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::AddLong => "add_long",
            Self::AddShort => "add_short",
            Self::ReduceLong => "reduce_long",
            Self::ReduceShort => "reduce_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "open_long" => Some(Self::OpenLong),
            "open_short" => Some(Self::OpenShort),
            "add_long" => Some(Self::AddLong),
            "add_short" => Some(Self::AddShort),
            "reduce_long" => Some(Self::ReduceLong),
            "reduce_short" => Some(Self::ReduceShort),
            "close_long" => Some(Self::CloseLong),
            "close_short" => Some(Self::CloseShort),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Self::AddLong | Self::AddShort)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, Self::ReduceLong | Self::ReduceShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }

    pub fn is_exit(&self) -> bool {
        self.is_close() || self.is_reduce()
    }

    pub fn is_entry(&self) -> bool {
        self.is_open() || self.is_add()
    }

    /// The position side this signal operates on.
    pub fn side(&self) -> Side {
        match self {
            Self::OpenLong | Self::AddLong | Self::ReduceLong | Self::CloseLong => Side::Long,
            Self::OpenShort | Self::AddShort | Self::ReduceShort | Self::CloseShort => Side::Short,
        }
    }

    /// Dispatch priority. Lower value wins: close before reduce, reduce
    /// before (re)open, open before add.
    pub fn priority(&self) -> u8 {
        match self {
            Self::CloseLong | Self::CloseShort => 0,
            Self::ReduceLong | Self::ReduceShort => 1,
            Self::OpenLong | Self::OpenShort => 2,
            Self::AddLong | Self::AddShort => 3,
        }
    }

    /// Strict state machine:
    ///   flat  -> open_long / open_short
    ///   long  -> add_long / reduce_long / close_long
    ///   short -> add_short / reduce_short / close_short
    pub fn allowed_in(&self, state: PositionState) -> bool {
        match state {
            PositionState::Flat => self.is_open(),
            PositionState::Long => {
                matches!(self, Self::AddLong | Self::ReduceLong | Self::CloseLong)
            }
            PositionState::Short => {
                matches!(self, Self::AddShort | Self::ReduceShort | Self::CloseShort)
            }
        }
    }

    /// Buy-like signals trigger when price rises through the trigger level;
    /// sell-like signals trigger when price falls through it.
    pub fn is_buy_like(&self) -> bool {
        matches!(
            self,
            Self::OpenLong | Self::AddLong | Self::CloseShort | Self::ReduceShort
        )
    }
}

// =============================================================================
// Pending-order queue status
// =============================================================================

/// Lifecycle of a queued order. `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Deferred,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broad market category a strategy belongs to. Live execution is only
/// wired up for crypto venues; the rest are guarded in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketCategory {
    Crypto,
    USStock,
    HShare,
    Forex,
    AShare,
    Futures,
}

impl Default for MarketCategory {
    fn default() -> Self {
        Self::Crypto
    }
}

impl MarketCategory {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "usstock" => Self::USStock,
            "hshare" => Self::HShare,
            "forex" => Self::Forex,
            "ashare" => Self::AShare,
            "futures" => Self::Futures,
            _ => Self::Crypto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crypto => "Crypto",
            Self::USStock => "USStock",
            Self::HShare => "HShare",
            Self::Forex => "Forex",
            Self::AShare => "AShare",
            Self::Futures => "Futures",
        }
    }
}

/// Normalize a symbol for dedup keys: uppercase, contract suffix stripped
/// (`BNB/USDT:USDT` -> `BNB/USDT`).
pub fn normalize_symbol(symbol: &str) -> String {
    let s = symbol.trim().to_uppercase();
    match s.split_once(':') {
        Some((head, _)) => head.to_string(),
        None => s,
    }
}
