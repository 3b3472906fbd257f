// =============================================================================
// Engine context — the dependency bundle shared by runners and the worker
// =============================================================================
//
// Every subsystem reaches its collaborators through this struct: the
// store, the shared price feed, the kline source, the indicator
// evaluator, notification fan-out, and the optional AI entry filter. It is
// built once in main and passed around as `Arc<EngineContext>`.
// =============================================================================

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::indicator::IndicatorEvaluator;
use crate::market::{KlineSource, PriceFeed};
use crate::notify::Notifier;
use crate::runner::entry_filter::EntryFilter;
use crate::store::Store;

pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Store,
    pub prices: PriceFeed,
    pub klines: Arc<dyn KlineSource>,
    pub evaluator: Arc<dyn IndicatorEvaluator>,
    pub notifier: Arc<dyn Notifier>,
    pub entry_filter: Arc<dyn EntryFilter>,
}
