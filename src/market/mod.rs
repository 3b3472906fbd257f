// =============================================================================
// Market data — candles, kline sources, and the shared price cache
// =============================================================================

pub mod candle;
pub mod kline;
pub mod price;

pub use candle::{timeframe_seconds, Candle, Frame};
pub use kline::{BinanceKlineSource, KlineSource};
pub use price::{BinanceTickerSource, PriceCache, PriceFeed, PriceSource};
