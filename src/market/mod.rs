//! Market data model: candles, timeframes, and per-symbol series.

mod series;
mod types;

pub use series::{CandleSeries, MarketData, SymbolSeries};
pub use types::{Candle, Direction, ParseTimeframeError, Regime, Timeframe, TimeframeStack};
